//! The login redirect and the `state` value it carries

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use url::form_urlencoded;

use crate::{OAuthState, OAuthStateRef, ProviderIdRef, ResolvedConfig};

const STATE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const NONCE_LEN: usize = 16;

/// The contents of the `state` value sent on a login redirect
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginState {
    /// Where to send the user once signed in
    #[serde(default)]
    pub return_to: Option<String>,
    /// Random value distinguishing one login attempt from another
    #[serde(default)]
    pub nonce: Option<String>,
}

impl LoginState {
    /// Generates the state for a login starting at `return_to`
    pub fn generate(return_to: &str) -> Self {
        let nonce = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();

        Self {
            return_to: Some(return_to.to_owned()),
            nonce: Some(nonce),
        }
    }

    /// Encodes the state as an opaque, URL-safe value
    pub fn encode(&self) -> OAuthState {
        let json = serde_json::json!({
            "returnTo": self.return_to,
            "nonce": self.nonce,
        });
        OAuthState::new(STATE.encode(json.to_string()))
    }

    /// Decodes a state value
    ///
    /// Values encoded with either base64 alphabet are accepted. Returns `None`
    /// if the value does not hold a login state.
    pub fn decode(state: &OAuthStateRef) -> Option<Self> {
        let normalized = state.as_str().replace('+', "-").replace('/', "_");
        let json = STATE.decode(normalized.as_bytes()).ok()?;
        serde_json::from_slice(&json).ok()
    }

    /// The path to return to, defaulting to `/`
    pub fn return_to(&self) -> &str {
        self.return_to
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or("/")
    }
}

/// The return path carried by a raw `state` value, defaulting to `/`
pub(crate) fn return_to(state: Option<&OAuthStateRef>) -> String {
    state
        .and_then(LoginState::decode)
        .map_or_else(|| String::from("/"), |s| s.return_to().to_owned())
}

/// Builds the authorize URL for a login redirect
pub fn authorize_url(
    config: &ResolvedConfig,
    state: &OAuthStateRef,
    provider: Option<&ProviderIdRef>,
) -> String {
    let redirect_uri = config.redirect_uri();
    let mut query = form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("client_id", config.client_id().as_str())
        .append_pair("redirect_uri", &redirect_uri)
        .append_pair("state", state.as_str());

    if let Some(provider) = provider {
        query.append_pair("provider", provider.as_str());
    }

    format!("{}/authorize?{}", config.auth_url(), query.finish())
}
