use aliri_braid::braid;
use std::fmt;

const REDACTED: &str = "***ACCESS TOKEN***";

/// Characters shown by `{:#?}` when no width is given
const PREVIEW_CHARS: usize = 15;

/// Splits off the part of `token` that fits in `budget` characters
///
/// When the token is too long, the returned prefix leaves room for a
/// trailing ellipsis and the flag is set.
fn preview(token: &str, budget: usize) -> (&str, bool) {
    if token.chars().count() <= budget {
        return (token, false);
    }

    let end = token
        .char_indices()
        .nth(budget.saturating_sub(1))
        .map_or(0, |(idx, _)| idx);
    (&token[..end], true)
}

/// A client ID registered with the auth service
#[braid(serde)]
pub struct ClientId;

/// An access token
///
/// Only the payload segment is ever inspected, and the token is never
/// verified locally. Formatting redacts the value unless the alternate
/// flag is used.
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

impl fmt::Debug for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !f.alternate() {
            return f.write_str(REDACTED);
        }

        let (shown, truncated) = preview(self.as_str(), f.width().unwrap_or(PREVIEW_CHARS));
        f.write_str("\"")?;
        f.write_str(shown)?;
        if truncated {
            f.write_str("…")?;
        }
        f.write_str("\"")
    }
}

impl fmt::Display for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_str(self.as_str())
        } else {
            f.write_str(REDACTED)
        }
    }
}

/// An organization ID
#[braid(serde)]
pub struct OrgId;

/// A sign-in provider ID, such as `github` or `google`
#[braid(serde)]
pub struct ProviderId;

/// The opaque `state` value round-tripped through the identity provider
#[braid(serde)]
pub struct OAuthState;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_is_redacted_by_default() {
        let token = AccessToken::from_static("aaaa.bbbbbbbbbbbbbbbbbbbb.cccc");

        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn access_token_reveals_prefix_with_alternate_flag() {
        let token = AccessToken::from_static("aaaa.bbbbbbbbbbbbbbbbbbbb.cccc");

        assert_eq!(format!("{:#?}", token), "\"aaaa.bbbbbbbbb…\"");
        assert_eq!(format!("{:#}", token), "aaaa.bbbbbbbbbbbbbbbbbbbb.cccc");
    }

    #[test]
    fn width_bounds_the_revealed_prefix() {
        let token = AccessToken::from_static("aaaa.bbbbbbbbbbbbbbbbbbbb.cccc");

        assert_eq!(format!("{:#5?}", token), "\"aaaa…\"");
        assert_eq!(format!("{:#1?}", token), "\"…\"");
        assert_eq!(format!("{:#64?}", token), "\"aaaa.bbbbbbbbbbbbbbbbbbbb.cccc\"");
    }

    #[test]
    fn preview_counts_characters_not_bytes() {
        assert_eq!(preview("ééé", 3), ("ééé", false));
        assert_eq!(preview("éééé", 3), ("éé", true));
    }
}
