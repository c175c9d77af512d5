//! The observable state of a session

use serde::{Deserialize, Serialize};

use crate::{token::Claims, AccessToken, AccessTokenRef, OrgId};

/// The org role assumed when the token carries no organization
pub const DEFAULT_ORG_ROLE: &str = "member";

/// The signed-in user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User ID
    pub id: String,
    /// Email address
    pub email: String,
    /// Display name
    pub name: String,
    /// `admin` for organization owners and admins, `member` otherwise
    pub role: String,
    /// Avatar image URL
    pub image_url: Option<String>,
    /// Application-specific role
    pub app_role: Option<String>,
}

/// An organization
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    /// Organization ID
    pub id: OrgId,
    /// Display name
    pub name: String,
    /// URL-friendly name
    pub slug: String,
    /// Logo image URL
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Where the session's refresh state machine currently sits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// No refresh has been attempted yet
    Idle,
    /// A refresh is in flight
    Refreshing,
    /// The most recent refresh produced a token
    Authenticated,
    /// The most recent refresh failed, or the session was logged out
    Unauthenticated,
}

/// A snapshot of a session
///
/// Snapshots are immutable. Every change to a session publishes a whole new
/// snapshot, so the fields derived from the access token are always
/// consistent with that token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    is_authenticated: bool,
    is_loading: bool,
    user: Option<User>,
    organization: Option<Organization>,
    org_role: String,
    is_admin: bool,
    is_owner: bool,
    is_super_admin: bool,
    is_platform_admin: bool,
    access_token: Option<AccessToken>,
    organizations: Vec<Organization>,
    is_logging_in: bool,
    is_logging_out: bool,
    login_error: Option<String>,
}

impl Default for SessionState {
    /// The state of a session that has not yet finished loading
    fn default() -> Self {
        Self {
            is_authenticated: false,
            is_loading: true,
            user: None,
            organization: None,
            org_role: String::from(DEFAULT_ORG_ROLE),
            is_admin: false,
            is_owner: false,
            is_super_admin: false,
            is_platform_admin: false,
            access_token: None,
            organizations: Vec::new(),
            is_logging_in: false,
            is_logging_out: false,
            login_error: None,
        }
    }
}

impl SessionState {
    /// Derives the state for a newly issued token
    ///
    /// Everything derived from the token is replaced. The organization list,
    /// loading and in-flight flags, and the last login error carry over from
    /// `self`.
    pub(crate) fn with_token(&self, token: AccessToken, claims: &Claims, require_org: bool) -> Self {
        let org_role = claims
            .org
            .as_ref()
            .map_or(DEFAULT_ORG_ROLE, |o| o.role.as_str())
            .to_owned();
        let is_admin = org_role == "admin" || org_role == "owner";
        let is_owner = org_role == "owner";

        let user = User {
            id: claims.sub.clone(),
            email: claims.email.clone(),
            name: claims.name.clone().unwrap_or_else(|| String::from("User")),
            role: String::from(if is_admin { "admin" } else { "member" }),
            image_url: claims.avatar_url.clone(),
            app_role: claims.app_role.clone(),
        };

        let organization = claims.org.as_ref().map(|o| Organization {
            id: o.id.clone(),
            name: o.name.clone(),
            slug: o.slug.clone(),
            image_url: None,
        });

        Self {
            is_authenticated: organization.is_some() || !require_org,
            user: Some(user),
            organization,
            org_role,
            is_admin,
            is_owner,
            is_super_admin: claims.is_super_admin,
            is_platform_admin: claims.is_super_admin,
            access_token: Some(token),
            ..self.clone()
        }
    }

    /// Derives the unauthenticated state
    ///
    /// All token-derived fields are cleared. The organization list, loading
    /// and in-flight flags, and the last login error carry over from `self`.
    pub(crate) fn without_token(&self) -> Self {
        Self {
            is_loading: self.is_loading,
            organizations: self.organizations.clone(),
            is_logging_in: self.is_logging_in,
            is_logging_out: self.is_logging_out,
            login_error: self.login_error.clone(),
            ..Self::default()
        }
    }

    /// The fully signed-out state, as left behind by a logout
    pub(crate) fn signed_out(&self) -> Self {
        Self {
            is_loading: self.is_loading,
            ..Self::default()
        }
    }

    pub(crate) fn set_loading(&mut self, is_loading: bool) {
        self.is_loading = is_loading;
    }

    pub(crate) fn set_logging_in(&mut self, is_logging_in: bool) {
        self.is_logging_in = is_logging_in;
    }

    pub(crate) fn set_logging_out(&mut self, is_logging_out: bool) {
        self.is_logging_out = is_logging_out;
    }

    pub(crate) fn set_login_error(&mut self, login_error: Option<String>) {
        self.login_error = login_error;
    }

    pub(crate) fn set_organizations(&mut self, organizations: Vec<Organization>) {
        self.organizations = organizations;
    }

    /// Whether the session holds a token and satisfies the organization requirement
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    /// Whether the session is still performing its initial load
    #[inline]
    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    /// The signed-in user
    #[inline]
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// The organization the session is currently scoped to
    #[inline]
    pub fn organization(&self) -> Option<&Organization> {
        self.organization.as_ref()
    }

    /// The user's role within the current organization
    #[inline]
    pub fn org_role(&self) -> &str {
        &self.org_role
    }

    /// The application-specific role
    #[inline]
    pub fn app_role(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.app_role.as_deref())
    }

    /// Whether the user administers the current organization
    #[inline]
    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// Whether the user owns the current organization
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Whether the user is a platform super-admin
    #[inline]
    pub fn is_super_admin(&self) -> bool {
        self.is_super_admin
    }

    /// Whether the user is a platform admin
    #[inline]
    pub fn is_platform_admin(&self) -> bool {
        self.is_platform_admin
    }

    /// The current access token
    #[inline]
    pub fn access_token(&self) -> Option<&AccessTokenRef> {
        self.access_token.as_deref()
    }

    /// The organizations the user belongs to
    ///
    /// This list is fetched separately from the token and may lag behind it.
    #[inline]
    pub fn organizations(&self) -> &[Organization] {
        &self.organizations
    }

    /// Whether a login redirect is underway
    ///
    /// Only ever set when the host can navigate. It is cleared once the
    /// sign-in callback has been handled.
    #[inline]
    pub fn is_logging_in(&self) -> bool {
        self.is_logging_in
    }

    /// Whether a logout is underway
    #[inline]
    pub fn is_logging_out(&self) -> bool {
        self.is_logging_out
    }

    /// The error from the most recent failed login
    #[inline]
    pub fn login_error(&self) -> Option<&str> {
        self.login_error.as_deref()
    }
}
