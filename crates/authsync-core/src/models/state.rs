use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Identity, Session, User};

/// Error categories surfaced to views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum ErrorKind {
    InvalidCredentials,
    /// Sign-up accepted, but the account must be confirmed out of band.
    ConfirmationPending,
    /// Network failure, timeout, rate limit or provider 5xx.
    ProviderUnavailable,
    /// The provider answered but refused the request.
    ProviderRejected,
    /// No provider URL/key configured.
    NotConfigured,
    /// A persisted snapshot could not be parsed.
    CacheCorrupt,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidCredentials => "invalid_credentials",
            ErrorKind::ConfirmationPending => "confirmation_pending",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::ProviderRejected => "provider_rejected",
            ErrorKind::NotConfigured => "not_configured",
            ErrorKind::CacheCorrupt => "cache_corrupt",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last error recorded on the state, with a message fit for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AuthFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl AuthFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The externally visible authentication aggregate.
///
/// Session and user live together inside `Identity`, so a snapshot can never
/// carry one without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthState {
    #[serde(flatten)]
    identity: Option<Identity>,
    pub loading: bool,
    pub error: Option<AuthFailure>,
}

impl AuthState {
    /// Nothing known yet: no snapshot, waiting on the provider.
    pub fn loading() -> Self {
        Self {
            identity: None,
            loading: true,
            error: None,
        }
    }

    pub fn signed_out() -> Self {
        Self {
            identity: None,
            loading: false,
            error: None,
        }
    }

    pub fn signed_in(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            loading: false,
            error: None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.identity.as_ref().map(Identity::session)
    }

    pub fn user(&self) -> Option<&User> {
        self.identity.as_ref().map(Identity::user)
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Replace session and user in one step.
    pub(crate) fn set_identity(&mut self, identity: Option<Identity>) {
        self.identity = identity;
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::loading()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn identity() -> Identity {
        Identity::new(
            Session {
                access_token: "tok".to_string(),
                refresh_token: None,
                expires_at: Utc::now() + Duration::hours(1),
                user_id: "u1".to_string(),
            },
            User {
                id: "u1".to_string(),
                email: Some("a@b.com".to_string()),
                full_name: None,
                avatar_url: None,
                created_at: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_default_state_is_loading_without_identity() {
        let state = AuthState::default();
        assert!(state.loading);
        assert!(state.session().is_none());
        assert!(state.user().is_none());
    }

    #[test]
    fn test_signed_in_exposes_session_and_user() {
        let state = AuthState::signed_in(identity());
        assert!(!state.loading);
        assert!(state.is_authenticated());
        assert_eq!(state.session().map(|s| s.user_id.as_str()), Some("u1"));
        assert_eq!(state.user().map(|u| u.id.as_str()), Some("u1"));
    }

    #[test]
    fn test_set_identity_clears_both() {
        let mut state = AuthState::signed_in(identity());
        state.set_identity(None);
        assert!(state.session().is_none());
        assert!(state.user().is_none());
    }

    #[test]
    fn test_state_serializes_flat_shape() {
        let json = serde_json::to_value(AuthState::signed_in(identity())).unwrap();
        assert_eq!(json["user"]["email"], "a@b.com");
        assert_eq!(json["session"]["user_id"], "u1");
        assert_eq!(json["loading"], false);
        assert!(json["error"].is_null());

        let json = serde_json::to_value(AuthState::signed_out()).unwrap();
        assert!(json.get("user").is_none());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::CacheCorrupt.to_string(), "cache_corrupt");
        assert_eq!(
            serde_json::to_string(&ErrorKind::ProviderUnavailable).unwrap(),
            "\"provider_unavailable\""
        );
    }
}
