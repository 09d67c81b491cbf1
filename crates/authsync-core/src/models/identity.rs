use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Refresh the access token this long before it actually expires.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Provider-issued token bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Session {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        let refresh_at = self.expires_at - Duration::seconds(TOKEN_REFRESH_MARGIN_SECS);
        Utc::now() >= refresh_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Profile snapshot for the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    /// Best label for status lines: name, then email, then id.
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("session belongs to user {session_user_id} but profile is for {user_id}")]
pub struct IdentityMismatch {
    pub session_user_id: String,
    pub user_id: String,
}

/// A session together with the user it belongs to.
///
/// The pair can only be built when the ids agree, so holders never see a
/// session without its user or the other way round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    session: Session,
    user: User,
}

impl Identity {
    pub fn new(session: Session, user: User) -> Result<Self, IdentityMismatch> {
        if session.user_id != user.id {
            return Err(IdentityMismatch {
                session_user_id: session.user_id,
                user_id: user.id,
            });
        }
        Ok(Self { session, user })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    pub fn into_parts(self) -> (Session, User) {
        (self.session, self.user)
    }
}
