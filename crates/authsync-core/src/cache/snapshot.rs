use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::PersistentCache;
use crate::models::{ErrorKind, Identity, Session, User};

/// Key holding the cached session snapshot.
pub const AUTH_SESSION_KEY: &str = "auth_session";

/// Key holding the cached user snapshot.
pub const AUTH_USER_KEY: &str = "auth_user";

/// A cached value and when it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> Stamped<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    /// Rounded age for status lines: "just now", "5m ago", "2h ago", "3d ago".
    pub fn saved_ago(&self) -> String {
        const HOUR: i64 = 60;
        const DAY: i64 = 24 * HOUR;

        // Clock skew gives a negative age
        match (Utc::now() - self.cached_at).num_minutes() {
            m if m < 1 => "just now".to_string(),
            m if m < HOUR => format!("{}m ago", m),
            m if m < DAY => format!("{}h ago", (m + HOUR / 2) / HOUR),
            m => format!("{}d ago", (m + DAY / 2) / DAY),
        }
    }
}

#[derive(Debug, Error)]
enum SnapshotError {
    #[error("cache backend unreadable: {0}")]
    Unreadable(anyhow::Error),

    #[error("{0}")]
    Corrupt(String),
}

/// Mirror of the signed-in identity, written as two keys that always move
/// together.
///
/// Reads never fail: an unreadable, half-written or unparsable snapshot is
/// reported as absent so the caller falls back to asking the provider.
#[derive(Clone)]
pub struct SnapshotCache {
    backend: Arc<dyn PersistentCache>,
}

impl SnapshotCache {
    pub fn new(backend: Arc<dyn PersistentCache>) -> Self {
        Self { backend }
    }

    /// Load the cached identity, if a complete and unexpired one exists.
    pub fn load(&self) -> Option<Stamped<Identity>> {
        match self.try_load() {
            Ok(snapshot) => snapshot,
            Err(SnapshotError::Unreadable(e)) => {
                warn!(error = %e, "Failed to read cached session, treating as absent");
                None
            }
            Err(SnapshotError::Corrupt(reason)) => {
                warn!(kind = %ErrorKind::CacheCorrupt, reason = %reason, "Discarding corrupt session snapshot");
                if let Err(e) = self.clear() {
                    debug!(error = %e, "Failed to remove corrupt session snapshot");
                }
                None
            }
        }
    }

    fn try_load(&self) -> Result<Option<Stamped<Identity>>, SnapshotError> {
        let session = self.read::<Session>(AUTH_SESSION_KEY)?;
        let user = self.read::<User>(AUTH_USER_KEY)?;

        let (session, user) = match (session, user) {
            (None, None) => return Ok(None),
            (Some(session), Some(user)) => (session, user),
            (Some(_), None) => return Err(SnapshotError::Corrupt("session without user".to_string())),
            (None, Some(_)) => return Err(SnapshotError::Corrupt("user without session".to_string())),
        };

        let cached_at = session.cached_at.min(user.cached_at);
        let identity = Identity::new(session.data, user.data)
            .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;

        // Left in place; the next reconciliation overwrites or clears it.
        if identity.session().is_expired() {
            debug!(user_id = %identity.user_id(), "Cached session has expired, ignoring");
            return Ok(None);
        }

        Ok(Some(Stamped {
            data: identity,
            cached_at,
        }))
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Stamped<T>>, SnapshotError> {
        let Some(raw) = self.backend.get(key).map_err(SnapshotError::Unreadable)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| SnapshotError::Corrupt(format!("{}: {}", key, e)))
    }

    /// Write session and user. A failed user write rolls back the session key.
    pub fn save(&self, identity: &Identity) -> Result<()> {
        let session = serde_json::to_string(&Stamped::new(identity.session()))?;
        let user = serde_json::to_string(&Stamped::new(identity.user()))?;

        self.backend.set(AUTH_SESSION_KEY, &session)?;
        if let Err(e) = self.backend.set(AUTH_USER_KEY, &user) {
            if let Err(rollback) = self.backend.remove(AUTH_SESSION_KEY) {
                debug!(error = %rollback, "Failed to roll back session snapshot");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove both keys, attempting the second even if the first fails.
    pub fn clear(&self) -> Result<()> {
        let session = self.backend.remove(AUTH_SESSION_KEY);
        let user = self.backend.remove(AUTH_USER_KEY);
        session.and(user)
    }
}
