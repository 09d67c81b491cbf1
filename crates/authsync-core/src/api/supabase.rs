//! Identity client for Supabase Auth (GoTrue).
//!
//! Talks to the `/auth/v1` REST endpoints and keeps the provider's own token
//! set (access + refresh token) in a `PersistentCache` under
//! `PROVIDER_STORAGE_KEY`. That storage belongs to the provider client; the
//! application's mirror lives under separate keys and is written by
//! `SessionStore`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{IdentityClient, ProviderError, ProviderResult, SessionEvent, SignUpOutcome};
use crate::cache::PersistentCache;
use crate::models::{Identity, Session, User};

// ============================================================================
// Constants
// ============================================================================

/// Storage key for the provider's token set.
pub const PROVIDER_STORAGE_KEY: &str = "sb-auth-token";

/// How often the background task checks whether the token needs rotating.
pub const AUTO_REFRESH_TICK: Duration = Duration::from_secs(30);

/// HTTP request timeout in seconds.
/// Auth calls are small; anything slower than this is treated as unavailable.
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Buffer for session events. Consumers only care about the latest one.
const EVENT_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: ApiUser,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default, alias = "picture")]
    avatar_url: Option<String>,
}

/// Sign-up answers with a full token response when the project auto-confirms
/// accounts, and with the bare user otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(ApiUser),
}

#[derive(Debug, Serialize)]
struct PasswordRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// On-disk shape of the provider token set.
#[derive(Serialize, Deserialize)]
struct StoredSession {
    session: Session,
    user: User,
}

impl ApiUser {
    fn into_user(self) -> User {
        let metadata = self.user_metadata.unwrap_or_default();
        User {
            id: self.id,
            email: self.email,
            full_name: metadata.full_name,
            avatar_url: metadata.avatar_url,
            created_at: self
                .created_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl TokenResponse {
    fn into_identity(self) -> ProviderResult<Identity> {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(ts), _) => Utc.timestamp_opt(ts, 0).single().ok_or_else(|| {
                ProviderError::InvalidResponse(format!("expires_at out of range: {}", ts))
            })?,
            (None, Some(secs)) => Utc::now() + ChronoDuration::seconds(secs),
            (None, None) => {
                return Err(ProviderError::InvalidResponse(
                    "token response without expiry".to_string(),
                ))
            }
        };

        let user = self.user.into_user();
        let session = Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user_id: user.id.clone(),
        };
        Identity::new(session, user).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

// ============================================================================
// Client
// ============================================================================

/// Supabase Auth client.
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    storage: Arc<dyn PersistentCache>,
    current: Mutex<Option<Identity>>,
    events: broadcast::Sender<SessionEvent>,
    /// Refresh tokens are single-use, so rotations must not overlap.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SupabaseClient {
    /// Create a client, restoring any token set left in `storage`.
    pub fn new(base_url: &str, anon_key: &str, storage: Arc<dyn PersistentCache>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let current = Self::load_stored(storage.as_ref());

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            storage,
            current: Mutex::new(current),
            events,
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn load_stored(storage: &dyn PersistentCache) -> Option<Identity> {
        let raw = match storage.get(PROVIDER_STORAGE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read stored provider session");
                return None;
            }
        };

        let parsed = serde_json::from_str::<StoredSession>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|s| Identity::new(s.session, s.user).map_err(|e| e.to_string()));

        match parsed {
            Ok(identity) => {
                debug!(user_id = %identity.user_id(), "Restored provider session");
                Some(identity)
            }
            Err(reason) => {
                warn!(reason = %reason, "Discarding unreadable provider session");
                if let Err(e) = storage.remove(PROVIDER_STORAGE_KEY) {
                    debug!(error = %e, "Failed to remove unreadable provider session");
                }
                None
            }
        }
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Identity>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Identity> {
        self.lock_current().clone()
    }

    fn persist(&self, identity: Option<&Identity>) {
        let result = match identity {
            Some(identity) => serde_json::to_string(&StoredSession {
                session: identity.session().clone(),
                user: identity.user().clone(),
            })
            .map_err(anyhow::Error::from)
            .and_then(|raw| self.storage.set(PROVIDER_STORAGE_KEY, &raw)),
            None => self.storage.remove(PROVIDER_STORAGE_KEY),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist provider session");
        }
    }

    fn store_identity(&self, identity: &Identity) {
        let mut current = self.lock_current();
        *current = Some(identity.clone());
        self.persist(Some(identity));
    }

    /// Store a rotated identity only if `stale_token` is still the held one.
    /// A sign-out or sign-in that landed during the rotation wins.
    fn replace_if_current(&self, stale_token: &str, identity: &Identity) -> bool {
        let mut current = self.lock_current();
        let still_current = current
            .as_ref()
            .map(|held| held.session().access_token == stale_token)
            .unwrap_or(false);
        if still_current {
            *current = Some(identity.clone());
            self.persist(Some(identity));
        }
        still_current
    }

    fn drop_tokens(&self) -> Option<Identity> {
        let mut current = self.lock_current();
        let previous = current.take();
        self.persist(None);
        previous
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> ProviderResult<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::from_status(status, &body))
        }
    }

    async fn password_grant(&self, email: &str, password: &str) -> ProviderResult<Identity> {
        debug!(email = %email, "Attempting email/password sign-in");

        let response = self
            .client
            .post(self.auth_url("token?grant_type=password"))
            .header("apikey", &self.anon_key)
            .json(&PasswordRequest { email, password })
            .send()
            .await?;
        let response = Self::check_response(response).await.map_err(|e| match e {
            // A 401 here is about the credentials, not a held session
            ProviderError::SessionRejected(detail) => ProviderError::InvalidCredentials(detail),
            e => e,
        })?;

        let tokens: TokenResponse = response.json().await?;
        let identity = tokens.into_identity()?;
        self.store_identity(&identity);

        info!(user_id = %identity.user_id(), "Signed in with password");
        self.emit(SessionEvent::signed_in(identity.clone()));
        Ok(identity)
    }

    async fn register(&self, email: &str, password: &str) -> ProviderResult<SignUpOutcome> {
        debug!(email = %email, "Registering account");

        let response = self
            .client
            .post(self.auth_url("signup"))
            .header("apikey", &self.anon_key)
            .json(&PasswordRequest { email, password })
            .send()
            .await?;
        let response = Self::check_response(response).await?;

        match response.json::<SignUpResponse>().await? {
            SignUpResponse::Session(tokens) => {
                let identity = tokens.into_identity()?;
                self.store_identity(&identity);
                info!(user_id = %identity.user_id(), "Account created and signed in");
                self.emit(SessionEvent::signed_in(identity.clone()));
                Ok(SignUpOutcome::Active(identity))
            }
            SignUpResponse::User(user) => {
                info!(user_id = %user.id, "Account created, awaiting email confirmation");
                Ok(SignUpOutcome::ConfirmationPending {
                    email: user.email.unwrap_or_else(|| email.to_string()),
                })
            }
        }
    }

    /// Tokens are dropped locally before the remote call, so sign-out never
    /// depends on the network.
    async fn revoke(&self) -> ProviderResult<()> {
        let Some(identity) = self.drop_tokens() else {
            debug!("Sign-out requested without a provider session");
            return Ok(());
        };
        info!(user_id = %identity.user_id(), "Signing out");
        self.emit(SessionEvent::signed_out());

        let response = self
            .client
            .post(self.auth_url("logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(&identity.session().access_token)
            .send()
            .await?;

        match Self::check_response(response).await {
            Ok(_) => Ok(()),
            // Already invalid server-side: nothing left to revoke
            Err(ProviderError::SessionRejected(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn load_session(&self) -> ProviderResult<Option<Identity>> {
        let Some(identity) = self.current() else {
            return Ok(None);
        };
        if !identity.session().needs_refresh() {
            return Ok(Some(identity));
        }
        self.refresh_tokens(identity).await
    }

    async fn refresh_tokens(&self, stale: Identity) -> ProviderResult<Option<Identity>> {
        let _rotation = self.refresh_lock.lock().await;

        // Someone else may have rotated or dropped the tokens while we waited.
        match self.current() {
            None => return Ok(None),
            Some(current) if current.session().access_token != stale.session().access_token => {
                return Ok(Some(current));
            }
            Some(_) => {}
        }

        let stale_token = stale.session().access_token.as_str();
        let Some(refresh_token) = stale.session().refresh_token.as_deref() else {
            warn!(user_id = %stale.user_id(), "Session expiring without a refresh token, signing out");
            self.drop_tokens();
            self.emit(SessionEvent::signed_out());
            return Ok(None);
        };

        debug!(user_id = %stale.user_id(), "Refreshing access token");
        let response = self
            .client
            .post(self.auth_url("token?grant_type=refresh_token"))
            .header("apikey", &self.anon_key)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) {
            let body = response.text().await.unwrap_or_default();
            warn!(
                user_id = %stale.user_id(),
                error = %ProviderError::from_status(status, &body),
                "Refresh token rejected, session lost"
            );
            self.drop_tokens();
            self.emit(SessionEvent::signed_out());
            return Ok(None);
        }
        let response = Self::check_response(response).await?;

        let tokens: TokenResponse = response.json().await?;
        let identity = tokens.into_identity()?;
        if !self.replace_if_current(stale_token, &identity) {
            debug!("Discarding rotated token, session changed during refresh");
            return Ok(self.current());
        }

        info!(user_id = %identity.user_id(), "Access token refreshed");
        self.emit(SessionEvent::token_refreshed(identity.clone()));
        Ok(Some(identity))
    }

    /// Rotate the access token in the background before it expires.
    pub fn spawn_auto_refresh(self: &Arc<Self>, tick: Duration) -> JoinHandle<()> {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                let Some(identity) = client.current() else {
                    continue;
                };
                if !identity.session().needs_refresh() {
                    continue;
                }
                if let Err(e) = client.refresh_tokens(identity).await {
                    warn!(error = %e, "Background token refresh failed");
                }
            }
        })
    }
}

impl IdentityClient for SupabaseClient {
    fn get_session(&self) -> BoxFuture<'_, ProviderResult<Option<Identity>>> {
        self.load_session().boxed()
    }

    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, ProviderResult<Identity>> {
        self.password_grant(email, password).boxed()
    }

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, ProviderResult<SignUpOutcome>> {
        self.register(email, password).boxed()
    }

    fn sign_out(&self) -> BoxFuture<'_, ProviderResult<()>> {
        self.revoke().boxed()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
