//! Test harness: a scripted `IdentityClient` plus fixtures.
//!
//! Replies are queued per operation with a delay. Call counters are bumped
//! when the method is called, not when its future completes, so a test can
//! count calls that are still outstanding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::broadcast;

use crate::api::{IdentityClient, ProviderError, ProviderResult, SessionEvent, SignUpOutcome};
use crate::auth::{ActionOptions, AuthActions, SessionStore};
use crate::cache::{MemoryCache, SnapshotCache};
use crate::models::{AuthState, ErrorKind, Identity, Session, User};

/// A signed-in identity for `user_id`. Deterministic, so two calls compare
/// equal.
pub fn identity(user_id: &str) -> Identity {
    identity_with_token(user_id, &format!("token-{}", user_id))
}

pub fn identity_with_token(user_id: &str, access_token: &str) -> Identity {
    Identity::new(
        Session {
            access_token: access_token.to_string(),
            refresh_token: Some(format!("refresh-{}", user_id)),
            expires_at: Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap(),
            user_id: user_id.to_string(),
        },
        User {
            id: user_id.to_string(),
            email: Some(format!("{}@example.com", user_id)),
            full_name: None,
            avatar_url: None,
            created_at: None,
        },
    )
    .unwrap()
}

/// Provider error for a scripted failure kind.
fn provider_error(kind: ErrorKind) -> ProviderError {
    match kind {
        ErrorKind::InvalidCredentials => ProviderError::InvalidCredentials("Invalid login credentials".to_string()),
        ErrorKind::ConfirmationPending => ProviderError::ConfirmationPending("Email not confirmed".to_string()),
        ErrorKind::ProviderUnavailable => ProviderError::Unavailable("connection refused".to_string()),
        ErrorKind::ProviderRejected | ErrorKind::CacheCorrupt => {
            ProviderError::Rejected("Status 422: rejected".to_string())
        }
        ErrorKind::NotConfigured => ProviderError::NotConfigured,
    }
}

struct Scripted<T> {
    delay: Duration,
    reply: Result<T, ErrorKind>,
}

impl<T> Scripted<T> {
    fn new(delay_ms: u64, reply: Result<T, ErrorKind>) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            reply,
        }
    }

    async fn resolve(self) -> ProviderResult<T> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.map_err(provider_error)
    }
}

/// Scripted identity provider.
pub struct MockIdentityClient {
    sessions: Mutex<VecDeque<Scripted<Option<Identity>>>>,
    /// Reply when no session reply is queued.
    default_session: Mutex<Result<Option<Identity>, ErrorKind>>,
    sign_ins: Mutex<VecDeque<Scripted<Identity>>>,
    sign_ups: Mutex<VecDeque<Scripted<SignUpOutcome>>>,
    sign_outs: Mutex<VecDeque<Scripted<()>>>,
    get_session_calls: AtomicUsize,
    sign_in_calls: AtomicUsize,
    sign_up_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
    events: broadcast::Sender<SessionEvent>,
}

impl MockIdentityClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            sessions: Mutex::new(VecDeque::new()),
            default_session: Mutex::new(Ok(None)),
            sign_ins: Mutex::new(VecDeque::new()),
            sign_ups: Mutex::new(VecDeque::new()),
            sign_outs: Mutex::new(VecDeque::new()),
            get_session_calls: AtomicUsize::new(0),
            sign_in_calls: AtomicUsize::new(0),
            sign_up_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            events,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Immediate reply for every unscripted `get_session`.
    pub fn set_session(&self, session: Option<Identity>) {
        *self.default_session.lock().unwrap() = Ok(session);
    }

    pub fn push_session(&self, delay_ms: u64, reply: Result<Option<Identity>, ErrorKind>) {
        self.sessions.lock().unwrap().push_back(Scripted::new(delay_ms, reply));
    }

    pub fn push_sign_in(&self, delay_ms: u64, reply: Result<Identity, ErrorKind>) {
        self.sign_ins.lock().unwrap().push_back(Scripted::new(delay_ms, reply));
    }

    pub fn push_sign_up(&self, delay_ms: u64, reply: Result<SignUpOutcome, ErrorKind>) {
        self.sign_ups.lock().unwrap().push_back(Scripted::new(delay_ms, reply));
    }

    pub fn push_sign_out(&self, delay_ms: u64, reply: Result<(), ErrorKind>) {
        self.sign_outs.lock().unwrap().push_back(Scripted::new(delay_ms, reply));
    }

    /// Push a provider event to every subscribed store.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    pub fn get_session_calls(&self) -> usize {
        self.get_session_calls.load(Ordering::SeqCst)
    }

    pub fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    pub fn sign_up_calls(&self) -> usize {
        self.sign_up_calls.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }
}

impl IdentityClient for MockIdentityClient {
    fn get_session(&self) -> BoxFuture<'_, ProviderResult<Option<Identity>>> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.sessions.lock().unwrap().pop_front().unwrap_or_else(|| Scripted {
            delay: Duration::ZERO,
            reply: self.default_session.lock().unwrap().clone(),
        });
        scripted.resolve().boxed()
    }

    fn sign_in<'a>(&'a self, _email: &'a str, _password: &'a str) -> BoxFuture<'a, ProviderResult<Identity>> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .sign_ins
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Scripted::new(0, Err(ErrorKind::InvalidCredentials)));
        scripted.resolve().boxed()
    }

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        _password: &'a str,
    ) -> BoxFuture<'a, ProviderResult<SignUpOutcome>> {
        self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.sign_ups.lock().unwrap().pop_front().unwrap_or_else(|| {
            Scripted::new(
                0,
                Ok(SignUpOutcome::ConfirmationPending {
                    email: email.to_string(),
                }),
            )
        });
        scripted.resolve().boxed()
    }

    fn sign_out(&self) -> BoxFuture<'_, ProviderResult<()>> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .sign_outs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Scripted::new(0, Ok(())));
        scripted.resolve().boxed()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Store over `client` backed by a fresh in-memory cache.
pub fn memory_store(client: &Arc<MockIdentityClient>) -> (SessionStore, Arc<MemoryCache>) {
    let backend = Arc::new(MemoryCache::new());
    let store = SessionStore::new(client.clone(), SnapshotCache::new(backend.clone()));
    (store, backend)
}

/// Store whose cache already holds `identity`.
pub fn cached_store(client: &Arc<MockIdentityClient>, identity: &Identity) -> (SessionStore, Arc<MemoryCache>) {
    let (store, backend) = memory_store(client);
    store.cache().save(identity).unwrap();
    (store, backend)
}

pub fn actions_for(store: &SessionStore) -> AuthActions {
    AuthActions::new(store.clone(), ActionOptions::default())
}

/// Collect every state a subscriber sees.
pub fn record(store: &SessionStore) -> (crate::auth::Subscription, Arc<Mutex<Vec<AuthState>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = store.subscribe(move |state| sink.lock().unwrap().push(state.clone()));
    (subscription, seen)
}

/// Let spawned tasks run. With a paused clock this also advances time by a
/// millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
