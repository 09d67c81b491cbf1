//! The single authority for `AuthState`.
//!
//! Every mutation goes through the core lock, is mirrored to the snapshot
//! cache, and is published to watchers and subscribers before the lock is
//! released, so all observers see changes in the order they were applied.
//!
//! Refreshes are single-flight: while one `get_session` call is outstanding,
//! further `refresh()` calls return `AlreadyInFlight` without touching the
//! network. Each refresh remembers the epoch it started at and its result is
//! dropped if any other mutation bumped the epoch in the meantime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{IdentityClient, ProviderResult, SessionEvent};
use crate::cache::SnapshotCache;
use crate::models::{AuthFailure, AuthState, ErrorKind, Identity};

/// Buffered state changes per subscriber before it is considered lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// How a call to `refresh()` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The provider's answer changed the state.
    Applied,
    /// The provider agreed with what we already had.
    Unchanged,
    /// A newer mutation landed while the call was outstanding.
    Superseded,
    /// The provider call failed; the previous state was kept.
    Failed(ErrorKind),
    /// Another refresh was outstanding; no call was made.
    AlreadyInFlight,
}

struct Core {
    state: AuthState,
    initialized: bool,
    /// Bumped by every refresh start and every direct mutation.
    epoch: u64,
    /// Epoch of the outstanding refresh, if any.
    in_flight: Option<u64>,
    /// Number of refreshes that have settled or been abandoned.
    settled: u64,
}

struct Inner {
    client: Arc<dyn IdentityClient>,
    cache: SnapshotCache,
    core: Mutex<Core>,
    state_tx: watch::Sender<AuthState>,
    changes_tx: broadcast::Sender<AuthState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the state and notify observers. Must be called with the core
    /// lock held. Returns false if nothing changed.
    fn publish(&self, core: &mut Core, next: AuthState) -> bool {
        if core.state == next {
            return false;
        }
        core.state = next.clone();
        self.state_tx.send_replace(next.clone());
        // No subscribers is fine
        let _ = self.changes_tx.send(next);
        true
    }

    /// Wake watchers without a state change, so they re-check
    /// `settled_refreshes`.
    fn touch(&self, core: &Core) {
        self.state_tx.send_replace(core.state.clone());
    }

    fn mirror(&self, identity: Option<&Identity>) {
        let result = match identity {
            Some(identity) => self.cache.save(identity),
            None => self.cache.clear(),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to update session cache");
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Marks a refresh as outstanding. If the refresh future is dropped before
/// the provider answers, the marker is released here.
struct InFlight<'a> {
    inner: &'a Inner,
    epoch: u64,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut core = self.inner.lock();
        if core.in_flight == Some(self.epoch) {
            core.in_flight = None;
        }
        core.settled += 1;
        debug!(epoch = self.epoch, "Refresh abandoned before settling");

        let mut next = core.state.clone();
        next.loading = false;
        if !self.inner.publish(&mut core, next) {
            self.inner.touch(&core);
        }
    }
}

/// Handle to a `subscribe` callback. Dropping it unsubscribes.
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shared handle to the canonical authentication state.
///
/// Cloning is cheap; all clones see and mutate the same state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    pub fn new(client: Arc<dyn IdentityClient>, cache: SnapshotCache) -> Self {
        let (state_tx, _) = watch::channel(AuthState::loading());
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                client,
                cache,
                core: Mutex::new(Core {
                    state: AuthState::loading(),
                    initialized: false,
                    epoch: 0,
                    in_flight: None,
                    settled: 0,
                }),
                state_tx,
                changes_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn client(&self) -> &Arc<dyn IdentityClient> {
        &self.inner.client
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.inner.cache
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Seed state from the cache, start listening for provider events and
    /// kick off the initial refresh.
    ///
    /// The seed is synchronous, so a cached session is visible as soon as
    /// this returns. Must be called from within a Tokio runtime. Calling it
    /// again is a no-op.
    pub fn initialize(&self) {
        {
            let mut core = self.inner.lock();
            if core.initialized {
                debug!("Session store already initialized");
                return;
            }
            core.initialized = true;

            let seeded = match self.inner.cache.load() {
                Some(cached) => {
                    info!(
                        user_id = %cached.data.user_id(),
                        age = %cached.saved_ago(),
                        "Restored session from cache"
                    );
                    AuthState::signed_in(cached.data)
                }
                None => {
                    debug!("No cached session, waiting on provider");
                    AuthState::loading()
                }
            };
            self.inner.publish(&mut core, seeded);
        }

        // Subscribe before spawning so no event between now and the first
        // poll of the listener is missed.
        let events = self.inner.client.session_events();
        let listener = tokio::spawn(listen(Arc::downgrade(&self.inner), events));
        self.inner.track(listener);

        let store = self.clone();
        let initial = tokio::spawn(async move {
            store.refresh().await;
        });
        self.inner.track(initial);
    }

    /// Abort background work (event listener, pending confirmation refreshes).
    pub fn shutdown(&self) {
        let tasks = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        debug!(count = tasks.len(), "Stopping session store tasks");
        for task in tasks {
            task.abort();
        }
    }

    /// Keep a background task owned by the store so `shutdown` stops it.
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        self.inner.track(handle);
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn get_auth_state(&self) -> AuthState {
        self.inner.lock().state.clone()
    }

    /// Receiver that always holds the latest state.
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.inner.state_tx.subscribe()
    }

    /// Call `callback` with every state change, in order.
    ///
    /// Callbacks run on a background task, so they may call back into the
    /// store. A subscriber that falls too far behind skips to the latest
    /// state. Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(&AuthState) + Send + 'static,
    {
        let mut changes = self.inner.changes_tx.subscribe();
        let latest = self.inner.state_tx.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(state) => callback(&state),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Subscriber lagged, delivering latest state");
                        changes = changes.resubscribe();
                        let state = latest.borrow().clone();
                        callback(&state);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Subscription { task: Some(task) }
    }

    /// Number of refreshes that have finished, successfully or not.
    pub fn settled_refreshes(&self) -> u64 {
        self.inner.lock().settled
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }

    /// Wait until more than `since` refreshes have settled.
    pub(crate) async fn settled_since(&self, since: u64) {
        let mut changes = self.watch();
        loop {
            changes.borrow_and_update();
            if self.settled_refreshes() > since {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// State and settled count read under one lock.
    pub(crate) fn observe(&self) -> (AuthState, u64) {
        let core = self.inner.lock();
        (core.state.clone(), core.settled)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Replace session and user in one step.
    pub fn set_state(&self, identity: Identity) {
        let mut core = self.inner.lock();
        core.epoch += 1;
        debug!(user_id = %identity.user_id(), epoch = core.epoch, "Setting session");

        let mut next = core.state.clone();
        next.set_identity(Some(identity.clone()));
        next.loading = false;
        next.error = None;
        self.inner.publish(&mut core, next);
        self.inner.mirror(Some(&identity));
    }

    /// Forget the current session locally.
    pub fn clear(&self) {
        let mut core = self.inner.lock();
        core.epoch += 1;
        debug!(epoch = core.epoch, "Clearing session");

        let mut next = core.state.clone();
        next.set_identity(None);
        next.loading = false;
        next.error = None;
        self.inner.publish(&mut core, next);
        self.inner.mirror(None);
    }

    fn apply_provider_event(&self, event: SessionEvent) {
        debug!(kind = ?event.kind, "Provider session event");
        match event.identity {
            Some(identity) => self.set_state(identity),
            None => self.clear(),
        }
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Reconcile with the provider. Returns immediately with
    /// `AlreadyInFlight` if another refresh is outstanding.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.run_refresh(false).await
    }

    /// Like `refresh`, but shows `loading` until the provider answers.
    pub async fn reload(&self) -> RefreshOutcome {
        self.run_refresh(true).await
    }

    async fn run_refresh(&self, show_loading: bool) -> RefreshOutcome {
        let epoch = {
            let mut core = self.inner.lock();
            if core.in_flight.is_some() {
                debug!("Refresh already in flight");
                return RefreshOutcome::AlreadyInFlight;
            }
            core.epoch += 1;
            core.in_flight = Some(core.epoch);

            if show_loading && !core.state.loading {
                let mut next = core.state.clone();
                next.loading = true;
                self.inner.publish(&mut core, next);
            }
            core.epoch
        };

        let mut marker = InFlight {
            inner: &*self.inner,
            epoch,
            armed: true,
        };
        debug!(epoch, "Refreshing session from provider");
        let result = self.inner.client.get_session().await;
        marker.armed = false;

        self.settle(epoch, result)
    }

    fn settle(&self, epoch: u64, result: ProviderResult<Option<Identity>>) -> RefreshOutcome {
        let mut core = self.inner.lock();
        core.in_flight = None;
        core.settled += 1;

        let mut next = core.state.clone();
        next.loading = false;

        let outcome = if core.epoch != epoch {
            debug!(epoch, current = core.epoch, "Discarding superseded refresh result");
            RefreshOutcome::Superseded
        } else {
            match result {
                Ok(Some(identity)) => {
                    next.error = None;
                    if next.identity() == Some(&identity) {
                        RefreshOutcome::Unchanged
                    } else {
                        info!(user_id = %identity.user_id(), epoch, "Session confirmed by provider");
                        self.inner.mirror(Some(&identity));
                        next.set_identity(Some(identity));
                        RefreshOutcome::Applied
                    }
                }
                Ok(None) if next.is_authenticated() => {
                    info!(epoch, "Provider reports no session, signing out locally");
                    next.set_identity(None);
                    next.error = None;
                    self.inner.mirror(None);
                    RefreshOutcome::Applied
                }
                Ok(None) => {
                    // Drops an expired snapshot that was skipped at startup
                    self.inner.mirror(None);
                    next.error = None;
                    RefreshOutcome::Unchanged
                }
                Err(e) => {
                    warn!(
                        epoch,
                        kind = %e.kind(),
                        transient = e.is_transient(),
                        error = %e,
                        "Refresh failed, keeping current state"
                    );
                    next.error = Some(AuthFailure::new(e.kind(), e.to_string()));
                    RefreshOutcome::Failed(e.kind())
                }
            }
        };

        if !self.inner.publish(&mut core, next) {
            self.inner.touch(&core);
        }
        outcome
    }
}

/// Apply provider-pushed events until the store or the provider goes away.
async fn listen(inner: Weak<Inner>, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        let received = events.recv().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let store = SessionStore { inner };

        match received {
            Ok(event) => store.apply_provider_event(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed provider session events, reconciling");
                store.refresh().await;
            }
            Err(RecvError::Closed) => {
                debug!("Provider event stream closed");
                break;
            }
        }
    }
}
