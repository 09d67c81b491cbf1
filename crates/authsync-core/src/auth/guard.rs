//! Gate for protected views.
//!
//! Each mounted view owns one `RouteGuard`. A guard moves through
//! `Init -> Checking -> {Granted, Denied}`:
//!
//! - a user in the store grants immediately, including a cached one
//! - otherwise the guard triggers one refresh and waits for it to settle,
//!   bounded by `GuardOptions::timeout`
//! - when the timer elapses first the guard keeps reporting `Checking` with
//!   `timed_out` set, and the caller may `continue_anyway()`; it never grants
//!   without a user
//! - `Denied` is terminal and carries the requested location for the
//!   post-login redirect

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::actions::DEFAULT_LOGIN_PATH;
use super::SessionStore;
use crate::models::AuthState;

/// How long a guard waits for the session check before offering to continue.
pub const DEFAULT_GUARD_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct GuardOptions {
    pub timeout: Duration,
    pub login_path: String,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_GUARD_TIMEOUT,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPhase {
    Init,
    Checking,
    Granted,
    Denied,
}

/// What the view should do right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum GuardDecision {
    Granted,
    /// Keep showing the loading view. With `timed_out` set, also offer a
    /// manual "continue" control.
    Checking { timed_out: bool },
    /// Redirect to `redirect_to`, remembering `return_to`.
    Denied { redirect_to: String, return_to: String },
}

pub struct RouteGuard {
    store: SessionStore,
    options: GuardOptions,
    location: String,
    phase: GuardPhase,
    /// Settled-refresh count when checking began; any later settlement is
    /// the answer we were waiting for.
    awaiting_after: u64,
    deadline: Option<Instant>,
    timed_out: bool,
}

impl RouteGuard {
    pub fn new(store: SessionStore, options: GuardOptions, location: impl Into<String>) -> Self {
        Self {
            store,
            options,
            location: location.into(),
            phase: GuardPhase::Init,
            awaiting_after: 0,
            deadline: None,
            timed_out: false,
        }
    }

    pub fn phase(&self) -> GuardPhase {
        self.phase
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// First evaluation for this view. Grants from the current state if it
    /// has a user, otherwise starts checking. Must be called from within a
    /// Tokio runtime.
    pub fn mount(&mut self) -> GuardDecision {
        let (state, settled) = self.store.observe();
        self.evaluate_at(&state, settled)
    }

    /// Decision for `state`, given this guard's phase and timer.
    ///
    /// The settled-refresh count only describes the store's current state,
    /// so a `state` the store has since moved past is replaced by the
    /// current one before deciding.
    pub fn evaluate(&mut self, state: &AuthState) -> GuardDecision {
        let (live, settled) = self.store.observe();
        if *state != live {
            debug!(location = %self.location, "Evaluating current state instead of outdated snapshot");
        }
        self.evaluate_at(&live, settled)
    }

    /// Wait until the guard grants, denies, or its timer elapses.
    pub async fn resolve(&mut self) -> GuardDecision {
        let mut changes = self.store.watch();
        loop {
            // Mark the current value seen before reading the store, so any
            // later change wakes us.
            let _ = changes.borrow_and_update();
            let (state, settled) = self.store.observe();
            let decision = self.evaluate_at(&state, settled);

            let deadline = match (&decision, self.deadline) {
                (GuardDecision::Checking { timed_out: false }, Some(deadline)) => deadline,
                _ => return decision,
            };

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return decision;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Manual escape after a timeout: keep waiting for the session instead of
    /// giving up. Re-arms the timer and asks for another refresh. Has no
    /// effect unless the guard is checking and has timed out.
    pub fn continue_anyway(&mut self) -> GuardDecision {
        let (state, settled) = self.store.observe();
        let decision = self.evaluate_at(&state, settled);
        if decision != (GuardDecision::Checking { timed_out: true }) {
            return decision;
        }

        info!(location = %self.location, "Continuing to wait for session");
        self.begin_checking(settled);
        GuardDecision::Checking { timed_out: false }
    }

    fn evaluate_at(&mut self, state: &AuthState, settled: u64) -> GuardDecision {
        if self.phase == GuardPhase::Denied {
            return self.denied();
        }

        if state.is_authenticated() {
            if self.phase != GuardPhase::Granted {
                debug!(location = %self.location, "Access granted");
            }
            self.phase = GuardPhase::Granted;
            self.deadline = None;
            self.timed_out = false;
            return GuardDecision::Granted;
        }

        match self.phase {
            GuardPhase::Init => {
                self.begin_checking(settled);
                GuardDecision::Checking { timed_out: false }
            }
            GuardPhase::Granted => {
                info!(location = %self.location, "Session ended, denying access");
                self.deny()
            }
            GuardPhase::Checking if settled > self.awaiting_after => {
                info!(location = %self.location, "No session after refresh, denying access");
                self.deny()
            }
            GuardPhase::Checking => {
                self.poll_timer();
                GuardDecision::Checking {
                    timed_out: self.timed_out,
                }
            }
            GuardPhase::Denied => self.denied(),
        }
    }

    fn begin_checking(&mut self, settled: u64) {
        self.phase = GuardPhase::Checking;
        self.awaiting_after = settled;
        self.deadline = Some(Instant::now() + self.options.timeout);
        self.timed_out = false;
        debug!(location = %self.location, settled, "Checking session");

        // Single-flight: joins any refresh already outstanding.
        let store = self.store.clone();
        let refresh = tokio::spawn(async move {
            store.refresh().await;
        });
        self.store.track(refresh);
    }

    fn poll_timer(&mut self) {
        if self.timed_out {
            return;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.timed_out = true;
                warn!(
                    location = %self.location,
                    timeout_ms = self.options.timeout.as_millis() as u64,
                    "Session check timed out"
                );
            }
        }
    }

    fn deny(&mut self) -> GuardDecision {
        self.phase = GuardPhase::Denied;
        self.deadline = None;
        self.timed_out = false;
        self.denied()
    }

    fn denied(&self) -> GuardDecision {
        GuardDecision::Denied {
            redirect_to: self.options.login_path.clone(),
            return_to: self.location.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, SnapshotCache};
    use crate::tests::harness::{identity, MockIdentityClient};
    use std::sync::Arc;

    fn guard_for(client: &Arc<MockIdentityClient>) -> (SessionStore, RouteGuard) {
        let store = SessionStore::new(client.clone(), SnapshotCache::new(Arc::new(MemoryCache::new())));
        let guard = RouteGuard::new(store.clone(), GuardOptions::default(), "/rules");
        (store, guard)
    }

    #[tokio::test]
    async fn test_mount_with_user_grants_without_refresh() {
        let client = MockIdentityClient::arc();
        let (store, mut guard) = guard_for(&client);
        store.set_state(identity("u1"));

        assert_eq!(guard.mount(), GuardDecision::Granted);
        assert_eq!(guard.phase(), GuardPhase::Granted);
        tokio::task::yield_now().await;
        assert_eq!(client.get_session_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_is_terminal() {
        let client = MockIdentityClient::arc();
        let (store, mut guard) = guard_for(&client);

        assert_eq!(guard.mount(), GuardDecision::Checking { timed_out: false });
        let decision = guard.resolve().await;
        assert_eq!(
            decision,
            GuardDecision::Denied {
                redirect_to: "/login".to_string(),
                return_to: "/rules".to_string(),
            }
        );

        store.set_state(identity("u1"));
        assert_eq!(guard.evaluate(&store.get_auth_state()), decision);
        assert_eq!(guard.phase(), GuardPhase::Denied);
    }

    #[tokio::test]
    async fn test_granted_reverts_to_denied_when_user_disappears() {
        let client = MockIdentityClient::arc();
        let (store, mut guard) = guard_for(&client);
        store.set_state(identity("u1"));
        assert_eq!(guard.mount(), GuardDecision::Granted);

        store.clear();
        assert!(matches!(
            guard.evaluate(&store.get_auth_state()),
            GuardDecision::Denied { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_anyway_is_noop_unless_timed_out() {
        let client = MockIdentityClient::arc();
        client.push_session(10_000, Ok(None));
        let (_store, mut guard) = guard_for(&client);

        assert_eq!(guard.mount(), GuardDecision::Checking { timed_out: false });
        assert_eq!(guard.continue_anyway(), GuardDecision::Checking { timed_out: false });
    }

    #[test]
    fn test_decision_serializes_with_status_tag() {
        let json = serde_json::to_value(GuardDecision::Checking { timed_out: true }).unwrap();
        assert_eq!(json["status"], "checking");
        assert_eq!(json["timed_out"], true);

        let json = serde_json::to_value(GuardDecision::Denied {
            redirect_to: "/login".to_string(),
            return_to: "/rules".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "denied");
        assert_eq!(json["return_to"], "/rules");
    }
}
