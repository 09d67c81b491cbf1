//! Session reconciliation: the store, the user-facing actions that mutate it,
//! and the guard that gates protected views on it.

pub mod actions;
pub mod error;
pub mod guard;
pub mod store;

pub use actions::{ActionOptions, AuthActions, SignInOutcome, SignOutOutcome, SignUpResult};
pub use error::AuthError;
pub use guard::{GuardDecision, GuardOptions, GuardPhase, RouteGuard};
pub use store::{RefreshOutcome, SessionStore, Subscription};
