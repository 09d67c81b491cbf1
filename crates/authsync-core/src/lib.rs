//! Core library for authsync.
//!
//! Keeps one in-memory authentication state in step with a remote identity
//! provider and a local persistent cache:
//!
//! - `models`: `Session`, `User`, `Identity` and the `AuthState` aggregate
//! - `cache`: key/value backends and the `SnapshotCache` mirror
//! - `api`: the `IdentityClient` seam plus the Supabase (GoTrue) client
//! - `auth`: `SessionStore`, `AuthActions` and `RouteGuard`
//! - `config`: on-disk configuration with environment overrides

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;

#[cfg(test)]
mod tests;

pub use api::{
    IdentityClient, ProviderError, SessionEvent, SessionEventKind, SignUpOutcome, SupabaseClient,
    UnconfiguredClient,
};
pub use auth::{
    ActionOptions, AuthActions, AuthError, GuardDecision, GuardOptions, GuardPhase, RefreshOutcome,
    RouteGuard, SessionStore, SignInOutcome, SignOutOutcome, SignUpResult, Subscription,
};
pub use cache::{PersistentCache, SnapshotCache};
pub use config::{CacheBackend, Config};
pub use models::{AuthFailure, AuthState, ErrorKind, Identity, Session, User};
