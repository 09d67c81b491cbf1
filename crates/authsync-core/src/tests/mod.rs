//! Scenario tests for session reconciliation.
//!
//! - `harness.rs` - scripted mock identity client and fixtures
//! - `store.rs`   - single-flight refresh, cache fast path, epoch ordering,
//!                  provider-pushed events, subscriber ordering
//! - `actions.rs` - optimistic sign-in/up, confirmation refresh, sign-out
//! - `guard.rs`   - cold start, timeout with manual continue, late grant

pub(crate) mod harness;
