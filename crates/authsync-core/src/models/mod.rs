//! Data models for the authentication core.
//!
//! - `Session`, `User`: provider-issued token bundle and profile snapshot
//! - `Identity`: the session/user pair that is always set and cleared together
//! - `AuthState`, `AuthFailure`, `ErrorKind`: the aggregate exposed to views

pub mod identity;
pub mod state;

pub use identity::{Identity, IdentityMismatch, Session, User};
pub use state::{AuthFailure, AuthState, ErrorKind};
