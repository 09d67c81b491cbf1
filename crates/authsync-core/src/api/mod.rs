//! Identity provider clients.
//!
//! `IdentityClient` is the seam between the session core and whatever issues
//! sessions. Two implementations ship here:
//!
//! - `SupabaseClient`: the GoTrue REST API over `reqwest`
//! - `UnconfiguredClient`: stand-in used when no provider is configured
//!
//! The provider owns token issuance and validation; this crate only consumes
//! the results.

pub mod error;
pub mod supabase;
pub mod unconfigured;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::models::Identity;

pub use error::{ProviderError, ProviderResult};
pub use supabase::SupabaseClient;
pub use unconfigured::UnconfiguredClient;

/// What happened on the provider side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// A session change pushed by the provider (sign-in elsewhere, token
/// rotation, revocation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub identity: Option<Identity>,
}

impl SessionEvent {
    pub fn signed_in(identity: Identity) -> Self {
        Self {
            kind: SessionEventKind::SignedIn,
            identity: Some(identity),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            kind: SessionEventKind::SignedOut,
            identity: None,
        }
    }

    pub fn token_refreshed(identity: Identity) -> Self {
        Self {
            kind: SessionEventKind::TokenRefreshed,
            identity: Some(identity),
        }
    }
}

/// Result of a sign-up request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// The provider confirmed the account immediately and issued a session.
    Active(Identity),
    /// The account exists but must be confirmed out of band first.
    ConfirmationPending { email: String },
}

/// Async interface to an identity provider.
///
/// Methods return boxed futures so the client can live behind
/// `Arc<dyn IdentityClient>` and be driven from spawned tasks.
pub trait IdentityClient: Send + Sync {
    /// Current session according to the provider, `None` if signed out.
    fn get_session(&self) -> BoxFuture<'_, ProviderResult<Option<Identity>>>;

    fn sign_in<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Identity>>;

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, ProviderResult<SignUpOutcome>>;

    fn sign_out(&self) -> BoxFuture<'_, ProviderResult<()>>;

    /// Subscribe to provider-pushed session changes. Dropping the receiver
    /// unsubscribes.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
