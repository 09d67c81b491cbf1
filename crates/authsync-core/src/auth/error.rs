use thiserror::Error;

use crate::api::ProviderError;
use crate::models::{AuthFailure, ErrorKind};

/// Failure of a user-initiated auth action.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Input rejected before any provider call.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Validation(_) => ErrorKind::InvalidCredentials,
            AuthError::Provider(e) => e.kind(),
        }
    }

    /// Kind plus a message fit for display.
    pub fn failure(&self) -> AuthFailure {
        AuthFailure::new(self.kind(), self.to_string())
    }
}
