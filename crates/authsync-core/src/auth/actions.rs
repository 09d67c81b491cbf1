use std::time::Duration;

use tracing::{debug, info, warn};

use super::{AuthError, RefreshOutcome, SessionStore};
use crate::api::SignUpOutcome;
use crate::models::{ErrorKind, Identity, User};

/// Longest email address accepted (RFC 5321 path limit).
pub const MAX_EMAIL_LENGTH: usize = 254;

/// Longest password accepted.
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// Delay before re-asking the provider after an optimistic sign-in.
pub const DEFAULT_CONFIRM_REFRESH_DELAY: Duration = Duration::from_millis(300);

/// Where the user lands after signing in, unless a location was carried.
pub const DEFAULT_PROTECTED_HOME: &str = "/dashboard";

/// Where the user lands after signing out.
pub const DEFAULT_PUBLIC_PATH: &str = "/";

/// Public entry point that guarded views redirect to.
pub const DEFAULT_LOGIN_PATH: &str = "/login";

#[derive(Debug, Clone)]
pub struct ActionOptions {
    pub confirm_refresh_delay: Duration,
    pub protected_home: String,
    pub public_path: String,
    /// Never accepted as a post-login destination.
    pub login_path: String,
}

impl Default for ActionOptions {
    fn default() -> Self {
        Self {
            confirm_refresh_delay: DEFAULT_CONFIRM_REFRESH_DELAY,
            protected_home: DEFAULT_PROTECTED_HOME.to_string(),
            public_path: DEFAULT_PUBLIC_PATH.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInOutcome {
    pub user: User,
    pub navigate_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpResult {
    /// The provider activated the account right away.
    SignedIn { user: User, navigate_to: String },
    /// A confirmation link was sent; nothing changed locally.
    ConfirmationRequired { email: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOutOutcome {
    pub navigate_to: String,
    /// Set when the provider call failed. Local state is cleared regardless.
    pub remote_error: Option<ErrorKind>,
}

/// Sign-in, sign-up and sign-out on top of a `SessionStore`.
///
/// Successful sign-ins are applied to the store before the provider is asked
/// again, so views update immediately; a confirmation refresh follows after
/// `confirm_refresh_delay`. Failures are returned to the caller and leave the
/// state untouched.
#[derive(Clone)]
pub struct AuthActions {
    store: SessionStore,
    options: ActionOptions,
}

impl AuthActions {
    pub fn new(store: SessionStore, options: ActionOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn options(&self) -> &ActionOptions {
        &self.options
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignInOutcome, AuthError> {
        self.sign_in_returning_to(email, password, None).await
    }

    /// Sign in and navigate back to `return_to` if it is a safe local path.
    pub async fn sign_in_returning_to(
        &self,
        email: &str,
        password: &str,
        return_to: Option<&str>,
    ) -> Result<SignInOutcome, AuthError> {
        let email = validate_credentials(email, password)?;

        let identity = self
            .store
            .client()
            .sign_in(email, password)
            .await
            .map_err(|e| {
                warn!(kind = %e.kind(), error = %e, "Sign-in failed");
                AuthError::from(e)
            })?;

        let user = self.apply(identity);
        info!(user_id = %user.id, "Signed in");

        Ok(SignInOutcome {
            user,
            navigate_to: self.destination(return_to),
        })
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpResult, AuthError> {
        let email = validate_credentials(email, password)?;

        let outcome = self
            .store
            .client()
            .sign_up(email, password)
            .await
            .map_err(|e| {
                warn!(kind = %e.kind(), error = %e, "Sign-up failed");
                AuthError::from(e)
            })?;

        match outcome {
            SignUpOutcome::Active(identity) => {
                let user = self.apply(identity);
                info!(user_id = %user.id, "Signed up and signed in");
                Ok(SignUpResult::SignedIn {
                    user,
                    navigate_to: self.options.protected_home.clone(),
                })
            }
            SignUpOutcome::ConfirmationPending { email } => {
                info!("Sign-up requires email confirmation");
                Ok(SignUpResult::ConfirmationRequired { email })
            }
        }
    }

    /// Forget the session locally, then tell the provider.
    ///
    /// Never fails: a provider error is logged and reported in the outcome.
    pub async fn sign_out(&self) -> SignOutOutcome {
        let user_id = self.store.get_auth_state().user().map(|u| u.id.clone());
        self.store.clear();

        let remote_error = match self.store.client().sign_out().await {
            Ok(()) => None,
            Err(e) => {
                warn!(kind = %e.kind(), error = %e, "Provider sign-out failed, local session already cleared");
                Some(e.kind())
            }
        };
        info!(user_id = user_id.as_deref().unwrap_or("-"), "Signed out");

        SignOutOutcome {
            navigate_to: self.options.public_path.clone(),
            remote_error,
        }
    }

    /// Apply an identity optimistically and schedule the confirmation refresh.
    fn apply(&self, identity: Identity) -> User {
        let user = identity.user().clone();
        self.store.set_state(identity);

        let store = self.store.clone();
        let delay = self.options.confirm_refresh_delay;
        let confirmation = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let since = store.settled_refreshes();
            let mut outcome = store.refresh().await;
            if outcome == RefreshOutcome::AlreadyInFlight {
                // That refresh started before the sign-in and will be
                // superseded, so ask again once it settles.
                debug!("Refresh outstanding at confirmation time, retrying after it settles");
                store.settled_since(since).await;
                outcome = store.refresh().await;
            }
            debug!(?outcome, "Confirmation refresh finished");
        });
        self.store.track(confirmation);

        user
    }

    fn destination(&self, return_to: Option<&str>) -> String {
        match return_to {
            Some(location) if is_safe_return(location, &self.options.login_path) => location.to_string(),
            Some(location) => {
                debug!(location = %location, "Ignoring unsafe return location");
                self.options.protected_home.clone()
            }
            None => self.options.protected_home.clone(),
        }
    }
}

/// Check input before it reaches the provider. Returns the trimmed email.
fn validate_credentials<'a>(email: &'a str, password: &str) -> Result<&'a str, AuthError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(AuthError::Validation("Email is required".to_string()));
    }
    if email.len() > MAX_EMAIL_LENGTH {
        return Err(AuthError::Validation(format!(
            "Email must be at most {} characters",
            MAX_EMAIL_LENGTH
        )));
    }
    if !email.contains('@') || email.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(AuthError::Validation("Email address is not valid".to_string()));
    }

    if password.is_empty() {
        return Err(AuthError::Validation("Password is required".to_string()));
    }
    if password.chars().count() > MAX_PASSWORD_LENGTH {
        return Err(AuthError::Validation(format!(
            "Password must be at most {} characters",
            MAX_PASSWORD_LENGTH
        )));
    }
    if password.chars().any(char::is_control) {
        return Err(AuthError::Validation("Password contains invalid characters".to_string()));
    }

    Ok(email)
}

/// Only same-origin absolute paths, and never back to the login page.
fn is_safe_return(location: &str, login_path: &str) -> bool {
    if !location.starts_with('/') || location.starts_with("//") || location.contains('\\') {
        return false;
    }
    if location.chars().any(char::is_control) {
        return false;
    }
    let path = location.split(['?', '#']).next().unwrap_or(location);
    path != login_path
}
