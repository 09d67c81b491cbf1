use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::broadcast;

use super::{IdentityClient, ProviderError, ProviderResult, SessionEvent, SignUpOutcome};
use crate::models::Identity;

/// Client used when no provider URL or key is configured.
///
/// Reports "no session", refuses sign-in and sign-up, and lets sign-out
/// succeed so local state can always be forgotten.
pub struct UnconfiguredClient {
    events: broadcast::Sender<SessionEvent>,
}

impl UnconfiguredClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for UnconfiguredClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityClient for UnconfiguredClient {
    fn get_session(&self) -> BoxFuture<'_, ProviderResult<Option<Identity>>> {
        future::ready(Ok(None)).boxed()
    }

    fn sign_in<'a>(&'a self, _email: &'a str, _password: &'a str) -> BoxFuture<'a, ProviderResult<Identity>> {
        future::ready(Err(ProviderError::NotConfigured)).boxed()
    }

    fn sign_up<'a>(
        &'a self,
        _email: &'a str,
        _password: &'a str,
    ) -> BoxFuture<'a, ProviderResult<SignUpOutcome>> {
        future::ready(Err(ProviderError::NotConfigured)).boxed()
    }

    fn sign_out(&self) -> BoxFuture<'_, ProviderResult<()>> {
        future::ready(Ok(())).boxed()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorKind;

    #[tokio::test]
    async fn test_unconfigured_client_behaviour() {
        let client = UnconfiguredClient::new();
        assert!(client.get_session().await.unwrap().is_none());
        assert_eq!(
            client.sign_in("a@b.com", "pw").await.unwrap_err().kind(),
            ErrorKind::NotConfigured
        );
        assert_eq!(
            client.sign_up("a@b.com", "pw").await.unwrap_err().kind(),
            ErrorKind::NotConfigured
        );
        assert!(client.sign_out().await.is_ok());
    }
}
