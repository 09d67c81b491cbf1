use anyhow::{Context, Result};
use keyring::Entry;

use super::PersistentCache;

/// Keychain service name used when none is given.
pub const DEFAULT_SERVICE_NAME: &str = "authsync";

/// Keeps values in the OS credential store (Keychain, Credential Manager,
/// kernel keyring), one entry per key.
pub struct KeyringCache {
    service: String,
}

impl KeyringCache {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringCache {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl PersistentCache for KeyringCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve value from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store value in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete value from keychain"),
        }
    }
}
