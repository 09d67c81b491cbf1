//! Local persistence for the last known session.
//!
//! This module provides:
//! - `PersistentCache`: the key/value seam every backend implements
//! - `FileCache`: one JSON file per key under the platform cache directory
//! - `KeyringCache`: values kept in the OS credential store
//! - `MemoryCache`: process-local storage for tests and ephemeral runs
//! - `SnapshotCache`: the session/user mirror written by `SessionStore`
//!
//! The cache is a lagging mirror of the in-memory state. It is read once at
//! startup to avoid a loading flash and is never consulted again after that.

pub mod file;
pub mod keychain;
pub mod memory;
pub mod snapshot;

use anyhow::Result;

pub use file::FileCache;
pub use keychain::KeyringCache;
pub use memory::MemoryCache;
pub use snapshot::{SnapshotCache, Stamped, AUTH_SESSION_KEY, AUTH_USER_KEY};

/// Key/value text store that survives restarts.
pub trait PersistentCache: Send + Sync {
    /// Retrieve a value, `None` if the key was never written or was removed.
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}
