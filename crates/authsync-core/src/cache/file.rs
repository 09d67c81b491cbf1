use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::PersistentCache;

/// Stores each key as `<key>.json` inside a cache directory.
pub struct FileCache {
    cache_dir: PathBuf,
}

impl FileCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir).with_context(|| {
            format!("Failed to create cache directory: {}", cache_dir.display())
        })?;
        Ok(Self { cache_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key))
    }
}

impl PersistentCache for FileCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.cache_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read cache file: {}", key)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        // Write then rename so a crash never leaves a half-written snapshot.
        let path = self.cache_path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)
            .with_context(|| format!("Failed to write cache file: {}", key))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace cache file: {}", key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.cache_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove cache file: {}", key)),
        }
    }
}
