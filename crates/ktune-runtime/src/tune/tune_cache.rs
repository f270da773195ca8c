use super::{Configuration, KernelSpec, RemoteCache, SearchSpace};
use crate::config::autotune::AutotuneConfig;
use ktune_common::cache_file::CacheFile;
use ktune_common::hash::ContentHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extension of the local cache records.
pub const CACHE_FILE_EXTENSION: &str = "best_config";

const REMOTE_KEY_SALT: &str = "autotune-best-config";

/// Error raised while reading or writing cache records.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The record couldn't be read or written.
    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The record isn't a valid cache entry.
    #[error("Corrupt cache record: {reason}")]
    Corrupt {
        /// Why the record was rejected.
        reason: String,
    },
    /// The remote store failed.
    #[error("Remote cache unavailable: {reason}")]
    Remote {
        /// The remote failure.
        reason: String,
    },
}

/// Persisted record of the winning configuration of a kernel.
#[derive(new, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hash of the candidate set the winner was chosen from.
    pub content_hash: String,
    /// The winning configuration.
    pub config: Configuration,
    /// Whether the winner was found by coordinate descent rather than among the offered set.
    pub found_by_local_search: bool,
}

/// Hash identifying a kernel and its candidate set.
///
/// Covers the kernel source, every configuration, the search rules of every parameter they use
/// and the backend version, so any change to the search space yields a different hash.
pub fn content_hash(kernel: &KernelSpec, configs: &[Configuration], space: &SearchSpace) -> String {
    let mut hasher = ContentHasher::new();
    let mut axes = BTreeSet::new();

    hasher.line(&kernel.source_hash);
    for config in configs {
        hasher.line(&config.canonical());
        axes.extend(config.axes());
    }
    hasher.line(&space.canonical(&axes));
    hasher.line(&kernel.backend_version);

    hasher.finalize()
}

/// Winning configurations persisted in a local directory, optionally mirrored to a remote store.
///
/// Nothing here ever fails the caller: unreadable, corrupt or stale records are misses, and
/// failed writes are logged.
#[derive(Debug, Clone, Default)]
pub struct PersistentCache {
    dir: Option<PathBuf>,
    remote: Option<Arc<dyn RemoteCache>>,
}

impl PersistentCache {
    /// Create a cache storing records in `dir`, or only in the remote store when `None`.
    pub fn new(dir: Option<PathBuf>, remote: Option<Arc<dyn RemoteCache>>) -> Self {
        Self { dir, remote }
    }

    /// Create a cache storing records in the given directory.
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self::new(Some(dir.into()), None)
    }

    /// A cache that never hits and never stores.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// Mirror records to a remote store.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Create the cache described by the autotune configuration.
    pub fn from_config(config: &AutotuneConfig) -> Self {
        let dir = config.local_cache.then(|| config.cache.autotune_dir());
        let remote = config.remote_cache_dir.as_ref().map(|dir| {
            Arc::new(super::DirectoryRemoteCache::new(dir.clone())) as Arc<dyn RemoteCache>
        });

        Self::new(dir, remote)
    }

    /// Whether records can be stored anywhere.
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some() || self.remote.is_some()
    }

    /// The local record of a kernel.
    ///
    /// Generated kernel names repeat across graphs, so the name is suffixed with a prefix of the
    /// source hash.
    pub fn entry_path(&self, kernel: &KernelSpec) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let prefix = kernel.source_hash.get(..8).unwrap_or(&kernel.source_hash);
        let name = sanitize_filename::sanitize(format!("{}-{prefix}", kernel.name));

        Some(dir.join(format!("{name}.{CACHE_FILE_EXTENSION}")))
    }

    /// The remote store key of a kernel's record.
    pub fn remote_key(kernel: &KernelSpec, content_hash: &str) -> String {
        let mut hasher = ContentHasher::new();
        hasher
            .line(&kernel.backend_version)
            .line(content_hash)
            .line(REMOTE_KEY_SALT);
        hasher.finalize()
    }

    /// The stored winner, provided it was chosen from the candidate set identified by
    /// `content_hash`.
    ///
    /// The remote store is only consulted when no local record exists.
    pub fn lookup(&self, kernel: &KernelSpec, content_hash: &str) -> Option<CacheEntry> {
        let mut local_exists = false;

        if let Some(path) = self.entry_path(kernel) {
            match load_entry(&CacheFile::new(path.as_path())) {
                Ok(Some(entry)) => {
                    local_exists = true;
                    if entry.content_hash == content_hash {
                        return Some(entry);
                    }
                    log::info!("Ignoring stale autotune record {path:?}, the candidate set changed.");
                }
                Ok(None) => {}
                Err(err) => {
                    local_exists = true;
                    log::warn!("Ignoring autotune record {path:?}: {err}");
                }
            }
        }

        if local_exists {
            return None;
        }

        let entry = self.lookup_remote(kernel, content_hash)?;
        if let Some(path) = self.entry_path(kernel) {
            self.write_local(&path, &entry);
        }

        Some(entry)
    }

    /// Persist the winner of a kernel, best effort.
    pub fn store(
        &self,
        kernel: &KernelSpec,
        content_hash: &str,
        config: &Configuration,
        found_by_local_search: bool,
    ) {
        let entry = CacheEntry::new(
            content_hash.to_string(),
            config.clone(),
            found_by_local_search,
        );

        if let Some(path) = self.entry_path(kernel) {
            self.write_local(&path, &entry);
        }

        if let Some(remote) = self.remote.as_ref() {
            let key = Self::remote_key(kernel, content_hash);
            let result = serde_json::to_vec(&entry)
                .map_err(|err| CacheError::Corrupt {
                    reason: err.to_string(),
                })
                .and_then(|content| remote.put(&key, &content));

            if let Err(err) = result {
                log::warn!("Unable to store autotune record of {} remotely: {err}", kernel.name);
            }
        }
    }

    fn lookup_remote(&self, kernel: &KernelSpec, content_hash: &str) -> Option<CacheEntry> {
        let remote = self.remote.as_ref()?;
        let key = Self::remote_key(kernel, content_hash);

        let mut values = match remote.get(core::slice::from_ref(&key)) {
            Ok(values) => values,
            Err(err) => {
                log::warn!("Remote autotune cache unavailable, continuing locally: {err}");
                return None;
            }
        };

        let content = values.remove(&key)?;
        match parse_entry(&content) {
            Ok(entry) if entry.content_hash == content_hash => Some(entry),
            Ok(_) => None,
            Err(err) => {
                log::warn!("Ignoring remote autotune record {key}: {err}");
                None
            }
        }
    }

    fn write_local(&self, path: &Path, entry: &CacheEntry) {
        let result = serde_json::to_vec_pretty(entry)
            .map_err(|err| CacheError::Corrupt {
                reason: err.to_string(),
            })
            .and_then(|content| Ok(CacheFile::new(path).write(&content)?));

        if let Err(err) = result {
            log::warn!("Unable to save autotune record {path:?}: {err}");
        }
    }
}

fn load_entry(file: &CacheFile) -> Result<Option<CacheEntry>, CacheError> {
    match file.read()? {
        Some(content) => parse_entry(&content).map(Some),
        None => Ok(None),
    }
}

fn parse_entry(content: &[u8]) -> Result<CacheEntry, CacheError> {
    serde_json::from_slice(content).map_err(|err| CacheError::Corrupt {
        reason: err.to_string(),
    })
}
