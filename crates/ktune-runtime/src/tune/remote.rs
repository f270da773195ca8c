use super::CacheError;
use ktune_common::cache_file::CacheFile;
use std::collections::HashMap;
use std::path::PathBuf;

/// A key/value store shared between machines, used to amortize autotuning across them.
///
/// Failures are reported as errors, and the [persistent cache](super::PersistentCache) treats them
/// as a miss or a best-effort write.
pub trait RemoteCache: Send + Sync + core::fmt::Debug {
    /// Fetch the values of the given keys. Missing keys are absent from the result.
    fn get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError>;

    /// Store a value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;
}

/// A remote cache backed by a shared directory, one file per key.
#[derive(new, Debug, Clone)]
pub struct DirectoryRemoteCache {
    dir: PathBuf,
}

impl DirectoryRemoteCache {
    fn file(&self, key: &str) -> CacheFile {
        CacheFile::new(self.dir.join(sanitize_filename::sanitize(key)))
    }
}

impl RemoteCache for DirectoryRemoteCache {
    fn get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        let mut values = HashMap::new();

        for key in keys {
            let content = self.file(key).read().map_err(|err| CacheError::Remote {
                reason: format!("Unable to read {key} from {:?}: {err}", self.dir),
            })?;

            if let Some(content) = content {
                values.insert(key.clone(), content);
            }
        }

        Ok(values)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.file(key).write(value).map_err(|err| CacheError::Remote {
            reason: format!("Unable to write {key} to {:?}: {err}", self.dir),
        })
    }
}
