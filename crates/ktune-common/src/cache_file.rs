use core::fmt::Display;
use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

/// A cache file holding a single record that is safe to share between processes.
///
/// Writes go to a sibling temporary file that is renamed over the record, so a reader never
/// observes a partially written record even when several processes race on the same path.
#[derive(Debug, Clone)]
pub struct CacheFile {
    path: PathBuf,
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Display for CacheFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Cache file: {:?}", self.path)
    }
}

impl CacheFile {
    /// Create a new cache file handle. Nothing is touched on disk until the first write.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// The path of the record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole record.
    ///
    /// Returns `Ok(None)` when the record doesn't exist yet.
    pub fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Replace the record with the given content.
    pub fn write(&self, content: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        let result = File::create(&tmp).and_then(|mut file| {
            file.write_all(content)?;
            file.sync_all()
        });

        match result.and_then(|_| fs::rename(&tmp, &self.path)) {
            Ok(()) => Ok(()),
            Err(err) => {
                fs::remove_file(&tmp).ok();
                Err(err)
            }
        }
    }

    /// Remove the record, ignoring a missing file.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "record".to_string());
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);

        self.path.with_file_name(format!(
            ".{file_name}.{}.{counter}.tmp",
            std::process::id()
        ))
    }
}
