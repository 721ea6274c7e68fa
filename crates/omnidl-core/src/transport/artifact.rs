//! Partial-download artifacts and exclusive access to them
//!
//! The `<name>.tmp` file is the only resume checkpoint, so at most one
//! transfer may touch a given artifact at a time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

/// Per-path async locks shared by all transfers of one transport
#[derive(Clone, Default)]
pub struct ArtifactLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Held for as long as a transfer owns an artifact
pub struct ArtifactGuard {
    path: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: ArtifactLocks,
}

impl ArtifactLocks {
    /// Wait for exclusive ownership of `path`
    pub async fn acquire(&self, path: &Path) -> ArtifactGuard {
        let lock = self
            .inner
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;
        ArtifactGuard {
            path: path.to_path_buf(),
            lock,
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl ArtifactGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.inner.lock();
        // Only the map and this guard still reference the lock: nobody is waiting
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.path);
        }
    }
}

/// Current length of an artifact, 0 if it does not exist
pub async fn artifact_len(path: &Path) -> std::io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Delete an artifact, ignoring one that is already gone
pub async fn remove_artifact(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move a finished artifact onto its destination, replacing what is there
pub async fn promote_artifact(artifact: &Path, destination: &Path) -> std::io::Result<()> {
    // rename() refuses to replace an existing file on some platforms
    remove_artifact(destination).await?;
    tokio::fs::rename(artifact, destination).await
}
