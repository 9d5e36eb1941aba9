//! Lock files coordinating writers across hashq processes.
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Holds a lock file until dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Creates `path` exclusively, or returns `None` while another holder has it.
///
/// A lock file older than `stale_after` is treated as left behind by a
/// crashed process and reclaimed.
pub fn try_acquire_lock(path: &Path, stale_after: Duration) -> Result<Option<FileLockGuard>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
        }
    }
    loop {
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                return Ok(Some(FileLockGuard {
                    path: path.to_path_buf(),
                }));
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                if stale_after > Duration::ZERO && reclaim_stale_lock(path, stale_after) {
                    continue;
                }
                return Ok(None);
            }
            Err(error) => {
                return Err(anyhow!("failed to acquire lock {}: {error}", path.display()));
            }
        }
    }
}

/// Waits up to `timeout` for the lock at `path` without blocking the runtime.
pub async fn acquire_lock(
    path: &Path,
    timeout: Duration,
    stale_after: Duration,
) -> Result<FileLockGuard> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(guard) = try_acquire_lock(path, stale_after)? {
            return Ok(guard);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out acquiring lock {}", path.display());
        }
        tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
    }
}

fn reclaim_stale_lock(path: &Path, stale_after: Duration) -> bool {
    let age = std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map(|modified| SystemTime::now().duration_since(modified).unwrap_or_default());
    match age {
        Ok(age) if age >= stale_after => std::fs::remove_file(path).is_ok(),
        _ => false,
    }
}
