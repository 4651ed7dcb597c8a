//! Filesystem utilities for crash-safe operations.
//!
//! - [`durable_rename`] renames and then fsyncs the destination directory so
//!   the new directory entry survives a power loss.
//! - [`rename_with_retry`] wraps it with a single delayed retry, absorbing
//!   transient contention (virus scanners, lingering handles) on the first
//!   attempt.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Atomically rename a file and fsync the parent directory.
pub fn durable_rename(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)?;

    if let Some(parent) = to.parent() {
        let dir = fs::File::open(parent)?;
        dir.sync_all()?;
    }

    Ok(())
}

/// [`durable_rename`], retried once after `delay` if the first attempt fails.
///
/// The error of the second attempt is returned.
pub fn rename_with_retry(from: &Path, to: &Path, delay: Duration) -> io::Result<()> {
    match durable_rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!(
                from = %from.display(),
                to = %to.display(),
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "rename failed, retrying once"
            );
            thread::sleep(delay);
            durable_rename(from, to)
        }
    }
}

/// Fsync a file's contents to stable storage.
pub fn fsync_file(path: &Path) -> io::Result<()> {
    fs::File::open(path)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_durable_rename_basic() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.txt");
        let dst = dir.path().join("dest.txt");

        fs::write(&src, b"hello").unwrap();
        durable_rename(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"hello");
    }

    #[test]
    fn test_durable_rename_nonexistent_source() {
        let dir = TempDir::new().unwrap();
        let result = durable_rename(&dir.path().join("missing"), &dir.path().join("dest"));
        assert!(result.is_err());
    }

    #[test]
    fn test_rename_with_retry_succeeds_first_time() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"x").unwrap();

        rename_with_retry(&src, &dst, Duration::from_millis(1)).unwrap();
        assert!(dst.exists());
    }

    #[test]
    fn test_rename_with_retry_reports_second_failure() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("never-created");
        let dst = dir.path().join("b");

        let start = std::time::Instant::now();
        let err = rename_with_retry(&src, &dst, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_fsync_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"data").unwrap();
        fsync_file(&path).unwrap();
    }
}
