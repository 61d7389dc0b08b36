//! Size-based rotation of the service log, run once when the sink starts.
//!
//! Keeps at most `max_files` rotated copies using the scheme:
//!   svc.log → svc.log.1 → svc.log.2 → … → svc.log.<max_files>

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Default size before rotation (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Default number of rotated copies to keep.
pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` once it has reached `max_bytes`.
///
/// With `max_files == 0` the live file is truncated in place. Otherwise the
/// copies shift up by one, the oldest falls off, and the live file starts
/// over empty.
///
/// Returns whether anything was rotated. A missing log is not an error.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    match fs::metadata(log_path) {
        Ok(meta) if meta.len() >= max_bytes => {}
        Ok(_) => return Ok(false),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    }

    if max_files > 0 {
        shift_copies(log_path, max_files)?;
        fs::rename(log_path, numbered_path(log_path, 1))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)?;
    Ok(true)
}

/// Make room for a new `.1`: drop `.max`, then move `.n` to `.n+1`.
fn shift_copies(log_path: &Path, max_files: usize) -> io::Result<()> {
    remove_if_present(&numbered_path(log_path, max_files))?;
    for n in (1..max_files).rev() {
        match fs::rename(numbered_path(log_path, n), numbered_path(log_path, n + 1)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Path of the `n`-th rotated copy of `base` (e.g. `svc.log.2`).
pub fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let mut name = base.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(".{n}"));
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LIMIT: u64 = 1024;

    fn log_with(dir: &TempDir, bytes: usize, fill: u8) -> PathBuf {
        let path = dir.path().join("svc.log");
        fs::write(&path, vec![fill; bytes]).unwrap();
        path
    }

    fn contents(path: &Path) -> Vec<u8> {
        fs::read(path).unwrap()
    }

    #[test]
    fn small_log_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, 10, b'a');
        assert!(!rotate_if_needed(&log, LIMIT, 3).unwrap());
        assert_eq!(contents(&log).len(), 10);
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("never-written.log");
        assert!(!rotate_if_needed(&log, LIMIT, 3).unwrap());
        assert!(!log.exists());
    }

    #[test]
    fn full_log_moves_to_first_copy() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, LIMIT as usize, b'a');

        assert!(rotate_if_needed(&log, LIMIT, 3).unwrap());
        assert!(contents(&log).is_empty());
        assert_eq!(contents(&numbered_path(&log, 1)).len(), LIMIT as usize);
    }

    #[test]
    fn repeated_rotation_keeps_newest_copies_in_order() {
        let dir = TempDir::new().unwrap();
        let mut log = PathBuf::new();
        for fill in [b'a', b'b', b'c', b'd'] {
            log = log_with(&dir, LIMIT as usize, fill);
            rotate_if_needed(&log, LIMIT, 3).unwrap();
        }

        assert_eq!(contents(&numbered_path(&log, 1))[0], b'd');
        assert_eq!(contents(&numbered_path(&log, 2))[0], b'c');
        assert_eq!(contents(&numbered_path(&log, 3))[0], b'b');
        assert!(!numbered_path(&log, 4).exists(), "oldest copy must fall off");
    }

    #[test]
    fn zero_copies_truncates_in_place() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, 2 * LIMIT as usize, b'a');
        assert!(rotate_if_needed(&log, LIMIT, 0).unwrap());
        assert!(contents(&log).is_empty());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn numbered_path_appends_to_the_full_name() {
        let base = Path::new("/var/log/db.log");
        assert_eq!(numbered_path(base, 3), PathBuf::from("/var/log/db.log.3"));
    }
}
