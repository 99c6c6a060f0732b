//! Advisory file locking with bounded retries.
//!
//! Every store mutation takes an exclusive lock on the target file and
//! every read takes a shared lock, so separate processes can operate on
//! the same `.phaser/` directory safely. Lock acquisition retries with
//! exponential backoff (100 ms, 300 ms, 1 s) before giving up.

use crate::errors::StoreError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

const RETRY_BACKOFF_MS: [u64; 3] = [100, 300, 1000];

enum LockKind {
    Shared,
    Exclusive,
}

fn acquire(file: &File, kind: LockKind, path: &Path) -> Result<(), StoreError> {
    let try_lock = |f: &File| match kind {
        LockKind::Shared => fs2::FileExt::try_lock_shared(f),
        LockKind::Exclusive => fs2::FileExt::try_lock_exclusive(f),
    };

    if try_lock(file).is_ok() {
        return Ok(());
    }
    for delay_ms in RETRY_BACKOFF_MS {
        std::thread::sleep(Duration::from_millis(delay_ms));
        if try_lock(file).is_ok() {
            return Ok(());
        }
    }
    Err(StoreError::LockContention {
        path: path.to_path_buf(),
        attempts: RETRY_BACKOFF_MS.len() as u32,
    })
}

/// Read a file under a shared lock. Returns `None` if the file does not exist.
pub fn read_locked(path: &Path) -> Result<Option<String>, StoreError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    acquire(&file, LockKind::Shared, path)?;
    let mut content = String::new();
    let result = file.read_to_string(&mut content);
    let _ = fs2::FileExt::unlock(&file);
    result.map_err(|e| StoreError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Some(content))
}

/// Write a file atomically under an exclusive lock: the content lands in a
/// temp file in the same directory and is renamed over the target, so a
/// crash or full disk never leaves a partial file behind.
pub fn write_locked(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    // Lock the target (creating it if absent) so concurrent writers serialize.
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    acquire(&lock_file, LockKind::Exclusive, path)?;

    let tmp_path = path.with_extension(format!(
        "{}.tmp.{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("dat"),
        std::process::id()
    ));

    let write_result = fs::write(&tmp_path, content).and_then(|_| fs::rename(&tmp_path, path));
    let _ = fs2::FileExt::unlock(&lock_file);

    write_result.map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Read-modify-write under one exclusive lock. `mutate` receives the
/// current content (`None` when the file is absent) and returns the new
/// content, or `None` to leave the file untouched.
pub fn update_locked<F, T>(path: &Path, mutate: F) -> Result<T, StoreError>
where
    F: FnOnce(Option<&str>) -> Result<(Option<String>, T), StoreError>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    acquire(&lock_file, LockKind::Exclusive, path)?;

    let run = || {
        let mut current = String::new();
        {
            let mut f = &lock_file;
            f.read_to_string(&mut current)
                .map_err(|e| StoreError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                })?;
        }
        let existing = if current.is_empty() {
            None
        } else {
            Some(current.as_str())
        };
        let (new_content, value) = mutate(existing)?;
        if let Some(content) = new_content {
            let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
            fs::write(&tmp_path, &content)
                .and_then(|_| fs::rename(&tmp_path, path))
                .map_err(|e| {
                    let _ = fs::remove_file(&tmp_path);
                    StoreError::WriteFailed {
                        path: path.to_path_buf(),
                        source: e,
                    }
                })?;
        }
        Ok(value)
    };

    let result = run();
    let _ = fs2::FileExt::unlock(&lock_file);
    result
}
