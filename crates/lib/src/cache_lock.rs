//! Cross-process lock on the cache directory.
//!
//! Every pipeline command holds it for its whole run: exclusively when it may
//! add or remove snapshots and builds, shared for `status`. Acquisition never
//! waits. A busy cache is reported together with the command holding it, which
//! an exclusive holder records in the lock file and clears on release.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILE: &str = ".patchstack.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// The pipeline command holding an exclusive lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub command: String,
  /// Directory of the project whose command holds the lock.
  pub project: PathBuf,
  pub since_unix: u64,
}

impl fmt::Display for LockHolder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "'{}' for {} (pid {}, since unix time {})",
      self.command,
      self.project.display(),
      self.pid,
      self.since_unix
    )
  }
}

fn describe(holder: &Option<LockHolder>) -> String {
  match holder {
    Some(holder) => holder.to_string(),
    None => "another patchstack process".to_string(),
  }
}

#[derive(Debug, Error)]
pub enum CacheLockError {
  #[error(
    "cache '{}' is in use by {}\nIf no such process is running, delete {}",
    .cache.display(),
    describe(.holder),
    .lock_file.display()
  )]
  Busy {
    cache: PathBuf,
    holder: Option<LockHolder>,
    lock_file: PathBuf,
  },

  #[error("failed to lock cache at '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheLockError + '_ {
  move |source| CacheLockError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Held until dropped.
#[derive(Debug)]
pub struct CacheLock {
  file: File,
  path: PathBuf,
  mode: LockMode,
}

impl CacheLock {
  /// Lock `cache` for `command` run from `project`, creating the directory.
  pub fn acquire(cache: &Path, mode: LockMode, command: &str, project: &Path) -> Result<Self, CacheLockError> {
    fs::create_dir_all(cache).map_err(io_err(cache))?;
    let path = cache.join(LOCK_FILE);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(io_err(&path))?;

    match try_lock(&file, mode) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        return Err(CacheLockError::Busy {
          holder: read_holder(&path),
          cache: cache.to_path_buf(),
          lock_file: path,
        });
      }
      Err(e) => return Err(io_err(&path)(e)),
    }

    let mut lock = Self { file, path, mode };
    if mode == LockMode::Exclusive {
      let holder = LockHolder {
        pid: std::process::id(),
        command: command.to_string(),
        project: project.to_path_buf(),
        since_unix: SystemTime::now()
          .duration_since(UNIX_EPOCH)
          .unwrap_or_default()
          .as_secs(),
      };
      lock.record(&holder).map_err(io_err(&lock.path))?;
    }
    debug!(cache = %cache.display(), ?mode, command, "locked cache");
    Ok(lock)
  }

  fn record(&mut self, holder: &LockHolder) -> io::Result<()> {
    self.file.set_len(0)?;
    self.file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&mut self.file, holder).map_err(io::Error::other)?;
    self.file.flush()
  }

  /// Holder recorded in the lock file, read through the held handle.
  pub fn holder(&self) -> io::Result<Option<LockHolder>> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(serde_json::from_str(&content).ok())
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for CacheLock {
  fn drop(&mut self) {
    if self.mode == LockMode::Exclusive {
      let _ = self.file.set_len(0);
    }
  }
}

fn read_holder(path: &Path) -> Option<LockHolder> {
  let content = fs::read_to_string(path).ok()?;
  serde_json::from_str(&content).ok()
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  flock(file, operation).map_err(io::Error::from)
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};
  use windows_sys::Win32::System::IO::OVERLAPPED;

  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: the handle is valid for the life of `file` and a zeroed
  // OVERLAPPED locks from offset 0.
  let locked = unsafe {
    let mut overlapped: OVERLAPPED = std::mem::zeroed();
    LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped)
  };
  if locked != 0 {
    return Ok(());
  }
  let err = io::Error::last_os_error();
  if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
    return Err(io::ErrorKind::WouldBlock.into());
  }
  Err(err)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn project() -> PathBuf {
    PathBuf::from("/work/fork")
  }

  #[test]
  fn exclusive_lock_records_its_command() {
    let temp = TempDir::new().unwrap();
    let lock = CacheLock::acquire(temp.path(), LockMode::Exclusive, "rebuild", &project()).unwrap();

    let holder = lock.holder().unwrap().unwrap();
    assert_eq!(holder.command, "rebuild");
    assert_eq!(holder.project, project());
    assert_eq!(holder.pid, std::process::id());
  }

  #[test]
  fn shared_locks_coexist_without_a_holder() {
    let temp = TempDir::new().unwrap();
    let first = CacheLock::acquire(temp.path(), LockMode::Shared, "status", &project()).unwrap();
    let second = CacheLock::acquire(temp.path(), LockMode::Shared, "status", &project()).unwrap();

    assert_eq!(first.path(), second.path());
    assert_eq!(first.holder().unwrap(), None);
  }

  #[test]
  fn acquire_creates_the_cache_directory() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("nested/cache");
    let lock = CacheLock::acquire(&cache, LockMode::Shared, "status", &project()).unwrap();
    assert_eq!(lock.path(), cache.join(LOCK_FILE));
  }

  #[cfg(unix)]
  #[test]
  fn busy_cache_names_the_holder() {
    let temp = TempDir::new().unwrap();
    let _sync = CacheLock::acquire(temp.path(), LockMode::Exclusive, "sync", &project()).unwrap();

    let err = CacheLock::acquire(temp.path(), LockMode::Shared, "status", &project()).unwrap_err();

    match &err {
      CacheLockError::Busy { holder: Some(holder), .. } => assert_eq!(holder.command, "sync"),
      other => panic!("expected a busy cache, got {other:?}"),
    }
    assert!(err.to_string().contains("'sync' for /work/fork"));
  }

  #[cfg(unix)]
  #[test]
  fn release_clears_the_holder() {
    let temp = TempDir::new().unwrap();
    drop(CacheLock::acquire(temp.path(), LockMode::Exclusive, "gc", &project()).unwrap());

    let _status = CacheLock::acquire(temp.path(), LockMode::Shared, "status", &project()).unwrap();
    let err = CacheLock::acquire(temp.path(), LockMode::Exclusive, "rebuild", &project()).unwrap_err();

    assert!(matches!(err, CacheLockError::Busy { holder: None, .. }));
    assert!(err.to_string().contains("another patchstack process"));
  }
}
