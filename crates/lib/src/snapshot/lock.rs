//! Upstream lock file.
//!
//! `patchstack.lock` pins the upstream version every module is patched
//! against. `sync` rewrites it; every other command reads it. It lives next to
//! the configuration file.
//!
//! # Lock File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "reference": "ver/1.21",
//!   "token": "git+https://example.com/upstream.git#0123abcd...",
//!   "treeHash": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
//!   "resolvedAt": 1733667300
//! }
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::fs::write_atomic;
use crate::util::hash::ContentHash;

use super::types::VersionToken;

/// Current lock file format version.
pub const LOCK_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamLock {
  pub version: u32,
  /// The reference that was resolved (branch, tag or commit).
  pub reference: String,
  pub token: VersionToken,
  /// Content hash of the upstream tree; cached snapshots must match it.
  pub tree_hash: ContentHash,
  pub resolved_at: u64,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("failed to read lock file: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write lock file: {0}")]
  Write(#[source] io::Error),

  #[error("failed to parse lock file: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize lock file: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported lock file version {0}, expected {LOCK_VERSION}")]
  UnsupportedVersion(u32),
}

impl UpstreamLock {
  pub fn new(reference: &str, token: VersionToken, tree_hash: ContentHash) -> Self {
    Self {
      version: LOCK_VERSION,
      reference: reference.to_string(),
      token,
      tree_hash,
      resolved_at: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    }
  }

  /// Load the lock file. `Ok(None)` if it does not exist.
  pub fn load(path: &Path) -> Result<Option<Self>, LockError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(LockError::Read(e)),
    };

    let lock: UpstreamLock = serde_json::from_str(&content).map_err(LockError::Parse)?;
    if lock.version != LOCK_VERSION {
      return Err(LockError::UnsupportedVersion(lock.version));
    }
    Ok(Some(lock))
  }

  pub fn save(&self, path: &Path) -> Result<(), LockError> {
    let mut content = serde_json::to_string_pretty(self).map_err(LockError::Serialize)?;
    content.push('\n');
    write_atomic(path, content.as_bytes()).map_err(LockError::Write)
  }

  /// Whether this lock already pins `token` with `tree_hash`.
  pub fn pins(&self, token: &VersionToken, tree_hash: &ContentHash) -> bool {
    &self.token == token && &self.tree_hash == tree_hash
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::LOCK_FILENAME;
  use crate::util::hash::hash_bytes;
  use tempfile::TempDir;

  fn sample() -> UpstreamLock {
    UpstreamLock::new(
      "main",
      VersionToken::new("git+https://example.com/upstream.git#0123"),
      hash_bytes(b"tree"),
    )
  }

  #[test]
  fn save_and_load_roundtrip() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join(LOCK_FILENAME);

    sample().save(&path).unwrap();
    let loaded = UpstreamLock::load(&path).unwrap().unwrap();

    assert_eq!(loaded.token, sample().token);
    assert_eq!(loaded.tree_hash, sample().tree_hash);
    assert!(loaded.pins(&sample().token, &sample().tree_hash));
  }

  #[test]
  fn uses_camel_case_keys() {
    let json = serde_json::to_string(&sample()).unwrap();
    assert!(json.contains("\"treeHash\""));
    assert!(json.contains("\"resolvedAt\""));
  }

  #[test]
  fn missing_file_is_none() {
    let temp = TempDir::new().unwrap();
    assert!(UpstreamLock::load(&temp.path().join("nope.lock")).unwrap().is_none());
  }

  #[test]
  fn unsupported_version_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join(LOCK_FILENAME);
    let mut lock = sample();
    lock.version = 99;
    fs::write(&path, serde_json::to_string(&lock).unwrap()).unwrap();

    assert!(matches!(UpstreamLock::load(&path), Err(LockError::UnsupportedVersion(99))));
  }

  #[test]
  fn invalid_json_is_parse_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join(LOCK_FILENAME);
    fs::write(&path, "{ not json").unwrap();

    assert!(matches!(UpstreamLock::load(&path), Err(LockError::Parse(_))));
  }
}
