//! Error and report types for pipeline runs.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::assemble::{Artifact, AssembleError};
use crate::bootstrap::BootstrapError;
use crate::cache::{CacheError, Fingerprint};
use crate::config::ConfigError;
use crate::gc::GcError;
use crate::graph::GraphError;
use crate::patch::{ApplyError, ConflictError, PatchFileError};
use crate::snapshot::{LockError, SnapshotError, VersionToken};
use crate::cache_lock::CacheLockError;
use crate::tree::{Tree, TreeError};
use crate::util::hash::{ContentHash, HashError};

/// Process exit codes, one per failure class.
pub mod exit_code {
  pub const OK: i32 = 0;
  pub const OTHER: i32 = 1;
  pub const CONFLICT: i32 = 2;
  pub const COMPILE: i32 = 3;
  pub const INTEGRITY: i32 = 4;
  pub const SNAPSHOT_UNAVAILABLE: i32 = 5;
}

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("snapshot '{token}' unavailable: {reason}")]
  SnapshotUnavailable { token: String, reason: String },

  #[error("module '{module}': {conflict}")]
  Conflict {
    module: String,
    #[source]
    conflict: ConflictError,
  },

  #[error("module '{module}': {source}")]
  Patch {
    module: String,
    #[source]
    source: ApplyError,
  },

  #[error("dependency cycle through module '{0}'")]
  CyclicDependency(String),

  #[error("invalid module graph: {0}")]
  Graph(GraphError),

  #[error("compilation of '{module}' failed:\n{diagnostics}")]
  CompileFailure { module: String, diagnostics: String },

  #[error("module '{module}' skipped: upstream '{failed}' failed")]
  Skipped { module: String, failed: String },

  #[error("packaging failed: {0}")]
  PackagingFailure(String),

  #[error("integrity check failed for {what}: expected {expected}, got {actual}")]
  Integrity {
    what: String,
    expected: ContentHash,
    actual: ContentHash,
  },

  #[error("bootstrap failed: {0}")]
  Bootstrap(BootstrapError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  PatchFile(#[from] PatchFileError),

  #[error(transparent)]
  Snapshot(SnapshotError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  CacheLock(#[from] CacheLockError),

  #[error(transparent)]
  Tree(#[from] TreeError),

  #[error(transparent)]
  Gc(#[from] GcError),

  #[error("failed to compute fingerprint: {0}")]
  Hash(#[from] HashError),

  #[error("output directory '{0}' does not exist; run apply first")]
  MissingOutput(PathBuf),

  #[error("I/O error at '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("pipeline task failed: {0}")]
  Join(String),
}

impl PipelineError {
  pub(crate) fn from_apply(module: &str, err: ApplyError) -> Self {
    match err {
      ApplyError::Conflict(conflict) => Self::Conflict {
        module: module.to_string(),
        conflict,
      },
      source => Self::Patch {
        module: module.to_string(),
        source,
      },
    }
  }

  /// Exit code for the CLI.
  pub fn exit_code(&self) -> i32 {
    match self {
      Self::Conflict { .. } => exit_code::CONFLICT,
      Self::CompileFailure { .. } | Self::PackagingFailure(_) => exit_code::COMPILE,
      Self::Integrity { .. } => exit_code::INTEGRITY,
      Self::SnapshotUnavailable { .. } => exit_code::SNAPSHOT_UNAVAILABLE,
      _ => exit_code::OTHER,
    }
  }
}

impl From<GraphError> for PipelineError {
  fn from(err: GraphError) -> Self {
    match err {
      GraphError::CyclicDependency(module) => Self::CyclicDependency(module),
      other => Self::Graph(other),
    }
  }
}

impl From<SnapshotError> for PipelineError {
  fn from(err: SnapshotError) -> Self {
    match err {
      SnapshotError::Unavailable { token, reason } => Self::SnapshotUnavailable { token, reason },
      other => Self::Snapshot(other),
    }
  }
}

impl From<AssembleError> for PipelineError {
  fn from(err: AssembleError) -> Self {
    match err {
      AssembleError::CompileFailure { module, diagnostics } => Self::CompileFailure { module, diagnostics },
      other => Self::PackagingFailure(other.to_string()),
    }
  }
}

impl From<BootstrapError> for PipelineError {
  fn from(err: BootstrapError) -> Self {
    match err {
      BootstrapError::Integrity { what, expected, actual } => Self::Integrity { what, expected, actual },
      other => Self::Bootstrap(other),
    }
  }
}

/// One module's completed build.
#[derive(Debug, Clone)]
pub struct ModuleBuild {
  pub name: String,
  pub fingerprint: Fingerprint,
  /// The working tree, handed read-only to dependents.
  pub tree: Arc<Tree>,
  /// Compiled output inside the rebuild cache.
  pub compiled_dir: PathBuf,
  /// Whether the cache already held this build.
  pub cached: bool,
}

/// Outcome of building every module.
#[derive(Debug, Default)]
pub struct BuildReport {
  pub token: Option<VersionToken>,
  /// Successful builds in completion order.
  pub built: Vec<ModuleBuild>,
  /// Failed modules with their errors.
  pub failed: Vec<(String, PipelineError)>,
  /// Modules not attempted, with the upstream that failed.
  pub skipped: Vec<(String, String)>,
}

impl BuildReport {
  pub fn get(&self, module: &str) -> Option<&ModuleBuild> {
    self.built.iter().find(|b| b.name == module)
  }

  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  /// The builds, or the first failure.
  pub fn into_result(self) -> Result<Vec<ModuleBuild>, PipelineError> {
    if let Some((_, err)) = self.failed.into_iter().next() {
      return Err(err);
    }
    if let Some((module, failed)) = self.skipped.into_iter().next() {
      return Err(PipelineError::Skipped { module, failed });
    }
    Ok(self.built)
  }
}

/// Outcome of `rebuild`: every module built, then the artifact if configured.
#[derive(Debug)]
pub struct RebuildReport {
  pub token: VersionToken,
  pub modules: Vec<ModuleBuild>,
  pub artifact: Option<Artifact>,
}

/// Per-module result of `sync`.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSync {
  pub module: String,
  pub patches: usize,
  pub refreshed: Vec<usize>,
  pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
  pub reference: String,
  pub token: VersionToken,
  pub tree_hash: ContentHash,
  /// Whether the lock file now pins a different snapshot.
  pub lock_changed: bool,
  pub modules: Vec<ModuleSync>,
}

/// Per-module result of `apply` and `rederive`.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleTree {
  pub module: String,
  pub output: PathBuf,
  pub files: usize,
  pub patches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
  pub module: String,
  pub upstream: Option<String>,
  pub patches: usize,
  pub fingerprint: Option<Fingerprint>,
  /// Whether a verified build for the current fingerprint is cached.
  pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
  pub reference: Option<String>,
  pub token: Option<VersionToken>,
  pub tree_hash: Option<ContentHash>,
  pub modules: Vec<ModuleStatus>,
}
