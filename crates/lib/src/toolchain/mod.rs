//! Compiler capability.
//!
//! The pipeline treats compilation as an opaque step: a [`Toolchain`] receives
//! a materialized working tree and fills an output directory.

mod cmd;

pub use cmd::CommandToolchain;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::{ToolchainConfig, ToolchainKind};
use crate::util::fs::copy_dir;

/// One module compilation.
#[derive(Debug, Clone)]
pub struct CompileJob {
  pub module: String,
  /// Materialized working tree; the process runs here.
  pub source: PathBuf,
  /// Empty directory the toolchain must populate.
  pub out: PathBuf,
  /// External libraries declared for the module.
  pub dependencies: Vec<String>,
  /// Compiled output of the upstream module, if any.
  pub upstream_out: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CompileError {
  /// The toolchain ran and reported failure. `stderr` is kept verbatim.
  #[error("compilation of '{module}' failed ({status}):\n{stderr}")]
  Failed {
    module: String,
    status: String,
    stderr: String,
  },

  #[error("failed to start toolchain '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("toolchain I/O error for '{module}': {source}")]
  Io {
    module: String,
    #[source]
    source: io::Error,
  },
}

impl CompileError {
  /// Diagnostics to surface to the user.
  pub fn diagnostics(&self) -> String {
    match self {
      Self::Failed { stderr, .. } => stderr.clone(),
      other => other.to_string(),
    }
  }
}

#[async_trait]
pub trait Toolchain: Send + Sync {
  /// Compile `job.source` into `job.out`, returning the output directory.
  async fn compile(&self, job: &CompileJob) -> Result<PathBuf, CompileError>;

  /// Stable description of what this toolchain runs. Part of every build
  /// fingerprint, so changing it invalidates cached outputs.
  fn identity(&self) -> String;
}

/// "Compiles" by copying the working tree verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyToolchain;

#[async_trait]
impl Toolchain for CopyToolchain {
  async fn compile(&self, job: &CompileJob) -> Result<PathBuf, CompileError> {
    let (source, out) = (job.source.clone(), job.out.clone());
    tokio::task::spawn_blocking(move || copy_dir(&source, &out))
      .await
      .map_err(|e| CompileError::Io {
        module: job.module.clone(),
        source: io::Error::other(e),
      })?
      .map_err(|source| CompileError::Io {
        module: job.module.clone(),
        source,
      })?;
    debug!(module = %job.module, "copied working tree as output");
    Ok(job.out.clone())
  }

  fn identity(&self) -> String {
    "copy".to_string()
  }
}

/// Build the configured toolchain.
pub fn from_config(config: &ToolchainConfig) -> Arc<dyn Toolchain> {
  match (config.kind, &config.program) {
    (ToolchainKind::Command, Some(program)) => Arc::new(CommandToolchain::new(program.clone(), config.args.clone())),
    _ => Arc::new(CopyToolchain),
  }
}
