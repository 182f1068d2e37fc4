//! External compiler processes with an isolated environment.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{CompileError, CompileJob, Toolchain};

/// ZIP epoch (1980-01-01), so archive timestamps do not depend on build time.
const SOURCE_DATE_EPOCH: &str = "315532800";

/// Runs `program args...` inside the working tree.
///
/// The process sees a cleared environment holding only:
/// - `PATH` from the host, so compilers can be found
/// - `src` and `out`, the working tree and the output directory
/// - `PATCHSTACK_MODULE`, `PATCHSTACK_DEPS` (`:`-separated) and
///   `PATCHSTACK_UPSTREAM_OUT` when the module has an upstream
/// - fixed `LANG`/`LC_ALL`, `HOME` and `SOURCE_DATE_EPOCH`
#[derive(Debug, Clone)]
pub struct CommandToolchain {
  program: String,
  args: Vec<String>,
}

impl CommandToolchain {
  pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
    Self {
      program: program.into(),
      args,
    }
  }
}

#[async_trait]
impl Toolchain for CommandToolchain {
  async fn compile(&self, job: &CompileJob) -> Result<PathBuf, CompileError> {
    info!(module = %job.module, program = %self.program, "compiling");

    tokio::fs::create_dir_all(&job.out).await.map_err(|source| CompileError::Io {
      module: job.module.clone(),
      source,
    })?;
    let home = job.out.with_extension("home");
    tokio::fs::create_dir_all(&home).await.map_err(|source| CompileError::Io {
      module: job.module.clone(),
      source,
    })?;

    let mut command = Command::new(&self.program);
    command
      .args(&self.args)
      .current_dir(&job.source)
      .env_clear()
      .env("PATH", std::env::var_os("PATH").unwrap_or_default())
      .env("HOME", &home)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
      .env("src", &job.source)
      .env("out", &job.out)
      .env("PATCHSTACK_MODULE", &job.module)
      .env("PATCHSTACK_DEPS", job.dependencies.join(":"));
    if let Some(upstream) = &job.upstream_out {
      command.env("PATCHSTACK_UPSTREAM_OUT", upstream);
    }

    debug!(cwd = %job.source.display(), "spawning toolchain");
    let output = command.output().await.map_err(|source| CompileError::Spawn {
      program: self.program.clone(),
      source,
    })?;

    let _ = tokio::fs::remove_dir_all(&home).await;

    if !output.status.success() {
      let stdout = String::from_utf8_lossy(&output.stdout);
      if !stdout.is_empty() {
        debug!(stdout = %stdout, "toolchain stdout");
      }
      return Err(CompileError::Failed {
        module: job.module.clone(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      });
    }

    Ok(job.out.clone())
  }

  fn identity(&self) -> String {
    let argv: Vec<&str> = std::iter::once(self.program.as_str())
      .chain(self.args.iter().map(String::as_str))
      .collect();
    format!("command:{}", serde_json::to_string(&argv).unwrap_or_default())
  }
}
