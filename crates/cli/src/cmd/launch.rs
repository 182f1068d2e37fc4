//! Implementation of the `patchstack launch` command.
//!
//! Needs no project config: everything comes from the artifact's manifest.
//! The runtime is rebuilt into the user cache on first use and reused after.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use patchstack_lib::bootstrap::{HttpFetcher, launch, prepare_runtime, read_manifest};
use patchstack_lib::execute::exit_code;
use patchstack_lib::platform::paths::cache_dir;

/// Returns the runtime's own exit code.
pub fn cmd_launch(artifact: &Path, args: &[String]) -> Result<i32> {
  let manifest = read_manifest(artifact).with_context(|| format!("Failed to read {}", artifact.display()))?;
  let fetcher = HttpFetcher::new();
  let cache = cache_dir();

  let runtime = super::runtime()?
    .block_on(prepare_runtime(artifact, &cache, &fetcher))
    .context("Failed to prepare runtime")?;
  info!(runtime = %runtime.display(), version = %manifest.original.version, "runtime ready");

  let status = launch(&runtime, &manifest.launcher, args).context("Failed to launch runtime")?;
  Ok(status.code().unwrap_or(exit_code::OTHER))
}
