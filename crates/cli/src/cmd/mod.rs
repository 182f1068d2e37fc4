mod evict;
mod gc;
mod launch;
mod rebuild;
mod status;
mod sync;
mod tree;

pub use evict::cmd_evict;
pub use gc::cmd_gc;
pub use launch::cmd_launch;
pub use rebuild::cmd_rebuild;
pub use status::cmd_status;
pub use sync::cmd_sync;
pub use tree::{cmd_apply, cmd_rederive};

use std::path::Path;

use anyhow::{Context, Result};
use tokio::runtime::Runtime;

use patchstack_lib::config::Config;
use patchstack_lib::execute::Pipeline;
use patchstack_lib::platform::paths::cache_dir;

/// Load the project config and build a pipeline over the user cache.
fn pipeline(config: Option<&Path>) -> Result<Pipeline> {
  let cwd = std::env::current_dir().context("Failed to determine working directory")?;
  let cwd = dunce::canonicalize(&cwd).unwrap_or(cwd);
  let config = Config::discover(config, &cwd).context("Failed to load config")?;
  Ok(Pipeline::new(config, cache_dir())?)
}

fn runtime() -> Result<Runtime> {
  Runtime::new().context("Failed to create async runtime")
}
