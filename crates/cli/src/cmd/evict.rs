use std::path::Path;

use anyhow::{Context, Result};

use patchstack_lib::snapshot::VersionToken;

use crate::output::{OutputFormat, print_info, print_json, print_success};

pub fn cmd_evict(config: Option<&Path>, token: &str, output: OutputFormat) -> Result<()> {
  let pipeline = super::pipeline(config)?;
  let token = VersionToken::new(token);
  let removed = super::runtime()?
    .block_on(pipeline.evict(&token))
    .context("Eviction failed")?;

  if output.is_json() {
    return print_json(&serde_json::json!({ "token": token, "removed": removed }));
  }
  if removed {
    print_success(&format!("Evicted {}", token));
  } else {
    print_info(&format!("{} is not cached", token));
  }
  Ok(())
}
