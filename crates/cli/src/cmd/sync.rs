//! Implementation of the `patchstack sync` command.
//!
//! Resolves the upstream reference, rebases every module's stack onto the new
//! snapshot and pins it in the lock file. Nothing is written on conflict.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::output::{
  ModuleMark, OutputFormat, format_duration, patch_count, print_dropped_patch, print_info, print_json, print_module,
  print_stat, print_success, short_hash,
};

pub fn cmd_sync(config: Option<&Path>, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let pipeline = super::pipeline(config)?;
  let report = super::runtime()?.block_on(pipeline.sync()).context("Sync failed")?;

  if output.is_json() {
    return print_json(&report);
  }

  if report.lock_changed {
    print_success(&format!("Synced to {}", report.token));
  } else {
    print_info(&format!("Already at {}", report.token));
  }
  print_stat("Reference", &report.reference);
  print_stat("Tree", short_hash(&report.tree_hash.0));
  println!();

  for module in &report.modules {
    let detail = if module.refreshed.is_empty() && module.dropped.is_empty() {
      format!("({}, unchanged)", patch_count(module.patches))
    } else {
      format!(
        "({}, {} refreshed, {} dropped)",
        patch_count(module.patches),
        module.refreshed.len(),
        module.dropped.len()
      )
    };
    let mark = if module.refreshed.is_empty() { ModuleMark::Listed } else { ModuleMark::Changed };
    print_module(mark, &module.module, &detail);
    for name in &module.dropped {
      print_dropped_patch(name);
    }
  }

  println!();
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
