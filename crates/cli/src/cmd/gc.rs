use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

pub fn cmd_gc(config: Option<&Path>, dry_run: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let pipeline = super::pipeline(config)?;
  let stats = super::runtime()?
    .block_on(pipeline.gc(dry_run))
    .context("Garbage collection failed")?;

  if output.is_json() {
    print_json(&stats)?;
  } else {
    println!();
    if dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    print_stat("Snapshots removed", &stats.snapshots_deleted.to_string());
    print_stat("Builds removed", &stats.builds_deleted.to_string());
    print_stat("Scratch removed", &stats.staging_deleted.to_string());
    print_stat("Space freed", &format_bytes(stats.bytes_freed));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
