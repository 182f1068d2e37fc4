//! Implementation of the `patchstack status` command.
//!
//! Works from the lock file and patch files alone; nothing is fetched.

use std::path::Path;

use anyhow::{Context, Result};

use crate::output::{
  ModuleMark, OutputFormat, patch_count, print_info, print_json, print_module, print_stat, print_success,
  print_warning, short_hash,
};

pub fn cmd_status(config: Option<&Path>, verbose: bool, output: OutputFormat) -> Result<()> {
  let pipeline = super::pipeline(config)?;
  let report = super::runtime()?.block_on(pipeline.status()).context("Status failed")?;

  if output.is_json() {
    return print_json(&report);
  }

  match (&report.token, &report.reference) {
    (Some(token), Some(reference)) => {
      print_success(&format!("Pinned to {}", token));
      print_stat("Reference", reference);
      if let Some(hash) = &report.tree_hash {
        print_stat("Tree", short_hash(&hash.0));
      }
    }
    _ => print_warning("No lock file. Run 'patchstack sync' to pin the upstream."),
  }
  println!();

  for module in &report.modules {
    let mut detail = format!("({}", patch_count(module.patches));
    if let Some(upstream) = &module.upstream {
      detail.push_str(&format!(", on {}", upstream));
    }
    detail.push(')');
    if verbose && let Some(fp) = &module.fingerprint {
      detail.push_str(&format!(" {}", short_hash(&fp.0)));
    }
    let mark = if module.cached { ModuleMark::Cached } else { ModuleMark::Changed };
    print_module(mark, &module.module, &detail);
  }

  let stale = report.modules.iter().filter(|m| !m.cached).count();
  if report.token.is_some() && stale > 0 {
    println!();
    print_info(&format!("{} module(s) need a rebuild", stale));
  }
  Ok(())
}
