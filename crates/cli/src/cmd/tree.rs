//! Implementation of `patchstack apply` and `patchstack rederive`.
//!
//! `apply` materializes each module's patched tree for editing; `rederive`
//! turns the edited trees back into patch stacks.

use std::path::Path;

use anyhow::{Context, Result};

use patchstack_lib::execute::ModuleTree;

use crate::output::{ModuleMark, OutputFormat, patch_count, print_json, print_module, print_success, relative};

pub fn cmd_apply(config: Option<&Path>, output: OutputFormat) -> Result<()> {
  let pipeline = super::pipeline(config)?;
  let trees = super::runtime()?.block_on(pipeline.apply()).context("Apply failed")?;

  if output.is_json() {
    return print_json(&trees);
  }
  print_success(&format!("Wrote {} working tree(s)", trees.len()));
  print_trees(&trees, pipeline.config().root.as_path());
  Ok(())
}

pub fn cmd_rederive(config: Option<&Path>, output: OutputFormat) -> Result<()> {
  let pipeline = super::pipeline(config)?;
  let trees = super::runtime()?.block_on(pipeline.rederive()).context("Rederive failed")?;

  if output.is_json() {
    return print_json(&trees);
  }
  print_success(&format!("Rederived {} patch stack(s)", trees.len()));
  print_trees(&trees, pipeline.config().root.as_path());
  Ok(())
}

fn print_trees(trees: &[ModuleTree], root: &Path) {
  for tree in trees {
    let detail = format!(
      "→ {} ({} files, {})",
      relative(&tree.output, root),
      tree.files,
      patch_count(tree.patches)
    );
    print_module(ModuleMark::Listed, &tree.module, &detail);
  }
}
