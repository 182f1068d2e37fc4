//! Implementation of the `patchstack rebuild` command.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;

use patchstack_lib::execute::RebuildReport;

use crate::output::{
  ModuleMark, OutputFormat, format_bytes, format_duration, print_json, print_module, print_stat, print_success,
  relative, short_hash,
};

#[derive(Serialize)]
struct ModuleSummary<'a> {
  name: &'a str,
  fingerprint: &'a str,
  cached: bool,
}

#[derive(Serialize)]
struct ArtifactSummary<'a> {
  path: &'a Path,
  size: u64,
  runtime_sha256: &'a str,
}

#[derive(Serialize)]
struct RebuildSummary<'a> {
  token: &'a str,
  modules: Vec<ModuleSummary<'a>>,
  artifact: Option<ArtifactSummary<'a>>,
}

impl<'a> RebuildSummary<'a> {
  fn new(report: &'a RebuildReport) -> Self {
    Self {
      token: report.token.as_str(),
      modules: report
        .modules
        .iter()
        .map(|m| ModuleSummary {
          name: &m.name,
          fingerprint: &m.fingerprint.0,
          cached: m.cached,
        })
        .collect(),
      artifact: report.artifact.as_ref().map(|a| ArtifactSummary {
        path: &a.path,
        size: a.size,
        runtime_sha256: &a.manifest.runtime.sha256.0,
      }),
    }
  }
}

pub fn cmd_rebuild(config: Option<&Path>, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let pipeline = super::pipeline(config)?;
  let report = super::runtime()?.block_on(pipeline.rebuild()).context("Rebuild failed")?;

  if output.is_json() {
    return print_json(&RebuildSummary::new(&report));
  }

  let cached = report.modules.iter().filter(|m| m.cached).count();
  print_success(&format!("Built {} module(s) at {}", report.modules.len(), report.token));
  for module in &report.modules {
    let (mark, detail) = if module.cached {
      (ModuleMark::Cached, "(cached)")
    } else {
      (ModuleMark::Changed, "(compiled)")
    };
    print_module(mark, &module.name, &format!("{} {}", short_hash(&module.fingerprint.0), detail));
  }
  println!();
  print_stat("Compiled", &(report.modules.len() - cached).to_string());
  print_stat("Cached", &cached.to_string());
  if let Some(artifact) = &report.artifact {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    print_stat("Artifact", &relative(&artifact.path, &cwd));
    print_stat("Size", &format_bytes(artifact.size));
  }
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
