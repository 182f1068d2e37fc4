//! Terminal rendering of pipeline reports.
//!
//! Text goes to stdout with one line per module; errors and warnings go to
//! stderr. `--output json` replaces the text with one pretty-printed document.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

/// Fingerprints and tree hashes are shown to this many characters.
const SHORT_HASH_LEN: usize = 12;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

/// State of a module as shown at the start of its line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleMark {
  /// Build output for the current fingerprint is in the cache.
  Cached,
  /// Compiled this run, or its stack changed and it needs a rebuild.
  Changed,
  /// Listed without a build state.
  Listed,
}

impl ModuleMark {
  fn symbol(self) -> &'static str {
    match self {
      ModuleMark::Cached => "✓",
      ModuleMark::Changed => "~",
      ModuleMark::Listed => "•",
    }
  }
}

pub fn short_hash(hash: &str) -> &str {
  hash.get(..SHORT_HASH_LEN).unwrap_or(hash)
}

pub fn patch_count(patches: usize) -> String {
  match patches {
    1 => "1 patch".to_string(),
    n => format!("{n} patches"),
  }
}

/// `path` relative to `base` when it lies below it.
pub fn relative(path: &Path, base: &Path) -> String {
  path.strip_prefix(base).unwrap_or(path).display().to_string()
}

pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 3] = ["KB", "MB", "GB"];

  if bytes < 1024 {
    return format!("{bytes} B");
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit + 1 < UNITS.len() {
    value /= 1024.0;
    unit += 1;
  }
  format!("{value:.1} {}", UNITS[unit])
}

/// Wall time of a pipeline command.
pub fn format_duration(elapsed: Duration) -> String {
  let secs = elapsed.as_secs();
  if secs >= 60 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else if secs > 0 {
    format!("{:.2}s", elapsed.as_secs_f64())
  } else {
    format!("{}ms", elapsed.as_millis())
  }
}

pub fn print_success(message: &str) {
  println!("{} {}", "✓".if_supports_color(Stream::Stdout, |s| s.green()), message);
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    "✗".if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    "⚠".if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!("{} {}", "•".if_supports_color(Stream::Stdout, |s| s.blue()), message);
}

pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()), value);
}

/// `  ✓ API (3 patches, on Base) 1f0c2a9e4b7d`
pub fn print_module(mark: ModuleMark, name: &str, detail: &str) {
  let symbol = mark.symbol();
  let symbol = match mark {
    ModuleMark::Cached => symbol.if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
    ModuleMark::Changed => symbol.if_supports_color(Stream::Stdout, |s| s.yellow()).to_string(),
    ModuleMark::Listed => symbol.to_string(),
  };
  println!(
    "  {} {} {}",
    symbol,
    name.if_supports_color(Stream::Stdout, |s| s.cyan()),
    detail.if_supports_color(Stream::Stdout, |s| s.dimmed())
  );
}

/// A patch removed by sync because upstream now contains its change.
pub fn print_dropped_patch(name: &str) {
  println!(
    "      {} {} {}",
    "-".if_supports_color(Stream::Stdout, |s| s.red()),
    name,
    "(now upstream)".if_supports_color(Stream::Stdout, |s| s.dimmed())
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
