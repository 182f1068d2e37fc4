mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use patchstack_lib::bootstrap::BootstrapError;
use patchstack_lib::execute::{PipelineError, exit_code};

use crate::output::{OutputFormat, print_error};

/// patchstack - maintain a fork as patch stacks over an upstream
#[derive(Parser)]
#[command(name = "patchstack")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Path to the project config (default: ./patchstack.toml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Pull the upstream and rebase every patch stack onto it
  Sync,

  /// Build every module and assemble the artifact
  Rebuild,

  /// Write each module's patched tree to its output directory
  Apply,

  /// Regenerate patch stacks from the output directories
  Rederive,

  /// Show the pinned upstream and per-module cache state
  Status,

  /// Remove cached snapshots and builds nothing references
  Gc {
    /// Show what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,
  },

  /// Drop one cached upstream snapshot
  Evict {
    /// Version token, as printed by `status`
    token: String,
  },

  /// Reconstruct the runtime from an artifact and run it
  Launch {
    /// Artifact produced by `rebuild`
    artifact: PathBuf,

    /// Arguments passed to the runtime
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let config = cli.config.as_deref();
  let result = match cli.command {
    Commands::Sync => cmd::cmd_sync(config, cli.output).map(|_| exit_code::OK),
    Commands::Rebuild => cmd::cmd_rebuild(config, cli.output).map(|_| exit_code::OK),
    Commands::Apply => cmd::cmd_apply(config, cli.output).map(|_| exit_code::OK),
    Commands::Rederive => cmd::cmd_rederive(config, cli.output).map(|_| exit_code::OK),
    Commands::Status => cmd::cmd_status(config, cli.verbose, cli.output).map(|_| exit_code::OK),
    Commands::Gc { dry_run } => cmd::cmd_gc(config, dry_run, cli.output).map(|_| exit_code::OK),
    Commands::Evict { token } => cmd::cmd_evict(config, &token, cli.output).map(|_| exit_code::OK),
    Commands::Launch { artifact, args } => cmd::cmd_launch(&artifact, &args),
  };

  match result {
    Ok(code) => ExitCode::from(clamp(code)),
    Err(err) => {
      print_error(&format!("{:#}", err));
      ExitCode::from(clamp(classify(&err)))
    }
  }
}

/// Logs go to stderr so `--output json` stays parseable.
fn init_tracing(verbose: bool) {
  let default = if verbose {
    "patchstack_lib=debug,patchstack=debug"
  } else {
    "warn"
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

/// Exit code for the first pipeline or bootstrap error in the chain.
fn classify(err: &anyhow::Error) -> i32 {
  err
    .chain()
    .find_map(|cause| {
      if let Some(e) = cause.downcast_ref::<PipelineError>() {
        return Some(e.exit_code());
      }
      cause.downcast_ref::<BootstrapError>().map(BootstrapError::exit_code)
    })
    .unwrap_or(exit_code::OTHER)
}

fn clamp(code: i32) -> u8 {
  u8::try_from(code).unwrap_or(exit_code::OTHER as u8)
}
