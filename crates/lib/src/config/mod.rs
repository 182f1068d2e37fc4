//! Project configuration (`patchstack.toml`).
//!
//! ```toml
//! [upstream]
//! source = "git"
//! url = "https://example.com/upstream.git"
//! ref_file = "current-upstream"
//!
//! [[module]]
//! name = "API"
//! patches = "patches/api"
//! output = "Fork-API"
//!
//! [[module]]
//! name = "Server"
//! patches = "patches/server"
//! output = "Fork-Server"
//! upstream = "API"
//!
//! [toolchain]
//! kind = "command"
//! program = "sh"
//! args = ["-c", "cp -r \"$src\"/. \"$out\""]
//!
//! [artifact]
//! path = "fork-bootstrap.zip"
//! runtime_module = "Server"
//! runtime_file = "server.jar"
//!
//! [bootstrap]
//! original_url = "https://example.com/original-1.17.1.jar"
//! original_version = "1.17.1"
//! original_file = "cache/original.jar"
//! runtime_path = "versions/1.17.1/server.jar"
//! launcher = ["java", "-jar"]
//! ```
//!
//! Relative paths resolve against the directory holding the config file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::consts::{CONFIG_FILENAME, LOCK_FILENAME};
use crate::graph::Module;
use crate::snapshot::{DirSource, GitSource, SnapshotSource};
use crate::util::hash::truncated_hash;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("no {CONFIG_FILENAME} found in '{0}'")]
  NotFound(PathBuf),

  #[error("failed to read '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid configuration: {0}")]
  Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
  Git,
  Dir,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
  pub source: SourceKind,
  /// Remote URL for git upstreams.
  pub url: Option<String>,
  /// Local directory for dir upstreams.
  pub path: Option<PathBuf>,
  /// Branch, tag or commit to track.
  #[serde(rename = "ref")]
  pub reference: Option<String>,
  /// File whose first line names the reference.
  pub ref_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
  pub name: String,
  pub patches: PathBuf,
  pub output: PathBuf,
  pub upstream: Option<String>,
  #[serde(default)]
  pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolchainKind {
  #[default]
  Copy,
  Command,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
  pub kind: ToolchainKind,
  pub program: Option<String>,
  pub args: Vec<String>,
  /// Maximum modules compiled at once.
  pub parallelism: usize,
}

impl Default for ToolchainConfig {
  fn default() -> Self {
    Self {
      kind: ToolchainKind::Copy,
      program: None,
      args: Vec::new(),
      parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
  pub path: PathBuf,
  /// Module whose compiled output contains the runtime binary.
  pub runtime_module: String,
  /// Path of the runtime binary inside that module's compiled output.
  pub runtime_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
  pub original_url: String,
  pub original_version: String,
  /// Local copy of the original binary used to compute the delta.
  pub original_file: PathBuf,
  /// Where the reconstructed runtime is placed, relative to the runtime cache.
  pub runtime_path: String,
  #[serde(default)]
  pub launcher: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Directory the config file was loaded from.
  #[serde(skip)]
  pub root: PathBuf,
  pub upstream: UpstreamConfig,
  #[serde(rename = "module", default)]
  pub modules: Vec<ModuleConfig>,
  #[serde(default)]
  pub toolchain: ToolchainConfig,
  pub artifact: Option<ArtifactConfig>,
  pub bootstrap: Option<BootstrapConfig>,
}

impl Config {
  /// Load `explicit`, or `patchstack.toml` from `cwd`.
  pub fn discover(explicit: Option<&Path>, cwd: &Path) -> Result<Self, ConfigError> {
    match explicit {
      Some(path) => Self::load(path),
      None => {
        let path = cwd.join(CONFIG_FILENAME);
        if !path.exists() {
          return Err(ConfigError::NotFound(cwd.to_path_buf()));
        }
        Self::load(&path)
      }
    }
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let root = path
      .parent()
      .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p })
      .unwrap_or(Path::new("."));
    let root = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let config = Self::parse(&content, root).map_err(|e| match e {
      ParseFailure::Toml(source) => ConfigError::Parse {
        path: path.to_path_buf(),
        source,
      },
      ParseFailure::Invalid(e) => e,
    })?;
    debug!(path = %path.display(), modules = config.modules.len(), "loaded config");
    Ok(config)
  }

  /// Parse and validate config text whose relative paths resolve against `root`.
  pub fn from_toml(content: &str, root: PathBuf) -> Result<Self, ConfigError> {
    Self::parse(content, root).map_err(|e| match e {
      ParseFailure::Toml(source) => ConfigError::Parse {
        path: PathBuf::from(CONFIG_FILENAME),
        source,
      },
      ParseFailure::Invalid(e) => e,
    })
  }

  fn parse(content: &str, root: PathBuf) -> Result<Self, ParseFailure> {
    let mut config: Config = toml::from_str(content).map_err(ParseFailure::Toml)?;
    config.root = root;
    config.validate().map_err(ParseFailure::Invalid)?;
    Ok(config)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::Invalid(msg));
    match self.upstream.source {
      SourceKind::Git if self.upstream.url.is_none() => return invalid("git upstream needs 'url'".into()),
      SourceKind::Dir if self.upstream.path.is_none() => return invalid("dir upstream needs 'path'".into()),
      SourceKind::Git if self.upstream.reference.is_none() == self.upstream.ref_file.is_none() => {
        return invalid("git upstream needs exactly one of 'ref' and 'ref_file'".into());
      }
      _ => {}
    }
    if self.toolchain.kind == ToolchainKind::Command && self.toolchain.program.is_none() {
      return invalid("command toolchain needs 'program'".into());
    }
    if self.toolchain.parallelism == 0 {
      return invalid("toolchain parallelism must be at least 1".into());
    }
    if let Some(artifact) = &self.artifact
      && !self.modules.iter().any(|m| m.name == artifact.runtime_module)
    {
      return invalid(format!("artifact runtime_module '{}' is not a module", artifact.runtime_module));
    }
    if self.artifact.is_some() != self.bootstrap.is_some() {
      return invalid("[artifact] and [bootstrap] must be configured together".into());
    }
    Ok(())
  }

  pub fn resolve_path(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.root.join(path)
    }
  }

  pub fn lock_path(&self) -> PathBuf {
    self.root.join(LOCK_FILENAME)
  }

  /// Modules with paths made absolute.
  pub fn modules(&self) -> Vec<Module> {
    self
      .modules
      .iter()
      .map(|m| Module {
        name: m.name.clone(),
        patches: self.resolve_path(&m.patches),
        output: self.resolve_path(&m.output),
        upstream: m.upstream.clone(),
        dependencies: m.dependencies.clone(),
      })
      .collect()
  }

  /// The upstream reference to resolve: `ref`, or the first line of `ref_file`.
  pub fn upstream_reference(&self) -> Result<String, ConfigError> {
    if let Some(reference) = &self.upstream.reference {
      return Ok(reference.clone());
    }
    if let Some(file) = &self.upstream.ref_file {
      let path = self.resolve_path(file);
      let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
      return content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::Invalid(format!("'{}' is empty", path.display())));
    }
    Ok("local".to_string())
  }

  /// Build the configured snapshot source. Git mirrors live under `{cache}/git/`.
  pub fn snapshot_source(&self, cache_dir: &Path) -> Arc<dyn SnapshotSource> {
    match self.upstream.source {
      SourceKind::Git => {
        let url = self.upstream.url.clone().unwrap_or_default();
        let mirror = cache_dir.join("git").join(&truncated_hash(url.as_bytes()).0);
        Arc::new(GitSource::new(url, mirror))
      }
      SourceKind::Dir => {
        let path = self.upstream.path.as_deref().map(|p| self.resolve_path(p)).unwrap_or_default();
        Arc::new(DirSource::new(path))
      }
    }
  }
}

enum ParseFailure {
  Toml(toml::de::Error),
  Invalid(ConfigError),
}
