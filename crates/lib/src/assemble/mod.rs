//! Artifact assembly.
//!
//! The artifact is a zip holding every module's compiled output plus what the
//! bootstrap launcher needs to reconstruct the runtime binary:
//!
//! ```text
//! META-INF/patchstack/bootstrap.json   # BootstrapManifest
//! META-INF/patchstack/runtime.delta    # runtime relative to the original binary
//! modules/<module>/<compiled files>    # the runtime file itself is left out
//! ```
//!
//! Entries are sorted and timestamped at the zip epoch, so identical inputs
//! give byte-identical artifacts.

mod delta;
mod manifest;

pub use delta::{DELTA_ALGORITHM, decode as decode_delta, encode as encode_delta};
pub use manifest::*;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::cache::Fingerprint;
use crate::config::Config;
use crate::util::fs::write_atomic;
use crate::util::hash::hash_bytes;

#[derive(Debug, Error)]
pub enum AssembleError {
  /// A module has no compiled output; assembly needs every module.
  #[error("module '{module}' did not compile: {diagnostics}")]
  CompileFailure { module: String, diagnostics: String },

  #[error("runtime file '{file}' not found in output of '{module}'")]
  MissingRuntime { module: String, file: String },

  #[error("failed to read original binary '{path}': {source}")]
  Original {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write artifact '{path}': {message}")]
  PackagingFailure { path: PathBuf, message: String },
}

/// Where and how to build the artifact.
#[derive(Debug, Clone)]
pub struct AssembleSettings {
  pub dest: PathBuf,
  pub runtime_module: String,
  pub runtime_file: String,
  pub original_file: PathBuf,
  pub original_url: String,
  pub original_version: String,
  pub runtime_path: String,
  pub launcher: Vec<String>,
}

impl AssembleSettings {
  /// Settings from `[artifact]` and `[bootstrap]`, if both are configured.
  pub fn from_config(config: &Config) -> Option<Self> {
    let artifact = config.artifact.as_ref()?;
    let bootstrap = config.bootstrap.as_ref()?;
    Some(Self {
      dest: config.resolve_path(&artifact.path),
      runtime_module: artifact.runtime_module.clone(),
      runtime_file: artifact.runtime_file.clone(),
      original_file: config.resolve_path(&bootstrap.original_file),
      original_url: bootstrap.original_url.clone(),
      original_version: bootstrap.original_version.clone(),
      runtime_path: bootstrap.runtime_path.clone(),
      launcher: bootstrap.launcher.clone(),
    })
  }
}

/// A module's compiled output as handed over by the pipeline.
#[derive(Debug, Clone)]
pub struct ModuleOutput {
  pub name: String,
  pub fingerprint: Fingerprint,
  pub compiled_dir: PathBuf,
}

/// A written artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
  pub path: PathBuf,
  pub manifest: BootstrapManifest,
  pub size: u64,
}

/// Every regular file below `dir`, keyed by `/`-separated relative path.
fn collect_files(dir: &Path) -> io::Result<BTreeMap<String, PathBuf>> {
  let mut files = BTreeMap::new();
  for entry in WalkDir::new(dir).follow_links(true) {
    let entry = entry.map_err(io::Error::other)?;
    if !entry.file_type().is_file() {
      continue;
    }
    let rel = entry
      .path()
      .strip_prefix(dir)
      .map_err(io::Error::other)?
      .to_string_lossy()
      .replace('\\', "/");
    files.insert(rel, entry.path().to_path_buf());
  }
  Ok(files)
}

/// Package `outputs` into the artifact described by `settings`.
pub fn assemble(outputs: &[ModuleOutput], settings: &AssembleSettings) -> Result<Artifact, AssembleError> {
  let packaging = |message: String| AssembleError::PackagingFailure {
    path: settings.dest.clone(),
    message,
  };

  let runtime_output = outputs
    .iter()
    .find(|o| o.name == settings.runtime_module)
    .ok_or_else(|| AssembleError::CompileFailure {
      module: settings.runtime_module.clone(),
      diagnostics: "no compiled output".to_string(),
    })?;
  let runtime_path = runtime_output.compiled_dir.join(&settings.runtime_file);
  let runtime = fs::read(&runtime_path).map_err(|_| AssembleError::MissingRuntime {
    module: settings.runtime_module.clone(),
    file: settings.runtime_file.clone(),
  })?;
  let original = fs::read(&settings.original_file).map_err(|source| AssembleError::Original {
    path: settings.original_file.clone(),
    source,
  })?;

  let delta = delta::encode(&original, &runtime).map_err(|e| packaging(format!("delta encoding failed: {}", e)))?;
  debug!(
    original = original.len(),
    runtime = runtime.len(),
    delta = delta.len(),
    "encoded runtime delta"
  );

  let mut sorted: Vec<&ModuleOutput> = outputs.iter().collect();
  sorted.sort_by(|a, b| a.name.cmp(&b.name));

  let mut entries: Vec<(String, PathBuf)> = Vec::new();
  let mut modules = Vec::with_capacity(sorted.len());
  for output in sorted {
    let files = collect_files(&output.compiled_dir).map_err(|e| packaging(e.to_string()))?;
    let mut count = 0;
    for (rel, path) in files {
      if output.name == settings.runtime_module && rel == settings.runtime_file {
        continue;
      }
      entries.push((format!("{}{}/{}", MODULES_PREFIX, output.name, rel), path));
      count += 1;
    }
    modules.push(ModuleEntry {
      name: output.name.clone(),
      fingerprint: output.fingerprint.0.clone(),
      files: count,
    });
  }

  let manifest = BootstrapManifest {
    version: MANIFEST_VERSION,
    original: OriginalBinary {
      version: settings.original_version.clone(),
      url: settings.original_url.clone(),
      sha256: hash_bytes(&original),
      size: original.len() as u64,
    },
    delta: DeltaInfo {
      entry: DELTA_ENTRY.to_string(),
      algorithm: DELTA_ALGORITHM.to_string(),
    },
    runtime: RuntimeInfo {
      sha256: hash_bytes(&runtime),
      size: runtime.len() as u64,
      path: settings.runtime_path.clone(),
    },
    launcher: settings.launcher.clone(),
    modules,
  };

  let bytes = write_zip(&manifest, &delta, &entries).map_err(|e| packaging(e.to_string()))?;
  write_atomic(&settings.dest, &bytes).map_err(|e| packaging(e.to_string()))?;

  info!(
    path = %settings.dest.display(),
    size = bytes.len(),
    entries = entries.len(),
    "assembled artifact"
  );
  Ok(Artifact {
    path: settings.dest.clone(),
    manifest,
    size: bytes.len() as u64,
  })
}

fn write_zip(manifest: &BootstrapManifest, delta: &[u8], entries: &[(String, PathBuf)]) -> zip::result::ZipResult<Vec<u8>> {
  let options = SimpleFileOptions::default()
    .compression_method(CompressionMethod::Deflated)
    .last_modified_time(DateTime::default())
    .unix_permissions(0o644);
  let stored = options.compression_method(CompressionMethod::Stored);

  let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

  writer.start_file(MANIFEST_ENTRY, options)?;
  writer.write_all(&serde_json::to_vec_pretty(manifest).map_err(io::Error::other)?)?;

  // Already compressed.
  writer.start_file(DELTA_ENTRY, stored)?;
  writer.write_all(delta)?;

  for (name, path) in entries {
    writer.start_file(name.as_str(), options)?;
    writer.write_all(&fs::read(path)?)?;
  }

  Ok(writer.finish()?.into_inner())
}

/// Read the manifest and delta back out of an artifact.
pub fn read_bootstrap(artifact: &Path) -> Result<(BootstrapManifest, Vec<u8>), AssembleError> {
  let invalid = |message: String| AssembleError::PackagingFailure {
    path: artifact.to_path_buf(),
    message,
  };

  let file = fs::File::open(artifact).map_err(|e| invalid(e.to_string()))?;
  let mut archive = ZipArchive::new(io::BufReader::new(file)).map_err(|e| invalid(e.to_string()))?;

  let mut json = Vec::new();
  archive
    .by_name(MANIFEST_ENTRY)
    .map_err(|e| invalid(format!("{}: {}", MANIFEST_ENTRY, e)))?
    .read_to_end(&mut json)
    .map_err(|e| invalid(e.to_string()))?;
  let manifest: BootstrapManifest = serde_json::from_slice(&json).map_err(|e| invalid(e.to_string()))?;

  let mut delta = Vec::new();
  archive
    .by_name(&manifest.delta.entry)
    .map_err(|e| invalid(format!("{}: {}", manifest.delta.entry, e)))?
    .read_to_end(&mut delta)
    .map_err(|e| invalid(e.to_string()))?;

  Ok((manifest, delta))
}
