//! First-run bootstrap of an assembled artifact.
//!
//! The artifact ships a delta rather than the runtime itself. On launch the
//! original binary is fetched, the delta applied and the result verified
//! against the manifest before anything is executed or cached.

mod fetch;

pub use fetch::{BinaryFetcher, HttpFetcher};

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::assemble::{AssembleError, BootstrapManifest, DELTA_ALGORITHM, MANIFEST_VERSION, decode_delta, read_bootstrap};
use crate::execute::exit_code;
use crate::tree;
use crate::util::fs::{make_executable, write_atomic};
use crate::util::hash::{ContentHash, hash_bytes};

#[derive(Debug, Error)]
pub enum BootstrapError {
  /// A checksum did not match the manifest. The data is never executed.
  #[error("integrity check failed for {what}: expected {expected}, got {actual}")]
  Integrity {
    what: String,
    expected: ContentHash,
    actual: ContentHash,
  },

  #[error("failed to fetch '{url}': {message}")]
  Fetch { url: String, message: String },

  #[error("invalid bootstrap manifest: {0}")]
  Manifest(String),

  #[error(transparent)]
  Artifact(#[from] AssembleError),

  #[error("I/O error at '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl BootstrapError {
  /// Exit code for the CLI.
  pub fn exit_code(&self) -> i32 {
    match self {
      Self::Integrity { .. } => exit_code::INTEGRITY,
      _ => exit_code::OTHER,
    }
  }
}

/// Manifest of an assembled artifact.
pub fn read_manifest(artifact: &Path) -> Result<BootstrapManifest, BootstrapError> {
  Ok(read_bootstrap(artifact)?.0)
}

/// Where the reconstructed runtime lives below `cache_dir`.
pub fn runtime_path(manifest: &BootstrapManifest, cache_dir: &Path) -> Result<PathBuf, BootstrapError> {
  tree::resolve(&cache_dir.join("runtime"), &manifest.runtime.path).map_err(|e| BootstrapError::Manifest(e.to_string()))
}

/// Make sure the runtime described by `artifact` is present and verified.
pub async fn prepare_runtime(
  artifact: &Path,
  cache_dir: &Path,
  fetcher: &dyn BinaryFetcher,
) -> Result<PathBuf, BootstrapError> {
  let (manifest, delta) = read_bootstrap(artifact)?;
  reconstruct(&manifest, &delta, cache_dir, fetcher).await
}

async fn reconstruct(
  manifest: &BootstrapManifest,
  delta: &[u8],
  cache_dir: &Path,
  fetcher: &dyn BinaryFetcher,
) -> Result<PathBuf, BootstrapError> {
  if manifest.version != MANIFEST_VERSION {
    return Err(BootstrapError::Manifest(format!(
      "unsupported manifest version {}",
      manifest.version
    )));
  }
  if manifest.delta.algorithm != DELTA_ALGORITHM {
    return Err(BootstrapError::Manifest(format!(
      "unsupported delta algorithm '{}'",
      manifest.delta.algorithm
    )));
  }

  let dest = runtime_path(manifest, cache_dir)?;
  let io_err = |source: io::Error| BootstrapError::Io {
    path: dest.clone(),
    source,
  };

  if let Ok(existing) = tokio::fs::read(&dest).await {
    if hash_bytes(&existing) == manifest.runtime.sha256 {
      debug!(path = %dest.display(), "using cached runtime");
      make_executable(&dest).map_err(io_err)?;
      return Ok(dest);
    }
    warn!(path = %dest.display(), "cached runtime does not match manifest, rebuilding");
  }

  let original = fetcher.fetch(&manifest.original.url).await?;
  verify("original binary", &original, &manifest.original.sha256)?;

  let runtime = decode_delta(&original, delta).map_err(io_err)?;
  verify("reconstructed runtime", &runtime, &manifest.runtime.sha256)?;

  let (path, bytes) = (dest.clone(), runtime);
  // Launched directly when the manifest names no launcher.
  tokio::task::spawn_blocking(move || write_atomic(&path, &bytes).and_then(|()| make_executable(&path)))
    .await
    .map_err(|e| io_err(io::Error::other(e)))?
    .map_err(io_err)?;

  info!(
    path = %dest.display(),
    version = %manifest.original.version,
    "reconstructed runtime"
  );
  Ok(dest)
}

fn verify(what: &str, data: &[u8], expected: &ContentHash) -> Result<(), BootstrapError> {
  let actual = hash_bytes(data);
  if &actual != expected {
    return Err(BootstrapError::Integrity {
      what: what.to_string(),
      expected: expected.clone(),
      actual,
    });
  }
  Ok(())
}

/// Run the runtime through the manifest's launcher prefix.
pub fn launch(runtime: &Path, launcher: &[String], args: &[String]) -> Result<ExitStatus, BootstrapError> {
  let mut command = match launcher.split_first() {
    Some((program, prefix)) => {
      let mut command = Command::new(program);
      command.args(prefix).arg(runtime);
      command
    }
    None => Command::new(runtime),
  };
  command.args(args);

  info!(runtime = %runtime.display(), "launching runtime");
  command.status().map_err(|source| BootstrapError::Io {
    path: runtime.to_path_buf(),
    source,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::assemble::{AssembleSettings, ModuleOutput, assemble};
  use crate::util::hash::ObjectHash;
  use async_trait::async_trait;
  use std::fs;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tempfile::TempDir;

  struct StaticFetcher {
    bytes: Vec<u8>,
    calls: AtomicUsize,
  }

  impl StaticFetcher {
    fn new(bytes: Vec<u8>) -> Self {
      Self {
        bytes,
        calls: AtomicUsize::new(0),
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl BinaryFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, BootstrapError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(self.bytes.clone())
    }
  }

  struct Fixture {
    temp: TempDir,
    artifact: PathBuf,
    original: Vec<u8>,
    runtime: Vec<u8>,
  }

  fn fixture() -> Fixture {
    let original: Vec<u8> = (0..8192u32).flat_map(|i| i.to_be_bytes()).collect();
    let mut runtime = original.clone();
    runtime.extend_from_slice(b"fork classes");
    fixture_with(original, runtime)
  }

  fn fixture_with(original: Vec<u8>, runtime: Vec<u8>) -> Fixture {
    let temp = TempDir::new().unwrap();

    let compiled = temp.path().join("server-out");
    fs::create_dir_all(&compiled).unwrap();
    fs::write(compiled.join("server.jar"), &runtime).unwrap();
    let original_file = temp.path().join("original.jar");
    fs::write(&original_file, &original).unwrap();

    let settings = AssembleSettings {
      dest: temp.path().join("fork.zip"),
      runtime_module: "Server".to_string(),
      runtime_file: "server.jar".to_string(),
      original_file,
      original_url: "https://example.com/original.jar".to_string(),
      original_version: "1.17.1".to_string(),
      runtime_path: "1.17.1/server.jar".to_string(),
      launcher: Vec::new(),
    };
    let outputs = vec![ModuleOutput {
      name: "Server".to_string(),
      fingerprint: ObjectHash("cccccccccccccccccccc".to_string()),
      compiled_dir: compiled,
    }];
    let artifact = assemble(&outputs, &settings).unwrap().path;

    Fixture {
      temp,
      artifact,
      original,
      runtime,
    }
  }

  #[tokio::test]
  async fn reconstructs_and_caches_runtime() {
    let fx = fixture();
    let cache = fx.temp.path().join("cache");
    let fetcher = StaticFetcher::new(fx.original.clone());

    let path = prepare_runtime(&fx.artifact, &cache, &fetcher).await.unwrap();
    assert_eq!(path, cache.join("runtime/1.17.1/server.jar"));
    assert_eq!(fs::read(&path).unwrap(), fx.runtime);

    let again = prepare_runtime(&fx.artifact, &cache, &fetcher).await.unwrap();
    assert_eq!(again, path);
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn wrong_original_is_integrity_error() {
    let fx = fixture();
    let cache = fx.temp.path().join("cache");
    let fetcher = StaticFetcher::new(b"some other release".to_vec());

    let err = prepare_runtime(&fx.artifact, &cache, &fetcher).await.unwrap_err();

    assert!(matches!(err, BootstrapError::Integrity { ref what, .. } if what == "original binary"));
    assert_eq!(err.exit_code(), exit_code::INTEGRITY);
    assert!(!cache.join("runtime/1.17.1/server.jar").exists());
  }

  #[tokio::test]
  async fn mismatched_reconstruction_is_not_cached() {
    let fx = fixture();
    let cache = fx.temp.path().join("cache");
    let (mut manifest, delta) = read_bootstrap(&fx.artifact).unwrap();
    manifest.runtime.sha256 = hash_bytes(b"not the runtime");
    let fetcher = StaticFetcher::new(fx.original.clone());

    let err = reconstruct(&manifest, &delta, &cache, &fetcher).await.unwrap_err();

    assert!(matches!(err, BootstrapError::Integrity { ref what, .. } if what == "reconstructed runtime"));
    assert!(!runtime_path(&manifest, &cache).unwrap().exists());
  }

  #[tokio::test]
  async fn tampered_cache_is_rebuilt() {
    let fx = fixture();
    let cache = fx.temp.path().join("cache");
    let fetcher = StaticFetcher::new(fx.original.clone());
    let path = prepare_runtime(&fx.artifact, &cache, &fetcher).await.unwrap();

    fs::write(&path, b"tampered").unwrap();
    prepare_runtime(&fx.artifact, &cache, &fetcher).await.unwrap();

    assert_eq!(fs::read(&path).unwrap(), fx.runtime);
    assert_eq!(fetcher.calls(), 2);
  }

  #[test]
  fn escaping_runtime_path_is_rejected() {
    let fx = fixture();
    let mut manifest = read_manifest(&fx.artifact).unwrap();
    manifest.runtime.path = "../../etc/passwd".to_string();

    let err = runtime_path(&manifest, fx.temp.path()).unwrap_err();
    assert!(matches!(err, BootstrapError::Manifest(_)));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn runtime_runs_without_launcher() {
    let original = b"#!/bin/sh\necho vanilla\n".repeat(32);
    let runtime = b"#!/bin/sh\ntest \"$1\" = nogui || exit 3\nexit 7\n".to_vec();
    let fx = fixture_with(original.clone(), runtime);
    let cache = fx.temp.path().join("cache");

    let path = prepare_runtime(&fx.artifact, &cache, &StaticFetcher::new(original))
      .await
      .unwrap();
    let status = launch(&path, &[], &["nogui".to_string()]).unwrap();

    assert_eq!(status.code(), Some(7));
  }

  #[cfg(unix)]
  #[test]
  fn launch_passes_arguments() {
    let temp = TempDir::new().unwrap();
    let script = temp.path().join("run.sh");
    fs::write(&script, "test \"$1\" = nogui\n").unwrap();

    let launcher = vec!["/bin/sh".to_string()];
    let ok = launch(&script, &launcher, &["nogui".to_string()]).unwrap();
    let failed = launch(&script, &launcher, &["gui".to_string()]).unwrap();

    assert!(ok.success());
    assert!(!failed.success());
  }
}
