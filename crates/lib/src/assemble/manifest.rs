use serde::{Deserialize, Serialize};

use crate::util::hash::ContentHash;

/// Bootstrap manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Zip entry holding the manifest.
pub const MANIFEST_ENTRY: &str = "META-INF/patchstack/bootstrap.json";

/// Zip entry holding the runtime delta.
pub const DELTA_ENTRY: &str = "META-INF/patchstack/runtime.delta";

/// Prefix of per-module compiled output entries.
pub const MODULES_PREFIX: &str = "modules/";

/// Everything the launcher needs to rebuild the runtime on first run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapManifest {
  pub version: u32,
  pub original: OriginalBinary,
  pub delta: DeltaInfo,
  pub runtime: RuntimeInfo,
  /// Command prefix used to start the runtime, e.g. `["java", "-jar"]`.
  /// Empty means the runtime is executed directly.
  #[serde(default)]
  pub launcher: Vec<String>,
  pub modules: Vec<ModuleEntry>,
}

/// The upstream binary that may not be redistributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginalBinary {
  pub version: String,
  pub url: String,
  pub sha256: ContentHash,
  pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaInfo {
  pub entry: String,
  pub algorithm: String,
}

/// The reconstructed binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
  pub sha256: ContentHash,
  pub size: u64,
  /// Placement below the runtime cache directory.
  pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleEntry {
  pub name: String,
  pub fingerprint: String,
  pub files: usize,
}
