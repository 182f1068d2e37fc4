//! Retrieval of the original binary.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use super::BootstrapError;

#[async_trait]
pub trait BinaryFetcher: Send + Sync {
  /// Download the bytes behind `url`. Verification is up to the caller.
  async fn fetch(&self, url: &str) -> Result<Vec<u8>, BootstrapError>;
}

/// Fetches over HTTP(S) with reqwest; `file://` URLs and bare paths are read
/// from disk.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Self {
    Self::default()
  }
}

fn local_path(url: &str) -> Option<PathBuf> {
  if let Some(path) = url.strip_prefix("file://") {
    return Some(PathBuf::from(path));
  }
  if url.contains("://") {
    return None;
  }
  Some(PathBuf::from(url))
}

#[async_trait]
impl BinaryFetcher for HttpFetcher {
  async fn fetch(&self, url: &str) -> Result<Vec<u8>, BootstrapError> {
    let failed = |message: String| BootstrapError::Fetch {
      url: url.to_string(),
      message,
    };

    if let Some(path) = local_path(url) {
      debug!(path = %path.display(), "reading original binary from disk");
      return tokio::fs::read(&path).await.map_err(|e| failed(e.to_string()));
    }

    info!(url = %url, "fetching original binary");
    let response = self.client.get(url).send().await.map_err(|e| failed(e.to_string()))?;
    if !response.status().is_success() {
      return Err(failed(format!("HTTP {}", response.status())));
    }
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    info!(url = %url, size = bytes.len(), "download complete");
    Ok(bytes.to_vec())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn local_path_forms() {
    assert_eq!(local_path("file:///tmp/a.jar"), Some(PathBuf::from("/tmp/a.jar")));
    assert_eq!(local_path("/tmp/a.jar"), Some(PathBuf::from("/tmp/a.jar")));
    assert_eq!(local_path("https://example.com/a.jar"), None);
  }

  #[tokio::test]
  async fn reads_file_urls() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("original.jar");
    std::fs::write(&path, b"original").unwrap();

    let bytes = HttpFetcher::new()
      .fetch(&format!("file://{}", path.display()))
      .await
      .unwrap();
    assert_eq!(bytes, b"original");
  }

  #[tokio::test]
  async fn missing_file_is_fetch_error() {
    let err = HttpFetcher::new().fetch("file:///nonexistent/original.jar").await.unwrap_err();
    assert!(matches!(err, BootstrapError::Fetch { .. }));
  }
}
