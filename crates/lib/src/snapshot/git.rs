//! Git upstreams.
//!
//! The upstream repository is mirrored at `{cache}/git/<name>/` with its
//! `.git` directory intact so later syncs fetch incrementally. Snapshots are
//! exported from commit objects, never from the checked-out worktree.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use gix::remote::Direction;
use tracing::{debug, info};

use crate::tree::Tree;

use super::source::SnapshotSource;
use super::types::{SourceError, VersionToken};

const TOKEN_PREFIX: &str = "git+";

/// A remote git repository used as the upstream.
#[derive(Debug)]
pub struct GitSource {
  url: String,
  mirror: PathBuf,
  // gix repositories are not shared across threads; serialize mirror access.
  guard: Mutex<()>,
}

impl GitSource {
  /// `mirror` is the local clone directory, created on first use.
  pub fn new(url: impl Into<String>, mirror: impl Into<PathBuf>) -> Self {
    Self {
      url: url.into(),
      mirror: mirror.into(),
      guard: Mutex::new(()),
    }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  fn git_err(&self, e: impl std::error::Error + Send + Sync + 'static) -> SourceError {
    SourceError::Git {
      url: self.url.clone(),
      source: Box::new(e),
    }
  }

  /// Open the mirror, cloning it first if needed. Fetches when `update` is set.
  fn open(&self, update: bool) -> Result<gix::Repository, SourceError> {
    if self.mirror.join(".git").exists() {
      debug!(path = %self.mirror.display(), "opening upstream mirror");
      let repo = gix::open(&self.mirror).map_err(|e| self.git_err(e))?;
      if update {
        self.fetch_updates(&repo)?;
      }
      return Ok(repo);
    }

    if let Some(parent) = self.mirror.parent() {
      fs::create_dir_all(parent).map_err(|e| self.git_err(e))?;
    }
    info!(url = %self.url, path = %self.mirror.display(), "cloning upstream");
    clone_repo(&self.url, &self.mirror).map_err(|e| SourceError::Git {
      url: self.url.clone(),
      source: e,
    })
  }

  fn fetch_updates(&self, repo: &gix::Repository) -> Result<(), SourceError> {
    debug!(url = %self.url, "fetching upstream updates");

    let remote = repo
      .find_default_remote(Direction::Fetch)
      .ok_or_else(|| SourceError::Resolve {
        reference: self.url.clone(),
        message: "mirror has no remote".to_string(),
      })?
      .map_err(|e| self.git_err(e))?;

    remote
      .connect(Direction::Fetch)
      .map_err(|e| self.git_err(e))?
      .prepare_fetch(gix::progress::Discard, Default::default())
      .map_err(|e| self.git_err(e))?
      .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
      .map_err(|e| self.git_err(e))?;

    Ok(())
  }
}

fn clone_repo(url: &str, dest: &Path) -> Result<gix::Repository, Box<dyn std::error::Error + Send + Sync>> {
  let mut prepared = gix::prepare_clone(url, dest)?;
  let (mut checkout, _outcome) = prepared.fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)?;
  let (repo, _outcome) = checkout.main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)?;
  Ok(repo)
}

/// Resolve `rev` to a commit id, preferring the freshly fetched remote branch.
fn resolve_commit(repo: &gix::Repository, rev: &str) -> Option<gix::ObjectId> {
  let candidates = [format!("origin/{}", rev), rev.to_string()];
  candidates.iter().find_map(|spec| {
    let id = repo.rev_parse_single(spec.as_str()).ok()?;
    let commit = id.object().ok()?.peel_to_commit().ok()?;
    Some(commit.id)
  })
}

/// Read every blob reachable from `commit`'s tree.
fn export_tree(repo: &gix::Repository, commit: gix::ObjectId) -> Result<Tree, Box<dyn std::error::Error + Send + Sync>> {
  let tree = repo.find_commit(commit)?.tree()?;
  let mut recorder = gix::traverse::tree::Recorder::default();
  tree.traverse().breadthfirst(&mut recorder)?;

  let mut out = Tree::new();
  for entry in recorder.records {
    if !entry.mode.is_blob() {
      continue;
    }
    let blob = repo.find_object(entry.oid)?;
    out.insert(entry.filepath.to_string(), blob.data.clone());
  }
  Ok(out)
}

impl SnapshotSource for GitSource {
  fn resolve(&self, reference: &str) -> Result<VersionToken, SourceError> {
    let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
    let repo = self.open(true)?;
    let commit = resolve_commit(&repo, reference).ok_or_else(|| SourceError::Resolve {
      reference: reference.to_string(),
      message: "revision not found".to_string(),
    })?;
    let token = VersionToken::new(format!("{}{}#{}", TOKEN_PREFIX, self.url, commit));
    info!(reference, %token, "resolved upstream revision");
    Ok(token)
  }

  fn fetch(&self, token: &VersionToken) -> Result<Tree, SourceError> {
    let foreign = || SourceError::ForeignToken(token.to_string());
    let rest = token.as_str().strip_prefix(TOKEN_PREFIX).ok_or_else(foreign)?;
    let (url, pin) = rest.rsplit_once('#').ok_or_else(foreign)?;
    if url != self.url {
      return Err(foreign());
    }
    let commit = gix::ObjectId::from_hex(pin.as_bytes()).map_err(|e| self.git_err(e))?;

    let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
    let mut repo = self.open(false)?;
    if repo.find_object(commit).is_err() {
      // Pinned by another machine; the commit may postdate our mirror.
      self.fetch_updates(&repo)?;
      repo = gix::open(&self.mirror).map_err(|e| self.git_err(e))?;
    }

    let tree = export_tree(&repo, commit).map_err(|e| SourceError::Git {
      url: self.url.clone(),
      source: e,
    })?;
    debug!(%token, files = tree.len(), "exported upstream tree");
    Ok(tree)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fetch_rejects_tokens_for_other_sources() {
    let source = GitSource::new("https://example.com/upstream.git", "/nonexistent/mirror");

    let dir_token = VersionToken::new("dir:/srv/upstream#abc");
    assert!(matches!(source.fetch(&dir_token), Err(SourceError::ForeignToken(_))));

    let other_repo = VersionToken::new("git+https://example.com/other.git#0123");
    assert!(matches!(source.fetch(&other_repo), Err(SourceError::ForeignToken(_))));
  }

  #[test]
  fn fetch_rejects_malformed_commit() {
    let source = GitSource::new("https://example.com/upstream.git", "/nonexistent/mirror");
    let token = VersionToken::new("git+https://example.com/upstream.git#not-a-commit");
    assert!(matches!(source.fetch(&token), Err(SourceError::Git { .. })));
  }

  // Clone and fetch need network access and are exercised by integration runs.
}
