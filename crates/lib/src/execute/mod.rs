//! Pipeline execution.
//!
//! A [`Pipeline`] owns the per-run context: the validated module graph, the
//! snapshot store, the rebuild cache and the toolchain. Its operations are
//! what the CLI exposes:
//!
//! - `sync`: resolve the upstream reference, rebase every stack, rewrite the lock
//! - `rebuild`: apply and compile every module wave by wave, then assemble
//! - `apply`: write every module's working tree to its output directory
//! - `rederive`: turn edits in the output directories back into patches
//! - `status`, `gc`, `evict`: inspection and cache maintenance

mod types;

pub use types::*;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::assemble::{AssembleSettings, ModuleOutput, assemble};
use crate::cache::{Fingerprint, RebuildCache, fingerprint};
use crate::config::Config;
use crate::consts::WORKTREE_IGNORED;
use crate::gc::{GcStats, collect_garbage};
use crate::graph::{Module, ModuleGraph};
use crate::patch::{self, RebaseOutcome, derive, read_stack, rebase, write_stack};
use crate::snapshot::{SnapshotSource, SnapshotStore, UpstreamLock, VersionToken};
use crate::cache_lock::{CacheLock, LockMode};
use crate::toolchain::{self, CompileJob, Toolchain};
use crate::tree::{self, Tree};
use crate::util::hash::ContentHash;

const WORK_DIR: &str = "work";

async fn blocking<T, F>(f: F) -> Result<T, PipelineError>
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| PipelineError::Join(e.to_string()))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
  move |source| PipelineError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Context for one invocation. Nothing in it is global; tests build as many as
/// they like.
pub struct Pipeline {
  config: Config,
  graph: Arc<ModuleGraph>,
  cache_dir: PathBuf,
  snapshots: Arc<SnapshotStore>,
  cache: Arc<RebuildCache>,
  toolchain: Arc<dyn Toolchain>,
  parallelism: usize,
}

impl Pipeline {
  /// Pipeline using the snapshot source and toolchain named by `config`.
  pub fn new(config: Config, cache_dir: PathBuf) -> Result<Self, PipelineError> {
    let source = config.snapshot_source(&cache_dir);
    let toolchain = toolchain::from_config(&config.toolchain);
    Self::with_parts(config, cache_dir, source, toolchain)
  }

  pub fn with_parts(
    config: Config,
    cache_dir: PathBuf,
    source: Arc<dyn SnapshotSource>,
    toolchain: Arc<dyn Toolchain>,
  ) -> Result<Self, PipelineError> {
    let graph = ModuleGraph::new(config.modules())?;
    debug!(modules = graph.len(), cache = %cache_dir.display(), "pipeline ready");
    Ok(Self {
      parallelism: config.toolchain.parallelism.max(1),
      graph: Arc::new(graph),
      snapshots: Arc::new(SnapshotStore::new(&cache_dir, source)),
      cache: Arc::new(RebuildCache::new(&cache_dir)),
      cache_dir,
      toolchain,
      config,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn graph(&self) -> &ModuleGraph {
    &self.graph
  }

  pub fn cache_dir(&self) -> &Path {
    &self.cache_dir
  }

  pub fn snapshots(&self) -> &SnapshotStore {
    &self.snapshots
  }

  pub fn cache(&self) -> &RebuildCache {
    &self.cache
  }

  fn lock(&self, mode: LockMode, command: &str) -> Result<CacheLock, PipelineError> {
    Ok(CacheLock::acquire(&self.cache_dir, mode, command, &self.config.root)?)
  }

  /// Token and tree hash from the lock file, or a fresh resolution when
  /// nothing has been synced yet.
  async fn pinned(&self) -> Result<(VersionToken, Option<ContentHash>), PipelineError> {
    if let Some(lock) = UpstreamLock::load(&self.config.lock_path())? {
      debug!(token = %lock.token, "using locked upstream");
      return Ok((lock.token, Some(lock.tree_hash)));
    }
    let reference = self.config.upstream_reference()?;
    warn!(%reference, "no lock file, resolving upstream reference");
    Ok((self.snapshots.resolve(&reference).await?, None))
  }

  /// Pull the current upstream and move every patch stack onto it.
  ///
  /// All stacks must rebase before anything is written, so a conflict leaves
  /// patch files and the lock untouched.
  pub async fn sync(&self) -> Result<SyncReport, PipelineError> {
    let _lock = self.lock(LockMode::Exclusive, "sync")?;

    let reference = self.config.upstream_reference()?;
    let token = self.snapshots.resolve(&reference).await?;
    let snapshot = self.snapshots.retrieve(&token, None).await?;
    info!(%reference, %token, "resolved upstream");

    let lock_path = self.config.lock_path();
    let lock_changed = !UpstreamLock::load(&lock_path)?.is_some_and(|l| l.pins(&token, &snapshot.tree_hash));

    let graph = self.graph.clone();
    let base = snapshot.clone();
    let outcomes = blocking(move || rebase_all(&graph, &base.tree)).await??;

    let mut modules = Vec::with_capacity(outcomes.len());
    for (module, outcome) in outcomes {
      if !outcome.is_unchanged() {
        write_stack(&module.patches, &outcome.stack)?;
        info!(
          module = %module.name,
          refreshed = outcome.refreshed.len(),
          dropped = outcome.dropped.len(),
          "rewrote patch stack"
        );
      }
      modules.push(ModuleSync {
        module: module.name,
        patches: outcome.stack.len(),
        refreshed: outcome.refreshed,
        dropped: outcome.dropped,
      });
    }

    UpstreamLock::new(&reference, token.clone(), snapshot.tree_hash.clone()).save(&lock_path)?;

    Ok(SyncReport {
      reference,
      token,
      tree_hash: snapshot.tree_hash.clone(),
      lock_changed,
      modules,
    })
  }

  /// Apply and compile every module without assembling.
  ///
  /// Module failures are collected in the report rather than returned, so
  /// independent modules still finish.
  pub async fn build(&self) -> Result<BuildReport, PipelineError> {
    let _lock = self.lock(LockMode::Exclusive, "build")?;
    let (token, expected) = self.pinned().await?;
    self.build_modules(&token, expected.as_ref()).await
  }

  /// Build every module, then assemble the artifact when one is configured.
  pub async fn rebuild(&self) -> Result<RebuildReport, PipelineError> {
    let _lock = self.lock(LockMode::Exclusive, "rebuild")?;
    let (token, expected) = self.pinned().await?;
    let modules = self.build_modules(&token, expected.as_ref()).await?.into_result()?;

    let artifact = match AssembleSettings::from_config(&self.config) {
      Some(settings) => {
        let outputs: Vec<ModuleOutput> = modules
          .iter()
          .map(|b| ModuleOutput {
            name: b.name.clone(),
            fingerprint: b.fingerprint.clone(),
            compiled_dir: b.compiled_dir.clone(),
          })
          .collect();
        Some(blocking(move || assemble(&outputs, &settings)).await??)
      }
      None => {
        debug!("no artifact configured, skipping assembly");
        None
      }
    };

    Ok(RebuildReport {
      token,
      modules,
      artifact,
    })
  }

  async fn build_modules(
    &self,
    token: &VersionToken,
    expected: Option<&ContentHash>,
  ) -> Result<BuildReport, PipelineError> {
    let snapshot = self.snapshots.retrieve(token, expected).await?;
    let root_tree = Arc::new(snapshot.tree.clone());
    let waves = self.graph.waves();
    info!(modules = self.graph.len(), waves = waves.len(), %token, "starting build");

    let mut report = BuildReport {
      token: Some(token.clone()),
      ..Default::default()
    };
    let mut done: HashMap<String, ModuleBuild> = HashMap::new();
    let mut failed: HashSet<String> = HashSet::new();
    let semaphore = Arc::new(Semaphore::new(self.parallelism));
    let work_dir = self.cache_dir.join(WORK_DIR);

    for (wave_idx, wave) in waves.into_iter().enumerate() {
      debug!(wave = wave_idx, modules = wave.len(), "executing wave");
      let mut join_set = JoinSet::new();

      for name in wave {
        let Some(module) = self.graph.get(&name).cloned() else {
          continue;
        };

        if let Some(up) = &module.upstream
          && failed.contains(up)
        {
          warn!(module = %name, upstream = %up, "skipping module due to failed upstream");
          report.skipped.push((name.clone(), up.clone()));
          failed.insert(name);
          continue;
        }

        let upstream = module.upstream.as_ref().and_then(|u| done.get(u));
        let task = ModuleTask {
          base: upstream.map_or_else(|| root_tree.clone(), |u| u.tree.clone()),
          upstream: upstream.map(|u| (u.fingerprint.clone(), u.compiled_dir.clone())),
          token: token.clone(),
          cache: self.cache.clone(),
          toolchain: self.toolchain.clone(),
          work_dir: work_dir.clone(),
          module,
        };
        let semaphore = semaphore.clone();

        join_set.spawn(async move {
          let name = task.module.name.clone();
          let result = match semaphore.acquire_owned().await {
            Ok(_permit) => task.run().await,
            Err(e) => Err(PipelineError::Join(e.to_string())),
          };
          (name, result)
        });
      }

      while let Some(joined) = join_set.join_next().await {
        match joined {
          Ok((name, Ok(build))) => {
            info!(module = %name, fingerprint = %build.fingerprint, cached = build.cached, "module built");
            done.insert(name, build.clone());
            report.built.push(build);
          }
          Ok((name, Err(e))) => {
            error!(module = %name, error = %e, "module failed");
            failed.insert(name.clone());
            report.failed.push((name, e));
          }
          Err(e) => {
            error!(error = %e, "module task panicked");
            return Err(PipelineError::Join(e.to_string()));
          }
        }
      }
    }

    info!(
      built = report.built.len(),
      failed = report.failed.len(),
      skipped = report.skipped.len(),
      "build complete"
    );
    Ok(report)
  }

  /// Write every module's working tree to its output directory.
  ///
  /// Files the tree no longer contains are removed; ignored entries such as a
  /// `.git` directory are left alone.
  pub async fn apply(&self) -> Result<Vec<ModuleTree>, PipelineError> {
    let _lock = self.lock(LockMode::Exclusive, "apply")?;
    let (token, expected) = self.pinned().await?;
    let snapshot = self.snapshots.retrieve(&token, expected.as_ref()).await?;

    let graph = self.graph.clone();
    blocking(move || -> Result<Vec<ModuleTree>, PipelineError> {
      let mut trees: HashMap<String, Tree> = HashMap::new();
      let mut out = Vec::new();
      for module in graph.resolve_order() {
        let base = base_tree(module, &snapshot.tree, &trees);
        let stack = read_stack(&module.patches)?;
        let applied = patch::apply(base, &stack).map_err(|e| PipelineError::from_apply(&module.name, e))?;
        mirror_tree(&applied.tree, &module.output)?;
        info!(module = %module.name, output = %module.output.display(), files = applied.tree.len(), "wrote working tree");

        out.push(ModuleTree {
          module: module.name.clone(),
          output: module.output.clone(),
          files: applied.tree.len(),
          patches: stack.len(),
        });
        trees.insert(module.name.clone(), applied.tree);
      }
      Ok(out)
    })
    .await?
  }

  /// Regenerate every module's stack from its output directory.
  pub async fn rederive(&self) -> Result<Vec<ModuleTree>, PipelineError> {
    let _lock = self.lock(LockMode::Exclusive, "rederive")?;
    let (token, expected) = self.pinned().await?;
    let snapshot = self.snapshots.retrieve(&token, expected.as_ref()).await?;

    let graph = self.graph.clone();
    blocking(move || -> Result<Vec<ModuleTree>, PipelineError> {
      let mut trees: HashMap<String, Tree> = HashMap::new();
      let mut out = Vec::new();
      for module in graph.resolve_order() {
        if !module.output.is_dir() {
          return Err(PipelineError::MissingOutput(module.output.clone()));
        }
        let base = base_tree(module, &snapshot.tree, &trees);
        let working = Tree::load(&module.output, WORKTREE_IGNORED)?;
        let previous = read_stack(&module.patches)?;
        let stack = derive(base, &working, &previous).map_err(|e| PipelineError::from_apply(&module.name, e))?;
        write_stack(&module.patches, &stack)?;
        info!(module = %module.name, before = previous.len(), after = stack.len(), "rederived patch stack");

        out.push(ModuleTree {
          module: module.name.clone(),
          output: module.output.clone(),
          files: working.len(),
          patches: stack.len(),
        });
        trees.insert(module.name.clone(), working);
      }
      Ok(out)
    })
    .await?
  }

  /// Current fingerprints per module, computed from the lock and the patch
  /// files alone. Nothing is fetched.
  fn fingerprints(&self, token: &VersionToken) -> Result<Vec<(String, usize, Fingerprint)>, PipelineError> {
    let mut by_name: HashMap<String, Fingerprint> = HashMap::new();
    let mut out = Vec::new();
    for module in self.graph.resolve_order() {
      let stack = read_stack(&module.patches)?;
      let upstream = module.upstream.as_ref().and_then(|u| by_name.get(u));
      let fp = fingerprint(token, &module.name, &stack, upstream, &self.toolchain.identity())?;
      by_name.insert(module.name.clone(), fp.clone());
      out.push((module.name.clone(), stack.len(), fp));
    }
    Ok(out)
  }

  pub async fn status(&self) -> Result<StatusReport, PipelineError> {
    let _lock = self.lock(LockMode::Shared, "status")?;
    let lock = UpstreamLock::load(&self.config.lock_path())?;

    let mut modules = Vec::new();
    match &lock {
      Some(lock) => {
        for (name, patches, fp) in self.fingerprints(&lock.token)? {
          let cache = self.cache.clone();
          let owned = fp.clone();
          let cached = !blocking(move || cache.should_rebuild(&owned)).await?;
          modules.push(ModuleStatus {
            upstream: self.graph.get(&name).and_then(|m| m.upstream.clone()),
            module: name,
            patches,
            fingerprint: Some(fp),
            cached,
          });
        }
      }
      None => {
        for module in self.graph.resolve_order() {
          modules.push(ModuleStatus {
            module: module.name.clone(),
            upstream: module.upstream.clone(),
            patches: read_stack(&module.patches)?.len(),
            fingerprint: None,
            cached: false,
          });
        }
      }
    }

    Ok(StatusReport {
      reference: lock.as_ref().map(|l| l.reference.clone()),
      token: lock.as_ref().map(|l| l.token.clone()),
      tree_hash: lock.map(|l| l.tree_hash),
      modules,
    })
  }

  /// Remove snapshots the lock does not pin and builds no module currently
  /// fingerprints to.
  pub async fn gc(&self, dry_run: bool) -> Result<GcStats, PipelineError> {
    let _lock = self.lock(LockMode::Exclusive, "gc")?;
    let lock = UpstreamLock::load(&self.config.lock_path())?;
    let live: HashSet<Fingerprint> = match &lock {
      Some(lock) => self.fingerprints(&lock.token)?.into_iter().map(|(_, _, fp)| fp).collect(),
      None => HashSet::new(),
    };

    let snapshots = self.snapshots.clone();
    let cache = self.cache.clone();
    let work_dir = self.cache_dir.join(WORK_DIR);
    Ok(blocking(move || collect_garbage(&snapshots, &cache, lock.as_ref(), &live, &work_dir, dry_run)).await??)
  }

  /// Drop one cached snapshot. Returns whether it was present.
  pub async fn evict(&self, token: &VersionToken) -> Result<bool, PipelineError> {
    let _lock = self.lock(LockMode::Exclusive, "evict")?;
    Ok(self.snapshots.evict(token)?)
  }
}

fn base_tree<'a>(module: &Module, root: &'a Tree, trees: &'a HashMap<String, Tree>) -> &'a Tree {
  module.upstream.as_ref().and_then(|u| trees.get(u)).unwrap_or(root)
}

fn rebase_all(graph: &ModuleGraph, root: &Tree) -> Result<Vec<(Module, RebaseOutcome)>, PipelineError> {
  let mut trees: HashMap<String, Tree> = HashMap::new();
  let mut out = Vec::new();
  for module in graph.resolve_order() {
    let base = base_tree(module, root, &trees);
    let stack = read_stack(&module.patches)?;
    let outcome = rebase(base, &stack).map_err(|e| PipelineError::from_apply(&module.name, e))?;
    for name in &outcome.dropped {
      info!(module = %module.name, patch = %name, "patch already upstream, dropping");
    }
    trees.insert(module.name.clone(), outcome.tree.clone());
    out.push((module.clone(), outcome));
  }
  Ok(out)
}

/// Make `dir` hold exactly `tree`, apart from ignored entries.
fn mirror_tree(tree: &Tree, dir: &Path) -> Result<(), PipelineError> {
  if dir.is_dir() {
    let existing = Tree::load(dir, WORKTREE_IGNORED)?;
    for stale in existing.paths().filter(|p| !tree.contains(p)) {
      let path = tree::resolve(dir, stale)?;
      fs::remove_file(&path).map_err(io_err(&path))?;
      debug!(path = %path.display(), "removed stale file");
    }
  }
  tree.write_to(dir)?;
  Ok(())
}

/// Everything one module build needs, owned so it can move into a task.
struct ModuleTask {
  module: Module,
  token: VersionToken,
  base: Arc<Tree>,
  /// Fingerprint and compiled output of the upstream module.
  upstream: Option<(Fingerprint, PathBuf)>,
  cache: Arc<RebuildCache>,
  toolchain: Arc<dyn Toolchain>,
  work_dir: PathBuf,
}

impl ModuleTask {
  async fn run(self) -> Result<ModuleBuild, PipelineError> {
    let name = self.module.name.clone();

    let patches_dir = self.module.patches.clone();
    let stack = blocking(move || read_stack(&patches_dir)).await??;
    let fp = fingerprint(
      &self.token,
      &name,
      &stack,
      self.upstream.as_ref().map(|(fp, _)| fp),
      &self.toolchain.identity(),
    )?;

    // Held until the entry is recorded.
    let _guard = self.cache.lock(&fp).await;

    let cache = self.cache.clone();
    let owned = fp.clone();
    if let Some(hit) = blocking(move || cache.lookup(&owned)).await?? {
      let compiled_dir = hit.compiled_dir.clone();
      let tree = blocking(move || hit.load_tree()).await??;
      debug!(module = %name, fingerprint = %fp, "using cached build");
      return Ok(ModuleBuild {
        name,
        fingerprint: fp,
        tree: Arc::new(tree),
        compiled_dir,
        cached: true,
      });
    }

    let base = self.base.clone();
    let patches = stack.len();
    let applied = blocking(move || patch::apply(&base, &stack))
      .await?
      .map_err(|e| PipelineError::from_apply(&name, e))?;
    debug!(module = %name, patches, files = applied.tree.len(), "applied patch stack");
    let tree = Arc::new(applied.tree);

    fs::create_dir_all(&self.work_dir).map_err(io_err(&self.work_dir))?;
    let scratch = tempfile::Builder::new()
      .prefix(&format!("{}-", fp))
      .tempdir_in(&self.work_dir)
      .map_err(io_err(&self.work_dir))?;
    let source = scratch.path().join("src");
    let written = tree.clone();
    let src = source.clone();
    blocking(move || written.write_to(&src)).await??;

    let job = CompileJob {
      module: name.clone(),
      source,
      out: scratch.path().join("out"),
      dependencies: self.module.dependencies.clone(),
      upstream_out: self.upstream.map(|(_, dir)| dir),
    };
    let compiled = self
      .toolchain
      .compile(&job)
      .await
      .map_err(|e| PipelineError::CompileFailure {
        module: name.clone(),
        diagnostics: e.diagnostics(),
      })?;

    let cache = self.cache.clone();
    let (owned_fp, owned_name, recorded_tree) = (fp.clone(), name.clone(), tree.clone());
    let recorded = blocking(move || cache.record(&owned_fp, &owned_name, &recorded_tree, &compiled)).await??;

    Ok(ModuleBuild {
      name,
      fingerprint: fp,
      tree,
      compiled_dir: recorded.compiled_dir,
      cached: false,
    })
  }
}
