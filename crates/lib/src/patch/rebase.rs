//! Moving a stack onto a new upstream snapshot.

use tracing::{debug, info, warn};

use crate::tree::Tree;

use super::apply::apply_one;
use super::diff::{already_applied, make_patch, transform};
use super::types::{ApplyError, ConflictError, FileChecksum, PatchOp, PatchStack};

/// Result of a successful rebase.
#[derive(Debug, Clone)]
pub struct RebaseOutcome {
  pub stack: PatchStack,
  pub tree: Tree,
  /// Ordinals (in the new stack) of patches rewritten against the new base.
  pub refreshed: Vec<usize>,
  /// Names of patches whose change is already present upstream.
  pub dropped: Vec<String>,
}

impl RebaseOutcome {
  pub fn is_unchanged(&self) -> bool {
    self.refreshed.is_empty() && self.dropped.is_empty()
  }
}

/// Replay `stack` on a new `base`, tolerating drift that the hunks absorb.
///
/// A patch whose base checksum still matches applies exactly as in
/// [`super::apply`]. On a mismatch the hunks are tried by context; if they
/// apply, the patch is regenerated against the file's new content. If the
/// result equals the file as it already is, the patch is dropped. Anything
/// else is a [`ConflictError`].
pub fn rebase(base: &Tree, stack: &PatchStack) -> Result<RebaseOutcome, ApplyError> {
  let mut tree = base.clone();
  let mut kept = Vec::with_capacity(stack.len());
  let mut refreshed = Vec::new();
  let mut dropped = Vec::new();

  for (ordinal, patch) in stack.iter().enumerate() {
    let current = tree.get(&patch.target).map(<[u8]>::to_vec);
    let actual = FileChecksum::of(current.as_deref());

    if actual == patch.base {
      apply_one(&mut tree, ordinal, patch)?;
      kept.push(patch.clone());
      continue;
    }

    let conflict = || ConflictError {
      ordinal,
      name: patch.name.clone(),
      path: patch.target.clone(),
      expected: patch.base.clone(),
      actual: actual.clone(),
    };

    // Only content drift is absorbed; a file appearing or vanishing is not.
    let drift_ok = match patch.op {
      PatchOp::Create => false,
      PatchOp::Modify | PatchOp::Delete => current.is_some(),
    };
    if !drift_ok {
      return Err(conflict().into());
    }

    let result = match transform(current.as_deref(), patch) {
      Ok(result) => result,
      Err(ApplyError::Rejected { message, .. }) => {
        if already_applied(current.as_deref(), patch) {
          warn!(name = %patch.name, target = %patch.target, "patch already applied upstream, dropping");
          dropped.push(patch.name.clone());
          continue;
        }
        debug!(ordinal, target = %patch.target, %message, "hunks no longer apply");
        return Err(conflict().into());
      }
      Err(e) => return Err(e),
    };

    match make_patch(&patch.name, &patch.target, current.as_deref(), result.as_deref())? {
      Some(fresh) => {
        refreshed.push(kept.len());
        apply_one(&mut tree, kept.len(), &fresh)?;
        kept.push(fresh);
      }
      None => {
        debug!(name = %patch.name, target = %patch.target, "patch is a no-op on the new base, dropping");
        dropped.push(patch.name.clone());
      }
    }
  }

  let stack = PatchStack::renumbered(kept);
  info!(
    patches = stack.len(),
    refreshed = refreshed.len(),
    dropped = dropped.len(),
    "rebased patch stack"
  );
  Ok(RebaseOutcome {
    stack,
    tree,
    refreshed,
    dropped,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::patch::apply::apply;

  fn old_base() -> Tree {
    let mut tree = Tree::new();
    tree.insert("World.java", "a\nb\nc\nd\n");
    tree.insert("Util.java", "util\n");
    tree
  }

  fn stack() -> PatchStack {
    let p = make_patch("Fix world", "World.java", Some(b"a\nb\nc\nd\n"), Some(b"a\nb\nC\nd\n"))
      .unwrap()
      .unwrap();
    PatchStack::renumbered(vec![p])
  }

  #[test]
  fn unchanged_upstream_keeps_stack() {
    let outcome = rebase(&old_base(), &stack()).unwrap();
    assert!(outcome.is_unchanged());
    assert_eq!(outcome.stack, stack());
    assert_eq!(outcome.tree, apply(&old_base(), &stack()).unwrap().tree);
  }

  #[test]
  fn drift_outside_hunks_refreshes_patch() {
    let mut new_base = old_base();
    new_base.insert("World.java", "// header\na\nb\nc\nd\n");

    assert!(apply(&new_base, &stack()).is_err());
    let outcome = rebase(&new_base, &stack()).unwrap();

    assert_eq!(outcome.refreshed, vec![0]);
    assert_eq!(outcome.tree.get("World.java"), Some(&b"// header\na\nb\nC\nd\n"[..]));
    // The refreshed stack applies strictly to the new base.
    assert_eq!(apply(&new_base, &outcome.stack).unwrap().tree, outcome.tree);
  }

  #[test]
  fn change_already_upstream_is_dropped() {
    let mut new_base = old_base();
    new_base.insert("World.java", "a\nb\nC\nd\n");

    let outcome = rebase(&new_base, &stack()).unwrap();

    assert!(outcome.stack.is_empty());
    assert_eq!(outcome.dropped, vec!["Fix world".to_string()]);
    assert_eq!(outcome.tree, new_base);
  }

  #[test]
  fn delete_of_drifted_file_is_refreshed() {
    let delete = make_patch("Drop util", "Util.java", Some(b"util\n"), None).unwrap().unwrap();
    let mut drifted = old_base();
    drifted.insert("Util.java", "util v2\n");
    let outcome = rebase(&drifted, &PatchStack::renumbered(vec![delete])).unwrap();
    assert_eq!(outcome.refreshed, vec![0]);
    assert!(!outcome.tree.contains("Util.java"));
  }

  #[test]
  fn rewritten_hunk_region_is_conflict() {
    let mut new_base = old_base();
    new_base.insert("World.java", "a\nx\ny\nd\n");

    let err = rebase(&new_base, &stack()).unwrap_err();
    let conflict = err.as_conflict().unwrap();
    assert_eq!(conflict.ordinal, 0);
    assert_eq!(conflict.path, "World.java");
    assert_eq!(conflict.actual, FileChecksum::of(Some(b"a\nx\ny\nd\n")));
  }

  #[test]
  fn upstream_created_file_conflicts_with_creation_patch() {
    let create = make_patch("Add notes", "NOTES.md", None, Some(b"notes\n")).unwrap().unwrap();
    let mut new_base = old_base();
    new_base.insert("NOTES.md", "upstream notes\n");

    let err = rebase(&new_base, &PatchStack::renumbered(vec![create])).unwrap_err();
    assert_eq!(err.as_conflict().unwrap().expected, FileChecksum::Absent);
  }
}
