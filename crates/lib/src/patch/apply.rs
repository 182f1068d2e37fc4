//! Strict, all-or-nothing stack application.

use tracing::{debug, trace};

use crate::tree::Tree;

use super::diff::transform;
use super::types::{AppliedStack, ApplyError, ConflictError, FileChecksum, Patch, PatchStack};

/// Apply `stack` to a private copy of `base`.
///
/// Every patch's base checksum must match the state of its target at that
/// point in the stack. The first mismatch aborts with a [`ConflictError`]; no
/// partially patched tree is ever returned and `base` is never modified.
pub fn apply(base: &Tree, stack: &PatchStack) -> Result<AppliedStack, ApplyError> {
  let mut tree = base.clone();
  let mut results = Vec::with_capacity(stack.len());

  for (ordinal, patch) in stack.iter().enumerate() {
    results.push(apply_one(&mut tree, ordinal, patch)?);
  }

  debug!(patches = stack.len(), files = tree.len(), "applied patch stack");
  Ok(AppliedStack { tree, results })
}

/// Apply one patch in place, returning the target's resulting checksum.
pub(crate) fn apply_one(tree: &mut Tree, ordinal: usize, patch: &Patch) -> Result<FileChecksum, ApplyError> {
  let current = tree.get(&patch.target);
  let actual = FileChecksum::of(current);

  if actual != patch.base {
    return Err(
      ConflictError {
        ordinal,
        name: patch.name.clone(),
        path: patch.target.clone(),
        expected: patch.base.clone(),
        actual,
      }
      .into(),
    );
  }

  trace!(ordinal, target = %patch.target, "applying patch");

  match transform(current, patch)? {
    Some(content) => {
      let checksum = FileChecksum::of(Some(&content));
      tree.insert(patch.target.clone(), content);
      Ok(checksum)
    }
    None => {
      tree.remove(&patch.target);
      Ok(FileChecksum::Absent)
    }
  }
}
