//! Turning an edited working tree back into a patch stack.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use crate::tree::Tree;

use super::apply::apply_one;
use super::diff::make_patch;
use super::types::{ApplyError, Patch, PatchStack};

/// Derive a new stack from `base` and an edited `working` tree.
///
/// `previous` must apply cleanly to `base`. For each file whose working content
/// differs from what `previous` produces:
/// - if patches already target it, the last of them is regenerated in place
///   from its own pre-image (or dropped when the edit reverts it);
/// - otherwise a new patch is appended to the end of the stack.
///
/// Patches for unchanged files are kept as-is and the relative order of all
/// retained patches is preserved.
pub fn derive(base: &Tree, working: &Tree, previous: &PatchStack) -> Result<PatchStack, ApplyError> {
  let mut replay = base.clone();
  let mut pre_images: Vec<Option<Vec<u8>>> = Vec::with_capacity(previous.len());
  let mut last_for: HashMap<&str, usize> = HashMap::new();

  for (ordinal, patch) in previous.iter().enumerate() {
    pre_images.push(replay.get(&patch.target).map(<[u8]>::to_vec));
    apply_one(&mut replay, ordinal, patch)?;
    last_for.insert(patch.target.as_str(), ordinal);
  }

  let mut slots: Vec<Option<Patch>> = previous.iter().cloned().map(Some).collect();
  let mut appended = Vec::new();
  let mut regenerated = 0usize;

  let paths: BTreeSet<&str> = replay.paths().chain(working.paths()).collect();
  for path in paths {
    let want = working.get(path);
    let have = replay.get(path);
    if want == have {
      continue;
    }

    match last_for.get(path) {
      Some(&slot) => {
        let name = slots[slot].as_ref().map(|p| p.name.clone()).unwrap_or_default();
        slots[slot] = make_patch(&name, path, pre_images[slot].as_deref(), want)?;
        regenerated += 1;
        debug!(path, ordinal = slot, "regenerated patch");
      }
      None => {
        if let Some(patch) = make_patch(&default_name(path, have, want), path, have, want)? {
          debug!(path, "appending new patch");
          appended.push(patch);
        }
      }
    }
  }

  let stack = PatchStack::renumbered(slots.into_iter().flatten().chain(appended.iter().cloned()));
  info!(
    previous = previous.len(),
    regenerated,
    appended = appended.len(),
    total = stack.len(),
    "derived patch stack"
  );
  Ok(stack)
}

fn default_name(path: &str, before: Option<&[u8]>, after: Option<&[u8]>) -> String {
  let verb = match (before, after) {
    (None, _) => "Add",
    (Some(_), None) => "Remove",
    _ => "Update",
  };
  format!("{} {}", verb, path)
}
