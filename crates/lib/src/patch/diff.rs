//! Unified diff generation and application for single files.

use super::types::{ApplyError, FileChecksum, Patch, PatchOp};

const NULL_LABEL: &str = "/dev/null";

fn as_text<'a>(path: &str, content: Option<&'a [u8]>) -> Result<&'a str, ApplyError> {
  match content {
    Some(bytes) => std::str::from_utf8(bytes).map_err(|_| ApplyError::Binary { path: path.to_string() }),
    None => Ok(""),
  }
}

/// Build a patch turning `before` into `after` for `target`.
///
/// Returns `None` when both states are identical. The patch's ordinal is 0;
/// callers renumber when placing it in a stack.
pub fn make_patch(
  name: &str,
  target: &str,
  before: Option<&[u8]>,
  after: Option<&[u8]>,
) -> Result<Option<Patch>, ApplyError> {
  if before == after {
    return Ok(None);
  }

  let op = match (before, after) {
    (None, _) => PatchOp::Create,
    (Some(_), None) => PatchOp::Delete,
    (Some(_), Some(_)) => PatchOp::Modify,
  };

  let old_text = as_text(target, before)?;
  let new_text = as_text(target, after)?;

  let old_label = if op == PatchOp::Create {
    NULL_LABEL.to_string()
  } else {
    format!("a/{}", target)
  };
  let new_label = if op == PatchOp::Delete {
    NULL_LABEL.to_string()
  } else {
    format!("b/{}", target)
  };

  // diffy labels its output "original"/"modified"; swap in git-style labels.
  let raw = diffy::create_patch(old_text, new_text).to_string();
  let hunks = raw.splitn(3, '\n').nth(2).unwrap_or("");
  let diff = format!("--- {}\n+++ {}\n{}", old_label, new_label, hunks);

  Ok(Some(Patch {
    name: name.to_string(),
    ordinal: 0,
    target: target.to_string(),
    base: FileChecksum::of(before),
    op,
    diff,
    header: None,
  }))
}

/// Run a patch's hunks against `current`, without checking its base checksum.
///
/// Returns the new content, or `None` when the patch deletes the file. Hunks are
/// located by context, so small offsets in `current` are tolerated.
pub(crate) fn transform(current: Option<&[u8]>, patch: &Patch) -> Result<Option<Vec<u8>>, ApplyError> {
  if patch.op == PatchOp::Delete {
    return Ok(None);
  }

  let text = as_text(&patch.target, current)?;
  let parsed = diffy::Patch::from_str(&patch.diff).map_err(|e| ApplyError::Malformed {
    ordinal: patch.ordinal,
    path: patch.target.clone(),
    message: e.to_string(),
  })?;
  let output = diffy::apply(text, &parsed).map_err(|e| ApplyError::Rejected {
    ordinal: patch.ordinal,
    path: patch.target.clone(),
    message: e.to_string(),
  })?;

  Ok(Some(output.into_bytes()))
}

/// Whether every hunk's post-image already appears in `current`.
///
/// Used when hunks fail to apply, to tell a change that landed upstream apart
/// from a real conflict.
pub(crate) fn already_applied(current: Option<&[u8]>, patch: &Patch) -> bool {
  let Some(text) = current.and_then(|c| std::str::from_utf8(c).ok()) else {
    return false;
  };
  let Ok(parsed) = diffy::Patch::from_str(&patch.diff) else {
    return false;
  };

  let hunks = parsed.hunks();
  !hunks.is_empty()
    && hunks.iter().all(|hunk| {
      let post: String = hunk
        .lines()
        .iter()
        .filter_map(|line| match line {
          diffy::Line::Context(s) | diffy::Line::Insert(s) => Some(*s),
          diffy::Line::Delete(_) => None,
        })
        .collect();
      !post.is_empty() && text.contains(&post)
    })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn already_applied_detects_post_image() {
    let patch = make_patch("edit", "a.txt", Some(b"a\nb\nc\nd\n"), Some(b"a\nb\nC\nd\n"))
      .unwrap()
      .unwrap();
    assert!(already_applied(Some(b"top\na\nb\nC\nd\n"), &patch));
    assert!(!already_applied(Some(b"a\nx\ny\nd\n"), &patch));
    assert!(!already_applied(None, &patch));
  }

  #[test]
  fn identical_states_produce_no_patch() {
    assert!(make_patch("noop", "a.txt", Some(b"x"), Some(b"x")).unwrap().is_none());
    assert!(make_patch("noop", "a.txt", None, None).unwrap().is_none());
  }

  #[test]
  fn modify_patch_uses_git_labels() {
    let patch = make_patch("edit", "dir/a.txt", Some(b"one\n"), Some(b"two\n"))
      .unwrap()
      .unwrap();
    assert_eq!(patch.op, PatchOp::Modify);
    assert!(patch.diff.starts_with("--- a/dir/a.txt\n+++ b/dir/a.txt\n@@"));
  }

  #[test]
  fn create_and_delete_use_null_label() {
    let create = make_patch("new", "n.txt", None, Some(b"new\n")).unwrap().unwrap();
    assert_eq!(create.op, PatchOp::Create);
    assert_eq!(create.base, FileChecksum::Absent);
    assert!(create.diff.starts_with("--- /dev/null\n"));

    let delete = make_patch("gone", "n.txt", Some(b"new\n"), None).unwrap().unwrap();
    assert_eq!(delete.op, PatchOp::Delete);
    assert!(delete.diff.contains("+++ /dev/null\n"));
  }

  #[test]
  fn transform_applies_hunks() {
    let patch = make_patch("edit", "a.txt", Some(b"hello"), Some(b"hello world"))
      .unwrap()
      .unwrap();
    let out = transform(Some(b"hello"), &patch).unwrap();
    assert_eq!(out.as_deref(), Some(&b"hello world"[..]));
  }

  #[test]
  fn transform_tolerates_shifted_context() {
    let before = b"a\nb\nc\nd\n";
    let patch = make_patch("edit", "a.txt", Some(before), Some(b"a\nb\nC\nd\n"))
      .unwrap()
      .unwrap();
    let shifted = b"header\na\nb\nc\nd\n";
    let out = transform(Some(shifted), &patch).unwrap().unwrap();
    assert_eq!(out, b"header\na\nb\nC\nd\n");
  }

  #[test]
  fn binary_content_is_rejected() {
    let err = make_patch("bin", "img.png", Some(&[0xff, 0xfe]), Some(b"x")).unwrap_err();
    assert!(matches!(err, ApplyError::Binary { .. }));
  }
}
