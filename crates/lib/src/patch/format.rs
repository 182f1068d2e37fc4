//! On-disk patch files.
//!
//! A module's stack is a directory of `NNNN-<slug>.patch` files. Sorted file
//! name order defines the ordinal; the numeric prefix only keeps that order
//! stable for humans and tools.
//!
//! # File Format
//!
//! ```text
//! From: patchstack
//! Subject: [PATCH] Add greeting
//! Target: Foo.txt
//! Base: sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
//! ---
//! --- a/Foo.txt
//! +++ b/Foo.txt
//! @@ -1 +1 @@
//! -hello
//! \ No newline at end of file
//! +hello world
//! \ No newline at end of file
//! ```
//!
//! `Base: absent` marks a file creation. Deletions carry `Operation: delete`.
//! `Operation: create` and `Operation: modify` are accepted when they agree
//! with `Base`. Files written elsewhere may use another `From` or add headers
//! of their own; their header block is kept and written back unchanged.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::consts::APP_NAME;
use crate::util::fs::write_atomic;

use super::types::{FileChecksum, Patch, PatchOp, PatchStack};

const PATCH_EXT: &str = "patch";
const SUBJECT_PREFIX: &str = "[PATCH] ";

#[derive(Debug, Error)]
pub enum PatchFileError {
  #[error("failed to read patch directory '{path}': {source}")]
  ReadDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid patch file '{file}': {message}")]
  Parse { file: String, message: String },
}

fn canonical_header(patch: &Patch) -> String {
  let mut out = String::new();
  out.push_str(&format!("From: {}\n", APP_NAME));
  out.push_str(&format!("Subject: {}{}\n", SUBJECT_PREFIX, patch.name));
  out.push_str(&format!("Target: {}\n", patch.target));
  out.push_str(&format!("Base: {}\n", patch.base));
  if patch.op == PatchOp::Delete {
    out.push_str("Operation: delete\n");
  }
  out
}

/// Serialize a patch to its file representation.
pub fn to_file_string(patch: &Patch) -> String {
  let header = match &patch.header {
    Some(header) => header.clone(),
    None => canonical_header(patch),
  };
  format!("{}---\n{}", header, patch.diff)
}

/// Parse one patch file. `file` is used for error messages only.
pub fn parse(file: &str, text: &str, ordinal: usize) -> Result<Patch, PatchFileError> {
  let parse_err = |message: &str| PatchFileError::Parse {
    file: file.to_string(),
    message: message.to_string(),
  };

  let (header, diff) = if let Some(rest) = text.strip_prefix("---\n") {
    ("", rest)
  } else {
    text.split_once("\n---\n").ok_or_else(|| parse_err("missing '---' header separator"))?
  };

  let mut name = None;
  let mut target = None;
  let mut base = None;
  let mut declared = None;

  for line in header.lines() {
    let Some((key, value)) = line.split_once(": ") else {
      return Err(parse_err(&format!("malformed header line '{}'", line)));
    };
    match key {
      "From" => {}
      "Subject" => name = Some(value.strip_prefix(SUBJECT_PREFIX).unwrap_or(value).to_string()),
      "Target" => target = Some(value.to_string()),
      "Base" => {
        base = Some(FileChecksum::parse(value).ok_or_else(|| parse_err(&format!("invalid base '{}'", value)))?);
      }
      "Operation" => {
        declared = Some(match value {
          "create" => PatchOp::Create,
          "modify" => PatchOp::Modify,
          "delete" => PatchOp::Delete,
          other => return Err(parse_err(&format!("unknown operation '{}'", other))),
        })
      }
      other => debug!(file, header = other, "keeping unknown patch header"),
    }
  }

  let name = name.ok_or_else(|| parse_err("missing Subject header"))?;
  let target = target.ok_or_else(|| parse_err("missing Target header"))?;
  let base = base.ok_or_else(|| parse_err("missing Base header"))?;

  let op = match (&base, declared) {
    (FileChecksum::Absent, Some(PatchOp::Delete)) => {
      return Err(parse_err("cannot delete a file expected to be absent"));
    }
    (FileChecksum::Absent, Some(PatchOp::Modify)) => return Err(parse_err("cannot modify a file expected to be absent")),
    (FileChecksum::Sha256(_), Some(PatchOp::Create)) => {
      return Err(parse_err("cannot create a file expected to exist"));
    }
    (_, Some(op)) => op,
    (FileChecksum::Absent, None) => PatchOp::Create,
    (FileChecksum::Sha256(_), None) => PatchOp::Modify,
  };

  let mut patch = Patch {
    name,
    ordinal,
    target,
    base,
    op,
    diff: diff.to_string(),
    header: None,
  };
  let raw = if header.is_empty() { String::new() } else { format!("{}\n", header) };
  if raw != canonical_header(&patch) {
    patch.header = Some(raw);
  }
  Ok(patch)
}

/// File name for a patch: `NNNN-<slug>.patch`.
pub fn file_name(patch: &Patch) -> String {
  format!("{:04}-{}.{}", patch.ordinal + 1, slug(&patch.name), PATCH_EXT)
}

fn slug(name: &str) -> String {
  let mut out = String::with_capacity(name.len());
  let mut last_dash = true;
  for c in name.chars() {
    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
      out.push(c);
      last_dash = false;
    } else if !last_dash {
      out.push('-');
      last_dash = true;
    }
  }
  let trimmed = out.trim_end_matches('-');
  if trimmed.is_empty() {
    "patch".to_string()
  } else {
    trimmed.chars().take(64).collect()
  }
}

fn patch_files(dir: &Path) -> Result<Vec<PathBuf>, PatchFileError> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => {
      return Err(PatchFileError::ReadDir {
        path: dir.to_path_buf(),
        source: e,
      });
    }
  };

  let mut files = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|e| PatchFileError::ReadDir {
      path: dir.to_path_buf(),
      source: e,
    })?;
    let path = entry.path();
    if path.is_file() && path.extension().is_some_and(|ext| ext == PATCH_EXT) {
      files.push(path);
    }
  }
  files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
  Ok(files)
}

/// Read a module's stack. A missing directory is an empty stack.
pub fn read_stack(dir: &Path) -> Result<PatchStack, PatchFileError> {
  let mut patches = Vec::new();
  for (ordinal, path) in patch_files(dir)?.into_iter().enumerate() {
    let text = fs::read_to_string(&path).map_err(|e| PatchFileError::Read {
      path: path.clone(),
      source: e,
    })?;
    let file = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    patches.push(parse(&file, &text, ordinal)?);
  }
  debug!(dir = %dir.display(), count = patches.len(), "read patch stack");
  Ok(PatchStack::new(patches))
}

/// Write a stack, replacing every `.patch` file in `dir`.
///
/// New files are written first; stale files are removed afterwards so an
/// interrupted write never loses a patch.
pub fn write_stack(dir: &Path, stack: &PatchStack) -> Result<Vec<PathBuf>, PatchFileError> {
  let existing = patch_files(dir)?;
  let mut written = Vec::with_capacity(stack.len());

  for patch in stack {
    let path = dir.join(file_name(patch));
    let content = to_file_string(patch);
    if fs::read_to_string(&path).ok().as_deref() != Some(content.as_str()) {
      write_atomic(&path, content.as_bytes()).map_err(|e| PatchFileError::Write {
        path: path.clone(),
        source: e,
      })?;
    }
    written.push(path);
  }

  for stale in existing.into_iter().filter(|p| !written.contains(p)) {
    fs::remove_file(&stale).map_err(|e| PatchFileError::Write {
      path: stale.clone(),
      source: e,
    })?;
  }

  Ok(written)
}
