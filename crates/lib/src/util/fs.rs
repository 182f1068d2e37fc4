//! Atomic filesystem helpers.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Write `content` to `path` via a sibling temp file and a rename.
///
/// Readers observe either the previous file or the complete new one.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
  fs::create_dir_all(parent)?;

  let file_name = path
    .file_name()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
  let temp_path = parent.join(format!(".{}.tmp-{}", file_name.to_string_lossy(), std::process::id()));

  fs::write(&temp_path, content)?;
  if let Err(e) = fs::rename(&temp_path, path) {
    let _ = fs::remove_file(&temp_path);
    return Err(e);
  }
  Ok(())
}

/// Let the owner, group and others execute `path` (mode 0o755). Does nothing
/// where there are no permission bits.
pub fn make_executable(path: &Path) -> io::Result<()> {
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
  }
  #[cfg(not(unix))]
  let _ = path;
  Ok(())
}

/// Move a fully populated staging directory to `dest`.
///
/// An existing `dest` is removed first. Both paths must be on the same filesystem.
pub fn replace_dir(staging: &Path, dest: &Path) -> io::Result<()> {
  if dest.exists() {
    fs::remove_dir_all(dest)?;
  }
  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent)?;
  }
  fs::rename(staging, dest)
}

/// Recursively copy the regular files of `src` into `dst`.
///
/// Symlinks are copied as the files they point to.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
  fs::create_dir_all(dst)?;
  for entry in WalkDir::new(src).follow_links(true) {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    let target = dst.join(rel);
    if entry.file_type().is_dir() {
      fs::create_dir_all(&target)?;
    } else if entry.file_type().is_file() {
      fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}
