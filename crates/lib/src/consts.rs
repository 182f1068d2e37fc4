//! Names and sizes shared across the crate.

pub const APP_NAME: &str = "patchstack";

/// Length of truncated object hashes (fingerprints, snapshot keys).
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Project configuration file looked up in the working directory.
pub const CONFIG_FILENAME: &str = "patchstack.toml";

/// Upstream lock file, stored next to the configuration file.
pub const LOCK_FILENAME: &str = "patchstack.lock";

/// Marker written last into a rebuild cache entry.
pub const BUILD_COMPLETE_MARKER: &str = ".patchstack-complete";

/// Environment variable overriding the cache root.
pub const CACHE_ENV: &str = "PATCHSTACK_CACHE";

/// Directory entries never treated as part of a source tree.
pub const WORKTREE_IGNORED: &[&str] = &[".git", ".gradle", "build", "target"];
