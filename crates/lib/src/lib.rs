//! patchstack-lib: patch-stack rebasing and bootstrap packaging
//!
//! A downstream fork is described as ordered patch stacks over an upstream
//! snapshot. This crate provides:
//! - `snapshot`: immutable, content-verified upstream trees keyed by version token
//! - `patch`: applying, deriving and rebasing patch stacks
//! - `graph`: the module dependency graph and its build order
//! - `cache`: fingerprint-addressed memoization of module builds
//! - `assemble` / `bootstrap`: the distributable artifact and its first-run launcher
//! - `execute`: the pipeline tying them together

pub mod assemble;
pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod consts;
pub mod execute;
pub mod gc;
pub mod graph;
pub mod patch;
pub mod platform;
pub mod snapshot;
pub mod cache_lock;
pub mod toolchain;
pub mod tree;
pub mod util;
