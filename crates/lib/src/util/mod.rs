//! Shared utilities.
//!
//! Hashing plus the atomic-write helpers used by every on-disk store.

pub mod fs;
pub mod hash;
