//! The patch stack engine.
//!
//! A module's fork is expressed as an ordered [`PatchStack`] of single-file
//! patches. [`apply`] replays a stack strictly onto an upstream tree,
//! [`derive`] turns an edited working tree back into a stack, and [`rebase`]
//! moves a stack onto a new upstream snapshot.

mod apply;
mod derive;
mod diff;
mod format;
mod rebase;
mod types;

pub use apply::apply;
pub use derive::derive;
pub use diff::make_patch;
pub use format::{PatchFileError, file_name, parse, read_stack, to_file_string, write_stack};
pub use rebase::{RebaseOutcome, rebase};
pub use types::*;
