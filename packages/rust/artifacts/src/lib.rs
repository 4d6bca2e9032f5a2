//! Default render and vault collaborators for DocVault.
//!
//! - [`OutlineRenderer`] turns a Python module into a single Markdown note.
//! - [`FsVault`] stores each unit's notes in its own vault directory and
//!   replaces them atomically.

mod outline;
mod vault;

pub use outline::{Outline, OutlineRenderer, Symbol};
pub use vault::FsVault;
