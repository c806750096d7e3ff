//! Chain reconstruction.
//!
//! The tree stores every branch ever taken; a model call needs one
//! linear conversation. [`ChainLoader`] walks parent links from a leaf
//! back to its root, applies history compaction and the context window,
//! and [`project_for_model`] turns the surviving nodes into model input,
//! accounting for every part it has to drop.

mod loader;
mod projection;

pub use loader::{ChainError, ChainLoader, ChainOptions};
pub use projection::{
    project_for_model, AttachmentResolver, DroppedPart, ModelContent, ModelMessage, NoopResolver,
    ResolvedFile,
};
