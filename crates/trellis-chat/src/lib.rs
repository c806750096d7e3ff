//! Conversation-tree domain model.
//!
//! A conversation is a tree of messages: users can edit, retry or branch
//! from any prior turn, so linear transcripts are a projection, never the
//! source of truth. This crate owns the message/part/metadata shapes and
//! the pure metadata accumulator used when one node is written multiple
//! times during a streamed turn.

pub mod message;
pub mod metadata;
pub mod session;

pub use message::{gen_message_id, ChatMessage, MessagePart, Role};
pub use metadata::{
    merge_metadata, merge_timing, merge_usage, MessageMetadata, Timing, Usage, FORBIDDEN_META_KEYS,
};
pub use session::{derive_title, Session, TITLE_MAX_CHARS};
