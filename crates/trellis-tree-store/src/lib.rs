//! Message-tree persistence.
//!
//! Each chat session is a tree of messages. A node's position is a
//! materialized path of fixed-width sibling indexes (`01`, `01/02`, ...),
//! so branch order, ancestry and the rightmost leaf all fall out of plain
//! lexicographic string comparison.
//!
//! `save_message` is the one write entry point and follows the same
//! algorithm in every adapter:
//!
//! 1. validate ids, drop transient parts, sanitize metadata;
//! 2. empty non-user content without `allow_empty` is skipped outright;
//! 3. an existing id in the same session is a replay: user nodes are
//!    returned unchanged, other roles merge (parts replaced when
//!    non-empty, usage and elapsed-time metadata summed, the rest
//!    last-wins);
//! 4. otherwise a new node is inserted under its parent at the next
//!    sibling index, capped at 99 children per parent.
//!
//! Adapters: [`MemoryStore`] for tests and local runs, [`SqliteStore`]
//! for single-node deployments, and a Postgres adapter behind the
//! `postgres` feature.

pub mod contract;
pub mod memory_store;
pub mod path;

#[cfg(feature = "postgres")]
pub mod postgres_store;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use contract::{
    MessageRef, SaveMessage, SaveOutcome, StoredMessage, TreeReader, TreeStore, TreeStoreError,
    TreeWriter,
};
pub use memory_store::MemoryStore;
pub use path::{child_path, sibling_index, MAX_SIBLINGS, SEGMENT_WIDTH};

#[cfg(feature = "postgres")]
pub use postgres_store::PostgresStore;
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteStore;
