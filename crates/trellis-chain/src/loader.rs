//! Leaf-to-root chain walking.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use trellis_chat::MessagePart;
use trellis_tree_store::{StoredMessage, TreeReader, TreeStoreError};

/// Chain reconstruction errors.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The requested leaf does not exist in the session.
    #[error("chain not found: {0}")]
    ChainNotFound(String),

    /// A parent link points at a missing node or back into the chain.
    #[error("corrupted tree: {0}")]
    Corrupted(String),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] TreeStoreError),
}

/// How to select and bound the chain.
#[derive(Debug, Clone, Default)]
pub struct ChainOptions {
    /// Walk up from this node. `None` starts at the rightmost leaf.
    pub leaf_id: Option<String>,
    /// Keep at most this many messages, dropping the oldest first.
    pub max_messages: Option<usize>,
}

impl ChainOptions {
    /// Start from an explicit leaf.
    #[must_use]
    pub fn from_leaf(leaf_id: impl Into<String>) -> Self {
        Self {
            leaf_id: Some(leaf_id.into()),
            max_messages: None,
        }
    }

    /// Bound the window.
    #[must_use]
    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }
}

/// Reconstructs one linear conversation out of the message tree.
pub struct ChainLoader {
    reader: Arc<dyn TreeReader>,
}

impl ChainLoader {
    pub fn new(reader: Arc<dyn TreeReader>) -> Self {
        Self { reader }
    }

    /// Load the chain ending at the selected leaf, oldest first.
    ///
    /// After the walk, the most recent compaction marker (if any) splices
    /// out everything before itself, then `max_messages` trims the front.
    /// A chain that resolves to zero nodes is `ChainNotFound`, whether the
    /// named leaf is missing or the session has no messages at all.
    pub async fn load(
        &self,
        session_id: &str,
        options: &ChainOptions,
    ) -> Result<Vec<StoredMessage>, ChainError> {
        let leaf_id = match &options.leaf_id {
            Some(id) => id.clone(),
            None => match self.reader.resolve_rightmost_leaf(session_id).await? {
                Some(id) => id,
                None => {
                    return Err(ChainError::ChainNotFound(format!(
                        "session {session_id} has no messages"
                    )))
                }
            },
        };

        let mut chain = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor = Some(leaf_id.clone());
        while let Some(id) = cursor {
            if !seen.insert(id.clone()) {
                return Err(ChainError::Corrupted(format!(
                    "parent cycle through message {id}"
                )));
            }
            let node = match self.reader.get_message(session_id, &id).await? {
                Some(node) => node,
                None if chain.is_empty() => {
                    return Err(ChainError::ChainNotFound(format!(
                        "message {leaf_id} not found in session {session_id}"
                    )))
                }
                None => {
                    return Err(ChainError::Corrupted(format!(
                        "dangling parent link to {id}"
                    )))
                }
            };
            cursor = node.parent_message_id.clone();
            chain.push(node);
        }
        chain.reverse();

        let chain = splice_at_compaction(chain);

        if let Some(max) = options.max_messages {
            if chain.len() > max {
                let start = chain.len() - max;
                tracing::debug!(
                    session_id,
                    dropped = start,
                    kept = max,
                    "chain truncated to context window"
                );
                return Ok(chain[start..].to_vec());
            }
        }
        Ok(chain)
    }
}

/// Cut everything before the most recent compaction marker.
///
/// The marker itself stays: its summary text stands in for the history
/// it replaced.
fn splice_at_compaction(chain: Vec<StoredMessage>) -> Vec<StoredMessage> {
    let marker_pos = chain.iter().rposition(|m| {
        m.message
            .parts
            .iter()
            .any(|p| matches!(p, MessagePart::Compaction { .. }))
    });
    match marker_pos {
        Some(pos) if pos > 0 => chain[pos..].to_vec(),
        _ => chain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_chat::ChatMessage;
    use trellis_tree_store::{MemoryStore, SaveMessage, TreeWriter};

    async fn seed_linear(store: &MemoryStore, session: &str, texts: &[(&str, &str)]) {
        let mut parent: Option<String> = None;
        for (id, text) in texts {
            let mut save = SaveMessage::new(session, ChatMessage::user(*text).with_id(*id));
            if let Some(p) = &parent {
                save = save.with_parent(p.clone());
            }
            store.save_message(save).await.unwrap();
            parent = Some(id.to_string());
        }
    }

    #[tokio::test]
    async fn walks_leaf_to_root_and_returns_oldest_first() {
        let store = MemoryStore::new();
        seed_linear(&store, "s1", &[("m1", "one"), ("m2", "two"), ("m3", "three")]).await;

        let loader = ChainLoader::new(Arc::new(store));
        let chain = loader
            .load("s1", &ChainOptions::from_leaf("m3"))
            .await
            .unwrap();
        let ids: Vec<&str> = chain.iter().map(|m| m.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn defaults_to_rightmost_leaf() {
        let store = MemoryStore::new();
        seed_linear(&store, "s1", &[("m1", "one"), ("m2", "two")]).await;
        // A sibling branch after m1 becomes the rightmost branch.
        store
            .save_message(
                SaveMessage::new("s1", ChatMessage::user("fork").with_id("m2b"))
                    .with_parent("m1"),
            )
            .await
            .unwrap();

        let loader = ChainLoader::new(Arc::new(store));
        let chain = loader.load("s1", &ChainOptions::default()).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|m| m.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2b"]);
    }

    #[tokio::test]
    async fn empty_session_is_chain_not_found() {
        let loader = ChainLoader::new(Arc::new(MemoryStore::new()));
        let err = loader
            .load("s1", &ChainOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::ChainNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_leaf_is_chain_not_found() {
        let store = MemoryStore::new();
        seed_linear(&store, "s1", &[("m1", "one")]).await;

        let loader = ChainLoader::new(Arc::new(store));
        let err = loader
            .load("s1", &ChainOptions::from_leaf("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::ChainNotFound(_)));
    }

    #[tokio::test]
    async fn window_drops_oldest_messages() {
        let store = MemoryStore::new();
        seed_linear(
            &store,
            "s1",
            &[("m1", "one"), ("m2", "two"), ("m3", "three"), ("m4", "four")],
        )
        .await;

        let loader = ChainLoader::new(Arc::new(store));
        let chain = loader
            .load("s1", &ChainOptions::default().with_max_messages(2))
            .await
            .unwrap();
        let ids: Vec<&str> = chain.iter().map(|m| m.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn compaction_marker_hides_prior_history() {
        let store = MemoryStore::new();
        seed_linear(&store, "s1", &[("a", "one"), ("b", "two")]).await;
        store
            .save_message(
                SaveMessage::new(
                    "s1",
                    ChatMessage {
                        id: "marker".to_string(),
                        role: trellis_chat::Role::User,
                        parts: vec![MessagePart::compaction("summary of a and b")],
                        metadata: None,
                    },
                )
                .with_parent("b"),
            )
            .await
            .unwrap();
        store
            .save_message(
                SaveMessage::new("s1", ChatMessage::user("three").with_id("c"))
                    .with_parent("marker"),
            )
            .await
            .unwrap();

        let loader = ChainLoader::new(Arc::new(store));
        let chain = loader.load("s1", &ChainOptions::default()).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|m| m.message.id.as_str()).collect();
        assert_eq!(ids, vec!["marker", "c"]);
    }

    #[tokio::test]
    async fn window_applies_after_compaction_splice() {
        let store = MemoryStore::new();
        seed_linear(&store, "s1", &[("a", "one")]).await;
        store
            .save_message(
                SaveMessage::new(
                    "s1",
                    ChatMessage {
                        id: "marker".to_string(),
                        role: trellis_chat::Role::User,
                        parts: vec![MessagePart::compaction("summary")],
                        metadata: None,
                    },
                )
                .with_parent("a"),
            )
            .await
            .unwrap();
        for (id, parent, text) in [("b", "marker", "two"), ("c", "b", "three")] {
            store
                .save_message(
                    SaveMessage::new("s1", ChatMessage::user(text).with_id(id)).with_parent(parent),
                )
                .await
                .unwrap();
        }

        let loader = ChainLoader::new(Arc::new(store));
        let chain = loader
            .load("s1", &ChainOptions::default().with_max_messages(2))
            .await
            .unwrap();
        let ids: Vec<&str> = chain.iter().map(|m| m.message.id.as_str()).collect();
        // Splice leaves [marker, b, c]; the window then keeps the newest 2.
        assert_eq!(ids, vec!["b", "c"]);
    }
}
