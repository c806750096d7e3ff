//! Message metadata and the pure merge functions applied when one node
//! is written multiple times (flush events during a stream, resumed
//! continuation writes).
//!
//! Numeric accumulation (token usage, elapsed time) sums; everything
//! else is last-write-wins. Serialization of concurrent merges to the
//! same node is the store transaction's job, not this module's.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata keys that may never be stored: they shadow columns owned by
/// the tree store and would desynchronize on merge.
pub const FORBIDDEN_META_KEYS: [&str; 4] = ["id", "sessionId", "parentMessageId", "path"];

/// Token usage for one or more inference flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
}

impl Usage {
    /// Returns `true` when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

/// Wall-clock timing for a node, cumulative across execution passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    /// Total elapsed milliseconds. Summed on merge, never overwritten,
    /// so a node resumed after reconnect reports cumulative wall time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Other timing keys (timestamps etc.), last-write-wins.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Timing {
    /// Returns `true` when no field is set.
    pub fn is_empty(&self) -> bool {
        self.elapsed_ms.is_none() && self.extra.is_empty()
    }
}

/// Metadata attached to a message node.
///
/// `usage` and `timing` get numeric accumulation; every other key lives
/// in the flattened `extra` map and merges shallowly (next wins).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMetadata {
    /// Returns `true` when nothing is set.
    pub fn is_empty(&self) -> bool {
        self.usage.is_none() && self.timing.is_none() && self.extra.is_empty()
    }

    /// Strip keys the store forbids (`id`, `sessionId`, ...).
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        for key in FORBIDDEN_META_KEYS {
            self.extra.remove(key);
        }
        self
    }

    /// Set an extra key.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Set usage.
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

fn sum_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
    }
}

/// Field-wise sum of two usage records.
///
/// Fields present in neither input stay absent; a field present in one
/// input passes through. Summing is associative, so flush order does not
/// matter.
pub fn merge_usage(prev: Option<&Usage>, next: Option<&Usage>) -> Option<Usage> {
    match (prev, next) {
        (None, None) => None,
        (Some(u), None) | (None, Some(u)) => Some(*u),
        (Some(a), Some(b)) => Some(Usage {
            input_tokens: sum_opt(a.input_tokens, b.input_tokens),
            output_tokens: sum_opt(a.output_tokens, b.output_tokens),
            total_tokens: sum_opt(a.total_tokens, b.total_tokens),
            reasoning_tokens: sum_opt(a.reasoning_tokens, b.reasoning_tokens),
            cached_input_tokens: sum_opt(a.cached_input_tokens, b.cached_input_tokens),
        }),
    }
}

/// Shallow-merge timing, summing the elapsed-duration field.
pub fn merge_timing(prev: Option<&Timing>, next: Option<&Timing>) -> Option<Timing> {
    match (prev, next) {
        (None, None) => None,
        (Some(t), None) | (None, Some(t)) => Some(t.clone()),
        (Some(a), Some(b)) => {
            let mut extra = a.extra.clone();
            for (k, v) in &b.extra {
                extra.insert(k.clone(), v.clone());
            }
            Some(Timing {
                elapsed_ms: sum_opt(a.elapsed_ms, b.elapsed_ms),
                extra,
            })
        }
    }
}

/// Merge metadata for a node updated across multiple writes.
///
/// Non-numeric keys are last-write-wins; `usage`/`timing` accumulate.
/// Sub-keys whose merge produces nothing are dropped entirely.
pub fn merge_metadata(
    prev: Option<&MessageMetadata>,
    next: Option<&MessageMetadata>,
) -> Option<MessageMetadata> {
    match (prev, next) {
        (None, None) => None,
        (Some(m), None) | (None, Some(m)) => Some(m.clone()),
        (Some(a), Some(b)) => {
            let mut extra = a.extra.clone();
            for (k, v) in &b.extra {
                extra.insert(k.clone(), v.clone());
            }
            let usage = merge_usage(a.usage.as_ref(), b.usage.as_ref()).filter(|u| !u.is_empty());
            let timing =
                merge_timing(a.timing.as_ref(), b.timing.as_ref()).filter(|t| !t.is_empty());
            Some(MessageMetadata {
                usage,
                timing,
                extra,
            })
        }
    }
}
