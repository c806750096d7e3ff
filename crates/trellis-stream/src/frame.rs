//! Request-scoped agent identity frames.
//!
//! Each in-flight turn tracks which logical agent is currently producing
//! output. The stack is owned by the request (created per call, shared
//! only between that request's completion paths), so concurrent requests
//! can never observe each other's frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

/// Identity of the agent producing a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFrame {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub model: String,
}

impl AgentFrame {
    /// Metadata extras recorded on the persisted node for audit/display.
    pub fn metadata_extras(&self) -> Vec<(String, Value)> {
        vec![
            ("agentId".to_string(), json!(self.id)),
            ("agentName".to_string(), json!(self.name)),
            ("agentKind".to_string(), json!(self.kind)),
            ("model".to_string(), json!(self.model)),
        ]
    }
}

/// Stack of active agent frames for one request.
#[derive(Default)]
pub struct AgentFrameStack {
    frames: Mutex<Vec<AgentFrame>>,
}

impl AgentFrameStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(self: &Arc<Self>, frame: AgentFrame) -> FramePopGuard {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(frame);
        }
        FramePopGuard {
            stack: Arc::clone(self),
            released: AtomicBool::new(false),
        }
    }

    /// The frame currently producing output.
    pub fn current(&self) -> Option<AgentFrame> {
        self.frames.lock().ok().and_then(|f| f.last().cloned())
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    fn pop(&self) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.pop();
        }
    }
}

/// One-shot release for a pushed frame.
///
/// The normal-finish and error paths of a turn may both try to pop; the
/// guard makes the second (and any later) release a no-op so the stack
/// never underflows into a sibling frame.
pub struct FramePopGuard {
    stack: Arc<AgentFrameStack>,
    released: AtomicBool,
}

impl FramePopGuard {
    /// Pop the frame. Subsequent calls do nothing.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.stack.pop();
        }
    }
}

impl Drop for FramePopGuard {
    fn drop(&mut self) {
        self.release();
    }
}
