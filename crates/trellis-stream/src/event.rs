//! Events produced by an agent run.

use serde_json::Value;
use trellis_chat::Usage;
use trellis_protocol_ai_sdk::FinishReason;

/// One event from the agent's output stream.
///
/// The orchestrator consumes these to build the persisted assistant node
/// and to drive the wire protocol; the agent knows nothing about either.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A model/tool step begins.
    StepStart,
    /// The current step ended; another step or the finish follows.
    StepEnd,

    TextStart { id: String },
    TextDelta { id: String, text: String },
    TextEnd { id: String },

    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        id: String,
        output: Value,
    },

    /// Usage reported by one inference flush; may arrive several times
    /// per turn and is accumulated field-wise.
    UsageReport(Usage),

    /// The agent is done.
    Finish {
        finish_reason: FinishReason,
        usage: Option<Usage>,
    },

    /// Provider-specific wire event, passed through to the client
    /// unchanged and never persisted.
    Raw(Value),
}
