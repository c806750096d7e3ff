//! AI SDK UI message stream protocol.
//!
//! Wire-level event vocabulary and SSE framing for streaming a turn to
//! a UI client. Events serialize to the AI SDK's tagged JSON shapes
//! (`{"type": "text-delta", ...}`); unknown upstream events pass through
//! the [`UIStreamEvent::Opaque`] variant untouched.

mod events;
mod sse;

pub use events::{FinishReason, StepThinkingData, TextSnippetData, UIStreamEvent};
pub use sse::{error_turn_events, sse_frame, DONE_FRAME, HEADER_STREAM_VERSION, STREAM_VERSION};
