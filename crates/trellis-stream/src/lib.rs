//! Streaming turn orchestration.
//!
//! Sits between the message tree and the wire protocol: takes a user
//! message, rebuilds the model context through `trellis-chain`, drives
//! an [`AgentRunner`], and guarantees that what the client saw and what
//! the tree stores stay consistent across normal finishes, cooperative
//! aborts and upstream failures.

mod encoder;
mod event;
mod frame;
mod orchestrator;
mod traits;

pub use encoder::TurnEncoder;
pub use event::AgentEvent;
pub use frame::{AgentFrame, AgentFrameStack, FramePopGuard};
pub use orchestrator::{ImageTurn, ImageTurnRequest, TurnOrchestrator, TurnRequest};
pub use traits::{
    AgentEventStream, AgentRunner, AgentTurnInput, GeneratedFile, GeneratedImages, ImageGenerator,
    NoopPreface, PrefaceEnsurer, StreamError,
};
