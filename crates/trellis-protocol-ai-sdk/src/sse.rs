//! SSE framing.

use crate::events::{FinishReason, UIStreamEvent};

/// Protocol version header sent on every stream response.
pub const HEADER_STREAM_VERSION: &str = "x-vercel-ai-ui-message-stream";
pub const STREAM_VERSION: &str = "v1";

/// Stream terminator frame.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Encode one event as an SSE data frame.
pub fn sse_frame(event: &UIStreamEvent) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// A complete minimal turn that delivers an error to the client.
///
/// Used when a turn fails before (or instead of) producing any content:
/// the client still receives a well-formed start/finish pair, with the
/// error text as the turn's visible body.
pub fn error_turn_events(
    message_id: impl Into<String>,
    text_id: impl Into<String>,
    error_text: &str,
) -> Vec<UIStreamEvent> {
    let text_id = text_id.into();
    vec![
        UIStreamEvent::start(message_id),
        UIStreamEvent::text_start(text_id.clone()),
        UIStreamEvent::text_delta(text_id.clone(), error_text),
        UIStreamEvent::text_end(text_id),
        UIStreamEvent::finish(FinishReason::Error),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_newline_terminated_data_lines() {
        let frame = sse_frame(&UIStreamEvent::start("m1")).unwrap();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(!frame[..frame.len() - 2].contains('\n'));
    }

    #[test]
    fn error_turn_is_well_formed() {
        let events = error_turn_events("m1", "t1", "upstream failed");
        assert!(matches!(events.first(), Some(UIStreamEvent::Start { .. })));
        assert!(matches!(
            events.last(),
            Some(UIStreamEvent::Finish {
                finish_reason: FinishReason::Error,
                ..
            })
        ));
        let text: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                UIStreamEvent::TextDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, vec!["upstream failed"]);
    }
}
