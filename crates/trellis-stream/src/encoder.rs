//! Agent-event to wire-event encoding.

use serde_json::json;
use trellis_protocol_ai_sdk::UIStreamEvent;

use crate::event::AgentEvent;

/// Stateful encoder for one turn's wire stream.
///
/// Tracks open text blocks so the stream always closes what it opened,
/// and injects the inter-step `data-step-thinking` marker: `true` right
/// after a step ends, `false` when the next step starts or the turn
/// finishes. The agent never sees this UI concern.
#[derive(Default)]
pub struct TurnEncoder {
    open_texts: Vec<String>,
    thinking: bool,
}

impl TurnEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one agent event into zero or more wire events.
    pub fn on_event(&mut self, event: &AgentEvent) -> Vec<UIStreamEvent> {
        let mut out = Vec::new();
        match event {
            AgentEvent::StepStart => {
                self.clear_thinking(&mut out);
            }
            AgentEvent::StepEnd => {
                if !self.thinking {
                    self.thinking = true;
                    out.push(UIStreamEvent::step_thinking(true));
                }
            }
            AgentEvent::TextStart { id } => {
                self.open_text(id, &mut out);
            }
            AgentEvent::TextDelta { id, text } => {
                // Tolerate a missing text-start from the agent.
                if !self.open_texts.iter().any(|t| t == id) {
                    self.open_text(id, &mut out);
                }
                out.push(UIStreamEvent::text_delta(id.clone(), text.clone()));
            }
            AgentEvent::TextEnd { id } => {
                self.open_texts.retain(|t| t != id);
                out.push(UIStreamEvent::text_end(id.clone()));
            }
            AgentEvent::ToolCall { id, name, arguments } => {
                out.push(UIStreamEvent::Opaque(json!({
                    "type": "tool-input-available",
                    "toolCallId": id,
                    "toolName": name,
                    "input": arguments,
                })));
            }
            AgentEvent::ToolResult { id, output } => {
                out.push(UIStreamEvent::Opaque(json!({
                    "type": "tool-output-available",
                    "toolCallId": id,
                    "output": output,
                })));
            }
            AgentEvent::UsageReport(_) => {}
            AgentEvent::Finish { .. } => {
                out.extend(self.close());
            }
            AgentEvent::Raw(value) => {
                out.push(UIStreamEvent::Opaque(value.clone()));
            }
        }
        out
    }

    /// Close anything still open (thinking marker, text blocks). Called
    /// on finish, abort and error so the wire never ends mid-block.
    pub fn close(&mut self) -> Vec<UIStreamEvent> {
        let mut out = Vec::new();
        self.clear_thinking(&mut out);
        for id in self.open_texts.drain(..) {
            out.push(UIStreamEvent::text_end(id));
        }
        out
    }

    fn open_text(&mut self, id: &str, out: &mut Vec<UIStreamEvent>) {
        self.open_texts.push(id.to_string());
        out.push(UIStreamEvent::text_start(id.to_string()));
    }

    fn clear_thinking(&mut self, out: &mut Vec<UIStreamEvent>) {
        if self.thinking {
            self.thinking = false;
            out.push(UIStreamEvent::step_thinking(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_protocol_ai_sdk::FinishReason;

    fn kinds(events: &[UIStreamEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| {
                serde_json::to_value(e).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn thinking_marker_brackets_inter_step_gaps() {
        let mut enc = TurnEncoder::new();
        assert!(enc.on_event(&AgentEvent::StepStart).is_empty());

        let after_step = enc.on_event(&AgentEvent::StepEnd);
        assert_eq!(kinds(&after_step), vec!["data-step-thinking"]);

        let next_step = enc.on_event(&AgentEvent::StepStart);
        assert_eq!(kinds(&next_step), vec!["data-step-thinking"]);
        assert_eq!(
            next_step[0],
            UIStreamEvent::step_thinking(false)
        );
    }

    #[test]
    fn thinking_cleared_on_finish() {
        let mut enc = TurnEncoder::new();
        enc.on_event(&AgentEvent::StepEnd);
        let closing = enc.on_event(&AgentEvent::Finish {
            finish_reason: FinishReason::Stop,
            usage: None,
        });
        assert_eq!(closing, vec![UIStreamEvent::step_thinking(false)]);
    }

    #[test]
    fn text_lifecycle_is_paired() {
        let mut enc = TurnEncoder::new();
        let events = enc.on_event(&AgentEvent::TextStart {
            id: "t1".to_string(),
        });
        assert_eq!(events, vec![UIStreamEvent::text_start("t1")]);

        let events = enc.on_event(&AgentEvent::TextDelta {
            id: "t1".to_string(),
            text: "hi".to_string(),
        });
        assert_eq!(events, vec![UIStreamEvent::text_delta("t1", "hi")]);

        let events = enc.on_event(&AgentEvent::TextEnd {
            id: "t1".to_string(),
        });
        assert_eq!(events, vec![UIStreamEvent::text_end("t1")]);
        assert!(enc.close().is_empty());
    }

    #[test]
    fn orphan_delta_gets_an_implicit_start() {
        let mut enc = TurnEncoder::new();
        let events = enc.on_event(&AgentEvent::TextDelta {
            id: "t1".to_string(),
            text: "hi".to_string(),
        });
        assert_eq!(
            events,
            vec![
                UIStreamEvent::text_start("t1"),
                UIStreamEvent::text_delta("t1", "hi")
            ]
        );
    }

    #[test]
    fn close_ends_open_blocks() {
        let mut enc = TurnEncoder::new();
        enc.on_event(&AgentEvent::TextStart {
            id: "t1".to_string(),
        });
        enc.on_event(&AgentEvent::StepEnd);
        let closing = enc.close();
        assert_eq!(
            closing,
            vec![
                UIStreamEvent::step_thinking(false),
                UIStreamEvent::text_end("t1")
            ]
        );
        assert!(enc.close().is_empty());
    }

    #[test]
    fn tool_events_pass_through_with_wire_names() {
        let mut enc = TurnEncoder::new();
        let events = enc.on_event(&AgentEvent::ToolCall {
            id: "c1".to_string(),
            name: "search".to_string(),
            arguments: serde_json::json!({"q": "x"}),
        });
        let v = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(v["type"], "tool-input-available");
        assert_eq!(v["toolName"], "search");
    }
}
