use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{RunId, ThreadId, ToolCallId};

/// Events emitted on a run's output stream. Strict ordering contract:
///
/// RunStarted → (TextDelta | ToolCallDispatch | StateDelta)* → (RunFinished | RunError)
///
/// A ToolCallDispatch immediately followed by RunFinished hands the turn to
/// the client: it must execute the tool and open a new run whose trailing
/// message is the tool result keyed by the same tool-call id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted { thread_id: ThreadId, run_id: RunId },

    TextDelta { delta: String },

    #[serde(rename_all = "camelCase")]
    ToolCallDispatch {
        tool_call_id: ToolCallId,
        tool_name: String,
        /// Arguments serialized as a JSON string.
        arguments: String,
    },

    /// RFC 6902 operations, in application order.
    StateDelta { delta: Vec<Value> },

    #[serde(rename_all = "camelCase")]
    RunFinished { thread_id: ThreadId, run_id: RunId },

    RunError { message: String },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::RunError { .. })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run-started",
            Self::TextDelta { .. } => "text-delta",
            Self::ToolCallDispatch { .. } => "tool-call-dispatch",
            Self::StateDelta { .. } => "state-delta",
            Self::RunFinished { .. } => "run-finished",
            Self::RunError { .. } => "run-error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_classification() {
        let finished = RunEvent::RunFinished {
            thread_id: ThreadId::from_raw("t"),
            run_id: RunId::from_raw("r"),
        };
        assert!(finished.is_terminal());
        assert!(RunEvent::RunError { message: "boom".into() }.is_terminal());
        assert!(!RunEvent::TextDelta { delta: "x".into() }.is_terminal());
    }

    #[test]
    fn wire_shape_is_kebab_tagged_camel_fields() {
        let event = RunEvent::ToolCallDispatch {
            tool_call_id: ToolCallId::from_raw("call_1"),
            tool_name: "fetch_weather".into(),
            arguments: r#"{"city":"Lyon"}"#.into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tool-call-dispatch",
                "toolCallId": "call_1",
                "toolName": "fetch_weather",
                "arguments": "{\"city\":\"Lyon\"}"
            })
        );
        assert_eq!(value["type"], event.event_type());
    }

    #[test]
    fn run_started_fields() {
        let value = serde_json::to_value(RunEvent::RunStarted {
            thread_id: ThreadId::from_raw("t1"),
            run_id: RunId::from_raw("r1"),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "run-started", "threadId": "t1", "runId": "r1"}));
    }

    #[test]
    fn state_delta_carries_operations() {
        let value = serde_json::to_value(RunEvent::StateDelta {
            delta: vec![json!({"op": "replace", "path": "/count", "value": 2})],
        })
        .unwrap();
        assert_eq!(value["type"], "state-delta");
        assert_eq!(value["delta"][0]["op"], "replace");
    }
}
