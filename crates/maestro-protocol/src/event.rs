// ABOUTME: Events emitted by the agent and forwarded to the frontend.
// ABOUTME: Optional fields are omitted on the wire rather than written as null.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message flowing agent → frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Init {
        #[serde(default)]
        version: String,
        #[serde(default)]
        workspace_root: String,
        #[serde(default)]
        model: String,
    },
    Conversation {
        role: Role,
        #[serde(default)]
        content: String,
        #[serde(default)]
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        #[serde(
            rename = "isStreaming",
            alias = "is_streaming",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        is_streaming: Option<bool>,
    },
    ToolGroup {
        #[serde(default)]
        id: u64,
        #[serde(default)]
        tools: Vec<ToolCall>,
    },
    Status {
        #[serde(default)]
        state: StatusState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
    Info {
        #[serde(default)]
        message: String,
        #[serde(default)]
        id: u64,
    },
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        id: u64,
    },
    CompletionStats {
        /// Usually a string like "1.2s"; forwarded as whatever the agent sent
        #[serde(default, skip_serializing_if = "Value::is_null")]
        duration: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completion_tokens: Option<u64>,
    },
}

impl Event {
    /// Every `type` tag an event may carry.
    pub const TYPES: &'static [&'static str] = &[
        "init",
        "conversation",
        "tool_group",
        "status",
        "info",
        "error",
        "completion_stats",
    ];

    /// The wire tag of this event.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Init { .. } => "init",
            Event::Conversation { .. } => "conversation",
            Event::ToolGroup { .. } => "tool_group",
            Event::Status { .. } => "status",
            Event::Info { .. } => "info",
            Event::Error { .. } => "error",
            Event::CompletionStats { .. } => "completion_stats",
        }
    }

    /// Error event originating from the bridge itself rather than the agent.
    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
            id: 0,
        }
    }

    pub fn info(message: impl Into<String>, id: u64) -> Self {
        Event::Info {
            message: message.into(),
            id,
        }
    }
}

/// Speaker of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Coarse agent activity reported by `status` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    #[default]
    Idle,
    Responding,
    WaitingForConfirmation,
}

/// Lifecycle of a single tool invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Pending,
    Confirming,
    Executing,
    Success,
    Error,
    Canceled,
}

/// One tool call inside a `tool_group` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub tool_id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub status: ToolStatus,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_details: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conversation_omits_absent_optionals() {
        let event = Event::Conversation {
            role: Role::Assistant,
            content: "hello".into(),
            id: 1,
            timestamp: None,
            is_streaming: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "conversation", "role": "assistant", "content": "hello", "id": 1})
        );
    }

    #[test]
    fn streaming_flag_uses_camel_case_on_the_wire() {
        let event = Event::Conversation {
            role: Role::Assistant,
            content: "partial".into(),
            id: 7,
            timestamp: Some(1_700_000_000),
            is_streaming: Some(true),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["isStreaming"], json!(true));
        assert!(value.get("is_streaming").is_none());
    }

    #[test]
    fn streaming_flag_accepts_snake_case_alias() {
        let event: Event = serde_json::from_value(json!({
            "type": "conversation",
            "role": "user",
            "content": "x",
            "id": 2,
            "is_streaming": false
        }))
        .unwrap();
        match event {
            Event::Conversation { is_streaming, .. } => assert_eq!(is_streaming, Some(false)),
            other => panic!("expected conversation, got {:?}", other),
        }
    }

    #[test]
    fn status_state_defaults_to_idle() {
        let event: Event = serde_json::from_value(json!({"type": "status"})).unwrap();
        assert_eq!(
            event,
            Event::Status {
                state: StatusState::Idle,
                message: None,
                thought: None
            }
        );
    }

    #[test]
    fn waiting_for_confirmation_is_snake_case() {
        let value = serde_json::to_value(StatusState::WaitingForConfirmation).unwrap();
        assert_eq!(value, json!("waiting_for_confirmation"));
    }

    #[test]
    fn tool_call_ignores_nested_type_tag() {
        let event: Event = serde_json::from_value(json!({
            "type": "tool_group",
            "id": 3,
            "tools": [{
                "type": "tool_call",
                "tool_id": "t1",
                "tool_name": "read_file",
                "status": "executing",
                "args": {"path": "src/main.rs"}
            }]
        }))
        .unwrap();
        let Event::ToolGroup { id, tools } = event else {
            panic!("expected tool_group");
        };
        assert_eq!(id, 3);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].status, ToolStatus::Executing);
        assert_eq!(tools[0].args["path"], json!("src/main.rs"));
        assert!(tools[0].result.is_none());
    }

    #[test]
    fn structured_tool_result_is_kept_opaque() {
        let wire = json!({
            "type": "tool_group",
            "id": 4,
            "tools": [{
                "tool_id": "t2",
                "tool_name": "run_shell",
                "status": "error",
                "args": {},
                "result": {"stdout": "x", "exit_code": 1},
                "error": {"code": 127}
            }]
        });
        let event: Event = serde_json::from_value(wire.clone()).unwrap();
        let Event::ToolGroup { tools, .. } = &event else {
            panic!("expected tool_group");
        };
        assert_eq!(tools[0].result, Some(json!({"stdout": "x", "exit_code": 1})));
        assert_eq!(tools[0].error, Some(json!({"code": 127})));
        assert_eq!(serde_json::to_value(&event).unwrap(), wire);
    }

    #[test]
    fn numeric_duration_is_accepted() {
        let wire = json!({"type": "completion_stats", "duration": 1.5, "prompt_tokens": 10});
        let event: Event = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(
            event,
            Event::CompletionStats {
                duration: json!(1.5),
                prompt_tokens: Some(10),
                completion_tokens: None,
            }
        );
        assert_eq!(serde_json::to_value(&event).unwrap(), wire);
    }

    #[test]
    fn missing_duration_is_not_written_as_null() {
        let event: Event = serde_json::from_value(json!({"type": "completion_stats"})).unwrap();
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "completion_stats"})
        );
    }

    #[test]
    fn bridge_error_uses_zero_id() {
        assert_eq!(
            serde_json::to_value(Event::error("boom")).unwrap(),
            json!({"type": "error", "message": "boom", "id": 0})
        );
    }
}
