// ABOUTME: Commands sent from a frontend to the agent.
// ABOUTME: Tagged by `type` in snake_case: user_input, tool_approval, interrupt, model_switch.

use serde::{Deserialize, Serialize};

/// A message flowing frontend → agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    UserInput {
        #[serde(default)]
        content: String,
    },
    ToolApproval {
        #[serde(default)]
        tool_id: String,
        #[serde(default)]
        approved: bool,
    },
    Interrupt,
    ModelSwitch {
        #[serde(default)]
        model_id: String,
    },
}

impl Command {
    /// Every `type` tag a command may carry.
    pub const TYPES: &'static [&'static str] =
        &["user_input", "tool_approval", "interrupt", "model_switch"];

    /// The wire tag of this command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Command::UserInput { .. } => "user_input",
            Command::ToolApproval { .. } => "tool_approval",
            Command::Interrupt => "interrupt",
            Command::ModelSwitch { .. } => "model_switch",
        }
    }

    pub fn user_input(content: impl Into<String>) -> Self {
        Command::UserInput {
            content: content.into(),
        }
    }

    pub fn tool_approval(tool_id: impl Into<String>, approved: bool) -> Self {
        Command::ToolApproval {
            tool_id: tool_id.into(),
            approved,
        }
    }

    pub fn model_switch(model_id: impl Into<String>) -> Self {
        Command::ModelSwitch {
            model_id: model_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interrupt_serializes_to_bare_tag() {
        let value = serde_json::to_value(Command::Interrupt).unwrap();
        assert_eq!(value, json!({"type": "interrupt"}));
    }

    #[test]
    fn tool_approval_uses_snake_case_tag() {
        let value = serde_json::to_value(Command::tool_approval("t-1", true)).unwrap();
        assert_eq!(
            value,
            json!({"type": "tool_approval", "tool_id": "t-1", "approved": true})
        );
    }

    #[test]
    fn type_name_matches_serialized_tag() {
        let commands = [
            Command::user_input("hi"),
            Command::tool_approval("x", false),
            Command::Interrupt,
            Command::model_switch("qwen-max"),
        ];
        for cmd in commands {
            let value = serde_json::to_value(&cmd).unwrap();
            assert_eq!(value["type"], cmd.type_name());
            assert!(Command::TYPES.contains(&cmd.type_name()));
        }
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cmd: Command = serde_json::from_str(r#"{"type":"tool_approval"}"#).unwrap();
        assert_eq!(cmd, Command::tool_approval("", false));
    }
}
