//! Message envelopes recorded to JSONL and published on the bus.
//!
//! Every envelope is `{ message_type, timestamp, data }`; consumers branch
//! on `message_type`. The payload is an explicit tagged sum, as is the
//! assistant content block list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::time::iso_millis;

/// System-event subtype announcing a spawned child session.
pub const SUB_INSTANCE_STARTED: &str = "sub_instance_started";

/// One recorded message: the payload plus its capture timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedMessage {
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

impl RecordedMessage {
    pub fn now(payload: MessagePayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn message_type(&self) -> &'static str {
        self.payload.message_type()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "data")]
pub enum MessagePayload {
    UserMessage(UserPayload),
    AssistantMessage(AssistantPayload),
    ToolUseMessage(ToolUsePayload),
    ToolResultMessage(ToolResultPayload),
    ResultMessage(ResultPayload),
    SystemMessage(SystemPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantPayload {
    pub model: String,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUsePayload {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub subtype: String,
    pub duration_ms: u64,
    pub duration_api_ms: u64,
    pub is_error: bool,
    pub num_turns: u32,
    pub total_cost_usd: f64,
    pub usage: UsagePayload,
    pub result: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsagePayload {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPayload {
    pub subtype: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    ToolUse(ToolUsePayload),
    ToolResult(ToolResultPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextBlock { text: text.into() })
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse(ToolUsePayload {
            id: id.into(),
            name: name.into(),
            input,
        })
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult(ToolResultPayload {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        })
    }
}

impl MessagePayload {
    pub fn user(content: impl Into<String>) -> Self {
        Self::UserMessage(UserPayload {
            role: "user".to_string(),
            content: content.into(),
        })
    }

    pub fn assistant(model: impl Into<String>, content: Vec<ContentBlock>) -> Self {
        Self::AssistantMessage(AssistantPayload {
            model: model.into(),
            content,
        })
    }

    pub fn system(subtype: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self::SystemMessage(SystemPayload {
            subtype: subtype.into(),
            fields,
        })
    }

    /// System event published on a parent's system channel when a child
    /// session starts. `session_id` is the child's id.
    pub fn sub_instance_started(instance_name: &str, session_id: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("instance_name".to_string(), instance_name.into());
        fields.insert("session_id".to_string(), session_id.into());
        Self::system(SUB_INSTANCE_STARTED, fields)
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::UserMessage(_) => "UserMessage",
            Self::AssistantMessage(_) => "AssistantMessage",
            Self::ToolUseMessage(_) => "ToolUseMessage",
            Self::ToolResultMessage(_) => "ToolResultMessage",
            Self::ResultMessage(_) => "ResultMessage",
            Self::SystemMessage(_) => "SystemMessage",
        }
    }

    pub fn as_result(&self) -> Option<&ResultPayload> {
        match self {
            Self::ResultMessage(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_system(&self) -> Option<&SystemPayload> {
        match self {
            Self::SystemMessage(system) => Some(system),
            _ => None,
        }
    }

    /// Text carried by this message, if any. Used to assemble the final
    /// query result.
    pub fn text_parts(&self) -> Vec<&str> {
        match self {
            Self::AssistantMessage(assistant) => assistant
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(text) => Some(text.text.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Extract the child session id and instance name from a
/// `sub_instance_started` system event payload. Accepts both the canonical
/// `session_id` field and the legacy `child_session_id` name.
pub fn parse_sub_instance_started(payload: &Value) -> Option<(String, String)> {
    let data = payload.get("data")?;
    let session_id = data
        .get("session_id")
        .or_else(|| data.get("child_session_id"))?
        .as_str()?
        .to_string();
    let instance_name = data
        .get("instance_name")
        .or_else(|| data.get("child_instance_name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some((session_id, instance_name))
}
