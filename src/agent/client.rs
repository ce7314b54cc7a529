//! The LLM client boundary.
//!
//! The client is an external collaborator: given one composed request it
//! streams back the typed messages of a full agent turn, driving tool
//! handlers itself as the model calls them. The crate ships no network
//! client; tests script one.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::config::PermissionMode;
use crate::error::Result;
use crate::session::message::MessagePayload;
use crate::tools::ToolDescriptor;

/// Everything the client needs for one agent turn.
#[derive(Clone)]
pub struct QueryRequest {
    pub prompt: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDescriptor>,
    pub permission_mode: PermissionMode,
    pub max_turns: Option<u32>,
    /// Forwarded to the client process environment; carries the SDK-level
    /// timeouts among other settings.
    pub env: BTreeMap<String, String>,
    /// Local session id being resumed, when the caller continues an
    /// existing conversation.
    pub resume_session_id: Option<String>,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<MessagePayload>> + Send>>;

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Open the message stream for one turn. The stream ends after the
    /// terminal `ResultMessage`, or earlier on interruption.
    async fn stream_query(&self, request: QueryRequest) -> Result<MessageStream>;
}
