//! Session recording: durable per-conversation logs plus live publication.

pub mod context;
pub mod id;
pub mod manager;
pub mod message;
pub mod meta;
pub mod session;
pub mod writer;

pub use context::SessionContext;
pub use id::generate_session_id;
pub use manager::{CleanupEntry, CleanupReport, SessionManager};
pub use message::{
    AssistantPayload, ContentBlock, MessagePayload, RecordedMessage, ResultPayload, SystemPayload,
    ToolResultPayload, ToolUsePayload, UsagePayload, UserPayload, SUB_INSTANCE_STARTED,
};
pub use meta::{ResultEntry, SessionMetadata, SessionStatistics, SessionStatus, SubsessionLink};
pub use session::{read_messages, Session};
pub use writer::JsonlWriter;
