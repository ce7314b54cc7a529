pub mod agent;
pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod instance;
pub mod query;
pub mod session;
pub mod tools;
pub mod utils;

pub use agent::{AgentClient, AgentRuntime, QueryRequest, QueryResult, QueryStream};
pub use bus::{BusEvent, BusSubscription, MessageBus};
pub use config::{InstanceConfig, PermissionMode, RecordingConfig, StreamingConfig};
pub use error::{RelayError, Result};
pub use query::{SessionQuery, SessionTree, SubscriptionCoordinator};
pub use session::{
    ContentBlock, MessagePayload, RecordedMessage, Session, SessionContext, SessionManager,
    SessionMetadata, SessionStatistics, SessionStatus,
};
pub use tools::{ToolDescriptor, ToolOutput};
