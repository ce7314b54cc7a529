pub mod instance;
pub mod streaming;

pub use instance::{
    AdvancedSection, AgentSection, InstanceConfig, PermissionMode, RecordingConfig, ToolsSection,
};
pub use streaming::{AsyncWriteConfig, BusConfig, StreamingConfig};
