use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Instance directory not found: {0}")]
    InstanceNotFound(PathBuf),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Message bus error: {0}")]
    Bus(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Query interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

pub(crate) fn session_err(msg: impl Into<String>) -> RelayError {
    RelayError::Session(msg.into())
}

pub(crate) fn session_err_with(msg: &str, err: impl std::fmt::Display) -> RelayError {
    RelayError::Session(format!("{}: {}", msg, err))
}
