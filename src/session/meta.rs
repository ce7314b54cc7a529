//! On-disk session metadata and statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::time::{iso_millis, iso_millis_opt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

/// `metadata.json` — written at session start, updated on finalize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub instance_name: String,
    #[serde(with = "iso_millis")]
    pub start_time: DateTime<Utc>,
    #[serde(default, with = "iso_millis_opt")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub depth: u32,
    #[serde(default)]
    pub parent_session_id: Option<String>,
    pub initial_prompt: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub resume_of: Option<String>,
    /// Owning runtime's OS process id; consumed by the crash-repair pass.
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub results: Vec<ResultEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    pub result: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    pub is_error: bool,
}

/// Link from a parent session to one child session it spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsessionLink {
    pub session_id: String,
    pub tool_name: String,
    pub tool_use_id: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub depth: u32,
}

/// `statistics.json` — written on finalize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub session_id: String,
    pub num_messages: u64,
    pub num_tool_calls: u64,
    pub num_turns: u32,
    pub total_duration_ms: u64,
    pub api_duration_ms: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    #[serde(default)]
    pub tools_used: BTreeMap<String, u64>,
    #[serde(default)]
    pub subsessions: Vec<SubsessionLink>,
    pub final_status: SessionStatus,
}

impl SessionStatistics {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            num_messages: 0,
            num_tool_calls: 0,
            num_turns: 0,
            total_duration_ms: 0,
            api_duration_ms: 0,
            cost_usd: None,
            tokens_in: 0,
            tokens_out: 0,
            tools_used: BTreeMap::new(),
            subsessions: Vec::new(),
            final_status: SessionStatus::Running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Interrupted).unwrap(),
            "\"interrupted\""
        );
        let status: SessionStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(status, SessionStatus::Running);
        assert!(!status.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_metadata_tolerates_missing_optional_fields() {
        let json = r#"{
            "session_id": "20251216T000000_0000_abcd1234",
            "instance_name": "demo",
            "start_time": "2025-12-16T00:00:00.000Z",
            "end_time": null,
            "status": "running",
            "depth": 0,
            "parent_session_id": null,
            "initial_prompt": "hello"
        }"#;

        let metadata: SessionMetadata = serde_json::from_str(json).unwrap();
        assert!(metadata.end_time.is_none());
        assert!(metadata.pid.is_none());
        assert!(metadata.results.is_empty());
        assert!(metadata.context.is_empty());
    }
}
