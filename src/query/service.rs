//! Synchronous session queries: details, listing, search, statistics,
//! export.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::bus::MessageBus;
use crate::config::{AsyncWriteConfig, RecordingConfig};
use crate::error::{RelayError, Result};
use crate::instance;
use crate::query::subscribe::{SubscribeCallbacks, SubscriptionCoordinator};
use crate::query::tree::{self, SessionTree};
use crate::session::manager::{CleanupReport, SessionManager};
use crate::session::meta::{SessionMetadata, SessionStatistics, SessionStatus, SubsessionLink};
use crate::session::session::{METADATA_FILE, STATISTICS_FILE, read_messages};
use crate::session::message::RecordedMessage;
use crate::session::writer::MESSAGES_FILE;
use crate::utils::file_ops::read_json;
use crate::utils::time::format_iso_millis;

const SEARCH_SCAN_LIMIT: usize = 1000;
const SUMMARY_SCAN_LIMIT: usize = 10_000;

/// Unified read access to one instance's session store, plus live
/// subscription when a bus is attached.
pub struct SessionQuery {
    instance_name: String,
    instances_root: PathBuf,
    manager: SessionManager,
    bus: Option<MessageBus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetails {
    pub metadata: SessionMetadata,
    pub statistics: SessionStatistics,
    pub messages: Vec<RecordedMessage>,
    pub subsessions: Vec<SubsessionLink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    InitialPrompt,
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Jsonl,
    Text,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSummary {
    pub total_sessions: usize,
    pub completed_sessions: usize,
    pub failed_sessions: usize,
    pub running_sessions: usize,
    pub total_messages: u64,
    pub total_tool_calls: u64,
    pub total_cost_usd: f64,
    pub avg_duration_ms: f64,
    pub recent_days: Option<u32>,
}

impl SessionQuery {
    pub fn new(instance_name: &str, instances_root: &Path, bus: Option<MessageBus>) -> Result<Self> {
        let instance_path = instance::instance_path(instance_name, instances_root)?;
        let manager = SessionManager::new(
            instance_path,
            RecordingConfig::default(),
            AsyncWriteConfig::default(),
            bus.clone(),
        );

        Ok(Self {
            instance_name: instance_name.to_string(),
            instances_root: instances_root.to_path_buf(),
            manager,
            bus,
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.manager.sessions_dir().join(session_id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(RelayError::SessionNotFound(session_id.to_string()))
        }
    }

    /// Metadata, statistics, linked subsessions, and optionally a message
    /// prefix, merged into one view.
    pub fn get_session_details(
        &self,
        session_id: &str,
        include_messages: bool,
        message_limit: Option<usize>,
    ) -> Result<SessionDetails> {
        let dir = self.session_dir(session_id)?;
        let metadata: SessionMetadata = read_json(&dir.join(METADATA_FILE))?;

        // A running session has no statistics file yet; synthesize an
        // empty one rather than failing the read.
        let statistics: SessionStatistics = match read_json(&dir.join(STATISTICS_FILE)) {
            Ok(statistics) => statistics,
            Err(_) => SessionStatistics::new(session_id),
        };

        let messages = if include_messages {
            read_messages(&dir, None, message_limit)?
        } else {
            Vec::new()
        };

        let subsessions = statistics.subsessions.clone();
        Ok(SessionDetails {
            metadata,
            statistics,
            messages,
            subsessions,
        })
    }

    pub fn get_session_messages(
        &self,
        session_id: &str,
        types: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<RecordedMessage>> {
        let dir = self.session_dir(session_id)?;
        read_messages(&dir, types, limit)
    }

    pub fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionMetadata>> {
        self.manager.list_sessions(status, limit, offset)
    }

    /// Linear scan with case-insensitive substring match over the chosen
    /// metadata field.
    pub fn search_sessions(
        &self,
        query: &str,
        field: SearchField,
        limit: usize,
    ) -> Result<Vec<SessionMetadata>> {
        let needle = query.to_lowercase();
        let sessions = self.manager.list_sessions(None, SEARCH_SCAN_LIMIT, 0)?;

        let mut matched = Vec::new();
        for metadata in sessions {
            let hit = match field {
                SearchField::InitialPrompt => {
                    metadata.initial_prompt.to_lowercase().contains(&needle)
                }
                SearchField::Result => metadata
                    .results
                    .iter()
                    .any(|entry| entry.result.to_lowercase().contains(&needle)),
            };
            if hit {
                matched.push(metadata);
                if matched.len() >= limit {
                    break;
                }
            }
        }
        Ok(matched)
    }

    /// Aggregate counts across the store, optionally windowed to sessions
    /// started in the last `recent_days`.
    pub fn get_statistics_summary(&self, recent_days: Option<u32>) -> Result<StatisticsSummary> {
        let mut sessions = self.manager.list_sessions(None, SUMMARY_SCAN_LIMIT, 0)?;

        if let Some(days) = recent_days {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
            sessions.retain(|metadata| metadata.start_time >= cutoff);
        }

        let mut summary = StatisticsSummary {
            total_sessions: sessions.len(),
            completed_sessions: 0,
            failed_sessions: 0,
            running_sessions: 0,
            total_messages: 0,
            total_tool_calls: 0,
            total_cost_usd: 0.0,
            avg_duration_ms: 0.0,
            recent_days,
        };

        let mut duration_total = 0u64;
        let mut duration_count = 0u64;

        for metadata in &sessions {
            match metadata.status {
                SessionStatus::Completed => summary.completed_sessions += 1,
                SessionStatus::Failed => summary.failed_sessions += 1,
                SessionStatus::Running => summary.running_sessions += 1,
                SessionStatus::Interrupted => {}
            }

            let stats_path = self
                .manager
                .sessions_dir()
                .join(&metadata.session_id)
                .join(STATISTICS_FILE);
            let Ok(stats) = read_json::<SessionStatistics>(&stats_path) else {
                continue;
            };

            summary.total_messages += stats.num_messages;
            summary.total_tool_calls += stats.num_tool_calls;
            summary.total_cost_usd += stats.cost_usd.unwrap_or(0.0);
            if stats.total_duration_ms > 0 {
                duration_total += stats.total_duration_ms;
                duration_count += 1;
            }
        }

        if duration_count > 0 {
            summary.avg_duration_ms = duration_total as f64 / duration_count as f64;
        }
        summary.total_cost_usd = (summary.total_cost_usd * 10_000.0).round() / 10_000.0;
        Ok(summary)
    }

    /// Write a session to a file in the requested format.
    ///
    /// `json` serializes the same view `get_session_details` returns;
    /// `jsonl` copies the raw complete message lines; `text` renders a
    /// human-readable transcript.
    pub fn export_session(
        &self,
        session_id: &str,
        output_path: &Path,
        format: ExportFormat,
        include_messages: bool,
    ) -> Result<()> {
        let details = self.get_session_details(session_id, include_messages, None)?;
        let mut file = std::fs::File::create(output_path)?;

        match format {
            ExportFormat::Json => {
                let content = serde_json::to_string_pretty(&details)?;
                file.write_all(content.as_bytes())?;
            }
            ExportFormat::Jsonl => {
                writeln!(
                    file,
                    "{}",
                    json!({"type": "metadata", "data": details.metadata})
                )?;
                writeln!(
                    file,
                    "{}",
                    json!({"type": "statistics", "data": details.statistics})
                )?;
                if include_messages {
                    for message in &details.messages {
                        writeln!(file, "{}", json!({"type": "message", "data": message}))?;
                    }
                }
            }
            ExportFormat::Text => {
                self.write_transcript(&mut file, session_id, &details)?;
            }
        }

        info!(session_id, path = %output_path.display(), "Exported session");
        Ok(())
    }

    fn write_transcript(
        &self,
        file: &mut std::fs::File,
        session_id: &str,
        details: &SessionDetails,
    ) -> Result<()> {
        writeln!(file, "=== Session: {} ===", session_id)?;
        writeln!(file)?;
        writeln!(file, "Instance: {}", details.metadata.instance_name)?;
        writeln!(file, "Status: {}", details.metadata.status)?;
        writeln!(
            file,
            "Start Time: {}",
            format_iso_millis(&details.metadata.start_time)
        )?;
        writeln!(
            file,
            "End Time: {}",
            details
                .metadata
                .end_time
                .map(|t| format_iso_millis(&t))
                .unwrap_or_else(|| "N/A".to_string())
        )?;
        writeln!(file)?;
        writeln!(file, "=== Statistics ===")?;
        writeln!(file, "Messages: {}", details.statistics.num_messages)?;
        writeln!(file, "Tool Calls: {}", details.statistics.num_tool_calls)?;
        writeln!(file, "Duration: {}ms", details.statistics.total_duration_ms)?;
        writeln!(
            file,
            "Cost: ${}",
            details.statistics.cost_usd.unwrap_or(0.0)
        )?;

        if !details.messages.is_empty() {
            writeln!(file)?;
            writeln!(file, "=== Messages ===")?;
            for (seq, message) in details.messages.iter().enumerate() {
                writeln!(
                    file,
                    "\n[{}] {} @ {}",
                    seq,
                    message.message_type(),
                    format_iso_millis(&message.timestamp)
                )?;
                for part in message.payload.text_parts() {
                    writeln!(file, "  {}", part)?;
                }
            }
        }
        Ok(())
    }

    /// Proxy to the manager's retention cleanup.
    pub fn cleanup_sessions(&self, retention_days: u32, dry_run: bool) -> Result<CleanupReport> {
        self.manager.cleanup_old_sessions(retention_days, dry_run)
    }

    /// Recursively assemble the session tree rooted at `session_id`,
    /// spanning instances.
    pub fn build_session_tree(
        &self,
        session_id: &str,
        instance_name: Option<&str>,
        include_messages: bool,
        max_depth: usize,
    ) -> Result<SessionTree> {
        tree::build_session_tree(
            &self.instances_root,
            session_id,
            instance_name.unwrap_or(&self.instance_name),
            include_messages,
            max_depth,
        )
    }

    /// Begin a live subscription rooted at `session_id`; children are
    /// discovered and followed automatically. Requires a bus.
    pub fn subscribe(
        &self,
        session_id: &str,
        callbacks: SubscribeCallbacks,
        auto_start: bool,
    ) -> Result<SubscriptionCoordinator> {
        let bus = self.bus.clone().ok_or_else(|| {
            RelayError::Bus("subscription requires a message bus".to_string())
        })?;

        let coordinator = SubscriptionCoordinator::new(bus, session_id, callbacks);
        if auto_start {
            coordinator.start()?;
        }
        Ok(coordinator)
    }

    /// Raw messages file path, used by callers that tail the durable log
    /// directly.
    pub fn messages_path(&self, session_id: &str) -> Result<PathBuf> {
        Ok(self.session_dir(session_id)?.join(MESSAGES_FILE))
    }
}

impl std::fmt::Debug for SessionQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionQuery")
            .field("instance", &self.instance_name)
            .field("has_bus", &self.bus.is_some())
            .finish()
    }
}
