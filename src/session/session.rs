//! A single recorded conversation.
//!
//! The owning runtime drives a session through `start`, a series of
//! `record_message` calls, and one `finalize`. Every recorded message goes
//! to the durable JSONL log and, when a bus is attached, to the session's
//! live channels. Durability never depends on the bus: publish failures
//! are logged and swallowed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::config::RecordingConfig;
use crate::error::{Result, session_err_with};
use crate::session::message::{
    ContentBlock, MessagePayload, RecordedMessage, ResultPayload, SUB_INSTANCE_STARTED,
};
use crate::session::meta::{
    ResultEntry, SessionMetadata, SessionStatistics, SessionStatus, SubsessionLink,
};
use crate::session::writer::{JsonlWriter, MESSAGES_FILE};
use crate::utils::file_ops::write_json_pretty;
use crate::utils::string::truncate_str;

pub const METADATA_FILE: &str = "metadata.json";
pub const STATISTICS_FILE: &str = "statistics.json";

/// Tool-name prefix marking sub-instance tools.
pub const SUB_INSTANCE_TOOL_PREFIX: &str = "sub_claude_";

const RESULT_TRUNCATE_BYTES: usize = 500;

pub struct Session {
    session_id: String,
    session_dir: PathBuf,
    metadata: Mutex<SessionMetadata>,
    stats: Mutex<SessionStatistics>,
    writer: Mutex<Option<JsonlWriter>>,
    bus: Option<MessageBus>,
    recording: RecordingConfig,
    /// tool_use id -> tool name, across the whole turn; tool results may
    /// stream in a later message than their originating tool_use block.
    tool_names: Mutex<HashMap<String, String>>,
    finalized: AtomicBool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        metadata: SessionMetadata,
        session_dir: PathBuf,
        writer: Option<JsonlWriter>,
        bus: Option<MessageBus>,
        recording: RecordingConfig,
        existing_messages: u64,
        finalized: bool,
    ) -> Self {
        let mut stats = SessionStatistics::new(&metadata.session_id);
        stats.num_messages = existing_messages;

        Self {
            session_id: metadata.session_id.clone(),
            session_dir,
            metadata: Mutex::new(metadata),
            stats: Mutex::new(stats),
            writer: Mutex::new(writer),
            bus,
            recording,
            tool_names: Mutex::new(HashMap::new()),
            finalized: AtomicBool::new(finalized),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn metadata(&self) -> SessionMetadata {
        self.metadata.lock().clone()
    }

    pub fn statistics(&self) -> SessionStatistics {
        self.stats.lock().clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Create the session directory, write the initial metadata, and
    /// announce the session on its lifecycle channel.
    pub async fn start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.session_dir)
            .await
            .map_err(|e| session_err_with("Cannot create session dir", e))?;

        self.write_metadata()?;
        self.publish_lifecycle("started", None);

        debug!(session_id = %self.session_id, "Session started");
        Ok(())
    }

    /// Record one message: durable append, live publish, counter update.
    /// Writer errors are logged and do not fail the call — the in-memory
    /// statistics stay consistent with what went out on the bus.
    pub async fn record_message(&self, payload: MessagePayload) -> Result<()> {
        if self.is_finalized() {
            warn!(session_id = %self.session_id, "Dropping message recorded after finalize");
            return Ok(());
        }

        let record = RecordedMessage::now(payload);
        let value = serde_json::to_value(&record)?;

        {
            let writer = self.writer.lock();
            match writer.as_ref() {
                Some(writer) => {
                    if let Err(e) = writer.append(&value) {
                        warn!(session_id = %self.session_id, error = %e, "Durable append failed");
                    }
                }
                None => {
                    warn!(session_id = %self.session_id, "Session has no writer, message not persisted");
                }
            }
        }

        if let Some(bus) = &self.bus {
            bus.publish(&bus.messages_channel(&self.session_id), value.clone());

            if let Some(system) = record.payload.as_system() {
                if system.subtype == SUB_INSTANCE_STARTED {
                    bus.publish(&bus.system_channel(&self.session_id), value);
                }
            }
        }

        self.update_counters(&record.payload);
        self.detect_subsessions(&record.payload);
        Ok(())
    }

    fn update_counters(&self, payload: &MessagePayload) {
        let mut stats = self.stats.lock();
        stats.num_messages += 1;

        if let MessagePayload::AssistantMessage(assistant) = payload {
            for block in &assistant.content {
                if let ContentBlock::ToolUse(tool_use) = block {
                    stats.num_tool_calls += 1;
                    *stats.tools_used.entry(tool_use.name.clone()).or_insert(0) += 1;
                }
            }
        }
        if let MessagePayload::ToolUseMessage(tool_use) = payload {
            stats.num_tool_calls += 1;
            *stats.tools_used.entry(tool_use.name.clone()).or_insert(0) += 1;
        }
    }

    /// Track tool_use ids and watch sub-instance tool results for the
    /// embedded session-id marker. This is what links children spawned by
    /// tool subprocesses, where no adapter holds this Session.
    fn detect_subsessions(&self, payload: &MessagePayload) {
        let blocks: &[ContentBlock] = match payload {
            MessagePayload::AssistantMessage(assistant) => &assistant.content,
            MessagePayload::ToolUseMessage(tool_use) => {
                self.tool_names
                    .lock()
                    .insert(tool_use.id.clone(), tool_use.name.clone());
                return;
            }
            MessagePayload::ToolResultMessage(result) => {
                self.check_tool_result(&result.tool_use_id, &result.content);
                return;
            }
            _ => return,
        };

        for block in blocks {
            match block {
                ContentBlock::ToolUse(tool_use) => {
                    self.tool_names
                        .lock()
                        .insert(tool_use.id.clone(), tool_use.name.clone());
                }
                ContentBlock::ToolResult(result) => {
                    self.check_tool_result(&result.tool_use_id, &result.content);
                }
                ContentBlock::Text(_) => {}
            }
        }
    }

    fn check_tool_result(&self, tool_use_id: &str, content: &str) {
        let tool_name = match self.tool_names.lock().get(tool_use_id) {
            Some(name) if name.contains(SUB_INSTANCE_TOOL_PREFIX) => name.clone(),
            _ => return,
        };

        if let Some(child_id) = extract_session_id_marker(content) {
            debug!(
                session_id = %self.session_id,
                child_id = %child_id,
                tool = %tool_name,
                "Detected sub-instance result"
            );
            self.append_subsession_link(&child_id, &tool_name, tool_use_id, "", None);
        }
    }

    /// Link a child session into this session's statistics. A child
    /// session id is unique per invocation, so it is the dedupe key: the
    /// adapter path and the marker-detection path each fill in the fields
    /// the other cannot know (instance name vs. tool_use id).
    pub fn append_subsession_link(
        &self,
        child_session_id: &str,
        tool_name: &str,
        tool_use_id: &str,
        instance_name: &str,
        depth: Option<u32>,
    ) {
        let mut stats = self.stats.lock();

        if let Some(existing) = stats
            .subsessions
            .iter_mut()
            .find(|link| link.session_id == child_session_id)
        {
            if existing.instance_name.is_empty() && !instance_name.is_empty() {
                existing.instance_name = instance_name.to_string();
            }
            if existing.tool_use_id.is_empty() && !tool_use_id.is_empty() {
                existing.tool_use_id = tool_use_id.to_string();
            }
            return;
        }

        let depth = depth.unwrap_or_else(|| self.metadata.lock().depth + 1);
        stats.subsessions.push(SubsessionLink {
            session_id: child_session_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_use_id: tool_use_id.to_string(),
            timestamp: Utc::now(),
            instance_name: instance_name.to_string(),
            depth,
        });
    }

    /// Finalize with an optional result message. Idempotent: only the
    /// first call flushes, writes statistics, and updates metadata.
    pub async fn finalize(&self, result: Option<&ResultPayload>) -> Result<()> {
        self.finalize_inner(result, None).await
    }

    /// Finalize after an external interruption (cancellation, stream torn
    /// down before a result arrived).
    pub async fn finalize_interrupted(&self) -> Result<()> {
        self.finalize_inner(None, Some(SessionStatus::Interrupted))
            .await
    }

    async fn finalize_inner(
        &self,
        result: Option<&ResultPayload>,
        status_override: Option<SessionStatus>,
    ) -> Result<()> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            debug!(session_id = %self.session_id, "Finalize skipped, already finalized");
            return Ok(());
        }

        // Flush the durable log first; a failure here must not stop the
        // metadata update below.
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.close().await {
                warn!(session_id = %self.session_id, error = %e, "Writer close failed");
            }
        }

        let now = Utc::now();
        let status = {
            let mut metadata = self.metadata.lock();
            metadata.end_time = Some(now);

            if metadata.status == SessionStatus::Running {
                metadata.status = match status_override {
                    Some(status) => status,
                    None => match result {
                        Some(result) if result.is_error => SessionStatus::Failed,
                        Some(_) => SessionStatus::Completed,
                        None => SessionStatus::Failed,
                    },
                };
            }

            if let Some(result) = result {
                if !result.result.is_empty() {
                    metadata.results.push(ResultEntry {
                        result: truncate_str(&result.result, RESULT_TRUNCATE_BYTES).to_string(),
                        timestamp: now,
                        is_error: result.is_error,
                    });
                }
            }
            metadata.status
        };

        {
            let mut stats = self.stats.lock();
            let start_time = self.metadata.lock().start_time;
            stats.total_duration_ms = (now - start_time).num_milliseconds().max(0) as u64;
            stats.final_status = status;

            if let Some(result) = result {
                stats.api_duration_ms = result.duration_api_ms;
                stats.num_turns = result.num_turns;
                stats.tokens_in = result.usage.input_tokens;
                stats.tokens_out = result.usage.output_tokens;
                if result.total_cost_usd > 0.0 {
                    stats.cost_usd = Some(result.total_cost_usd);
                }
            }
        }

        let mut first_error = None;
        if let Err(e) = self.write_metadata() {
            warn!(session_id = %self.session_id, error = %e, "Metadata write failed on finalize");
            first_error = Some(e);
        }
        if let Err(e) = self.write_statistics() {
            warn!(session_id = %self.session_id, error = %e, "Statistics write failed on finalize");
            first_error.get_or_insert(e);
        }

        self.publish_lifecycle("finalized", Some(status));
        debug!(session_id = %self.session_id, status = %status, "Session finalized");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read recorded messages in write order. With no explicit filter,
    /// the instance's configured `message_types` narrows the view.
    pub fn messages(
        &self,
        types: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<RecordedMessage>> {
        let configured = self.recording.message_types.as_deref();
        let effective = types.or(configured);
        read_messages(&self.session_dir, effective, limit)
    }

    fn write_metadata(&self) -> Result<()> {
        let metadata = self.metadata.lock().clone();
        write_json_pretty(&self.session_dir.join(METADATA_FILE), &metadata)
    }

    fn write_statistics(&self) -> Result<()> {
        let stats = self.stats.lock().clone();
        write_json_pretty(&self.session_dir.join(STATISTICS_FILE), &stats)
    }

    fn publish_lifecycle(&self, event: &str, status: Option<SessionStatus>) {
        let Some(bus) = &self.bus else {
            return;
        };
        let mut payload = json!({
            "event": event,
            "session_id": self.session_id,
            "instance_name": self.metadata.lock().instance_name,
            "timestamp": crate::utils::time::format_iso_millis(&Utc::now()),
        });
        if let Some(status) = status {
            payload["status"] = json!(status.to_string());
        }
        bus.publish(&bus.lifecycle_channel(&self.session_id), payload);
    }

    /// Reset a finalized session for appending (resume). Returns the
    /// number of records already on disk.
    pub(crate) fn reopen(&self, writer: JsonlWriter) -> Result<u64> {
        let existing =
            crate::utils::file_ops::count_lines_in_file(self.session_dir.join(MESSAGES_FILE))
                .unwrap_or(0) as u64;

        {
            let mut metadata = self.metadata.lock();
            metadata.status = SessionStatus::Running;
            metadata.end_time = None;
        }
        {
            let mut stats = self.stats.lock();
            stats.num_messages = existing;
            stats.final_status = SessionStatus::Running;
        }
        *self.writer.lock() = Some(writer);
        self.finalized.store(false, Ordering::Release);

        self.write_metadata()?;
        Ok(existing)
    }
}

/// Pull the child session id out of a sub-instance tool result.
pub(crate) fn extract_session_id_marker(content: &str) -> Option<String> {
    static MARKER: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let regex = MARKER.get_or_init(|| Regex::new(r"<!--SESSION_ID:([^>]+)-->").expect("valid regex"));
    regex
        .captures(content)
        .map(|captures| captures[1].to_string())
}

/// Stream recorded messages from a session directory. A partially-written
/// last line (a writer may be mid-batch) is skipped, never an error;
/// malformed interior lines are skipped with a warning.
pub fn read_messages(
    session_dir: &Path,
    types: Option<&[String]>,
    limit: Option<usize>,
) -> Result<Vec<RecordedMessage>> {
    let path = session_dir.join(MESSAGES_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = content.lines().collect();
    let mut messages = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: RecordedMessage = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                if index + 1 == lines.len() {
                    debug!(path = %path.display(), "Skipping partial last line");
                } else {
                    warn!(path = %path.display(), line = index + 1, error = %e, "Skipping malformed record");
                }
                continue;
            }
        };

        if let Some(types) = types {
            if !types.iter().any(|t| t == record.message_type()) {
                continue;
            }
        }

        messages.push(record);
        if let Some(limit) = limit {
            if messages.len() >= limit {
                break;
            }
        }
    }

    Ok(messages)
}
