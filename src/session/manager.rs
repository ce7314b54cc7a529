//! Session factory and registry for one instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::config::{AsyncWriteConfig, RecordingConfig};
use crate::error::{RelayError, Result};
use crate::instance;
use crate::session::id::generate_session_id;
use crate::session::meta::{SessionMetadata, SessionStatus};
use crate::session::session::{METADATA_FILE, Session};
use crate::session::writer::{JsonlWriter, MESSAGES_FILE};
use crate::utils::file_ops::{count_lines_in_file, read_json, write_json_pretty};
use crate::utils::string::truncate_str;

const PROMPT_TRUNCATE_BYTES: usize = 1000;

/// Default grace period before a dead-pid session is repaired to
/// `interrupted`.
pub const REPAIR_GRACE: Duration = Duration::from_secs(60);

pub struct SessionManager {
    instance_path: PathBuf,
    instance_name: String,
    instances_root: PathBuf,
    sessions_dir: PathBuf,
    recording: RecordingConfig,
    write_config: AsyncWriteConfig,
    bus: Option<MessageBus>,
    live: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(
        instance_path: PathBuf,
        recording: RecordingConfig,
        write_config: AsyncWriteConfig,
        bus: Option<MessageBus>,
    ) -> Self {
        let instance_name = instance_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unknown")
            .to_string();
        let instances_root = instance_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let sessions_dir = instance::sessions_dir(&instance_path);

        Self {
            instance_path,
            instance_name,
            instances_root,
            sessions_dir,
            recording,
            write_config,
            bus,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn instance_path(&self) -> &Path {
        &self.instance_path
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn recording(&self) -> &RecordingConfig {
        &self.recording
    }

    /// Allocate a new session, write its directory, and register it live.
    pub async fn create_session(
        &self,
        initial_prompt: &str,
        context: Map<String, Value>,
        parent_session_id: Option<&str>,
    ) -> Result<Arc<Session>> {
        let session_id = generate_session_id();
        let session_dir = self.sessions_dir.join(&session_id);

        let depth = match parent_session_id {
            Some(parent_id) => self.resolve_parent_depth(parent_id).map_or(1, |d| d + 1),
            None => 0,
        };

        let metadata = SessionMetadata {
            session_id: session_id.clone(),
            instance_name: self.instance_name.clone(),
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Running,
            depth,
            parent_session_id: parent_session_id.map(String::from),
            initial_prompt: truncate_str(initial_prompt, PROMPT_TRUNCATE_BYTES).to_string(),
            context,
            resume_of: None,
            pid: Some(std::process::id()),
            results: Vec::new(),
        };

        let writer = self.open_writer(&session_dir);
        let session = Arc::new(Session::new(
            metadata,
            session_dir,
            Some(writer),
            self.bus.clone(),
            self.recording.clone(),
            0,
            false,
        ));
        session.start().await?;

        self.live
            .lock()
            .insert(session_id.clone(), Arc::clone(&session));

        info!(
            session_id = %session_id,
            instance = %self.instance_name,
            depth,
            parent = parent_session_id.unwrap_or("-"),
            "Created session"
        );
        Ok(session)
    }

    /// Live session if present, otherwise a read-only view hydrated from
    /// disk.
    pub fn get_session(&self, session_id: &str) -> Result<Arc<Session>> {
        if let Some(session) = self.live.lock().get(session_id) {
            return Ok(Arc::clone(session));
        }
        self.hydrate(session_id)
    }

    /// Reopen an existing session for appending. Resume of a `failed` or
    /// `interrupted` session is allowed; its status returns to `running`
    /// and prior records are untouched.
    pub async fn resume_session(&self, session_id: &str) -> Result<Arc<Session>> {
        let session = self.get_session(session_id)?;

        let writer = self.open_writer(session.session_dir());
        let existing = session.reopen(writer)?;

        self.live
            .lock()
            .insert(session_id.to_string(), Arc::clone(&session));

        info!(session_id, existing_messages = existing, "Resumed session");
        Ok(session)
    }

    fn hydrate(&self, session_id: &str) -> Result<Arc<Session>> {
        let session_dir = self.sessions_dir.join(session_id);
        if !session_dir.is_dir() {
            return Err(RelayError::SessionNotFound(session_id.to_string()));
        }

        let metadata: SessionMetadata = read_json(&session_dir.join(METADATA_FILE))
            .map_err(|e| RelayError::Session(format!("Unreadable metadata for {}: {}", session_id, e)))?;
        let existing = count_lines_in_file(session_dir.join(MESSAGES_FILE)).unwrap_or(0) as u64;

        Ok(Arc::new(Session::new(
            metadata,
            session_dir,
            None,
            self.bus.clone(),
            self.recording.clone(),
            existing,
            true,
        )))
    }

    fn open_writer(&self, session_dir: &Path) -> JsonlWriter {
        JsonlWriter::new(
            session_dir.to_path_buf(),
            self.write_config.batch_size,
            self.write_config.flush_interval_duration(),
        )
    }

    /// Depth of the parent session, looked up first in this instance and
    /// then across every instance under the root (a parent may live in a
    /// different instance).
    fn resolve_parent_depth(&self, parent_session_id: &str) -> Option<u32> {
        let local = self.sessions_dir.join(parent_session_id).join(METADATA_FILE);
        if let Ok(metadata) = read_json::<SessionMetadata>(&local) {
            return Some(metadata.depth);
        }

        let owner = instance::infer_instance_name(parent_session_id, &self.instances_root)?;
        let path = self
            .instances_root
            .join(owner)
            .join(instance::SESSIONS_DIR)
            .join(parent_session_id)
            .join(METADATA_FILE);
        read_json::<SessionMetadata>(&path).ok().map(|m| m.depth)
    }

    /// Scan the sessions directory, newest session id first.
    pub fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionMetadata>> {
        if !self.sessions_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_dir)?.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata: SessionMetadata = match read_json(&path.join(METADATA_FILE)) {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping session without readable metadata");
                    continue;
                }
            };
            if let Some(status) = status {
                if metadata.status != status {
                    continue;
                }
            }
            sessions.push(metadata);
        }

        sessions.sort_by(|a, b| b.session_id.cmp(&a.session_id));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    /// Delete session directories older than the retention cutoff.
    pub fn cleanup_old_sessions(&self, retention_days: u32, dry_run: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport {
            deleted: 0,
            total_size_mb: 0.0,
            sessions: Vec::new(),
            dry_run,
        };
        if !self.sessions_dir.is_dir() {
            return Ok(report);
        }

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let mut total_bytes = 0u64;

        for entry in std::fs::read_dir(&self.sessions_dir)?.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(metadata) = read_json::<SessionMetadata>(&path.join(METADATA_FILE)) else {
                continue;
            };
            if metadata.start_time >= cutoff {
                continue;
            }

            let size_bytes = dir_size(&path);
            total_bytes += size_bytes;
            report.sessions.push(CleanupEntry {
                session_id: metadata.session_id.clone(),
                start_time: crate::utils::time::format_iso_millis(&metadata.start_time),
                size_bytes,
            });

            if !dry_run {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!(session_id = %metadata.session_id, error = %e, "Failed to delete session dir");
                    continue;
                }
                self.live.lock().remove(&metadata.session_id);
            }
            report.deleted += 1;
        }

        report.total_size_mb = total_bytes as f64 / (1024.0 * 1024.0);
        info!(
            deleted = report.deleted,
            dry_run,
            retention_days,
            "Session cleanup finished"
        );
        Ok(report)
    }

    /// Startup repair: a session still marked `running` whose recorded pid
    /// is dead and whose log has been quiet past the grace period crashed;
    /// mark it `interrupted`. Returns the repaired session ids.
    pub fn repair_stale_sessions(&self, grace: Duration) -> Result<Vec<String>> {
        if !self.sessions_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut repaired = Vec::new();
        let now = Utc::now();
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::seconds(60));

        for entry in std::fs::read_dir(&self.sessions_dir)?.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata_path = path.join(METADATA_FILE);
            let Ok(mut metadata) = read_json::<SessionMetadata>(&metadata_path) else {
                continue;
            };
            if metadata.status != SessionStatus::Running {
                continue;
            }
            if self.live.lock().contains_key(&metadata.session_id) {
                continue;
            }
            if metadata.pid.map(pid_alive).unwrap_or(false) {
                continue;
            }

            let last_activity = last_activity(&path).unwrap_or(metadata.start_time);
            if now - last_activity < grace {
                continue;
            }

            metadata.status = SessionStatus::Interrupted;
            metadata.end_time = Some(last_activity);
            if let Err(e) = write_json_pretty(&metadata_path, &metadata) {
                warn!(session_id = %metadata.session_id, error = %e, "Repair write failed");
                continue;
            }

            info!(session_id = %metadata.session_id, "Repaired crashed session to interrupted");
            repaired.push(metadata.session_id);
        }

        Ok(repaired)
    }

    pub fn remove_live(&self, session_id: &str) {
        self.live.lock().remove(session_id);
    }

    pub fn cleanup(&self) {
        self.live.lock().clear();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub deleted: usize,
    pub total_size_mb: f64,
    pub sessions: Vec<CleanupEntry>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupEntry {
    pub session_id: String,
    pub start_time: String,
    pub size_bytes: u64,
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}

fn last_activity(session_dir: &Path) -> Option<chrono::DateTime<Utc>> {
    session_dir
        .join(MESSAGES_FILE)
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .map(chrono::DateTime::<Utc>::from)
}

fn pid_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.exists() {
        proc_root.join(pid.to_string()).exists()
    } else {
        // Without /proc there is no cheap liveness check; err on the side
        // of leaving the session alone.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::message::MessagePayload;

    fn manager_in(root: &Path) -> SessionManager {
        let instance_path = root.join("demo");
        std::fs::create_dir_all(&instance_path).unwrap();
        SessionManager::new(
            instance_path,
            RecordingConfig::default(),
            AsyncWriteConfig {
                batch_size: 1,
                flush_interval: 0.05,
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_create_session_writes_layout() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager_in(root.path());

        let session = manager
            .create_session("hello", Map::new(), None)
            .await
            .unwrap();

        let dir = manager.sessions_dir().join(session.session_id());
        assert!(dir.join(METADATA_FILE).exists());

        let metadata = session.metadata();
        assert_eq!(metadata.status, SessionStatus::Running);
        assert_eq!(metadata.depth, 0);
        assert_eq!(metadata.instance_name, "demo");
        assert_eq!(metadata.pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_child_depth_from_parent() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager_in(root.path());

        let parent = manager
            .create_session("parent", Map::new(), None)
            .await
            .unwrap();
        let child = manager
            .create_session("child", Map::new(), Some(parent.session_id()))
            .await
            .unwrap();

        assert_eq!(child.metadata().depth, 1);
        assert_eq!(
            child.metadata().parent_session_id.as_deref(),
            Some(parent.session_id())
        );
    }

    #[tokio::test]
    async fn test_list_sessions_order_and_paging() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager_in(root.path());

        let mut ids = Vec::new();
        for i in 0..3 {
            let session = manager
                .create_session(&format!("prompt {}", i), Map::new(), None)
                .await
                .unwrap();
            ids.push(session.session_id().to_string());
            session.finalize(None).await.ok();
        }

        let listed = manager.list_sessions(None, 100, 0).unwrap();
        assert_eq!(listed.len(), 3);
        // Newest first.
        assert_eq!(listed[0].session_id, ids[2]);

        // Offset past the end is an empty list, not an error.
        assert!(manager.list_sessions(None, 100, 10).unwrap().is_empty());

        let failed = manager
            .list_sessions(Some(SessionStatus::Failed), 100, 0)
            .unwrap();
        assert_eq!(failed.len(), 3);
    }

    #[tokio::test]
    async fn test_resume_appends_without_new_directory() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager_in(root.path());

        let session = manager
            .create_session("q1", Map::new(), None)
            .await
            .unwrap();
        let session_id = session.session_id().to_string();
        session.record_message(MessagePayload::user("q1")).await.unwrap();
        session.finalize(None).await.ok();
        manager.remove_live(&session_id);

        let before = std::fs::read_dir(manager.sessions_dir()).unwrap().count();

        let resumed = manager.resume_session(&session_id).await.unwrap();
        assert_eq!(resumed.metadata().status, SessionStatus::Running);
        resumed
            .record_message(MessagePayload::user("q2"))
            .await
            .unwrap();
        resumed.finalize(None).await.ok();

        let after = std::fs::read_dir(manager.sessions_dir()).unwrap().count();
        assert_eq!(before, after);

        let messages =
            crate::session::read_messages(resumed.session_dir(), None, None).unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_dry_run_then_delete() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager_in(root.path());

        let session = manager
            .create_session("old", Map::new(), None)
            .await
            .unwrap();
        let session_id = session.session_id().to_string();
        session.finalize(None).await.ok();
        manager.remove_live(&session_id);

        // Backdate the metadata so the session falls past retention.
        let metadata_path = manager
            .sessions_dir()
            .join(&session_id)
            .join(METADATA_FILE);
        let mut metadata: SessionMetadata = read_json(&metadata_path).unwrap();
        metadata.start_time = Utc::now() - chrono::Duration::days(90);
        write_json_pretty(&metadata_path, &metadata).unwrap();

        let dry = manager.cleanup_old_sessions(30, true).unwrap();
        assert_eq!(dry.deleted, 1);
        assert!(manager.sessions_dir().join(&session_id).exists());

        let real = manager.cleanup_old_sessions(30, false).unwrap();
        assert_eq!(real.deleted, 1);
        assert!(!manager.sessions_dir().join(&session_id).exists());
    }

    #[tokio::test]
    async fn test_repair_marks_dead_running_session() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager_in(root.path());

        let session = manager
            .create_session("crashed", Map::new(), None)
            .await
            .unwrap();
        let session_id = session.session_id().to_string();
        drop(session);
        manager.remove_live(&session_id);

        // Fake a dead owner and an old log.
        let metadata_path = manager
            .sessions_dir()
            .join(&session_id)
            .join(METADATA_FILE);
        let mut metadata: SessionMetadata = read_json(&metadata_path).unwrap();
        metadata.pid = Some(u32::MAX - 13);
        metadata.start_time = Utc::now() - chrono::Duration::hours(1);
        write_json_pretty(&metadata_path, &metadata).unwrap();

        let repaired = manager
            .repair_stale_sessions(Duration::from_secs(60))
            .unwrap();

        if Path::new("/proc").exists() {
            assert_eq!(repaired, vec![session_id.clone()]);
            let metadata: SessionMetadata = read_json(&metadata_path).unwrap();
            assert_eq!(metadata.status, SessionStatus::Interrupted);
            assert!(metadata.end_time.is_some());
        }
    }
}
