//! Filesystem-mediated session context.
//!
//! A runtime that owns a running session writes a small per-pid file; a
//! tool subprocess spawned by that runtime reads the file for its parent
//! pid and learns the session id to use as `parent_session_id` when it
//! re-enters the runtime — no argument plumbing required.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, session_err_with};
use crate::utils::time::iso_millis;

const CONTEXT_DIR: &str = "claude_relay_sessions";
const STALE_GRACE_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    pub session_id: String,
    pub instance_path: PathBuf,
    pub pid: u32,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

/// Per-process session context. At most one file exists per pid, and only
/// that process writes it.
pub struct SessionContext;

impl SessionContext {
    fn context_dir() -> PathBuf {
        std::env::temp_dir().join(CONTEXT_DIR)
    }

    fn context_file(pid: u32) -> PathBuf {
        Self::context_dir().join(format!("session_context_{}.json", pid))
    }

    /// Record the current process's active session. The write is atomic
    /// (temp file + rename) so a concurrent reader never sees a torn file.
    pub fn set(session_id: &str, instance_path: &Path) -> Result<()> {
        let pid = std::process::id();
        let record = ContextRecord {
            session_id: session_id.to_string(),
            instance_path: instance_path.to_path_buf(),
            pid,
            timestamp: Utc::now(),
        };

        let dir = Self::context_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| session_err_with("Cannot create context dir", e))?;

        let target = Self::context_file(pid);
        let temp = dir.join(format!("session_context_{}.json.tmp", pid));
        std::fs::write(&temp, serde_json::to_string(&record)?)
            .map_err(|e| session_err_with("Cannot write context file", e))?;
        std::fs::rename(&temp, &target)
            .map_err(|e| session_err_with("Cannot publish context file", e))?;

        debug!(session_id, pid, "Set session context");
        Ok(())
    }

    /// Read the context for a given pid. Absent or unreadable means no
    /// current session.
    pub fn get(pid: u32) -> Option<ContextRecord> {
        let path = Self::context_file(pid);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(pid, error = %e, "Ignoring malformed session context file");
                None
            }
        }
    }

    /// Session id recorded for the current process, if any.
    pub fn current() -> Option<String> {
        Self::get(std::process::id()).map(|record| record.session_id)
    }

    /// Remove the current process's context file. A no-op when the file is
    /// already gone.
    pub fn clear() {
        Self::clear_pid(std::process::id());
    }

    pub fn clear_pid(pid: u32) {
        let path = Self::context_file(pid);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(pid, "Cleared session context"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(pid, error = %e, "Failed to clear session context"),
        }
    }

    /// Startup sweep: remove context files left behind by processes that no
    /// longer exist. Returns the number of files removed.
    pub fn cleanup_all() -> usize {
        let dir = Self::context_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return 0;
        };

        let own_pid = std::process::id();
        let mut removed = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(pid) = parse_context_pid(&path) else {
                continue;
            };
            if pid == own_pid || !is_stale(pid, &path) {
                continue;
            }
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Removed stale session context files");
        }
        removed
    }
}

fn parse_context_pid(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let pid = name
        .strip_prefix("session_context_")?
        .strip_suffix(".json")?;
    pid.parse().ok()
}

/// A context file is stale when its pid is provably dead, or — where
/// liveness cannot be checked — when it has outlived the grace period.
fn is_stale(pid: u32, path: &Path) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.exists() {
        return !proc_root.join(pid.to_string()).exists();
    }

    match path.metadata().and_then(|m| m.modified()) {
        Ok(modified) => {
            let age = Utc::now() - DateTime::<Utc>::from(modified);
            age > chrono::Duration::hours(STALE_GRACE_HOURS)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_clear_roundtrip() {
        let session_id = crate::session::generate_session_id();
        SessionContext::set(&session_id, Path::new("/tmp/instances/demo")).unwrap();

        assert_eq!(SessionContext::current().as_deref(), Some(session_id.as_str()));
        let record = SessionContext::get(std::process::id()).unwrap();
        assert_eq!(record.instance_path, PathBuf::from("/tmp/instances/demo"));

        SessionContext::clear();
        assert!(SessionContext::current().is_none());

        // Clearing again is a no-op.
        SessionContext::clear();
    }

    #[test]
    fn test_get_unknown_pid() {
        assert!(SessionContext::get(u32::MAX - 7).is_none());
    }

    #[test]
    fn test_cleanup_removes_dead_pid_files() {
        let dir = SessionContext::context_dir();
        std::fs::create_dir_all(&dir).unwrap();

        // A pid far outside the valid range is never alive.
        let dead_pid = u32::MAX - 11;
        let path = dir.join(format!("session_context_{}.json", dead_pid));
        let record = ContextRecord {
            session_id: "s1".to_string(),
            instance_path: PathBuf::from("/tmp"),
            pid: dead_pid,
            timestamp: Utc::now() - chrono::Duration::days(2),
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        if Path::new("/proc").exists() {
            SessionContext::cleanup_all();
            assert!(!path.exists());
        } else {
            // Age-based fallback needs an old mtime, which we cannot set
            // portably; just confirm the sweep leaves fresh files alone.
            SessionContext::cleanup_all();
            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn test_parse_context_pid() {
        assert_eq!(
            parse_context_pid(Path::new("/tmp/x/session_context_123.json")),
            Some(123)
        );
        assert!(parse_context_pid(Path::new("/tmp/x/other.json")).is_none());
    }
}
