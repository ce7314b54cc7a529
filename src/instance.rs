//! Instance directory resolution.
//!
//! An instance is one configured agent identity: a directory under the
//! instances root holding `config.yaml` and a `sessions/` store.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{RelayError, Result};

pub const SESSIONS_DIR: &str = "sessions";

/// Resolve an instance by name under the instances root, or accept a
/// direct directory path.
pub fn instance_path(instance: &str, instances_root: &Path) -> Result<PathBuf> {
    let direct = Path::new(instance);
    if direct.is_dir() && direct.join(crate::config::instance::CONFIG_FILE).exists() {
        return Ok(direct.to_path_buf());
    }

    let path = instances_root.join(instance);
    if path.is_dir() {
        Ok(path)
    } else {
        Err(RelayError::InstanceNotFound(path))
    }
}

pub fn sessions_dir(instance_path: &Path) -> PathBuf {
    instance_path.join(SESSIONS_DIR)
}

/// Find which instance owns a session by scanning every instance's
/// sessions directory. Sessions can belong to any instance, so tree and
/// query operations use this when a link does not carry the instance name.
pub fn infer_instance_name(session_id: &str, instances_root: &Path) -> Option<String> {
    let entries = match std::fs::read_dir(instances_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %instances_root.display(), error = %e, "Cannot scan instances root");
            return None;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.join(SESSIONS_DIR).join(session_id).is_dir() {
            return entry.file_name().to_str().map(String::from);
        }
    }
    None
}

/// All instance names under the root (directories carrying a config file).
pub fn list_instances(instances_root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(instances_root) else {
        return Vec::new();
    };

    let mut instances: Vec<String> = entries
        .flatten()
        .filter(|entry| {
            entry.path().is_dir()
                && entry
                    .path()
                    .join(crate::config::instance::CONFIG_FILE)
                    .exists()
        })
        .filter_map(|entry| entry.file_name().to_str().map(String::from))
        .collect();
    instances.sort();
    instances
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaffold(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        std::fs::create_dir_all(path.join(SESSIONS_DIR)).unwrap();
        std::fs::write(
            path.join("config.yaml"),
            "agent:\n  name: demo\nmodel: m\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_instance_path_by_name() {
        let root = tempfile::tempdir().unwrap();
        let expected = scaffold(root.path(), "demo");
        assert_eq!(instance_path("demo", root.path()).unwrap(), expected);
        assert!(instance_path("missing", root.path()).is_err());
    }

    #[test]
    fn test_infer_instance_name() {
        let root = tempfile::tempdir().unwrap();
        let demo = scaffold(root.path(), "demo");
        std::fs::create_dir_all(demo.join(SESSIONS_DIR).join("20251216T000000_0000_aa11bb22"))
            .unwrap();

        assert_eq!(
            infer_instance_name("20251216T000000_0000_aa11bb22", root.path()).as_deref(),
            Some("demo")
        );
        assert!(infer_instance_name("20990101T000000_0000_ffffffff", root.path()).is_none());
    }

    #[test]
    fn test_list_instances() {
        let root = tempfile::tempdir().unwrap();
        scaffold(root.path(), "beta");
        scaffold(root.path(), "alpha");
        std::fs::create_dir_all(root.path().join("not_an_instance")).unwrap();

        assert_eq!(list_instances(root.path()), vec!["alpha", "beta"]);
    }
}
