//! Temporary instances-root scaffolding.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

pub struct TestProject {
    root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let project = Self {
            root: TempDir::new().expect("create temp instances root"),
        };
        // Small batches and a fast timer keep test flushes prompt.
        project.write_streaming_config(1, 0.05);
        project
    }

    pub fn instances_root(&self) -> &Path {
        self.root.path()
    }

    pub fn write_streaming_config(&self, batch_size: usize, flush_interval: f64) {
        let content = format!(
            "bus:\n  namespace: test\nasync_write:\n  batch_size: {}\n  flush_interval: {}\n",
            batch_size, flush_interval
        );
        std::fs::write(self.root.path().join("streaming.yaml"), content).unwrap();
    }

    /// Minimal instance: a config with the given model id.
    pub fn add_instance(&self, name: &str, model: &str) -> PathBuf {
        self.add_instance_yaml(
            name,
            &format!("agent:\n  name: {}\nmodel: {}\n", name, model),
        )
    }

    /// Instance that exposes other instances as sub-instance tools.
    pub fn add_instance_with_subs(
        &self,
        name: &str,
        model: &str,
        subs: &[(&str, &str)],
    ) -> PathBuf {
        let mut yaml = format!(
            "agent:\n  name: {}\n  description: {} test agent\nmodel: {}\n",
            name, name, model
        );
        if !subs.is_empty() {
            yaml.push_str("sub_claude_instances:\n");
            for (logical, dir) in subs {
                yaml.push_str(&format!("  {}: {}\n", logical, dir));
            }
        }
        self.add_instance_yaml(name, &yaml)
    }

    pub fn add_instance_yaml(&self, name: &str, config_yaml: &str) -> PathBuf {
        let path = self.root.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("config.yaml"), config_yaml).unwrap();
        path
    }

    pub fn write_tool_manifest(&self, instance: &str, manifest_yaml: &str) {
        std::fs::write(
            self.root.path().join(instance).join("tools.yaml"),
            manifest_yaml,
        )
        .unwrap();
    }

    pub fn session_dir(&self, instance: &str, session_id: &str) -> PathBuf {
        self.root
            .path()
            .join(instance)
            .join("sessions")
            .join(session_id)
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
