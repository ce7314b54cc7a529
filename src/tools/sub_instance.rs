//! Sub-instance tools: another configured instance exposed as one tool.
//!
//! Invoking the tool runs a full agent turn on the child instance and
//! returns its text result. The child's session links back to the caller
//! through `parent_session_id`, taken from the tool arguments or — on the
//! subprocess path — from the process session context.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::agent::client::AgentClient;
use crate::agent::runtime::AgentRuntime;
use crate::bus::MessageBus;
use crate::config::InstanceConfig;
use crate::error::Result;
use crate::session::context::SessionContext;
use crate::session::manager::SessionManager;
use crate::tools::descriptor::{ToolDescriptor, ToolHandler, ToolOutput};
use crate::tools::local::LocalToolRegistry;

pub const TOOL_NAME_PREFIX: &str = "sub_claude_";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubInstanceArgs {
    /// The prompt forwarded to the child instance.
    pub task: String,
    /// Linkage key; the child session's `parent_session_id`. Falls back
    /// to the process session context when omitted.
    #[serde(default)]
    pub parent_session_id: Option<String>,
    /// File paths the child should read, forwarded verbatim.
    #[serde(default)]
    pub context_files: Option<Vec<String>>,
    /// Formatting hint forwarded to the child.
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
    /// Resume an existing child session instead of creating a new one.
    #[serde(default)]
    pub resume_session_id: Option<String>,
    /// Free-form key/values forwarded in the child prompt.
    #[serde(default)]
    pub variables: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
    Markdown,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Markdown => write!(f, "markdown"),
        }
    }
}

pub struct SubInstanceTool {
    logical_name: String,
    instance_path: PathBuf,
    instances_root: PathBuf,
    client: Arc<dyn AgentClient>,
    bus: Option<MessageBus>,
    local_registry: LocalToolRegistry,
    parent_manager: Arc<SessionManager>,
    child_runtime: OnceCell<Arc<AgentRuntime>>,
}

impl SubInstanceTool {
    pub fn tool_name(&self) -> String {
        format!("{}{}", TOOL_NAME_PREFIX, self.logical_name)
    }

    fn instance_name(&self) -> &str {
        self.instance_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.logical_name)
    }

    /// The child runtime is materialized on first use and reused after.
    async fn runtime(&self) -> Result<Arc<AgentRuntime>> {
        let runtime = self
            .child_runtime
            .get_or_try_init(|| async {
                let runtime = Arc::new(
                    AgentRuntime::new(
                        &self.instance_path.to_string_lossy(),
                        &self.instances_root,
                        Arc::clone(&self.client),
                    )?
                    .with_bus(self.bus.clone())
                    .with_local_tools(self.local_registry.clone()),
                );
                runtime.initialize().await?;
                Ok::<_, crate::error::RelayError>(runtime)
            })
            .await?;
        Ok(Arc::clone(runtime))
    }

    fn compose_prompt(&self, args: &SubInstanceArgs) -> String {
        let mut parts = vec![args.task.clone()];

        if let Some(files) = &args.context_files {
            if !files.is_empty() {
                let mut section = String::from("\nRelevant files:\n");
                for file in files {
                    section.push_str(&format!("- {}\n", file));
                }
                parts.push(section);
            }
        }

        if let Some(format) = args.output_format {
            if format != OutputFormat::Text {
                parts.push(format!("\nRespond in {} format.", format));
            }
        }

        if let Some(variables) = &args.variables {
            if !variables.is_empty() {
                let mut section = String::from("\nVariables:\n");
                for (key, value) in variables {
                    section.push_str(&format!("- {}: {}\n", key, value));
                }
                parts.push(section);
            }
        }

        parts.join("\n")
    }
}

#[async_trait]
impl ToolHandler for SubInstanceTool {
    async fn invoke(&self, args: Value) -> Result<ToolOutput> {
        let args: SubInstanceArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return Ok(ToolOutput::error(format!("invalid arguments: {}", e))),
        };

        let parent_session_id = match args
            .parent_session_id
            .clone()
            .or_else(SessionContext::current)
        {
            Some(parent_id) => parent_id,
            None => {
                return Ok(ToolOutput::error(
                    "no parent_session_id given and no session context found",
                ));
            }
        };

        let runtime = match self.runtime().await {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(instance = %self.logical_name, error = %e, "Sub-instance runtime unavailable");
                return Ok(ToolOutput::error(format!(
                    "sub-instance {} failed to initialize: {}",
                    self.logical_name, e
                )));
            }
        };

        let prompt = self.compose_prompt(&args);
        info!(
            instance = %self.logical_name,
            parent = %parent_session_id,
            resume = args.resume_session_id.as_deref().unwrap_or("-"),
            "Invoking sub-instance"
        );

        let result = runtime
            .query_text(
                &prompt,
                true,
                args.resume_session_id.as_deref(),
                Some(&parent_session_id),
            )
            .await;

        match result {
            Ok(query_result) => {
                let mut content = query_result.result;
                if let Some(child_session_id) = &query_result.session_id {
                    // Link the child into the caller's statistics; the
                    // recorder fills in the tool_use id when the result
                    // block flows back through the parent's stream.
                    if let Ok(parent) = self.parent_manager.get_session(&parent_session_id) {
                        parent.append_subsession_link(
                            child_session_id,
                            &self.tool_name(),
                            "",
                            self.instance_name(),
                            None,
                        );
                    }
                    content.push_str(&format!("\n<!--SESSION_ID:{}-->", child_session_id));
                }

                let mut output = ToolOutput::text(content);
                output.session_id = query_result.session_id;
                Ok(output)
            }
            Err(e) => {
                warn!(instance = %self.logical_name, error = %e, "Sub-instance query failed");
                Ok(ToolOutput::error(format!(
                    "sub-instance {} failed: {}",
                    self.logical_name, e
                )))
            }
        }
    }
}

/// Build one tool per configured sub-instance. Entries whose directory is
/// missing are skipped with a warning rather than failing initialization.
pub fn create_sub_instance_tools(
    instances_config: &BTreeMap<String, String>,
    instances_root: &Path,
    client: Arc<dyn AgentClient>,
    bus: Option<MessageBus>,
    local_registry: LocalToolRegistry,
    parent_manager: Arc<SessionManager>,
) -> Vec<ToolDescriptor> {
    let mut tools = Vec::new();

    for (logical_name, relative_path) in instances_config {
        let instance_path = instances_root.join(relative_path);
        if !instance_path.is_dir() {
            warn!(
                instance = %logical_name,
                path = %instance_path.display(),
                "Sub-instance directory missing, skipping"
            );
            continue;
        }

        let description = InstanceConfig::load(&instance_path)
            .ok()
            .and_then(|config| config.agent.description)
            .unwrap_or_else(|| format!("Invoke the {} sub-instance", logical_name));

        let tool = SubInstanceTool {
            logical_name: logical_name.clone(),
            instance_path,
            instances_root: instances_root.to_path_buf(),
            client: Arc::clone(&client),
            bus: bus.clone(),
            local_registry: local_registry.clone(),
            parent_manager: Arc::clone(&parent_manager),
            child_runtime: OnceCell::new(),
        };

        let input_schema =
            serde_json::to_value(schemars::schema_for!(SubInstanceArgs)).unwrap_or_default();

        tools.push(ToolDescriptor::new(
            tool.tool_name(),
            description,
            input_schema,
            Arc::new(tool),
        ));
    }

    if !tools.is_empty() {
        info!(count = tools.len(), "Created sub-instance tools");
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_with_defaults() {
        let args: SubInstanceArgs =
            serde_json::from_value(serde_json::json!({"task": "review code.py"})).unwrap();
        assert_eq!(args.task, "review code.py");
        assert!(args.parent_session_id.is_none());
        assert!(args.output_format.is_none());
    }

    #[test]
    fn test_args_schema_lists_fields() {
        let schema = serde_json::to_value(schemars::schema_for!(SubInstanceArgs)).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        for field in [
            "task",
            "parent_session_id",
            "context_files",
            "output_format",
            "resume_session_id",
            "variables",
        ] {
            assert!(properties.contains_key(field), "missing field {}", field);
        }
        assert_eq!(schema["required"], serde_json::json!(["task"]));
    }

    #[test]
    fn test_prompt_composition() {
        let tool_args = SubInstanceArgs {
            task: "analyze".to_string(),
            parent_session_id: None,
            context_files: Some(vec!["src/lib.rs".to_string()]),
            output_format: Some(OutputFormat::Json),
            resume_session_id: None,
            variables: Some(BTreeMap::from([(
                "focus".to_string(),
                Value::String("errors".to_string()),
            )])),
        };

        let tool = SubInstanceTool {
            logical_name: "analyzer".to_string(),
            instance_path: PathBuf::from("/tmp/instances/analyzer_agent"),
            instances_root: PathBuf::from("/tmp/instances"),
            client: Arc::new(NoopClient),
            bus: None,
            local_registry: LocalToolRegistry::new(),
            parent_manager: Arc::new(SessionManager::new(
                PathBuf::from("/tmp/instances/parent"),
                Default::default(),
                Default::default(),
                None,
            )),
            child_runtime: OnceCell::new(),
        };

        let prompt = tool.compose_prompt(&tool_args);
        assert!(prompt.starts_with("analyze"));
        assert!(prompt.contains("- src/lib.rs"));
        assert!(prompt.contains("json format"));
        assert!(prompt.contains("- focus: \"errors\""));
        assert_eq!(tool.tool_name(), "sub_claude_analyzer");
    }

    struct NoopClient;

    #[async_trait]
    impl AgentClient for NoopClient {
        async fn stream_query(
            &self,
            _request: crate::agent::client::QueryRequest,
        ) -> Result<crate::agent::client::MessageStream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }
}
