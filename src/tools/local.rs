//! Locally-defined function tools.
//!
//! An instance declares its local tools in `tools.yaml`; each entry names
//! the source file stem and function it came from, and the exposed tool
//! name derives as `{file}__{function}`. Handlers are plain async closures
//! registered at startup — an explicit registry rather than reflection
//! over a source tree.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::tools::descriptor::{ToolDescriptor, ToolHandler, ToolOutput};

pub const MANIFEST_FILE: &str = "tools.yaml";

pub type LocalToolFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
pub type LocalToolFn = Arc<dyn Fn(Value) -> LocalToolFuture + Send + Sync>;

/// `tools.yaml` — the manifest of an instance's local tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolManifest {
    #[serde(default)]
    pub tools: Vec<ToolManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifestEntry {
    /// Source file stem the function lives in.
    pub file: String,
    /// Function name within the file.
    pub function: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ToolParam>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    /// Declared type: `string`, `integer`, `number`, `boolean`, `array`,
    /// or `object`.
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_param_type() -> String {
    "string".to_string()
}

fn default_true() -> bool {
    true
}

impl ToolManifestEntry {
    pub fn tool_name(&self) -> String {
        format!("{}__{}", self.file, self.function)
    }

    /// JSON Schema inferred from the declared parameter types.
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.params {
            properties.insert(
                param.name.clone(),
                json!({
                    "type": param.param_type,
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

impl ToolManifest {
    pub fn load(instance_path: &Path) -> Result<Self> {
        let path = instance_path.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let manifest: Self = serde_yaml_bw::from_str(&content)?;
        debug!(path = %path.display(), tools = manifest.tools.len(), "Loaded tool manifest");
        Ok(manifest)
    }
}

/// Process-level registry mapping tool names to handler functions.
#[derive(Default, Clone)]
pub struct LocalToolRegistry {
    handlers: HashMap<String, LocalToolFn>,
}

impl LocalToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.handlers.insert(
            name.into(),
            Arc::new(move |args| Box::pin((handler.as_ref())(args)) as LocalToolFuture),
        );
    }

    pub fn get(&self, name: &str) -> Option<LocalToolFn> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct LocalToolHandler {
    name: String,
    function: Option<LocalToolFn>,
}

#[async_trait]
impl ToolHandler for LocalToolHandler {
    async fn invoke(&self, args: Value) -> Result<ToolOutput> {
        let Some(function) = &self.function else {
            // Declared in the manifest but not registered in this process;
            // the out-of-process transport is not ours to run.
            return Ok(ToolOutput::error(format!(
                "tool {} has no registered handler",
                self.name
            )));
        };

        match (function.as_ref())(args).await {
            Ok(value) => {
                let content = match value {
                    Value::String(text) => text,
                    other => serde_json::to_string(&other)?,
                };
                Ok(ToolOutput::text(content))
            }
            Err(RelayError::Tool(message)) => Ok(ToolOutput::error(message)),
            Err(e) => Ok(ToolOutput::error(e.to_string())),
        }
    }
}

/// Build descriptors for every manifest entry, wiring in registered
/// handlers where present.
pub fn load_local_tools(
    instance_path: &Path,
    registry: &LocalToolRegistry,
) -> Result<Vec<ToolDescriptor>> {
    let manifest = ToolManifest::load(instance_path)?;
    let mut tools = Vec::with_capacity(manifest.tools.len());

    for entry in &manifest.tools {
        let name = entry.tool_name();
        let function = registry.get(&name);
        if function.is_none() {
            warn!(tool = %name, "Manifest tool has no registered handler");
        }

        tools.push(ToolDescriptor::new(
            name.clone(),
            entry.description.clone(),
            entry.input_schema(),
            Arc::new(LocalToolHandler { name, function }),
        ));
    }

    if !tools.is_empty() {
        info!(
            instance = %instance_path.display(),
            count = tools.len(),
            "Loaded local tools"
        );
    }
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_yaml() -> &'static str {
        concat!(
            "tools:\n",
            "  - file: calculator\n",
            "    function: add\n",
            "    description: Add two numbers\n",
            "    params:\n",
            "      - name: a\n",
            "        type: number\n",
            "      - name: b\n",
            "        type: number\n",
            "      - name: precision\n",
            "        type: integer\n",
            "        required: false\n",
        )
    }

    #[test]
    fn test_manifest_names_and_schema() {
        let manifest: ToolManifest = serde_yaml_bw::from_str(manifest_yaml()).unwrap();
        let entry = &manifest.tools[0];

        assert_eq!(entry.tool_name(), "calculator__add");

        let schema = entry.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["a"]["type"], "number");
        assert_eq!(schema["required"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_registered_handler_invocation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest_yaml()).unwrap();

        let mut registry = LocalToolRegistry::new();
        registry.register("calculator__add", |args: Value| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(json!(a + b))
        });

        let tools = load_local_tools(dir.path(), &registry).unwrap();
        assert_eq!(tools.len(), 1);

        let output = tools[0].invoke(json!({"a": 1.5, "b": 2.0})).await.unwrap();
        assert!(!output.is_error);
        assert_eq!(output.content, "3.5");
    }

    #[tokio::test]
    async fn test_unregistered_handler_is_error_result() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest_yaml()).unwrap();

        let tools = load_local_tools(dir.path(), &LocalToolRegistry::new()).unwrap();
        let output = tools[0].invoke(json!({})).await.unwrap();
        assert!(output.is_error);
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_error_output() {
        let mut registry = LocalToolRegistry::new();
        registry.register("f__g", |_args| async {
            Err(RelayError::Tool("boom".to_string()))
        });

        let handler = LocalToolHandler {
            name: "f__g".to_string(),
            function: registry.get("f__g"),
        };
        let output = handler.invoke(json!({})).await.unwrap();
        assert!(output.is_error);
        assert_eq!(output.content, "boom");
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tools = load_local_tools(dir.path(), &LocalToolRegistry::new()).unwrap();
        assert!(tools.is_empty());
    }
}
