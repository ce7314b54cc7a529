//! One instance's agent runtime.
//!
//! Owns the composed tool list, the session manager, and the turn loop:
//! resolve a session, expose it through the process session context,
//! announce child linkage, then stream the client's messages through the
//! session recorder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Map;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::agent::client::{AgentClient, QueryRequest};
use crate::agent::stream::{QueryResult, QueryStream};
use crate::bus::MessageBus;
use crate::config::{InstanceConfig, StreamingConfig};
use crate::error::{RelayError, Result};
use crate::instance;
use crate::session::context::SessionContext;
use crate::session::manager::{REPAIR_GRACE, SessionManager};
use crate::session::message::{MessagePayload, RecordedMessage};
use crate::session::session::Session;
use crate::tools::local::{LocalToolRegistry, load_local_tools};
use crate::tools::sub_instance::create_sub_instance_tools;
use crate::tools::ToolDescriptor;

pub struct AgentRuntime {
    instance_path: PathBuf,
    instances_root: PathBuf,
    instance_name: String,
    client: Arc<dyn AgentClient>,
    bus: Option<MessageBus>,
    local_registry: LocalToolRegistry,
    state: OnceCell<Initialized>,
}

struct Initialized {
    config: InstanceConfig,
    system_prompt: Option<String>,
    tools: Vec<ToolDescriptor>,
    session_manager: Arc<SessionManager>,
}

impl AgentRuntime {
    /// Resolve the instance directory; `instance` is a name under
    /// `instances_root` or a direct path.
    pub fn new(
        instance: &str,
        instances_root: &Path,
        client: Arc<dyn AgentClient>,
    ) -> Result<Self> {
        let instance_path = instance::instance_path(instance, instances_root)?;
        let instance_name = instance_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(instance)
            .to_string();
        let instances_root = instance_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| instances_root.to_path_buf());

        Ok(Self {
            instance_path,
            instances_root,
            instance_name,
            client,
            bus: None,
            local_registry: LocalToolRegistry::new(),
            state: OnceCell::new(),
        })
    }

    /// Attach a message bus. Sub-instances share the parent's bus, so one
    /// subscriber sees the whole tree.
    pub fn with_bus(mut self, bus: Option<MessageBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Register handlers for this instance's local tools.
    pub fn with_local_tools(mut self, registry: LocalToolRegistry) -> Self {
        self.local_registry = registry;
        self
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn instance_path(&self) -> &Path {
        &self.instance_path
    }

    pub fn bus(&self) -> Option<&MessageBus> {
        self.bus.as_ref()
    }

    /// Load configuration, compose the tool list, and prepare the session
    /// store. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        self.state
            .get_or_try_init(|| self.build_state())
            .await
            .map(|_| ())
    }

    async fn build_state(&self) -> Result<Initialized> {
        info!(instance = %self.instance_name, "Initializing agent runtime");

        let config = InstanceConfig::load(&self.instance_path)?;
        let system_prompt = config.system_prompt(&self.instance_path)?;
        let streaming = StreamingConfig::resolve(&self.instances_root);

        // Sweep contexts left by dead processes before this runtime
        // starts writing its own.
        SessionContext::cleanup_all();

        let session_manager = Arc::new(SessionManager::new(
            self.instance_path.clone(),
            config.session_recording.clone(),
            streaming.async_write.clone(),
            self.bus.clone(),
        ));

        match session_manager.repair_stale_sessions(REPAIR_GRACE) {
            Ok(repaired) if !repaired.is_empty() => {
                info!(count = repaired.len(), "Repaired crashed sessions");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Session repair pass failed"),
        }

        if config.session_recording.auto_cleanup {
            let retention = config.session_recording.retention_days;
            match session_manager.cleanup_old_sessions(retention, false) {
                Ok(report) if report.deleted > 0 => {
                    info!(deleted = report.deleted, retention, "Expired old sessions");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Retention cleanup failed"),
            }
        }

        let mut tools = load_local_tools(&self.instance_path, &self.local_registry)?;
        tools.extend(create_sub_instance_tools(
            &config.sub_claude_instances,
            &self.instances_root,
            Arc::clone(&self.client),
            self.bus.clone(),
            self.local_registry.clone(),
            Arc::clone(&session_manager),
        ));

        let before = tools.len();
        tools.retain(|tool| config.tool_permitted(&tool.name));
        if tools.len() < before {
            debug!(
                filtered = before - tools.len(),
                "Tools removed by allow/deny patterns"
            );
        }

        info!(
            instance = %self.instance_name,
            tools = tools.len(),
            sub_instances = config.sub_claude_instances.len(),
            "Agent runtime initialized"
        );

        Ok(Initialized {
            config,
            system_prompt,
            tools,
            session_manager,
        })
    }

    fn initialized(&self) -> Result<&Initialized> {
        self.state
            .get()
            .ok_or_else(|| RelayError::Agent("runtime not initialized".to_string()))
    }

    pub fn session_manager(&self) -> Result<Arc<SessionManager>> {
        Ok(Arc::clone(&self.initialized()?.session_manager))
    }

    pub fn tools(&self) -> Result<&[ToolDescriptor]> {
        Ok(&self.initialized()?.tools)
    }

    /// Run one agent turn, returning the message stream. Messages are
    /// recorded as the caller consumes them; the terminal result message
    /// finalizes the session.
    pub async fn query(
        &self,
        prompt: &str,
        record_session: bool,
        resume_session_id: Option<&str>,
        parent_session_id: Option<&str>,
    ) -> Result<QueryStream> {
        let state = self.initialized()?;
        let manager = &state.session_manager;

        let session: Option<Arc<Session>> =
            if record_session && state.config.session_recording.enabled {
                let session = match resume_session_id {
                    Some(resume_id) => manager.resume_session(resume_id).await?,
                    None => {
                        manager
                            .create_session(prompt, Map::new(), parent_session_id)
                            .await?
                    }
                };
                Some(session)
            } else {
                None
            };

        let previous_context = session
            .is_some()
            .then(|| SessionContext::get(std::process::id()))
            .flatten();

        if let Some(session) = &session {
            // Must land before any tool subprocess spawns, so a re-entrant
            // child can find its parent session id.
            SessionContext::set(session.session_id(), &self.instance_path)?;

            if let (Some(parent_id), Some(bus)) = (parent_session_id, &self.bus) {
                self.announce_child(bus, parent_id, session.session_id());
            }
        }

        let request = QueryRequest {
            prompt: prompt.to_string(),
            model: state.config.model.clone(),
            system_prompt: state.system_prompt.clone(),
            tools: state.tools.clone(),
            permission_mode: state.config.advanced.permission_mode,
            max_turns: state.config.advanced.max_turns,
            env: state.config.advanced.env.clone(),
            resume_session_id: resume_session_id.map(String::from),
        };

        let stream = match self.client.stream_query(request).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(session) = &session {
                    let _ = session.finalize(None).await;
                    crate::agent::stream::restore_context(previous_context.as_ref());
                    manager.remove_live(session.session_id());
                }
                return Err(e);
            }
        };

        Ok(QueryStream::new(
            stream,
            session,
            Arc::clone(manager),
            previous_context,
        ))
    }

    /// Convenience wrapper: run a turn to completion and hand back the
    /// assembled text.
    pub async fn query_text(
        &self,
        prompt: &str,
        record_session: bool,
        resume_session_id: Option<&str>,
        parent_session_id: Option<&str>,
    ) -> Result<QueryResult> {
        let mut stream = self
            .query(prompt, record_session, resume_session_id, parent_session_id)
            .await?;
        stream.collect_text().await
    }

    /// Announce this child session on the parent's system channel so live
    /// subscribers discover it. Published once per child turn, here.
    fn announce_child(&self, bus: &MessageBus, parent_session_id: &str, child_session_id: &str) {
        let event = RecordedMessage::now(MessagePayload::sub_instance_started(
            &self.instance_name,
            child_session_id,
        ));
        match serde_json::to_value(&event) {
            Ok(payload) => {
                bus.publish(&bus.system_channel(parent_session_id), payload);
                debug!(
                    parent = parent_session_id,
                    child = child_session_id,
                    "Announced sub-instance start"
                );
            }
            Err(e) => warn!(error = %e, "Failed to encode sub_instance_started event"),
        }
    }

    /// Release runtime resources: live session handles and, when this
    /// runtime owns the bus, the bus itself is left to the caller that
    /// created it.
    pub fn cleanup(&self) {
        if let Some(state) = self.state.get() {
            state.session_manager.cleanup();
        }
        debug!(instance = %self.instance_name, "Agent runtime cleaned up");
    }
}
