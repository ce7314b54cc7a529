//! Live subscription with automatic child discovery.
//!
//! One task per subscribed session reads that session's messages and
//! system channels from the bus. A `sub_instance_started` system event
//! registers the child and spawns an identical task against it, so a deep
//! tree of sub-instances reports to a single subscriber. A broker failure
//! on one child is logged and does not affect the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::error::{RelayError, Result};
use crate::session::message::{SUB_INSTANCE_STARTED, parse_sub_instance_started};

pub type ParentMessageFn = Box<dyn Fn(Value) + Send + Sync>;
pub type ChildMessageFn = Box<dyn Fn(&str, &str, Value) + Send + Sync>;
pub type ChildStartedFn = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Callback set for one subscription. Child sessions are followed only
/// when a child-message callback is registered.
#[derive(Default)]
pub struct SubscribeCallbacks {
    parent_message: Option<ParentMessageFn>,
    child_message: Option<ChildMessageFn>,
    child_started: Option<ChildStartedFn>,
}

impl SubscribeCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_parent_message(mut self, callback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.parent_message = Some(Box::new(callback));
        self
    }

    pub fn on_child_message(
        mut self,
        callback: impl Fn(&str, &str, Value) + Send + Sync + 'static,
    ) -> Self {
        self.child_message = Some(Box::new(callback));
        self
    }

    pub fn on_child_started(
        mut self,
        callback: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> Self {
        self.child_started = Some(Box::new(callback));
        self
    }
}

pub struct SubscriptionCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    bus: MessageBus,
    root_session_id: String,
    callbacks: SubscribeCallbacks,
    children: DashMap<String, String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    abort_handles: Mutex<Vec<AbortHandle>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl SubscriptionCoordinator {
    pub fn new(bus: MessageBus, session_id: &str, callbacks: SubscribeCallbacks) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                bus,
                root_session_id: session_id.to_string(),
                callbacks,
                children: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
                abort_handles: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.root_session_id
    }

    /// Begin the root subscription. Errors when the bus is unreachable or
    /// the coordinator was already stopped.
    pub fn start(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(RelayError::Bus("subscription already stopped".to_string()));
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            warn!(session_id = %self.inner.root_session_id, "Subscription already running");
            return Ok(());
        }

        info!(session_id = %self.inner.root_session_id, "Starting session subscription");
        CoordinatorInner::spawn_session_task(
            &self.inner,
            self.inner.root_session_id.clone(),
            String::new(),
            true,
        )
    }

    /// Cancel every subscription, parent and all discovered children.
    /// Safe to call from any task, repeatedly, and after bus shutdown.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.running.store(false, Ordering::Release);

        let handles: Vec<AbortHandle> = self.inner.abort_handles.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        info!(
            session_id = %self.inner.root_session_id,
            children = self.inner.children.len(),
            "Stopped session subscription"
        );
    }

    /// Block until every subscription task has completed. Tasks spawned
    /// for children discovered while waiting are awaited too.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let join_all = async {
            loop {
                let drained: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
                if drained.is_empty() {
                    break;
                }
                for task in drained {
                    // Cancelled tasks surface a JoinError; that is the
                    // normal shape of `stop`.
                    let _ = task.await;
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, join_all)
                .await
                .map_err(|_| RelayError::Timeout("subscription wait".to_string())),
            None => {
                join_all.await;
                Ok(())
            }
        }
    }

    /// Children discovered so far: session id -> instance name.
    pub fn child_sessions(&self) -> HashMap<String, String> {
        self.inner
            .children
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire) && !self.inner.stopped.load(Ordering::Acquire)
    }
}

impl CoordinatorInner {
    fn spawn_session_task(
        inner: &Arc<Self>,
        session_id: String,
        instance_name: String,
        is_root: bool,
    ) -> Result<()> {
        let channels = vec![
            inner.bus.messages_channel(&session_id),
            inner.bus.system_channel(&session_id),
        ];
        let subscription = inner.bus.subscribe(&channels)?;

        let task_inner = Arc::clone(inner);
        let task = tokio::spawn(async move {
            let mut subscription = subscription;
            let system_channel = task_inner.bus.system_channel(&session_id);

            debug!(session_id = %session_id, is_root, "Session subscription task started");

            while let Some(event) = subscription.recv().await {
                if task_inner.stopped.load(Ordering::Acquire) {
                    break;
                }

                if event.channel == system_channel {
                    Self::handle_system_event(&task_inner, &event.payload);
                } else if is_root {
                    if let Some(callback) = &task_inner.callbacks.parent_message {
                        callback(event.payload);
                    }
                } else if let Some(callback) = &task_inner.callbacks.child_message {
                    callback(&session_id, &instance_name, event.payload);
                }
            }

            debug!(session_id = %session_id, "Session subscription task ended");
        });

        inner.abort_handles.lock().push(task.abort_handle());
        inner.tasks.lock().push(task);
        Ok(())
    }

    fn handle_system_event(inner: &Arc<Self>, payload: &Value) {
        let subtype = payload
            .get("data")
            .and_then(|data| data.get("subtype"))
            .and_then(Value::as_str);
        if subtype != Some(SUB_INSTANCE_STARTED) {
            return;
        }

        let Some((child_session_id, child_instance)) = parse_sub_instance_started(payload) else {
            warn!("sub_instance_started event without a child session id");
            return;
        };

        if child_session_id == inner.root_session_id
            || inner.children.contains_key(&child_session_id)
        {
            return;
        }

        info!(
            child = %child_session_id,
            instance = %child_instance,
            "Discovered child session"
        );
        inner
            .children
            .insert(child_session_id.clone(), child_instance.clone());

        if let Some(callback) = &inner.callbacks.child_started {
            callback(&child_session_id, &child_instance);
        }

        // Follow the child the same way; its own system channel surfaces
        // grandchildren.
        if inner.callbacks.child_message.is_some() {
            if let Err(e) =
                Self::spawn_session_task(inner, child_session_id.clone(), child_instance, false)
            {
                error!(child = %child_session_id, error = %e, "Failed to subscribe to child session");
            }
        }
    }
}

impl Drop for SubscriptionCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
