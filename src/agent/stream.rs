//! Query stream lifecycle.
//!
//! Wraps the client's message stream and drives the session through
//! recording and finalization: every message is recorded, the terminal
//! `ResultMessage` finalizes exactly once, and a stream that ends or is
//! cancelled without a result still leaves the session in a terminal
//! state with the process's session context cleared.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::agent::client::MessageStream;
use crate::error::Result;
use crate::session::context::{ContextRecord, SessionContext};
use crate::session::manager::SessionManager;
use crate::session::message::MessagePayload;
use crate::session::session::Session;

/// Final outcome of one query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub result: String,
    pub session_id: Option<String>,
}

pub struct QueryStream {
    stream: MessageStream,
    session: Option<Arc<Session>>,
    manager: Arc<SessionManager>,
    /// Session context that was current before this turn; restored when
    /// the turn ends so a nested sub-instance call does not erase its
    /// caller's context.
    previous_context: Option<ContextRecord>,
    saw_result: bool,
    done: bool,
}

impl QueryStream {
    pub(crate) fn new(
        stream: MessageStream,
        session: Option<Arc<Session>>,
        manager: Arc<SessionManager>,
        previous_context: Option<ContextRecord>,
    ) -> Self {
        Self {
            stream,
            session,
            manager,
            previous_context,
            saw_result: false,
            done: false,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref().map(Session::session_id)
    }

    /// Pull the next message, recording it as a side effect. Returns
    /// `Ok(None)` at end of turn.
    pub async fn next_message(&mut self) -> Result<Option<MessagePayload>> {
        if self.done {
            return Ok(None);
        }

        match self.stream.next().await {
            Some(Ok(payload)) => {
                if let Some(session) = &self.session {
                    if let Err(e) = session.record_message(payload.clone()).await {
                        warn!(session_id = %session.session_id(), error = %e, "Failed to record message");
                    }
                }

                if let Some(result) = payload.as_result() {
                    self.saw_result = true;
                    if let Some(session) = &self.session {
                        if let Err(e) = session.finalize(Some(result)).await {
                            warn!(session_id = %session.session_id(), error = %e, "Finalize failed");
                        }
                    }
                    self.release();
                }
                Ok(Some(payload))
            }
            Some(Err(e)) => {
                self.done = true;
                if let Some(session) = &self.session {
                    if let Err(finalize_err) = session.finalize(None).await {
                        warn!(session_id = %session.session_id(), error = %finalize_err, "Finalize after stream error failed");
                    }
                }
                self.release();
                Err(e)
            }
            None => {
                self.done = true;
                if !self.saw_result {
                    if let Some(session) = &self.session {
                        debug!(session_id = %session.session_id(), "Stream ended without a result message");
                        if let Err(e) = session.finalize(None).await {
                            warn!(session_id = %session.session_id(), error = %e, "Finalize at stream end failed");
                        }
                    }
                    self.release();
                }
                Ok(None)
            }
        }
    }

    /// Cooperative cancellation: stop consuming, finalize the session as
    /// `interrupted`, and release the process's session context.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        if let Some(session) = &self.session {
            session.finalize_interrupted().await?;
        }
        self.release();
        Ok(())
    }

    /// Drain the stream, assembling the final text result.
    pub async fn collect_text(&mut self) -> Result<QueryResult> {
        let mut parts: Vec<String> = Vec::new();

        while let Some(payload) = self.next_message().await? {
            for text in payload.text_parts() {
                parts.push(text.to_string());
            }
            if let Some(result) = payload.as_result() {
                if !result.result.is_empty() {
                    parts.push(result.result.clone());
                }
            }
        }

        Ok(QueryResult {
            result: parts.join("\n"),
            session_id: self.session_id().map(String::from),
        })
    }

    fn release(&self) {
        if let Some(session) = &self.session {
            restore_context(self.previous_context.as_ref());
            self.manager.remove_live(session.session_id());
        }
    }
}

/// Put back the caller's context, or clear the slot for a root turn.
pub(crate) fn restore_context(previous: Option<&ContextRecord>) {
    match previous {
        Some(record) => {
            if let Err(e) = SessionContext::set(&record.session_id, &record.instance_path) {
                warn!(error = %e, "Failed to restore previous session context");
            }
        }
        None => SessionContext::clear(),
    }
}
