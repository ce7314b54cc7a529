//! Scripted agent client: plays back configured turns without an LLM.
//!
//! Scripts are keyed by the request's model id, so each test instance
//! (with its own model string) gets its own behavior. Tool calls invoke
//! the real tool handlers from the composed request, mirroring an SDK's
//! internal tool loop.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use claude_relay::agent::{AgentClient, MessageStream, QueryRequest};
use claude_relay::error::Result;
use claude_relay::session::{ContentBlock, MessagePayload};
use claude_relay::session::message::{ResultPayload, UsagePayload};
use claude_relay::tools::ToolDescriptor;

#[derive(Clone)]
pub enum ScriptStep {
    /// Emit an assistant message with the given text.
    Say(String),
    /// Invoke a tool by name and stream the use/result block pair.
    CallTool { name: String, args: Value },
    /// Emit the terminal result message and end the turn.
    Finish { text: String, is_error: bool },
    /// End the stream without a result message (interrupted turn).
    Hangup,
}

pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Vec<ScriptStep>>>>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
        })
    }

    /// Queue one turn for the given model id. Turns play in FIFO order;
    /// a model with no queued turn falls back to a simple echo.
    pub fn push_script(&self, model: &str, steps: Vec<ScriptStep>) {
        self.scripts
            .lock()
            .entry(model.to_string())
            .or_default()
            .push_back(steps);
    }

    fn next_script(&self, model: &str) -> Vec<ScriptStep> {
        self.scripts
            .lock()
            .get_mut(model)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                vec![
                    ScriptStep::Say("ok".to_string()),
                    ScriptStep::Finish {
                        text: "ok".to_string(),
                        is_error: false,
                    },
                ]
            })
    }
}

#[async_trait]
impl AgentClient for ScriptedClient {
    async fn stream_query(&self, request: QueryRequest) -> Result<MessageStream> {
        let steps = self.next_script(&request.model);
        let model = request.model.clone();
        let tools: HashMap<String, ToolDescriptor> = request
            .tools
            .iter()
            .map(|tool| (tool.name.clone(), tool.clone()))
            .collect();

        // Capacity one: each step waits for the consumer, so tool calls
        // interleave with recording the way a live SDK stream would.
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut num_turns = 0u32;
            for step in steps {
                match step {
                    ScriptStep::Say(text) => {
                        num_turns += 1;
                        let payload =
                            MessagePayload::assistant(&model, vec![ContentBlock::text(text)]);
                        if tx.send(Ok(payload)).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::CallTool { name, args } => {
                        num_turns += 1;
                        let tool_use_id = format!("toolu_{}", uuid::Uuid::new_v4().simple());

                        let use_message = MessagePayload::assistant(
                            &model,
                            vec![ContentBlock::tool_use(&tool_use_id, &name, args.clone())],
                        );
                        if tx.send(Ok(use_message)).await.is_err() {
                            return;
                        }

                        let output = match tools.get(&name) {
                            Some(tool) => match tool.invoke(args).await {
                                Ok(output) => output,
                                Err(e) => {
                                    claude_relay::tools::ToolOutput::error(e.to_string())
                                }
                            },
                            None => claude_relay::tools::ToolOutput::error(format!(
                                "unknown tool: {}",
                                name
                            )),
                        };

                        let result_message = MessagePayload::assistant(
                            &model,
                            vec![ContentBlock::tool_result(
                                &tool_use_id,
                                output.content,
                                output.is_error,
                            )],
                        );
                        if tx.send(Ok(result_message)).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Finish { text, is_error } => {
                        let payload = MessagePayload::ResultMessage(ResultPayload {
                            subtype: (if is_error { "error" } else { "success" }).to_string(),
                            duration_ms: 1200,
                            duration_api_ms: 800,
                            is_error,
                            num_turns,
                            total_cost_usd: 0.0125,
                            usage: UsagePayload {
                                input_tokens: 100,
                                output_tokens: 50,
                            },
                            result: text,
                        });
                        let _ = tx.send(Ok(payload)).await;
                        return;
                    }
                    ScriptStep::Hangup => return,
                }
            }
        });

        Ok(Box::pin(ReceiverStream { rx }))
    }
}

struct ReceiverStream {
    rx: mpsc::Receiver<Result<MessagePayload>>,
}

impl Stream for ReceiverStream {
    type Item = Result<MessagePayload>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
