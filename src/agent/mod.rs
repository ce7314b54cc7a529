//! Agent runtime: one instance's turn loop against the external LLM
//! client.

pub mod client;
pub mod runtime;
pub mod stream;

pub use client::{AgentClient, MessageStream, QueryRequest};
pub use runtime::AgentRuntime;
pub use stream::{QueryResult, QueryStream};
