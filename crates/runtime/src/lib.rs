//! Switchboard runtime: tool routing and the model conversation loop.
//!
//! The runtime joins one language model to any number of MCP tool servers.
//!
//! # Overview
//!
//! - **SessionPool**: live connections to tool servers, addressed by
//!   [`SessionHandle`].
//! - **ToolRegistry**: one flat tool namespace that routes each name to the
//!   session serving it.
//! - **Conversation**: the append-only message log, with a bounded window
//!   used for model requests.
//! - **Orchestrator**: runs a query through the model, executes requested
//!   tools, and loops until the model gives a final answer.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use runtime::{Orchestrator, SessionPool, connect_all};
//! use runtime::providers::OpenAiBackend;
//!
//! # async fn example(configs: Vec<mcp::ServerConfig>) -> runtime::Result<()> {
//! let backend = OpenAiBackend::builder("sk-...", "deepseek-chat")
//!     .base_url("https://api.deepseek.com/v1")
//!     .build();
//! let pool = Arc::new(SessionPool::new());
//! let registry = connect_all(&pool, configs).await;
//!
//! let mut orchestrator = Orchestrator::new(backend, Arc::clone(&pool), registry);
//! let answer = orchestrator.ask("Play the second song").await?;
//! println!("{answer}");
//! pool.close_all().await
//! # }
//! ```

mod conversation;
mod error;
pub mod model;
mod orchestrator;
mod pool;
pub mod providers;
mod registry;

#[cfg(test)]
mod testing;

pub use conversation::{Conversation, DEFAULT_WINDOW_SIZE};
pub use error::{Error, Result, TeardownFailure};
pub use model::{
    Arguments, Backend, Completion, CompletionRequest, Message, ModelError, Role, ToolCall,
    ToolDescriptor, ToolOutput, Usage,
};
pub use orchestrator::{Orchestrator, Settings, State, connect_all};
pub use pool::{Channel, Fault, SessionHandle, SessionPool};
pub use registry::{RegisteredTool, ToolRegistry};
