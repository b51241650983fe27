//! Minimal Model Context Protocol client.
//!
//! Servers run as child processes and exchange newline-delimited JSON-RPC 2.0
//! over stdin and stdout. One request is in flight per server at a time.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{Server, ServerConfig};
//! use std::collections::HashMap;
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig {
//!     name: "music".to_string(),
//!     command: "python".to_string(),
//!     args: vec!["music_player_server.py".to_string()],
//!     env: HashMap::new(),
//! };
//!
//! let server = Server::spawn(config).await?;
//! server.initialize().await?;
//!
//! for tool in server.list_tools().await? {
//!     println!("{}: {}", tool.name, tool.description.unwrap_or_default());
//! }
//!
//! let result = server
//!     .call_tool("play_music", Some(serde_json::json!({ "index": 2 })))
//!     .await?;
//! println!("{}", result.text());
//!
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod protocol;
mod server;

pub use error::{Error, ErrorClass, Result};
pub use protocol::{
    CallToolParams, CallToolResult, Incoming, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    PROTOCOL_VERSION, RequestId, ServerCapabilities, ServerInfo, Tool, ToolContent,
};
pub use server::{DEFAULT_TIMEOUT, MAX_OUTPUT_SIZE, SHUTDOWN_GRACE, Server, ServerConfig};
