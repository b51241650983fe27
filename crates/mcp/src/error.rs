//! MCP error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error on server pipe: {0}")]
    Io(#[from] std::io::Error),

    #[error("server not initialized")]
    NotInitialized,

    #[error("server exited unexpectedly")]
    ServerExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("malformed message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("tool call failed: {0}")]
    ToolCallFailed(String),

    #[error("output too large: {size} bytes (max {max})")]
    OutputTooLarge { size: usize, max: usize },
}

/// Which side of the conversation an [`Error`] is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The pipe to the server is broken or unresponsive.
    Transport,
    /// The server answered, but not with something we can use.
    Protocol,
    /// The server reported a failure of the requested operation.
    Remote,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::ServerExited | Self::Timeout | Self::NotInitialized => {
                ErrorClass::Transport
            }
            Self::Serialize(_) | Self::InvalidResponse(_) | Self::OutputTooLarge { .. } => {
                ErrorClass::Protocol
            }
            Self::JsonRpc(_) | Self::ToolCallFailed(_) => ErrorClass::Remote,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
