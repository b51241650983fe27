use std::time::Duration;

use thiserror::Error;

use crate::model::ModelError;

#[derive(Debug, Error)]
pub enum Error {
    /// A session could not be established. Other sessions are unaffected.
    #[error("failed to connect to {server}: {reason}")]
    Connection { server: String, reason: String },

    /// A server answered with something that does not fit the protocol.
    #[error("protocol error from {server}: {reason}")]
    Protocol { server: String, reason: String },

    /// The model asked for a tool that no open session provides.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The remote tool reported a failure.
    #[error("tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The channel to a server is broken; the session is no longer usable.
    #[error("channel to {server} failed: {reason}")]
    Channel { server: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("gave up after {rounds} tool rounds without a final answer")]
    LoopBudgetExceeded { rounds: usize },

    #[error("session {0} is not open")]
    SessionClosed(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("failed to close {} session(s): {}", .0.len(), join_failures(.0))]
    Teardown(Vec<TeardownFailure>),
}

/// One session that could not be closed cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub server: String,
    pub reason: String,
}

fn join_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.server, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Whether this error means the session it came from is dead or gone.
    pub fn is_channel_fault(&self) -> bool {
        matches!(
            self,
            Self::Channel { .. } | Self::Timeout { .. } | Self::SessionClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
