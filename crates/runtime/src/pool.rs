//! Live tool-server sessions.
//!
//! The pool owns one request/response [`Channel`] per connected server and
//! exposes discovery and invocation against a [`SessionHandle`]. Calls to
//! different sessions run concurrently; calls to the same session are
//! serialized because a channel carries one exchange at a time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mcp::{ErrorClass, Server, ServerConfig};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::TeardownFailure;
use crate::model::{Arguments, ToolCall, ToolDescriptor, ToolOutput};
use crate::{Error, Result};

/// Opaque reference to one connected tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// How a channel operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The pipe is broken or unresponsive.
    Transport(String),
    /// The reply could not be understood.
    Protocol(String),
    /// The server reported that the operation itself failed.
    Remote(String),
}

impl From<mcp::Error> for Fault {
    fn from(e: mcp::Error) -> Self {
        // Remote failures carry the server's own words, unwrapped.
        match e {
            mcp::Error::ToolCallFailed(message) => return Self::Remote(message),
            mcp::Error::JsonRpc(error) => return Self::Remote(error.message),
            _ => {}
        }
        let reason = e.to_string();
        match e.class() {
            ErrorClass::Transport => Self::Transport(reason),
            ErrorClass::Protocol => Self::Protocol(reason),
            ErrorClass::Remote => Self::Remote(reason),
        }
    }
}

/// A request/response channel to one tool server.
pub trait Channel: Send + Sync + 'static {
    fn list_tools(
        &self,
    ) -> impl Future<Output = std::result::Result<Vec<ToolDescriptor>, Fault>> + Send;

    /// Run a tool and return its rendered content.
    fn call_tool(
        &self,
        name: &str,
        arguments: Arguments,
    ) -> impl Future<Output = std::result::Result<String, Fault>> + Send;

    fn close(&self) -> impl Future<Output = std::result::Result<(), Fault>> + Send;
}

impl From<mcp::Tool> for ToolDescriptor {
    fn from(tool: mcp::Tool) -> Self {
        Self {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema,
        }
    }
}

impl Channel for Server {
    async fn list_tools(&self) -> std::result::Result<Vec<ToolDescriptor>, Fault> {
        let tools = Server::list_tools(self).await?;
        Ok(tools.into_iter().map(ToolDescriptor::from).collect())
    }

    async fn call_tool(&self, name: &str, arguments: Arguments) -> std::result::Result<String, Fault> {
        let arguments = (!arguments.is_empty()).then(|| serde_json::Value::Object(arguments));
        let result = Server::call_tool(self, name, arguments).await?;
        Ok(result.text())
    }

    async fn close(&self) -> std::result::Result<(), Fault> {
        Ok(self.shutdown().await?)
    }
}

struct Session<C> {
    name: String,
    channel: C,
    /// Held for the duration of one exchange.
    pipeline: Mutex<()>,
}

/// The set of open sessions.
pub struct SessionPool<C> {
    sessions: RwLock<HashMap<SessionHandle, Arc<Session<C>>>>,
    next_id: AtomicU64,
}

impl<C> Default for SessionPool<C> {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl SessionPool<Server> {
    /// Spawn a server, complete the handshake and add it to the pool.
    pub async fn connect(&self, config: ServerConfig) -> Result<SessionHandle> {
        let name = config.name.clone();
        info!(server = %name, command = %config.command, args = ?config.args, "connecting");

        let server = Server::spawn(config).await.map_err(|e| Error::Connection {
            server: name.clone(),
            reason: e.to_string(),
        })?;

        if let Err(e) = server.initialize().await {
            if let Err(close) = server.shutdown().await {
                debug!(server = %name, error = %close, "cleanup after failed handshake");
            }
            return Err(Error::Connection {
                server: name,
                reason: e.to_string(),
            });
        }

        Ok(self.attach(name, server).await)
    }
}

impl<C: Channel> SessionPool<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an already-open channel.
    pub async fn attach(&self, name: impl Into<String>, channel: C) -> SessionHandle {
        let handle = SessionHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(Session {
            name: name.into(),
            channel,
            pipeline: Mutex::new(()),
        });
        debug!(server = %session.name, %handle, "session attached");
        self.sessions.write().await.insert(handle, session);
        handle
    }

    pub async fn discover_tools(&self, handle: SessionHandle) -> Result<Vec<ToolDescriptor>> {
        let session = self.session(handle).await?;
        let _turn = session.pipeline.lock().await;
        session.channel.list_tools().await.map_err(|fault| match fault {
            Fault::Transport(reason) => Error::Channel {
                server: session.name.clone(),
                reason,
            },
            Fault::Protocol(reason) | Fault::Remote(reason) => Error::Protocol {
                server: session.name.clone(),
                reason,
            },
        })
    }

    /// Run one tool call on `handle` and pair the result with the call's id.
    pub async fn invoke(&self, handle: SessionHandle, call: &ToolCall) -> Result<ToolOutput> {
        let session = self.session(handle).await?;
        let _turn = session.pipeline.lock().await;
        match session
            .channel
            .call_tool(&call.name, call.arguments.clone())
            .await
        {
            Ok(content) => Ok(ToolOutput::success(&call.id, content)),
            Err(Fault::Remote(message)) => Err(Error::ToolExecution {
                tool: call.name.clone(),
                message,
            }),
            Err(Fault::Protocol(reason)) => Err(Error::Protocol {
                server: session.name.clone(),
                reason,
            }),
            Err(Fault::Transport(reason)) => Err(Error::Channel {
                server: session.name.clone(),
                reason,
            }),
        }
    }

    /// Remove a session so nothing routes to it again, closing it best-effort.
    ///
    /// Returns the session's name if it was still open.
    pub async fn evict(&self, handle: SessionHandle) -> Option<String> {
        let session = self.sessions.write().await.remove(&handle)?;
        warn!(server = %session.name, %handle, "evicting session");
        if let Err(fault) = session.channel.close().await {
            debug!(server = %session.name, ?fault, "close after eviction failed");
        }
        Some(session.name.clone())
    }

    /// Close every session.
    ///
    /// Every close is attempted; failures are gathered into
    /// [`Error::Teardown`].
    pub async fn close_all(&self) -> Result<()> {
        let mut drained: Vec<_> = self.sessions.write().await.drain().collect();
        drained.sort_by_key(|(handle, _)| *handle);

        let mut failures = Vec::new();
        for (handle, session) in drained {
            match session.channel.close().await {
                Ok(()) => debug!(server = %session.name, %handle, "session closed"),
                Err(fault) => {
                    warn!(server = %session.name, ?fault, "failed to close session");
                    let reason = match fault {
                        Fault::Transport(r) | Fault::Protocol(r) | Fault::Remote(r) => r,
                    };
                    failures.push(TeardownFailure {
                        server: session.name.clone(),
                        reason,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }

    pub async fn name_of(&self, handle: SessionHandle) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(&handle)
            .map(|s| s.name.clone())
    }

    pub async fn is_open(&self, handle: SessionHandle) -> bool {
        self.sessions.read().await.contains_key(&handle)
    }

    /// Open sessions, oldest first.
    pub async fn handles(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<_> = self.sessions.read().await.keys().copied().collect();
        handles.sort();
        handles
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn session(&self, handle: SessionHandle) -> Result<Arc<Session<C>>> {
        self.sessions
            .read()
            .await
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::SessionClosed(handle.to_string()))
    }
}
