//! The tool-call orchestration loop.
//!
//! One [`Orchestrator`] drives one conversation: it appends the user's
//! query, asks the model for a completion with the full tool catalog, runs
//! every tool the model requests on the session that owns it, feeds the
//! results back, and repeats until the model answers without tool calls.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::conversation::{Conversation, DEFAULT_WINDOW_SIZE};
use crate::model::{Backend, Completion, CompletionRequest, Message, ToolCall, ToolOutput};
use crate::pool::{Channel, SessionHandle, SessionPool};
use crate::registry::ToolRegistry;
use crate::{Error, Result};

/// Tunables for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Most recent messages included in each completion request.
    pub window_size: usize,
    /// Completion requests allowed per query before giving up.
    pub max_rounds: usize,
    pub tool_timeout: Duration,
    pub completion_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_rounds: 10,
            tool_timeout: Duration::from_secs(60),
            completion_timeout: Duration::from_secs(120),
        }
    }
}

/// Where the loop is within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingQuery,
    RequestingCompletion,
    ResolvingTools,
    Done,
}

/// Drives queries through the model and the tool servers.
pub struct Orchestrator<B, C> {
    backend: B,
    pool: Arc<SessionPool<C>>,
    registry: ToolRegistry,
    conversation: Conversation,
    settings: Settings,
    state: State,
}

impl<B: Backend, C: Channel> Orchestrator<B, C> {
    pub fn new(backend: B, pool: Arc<SessionPool<C>>, registry: ToolRegistry) -> Self {
        Self {
            backend,
            pool,
            registry,
            conversation: Conversation::new(),
            settings: Settings::default(),
            state: State::AwaitingQuery,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Answer one user query.
    ///
    /// On error the conversation keeps everything appended before the
    /// failure; nothing is rolled back.
    pub async fn ask(&mut self, query: &str) -> Result<String> {
        let result = self.run_turn(query).await;
        self.state = match result {
            Ok(_) => State::Done,
            Err(_) => State::AwaitingQuery,
        };
        result
    }

    async fn run_turn(&mut self, query: &str) -> Result<String> {
        self.conversation.append(Message::user(query));
        let mut fragments: Vec<String> = Vec::new();

        for round in 1..=self.settings.max_rounds {
            self.state = State::RequestingCompletion;
            self.retire_closed_sessions().await;
            let completion = self.request_completion().await?;
            debug!(
                round,
                tool_calls = completion.tool_calls.len(),
                input_tokens = completion.usage.input_tokens,
                output_tokens = completion.usage.output_tokens,
                "completion received"
            );

            if !completion.content.is_empty() {
                fragments.push(completion.content.clone());
            }

            if completion.tool_calls.is_empty() {
                let answer = fragments.join("\n");
                self.conversation.append(Message::assistant(answer.clone()));
                return Ok(answer);
            }

            self.state = State::ResolvingTools;
            let outputs = self.resolve_tools(&completion.tool_calls).await?;

            let Completion {
                content,
                tool_calls,
                ..
            } = completion;
            self.conversation
                .append(Message::tool_calls(content, tool_calls));
            for output in outputs {
                self.conversation.append(Message::tool_result(output));
            }
        }

        warn!(rounds = self.settings.max_rounds, "tool loop budget exhausted");
        Err(Error::LoopBudgetExceeded {
            rounds: self.settings.max_rounds,
        })
    }

    async fn request_completion(&self) -> Result<Completion> {
        let messages = request_window(self.conversation.windowed_view(self.settings.window_size));
        let request = CompletionRequest {
            messages,
            tools: self.registry.catalog(),
        };
        let after = self.settings.completion_timeout;
        timeout(after, self.backend.complete(request))
            .await
            .map_err(|_| Error::Timeout {
                operation: "completion request".to_string(),
                after,
            })?
            .map_err(Error::from)
    }

    /// Route and run every call in the order the model emitted them.
    ///
    /// All names are resolved before anything runs, so an unknown tool fails
    /// the turn without side effects.
    async fn resolve_tools(&mut self, calls: &[ToolCall]) -> Result<Vec<ToolOutput>> {
        let owners = calls
            .iter()
            .map(|call| self.registry.owner_of(&call.name))
            .collect::<Result<Vec<SessionHandle>>>()?;

        let mut outputs = Vec::with_capacity(calls.len());
        for (call, owner) in calls.iter().zip(owners) {
            info!(
                tool = %call.name,
                args = %serde_json::Value::Object(call.arguments.clone()),
                "Calling tool"
            );
            match self.invoke(owner, call).await {
                Ok(output) => outputs.push(output),
                Err(Error::ToolExecution { tool, message }) => {
                    warn!(%tool, %message, "tool reported failure");
                    outputs.push(ToolOutput::failure(&call.id, message));
                }
                Err(e) => {
                    if e.is_channel_fault() {
                        self.drop_session(owner).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(outputs)
    }

    async fn invoke(&self, owner: SessionHandle, call: &ToolCall) -> Result<ToolOutput> {
        let after = self.settings.tool_timeout;
        timeout(after, self.pool.invoke(owner, call))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("tool {}", call.name),
                after,
            })?
    }

    /// Stop advertising tools of sessions the shared pool no longer holds.
    async fn retire_closed_sessions(&mut self) {
        let mut owners: Vec<SessionHandle> =
            self.registry.tools().iter().map(|tool| tool.owner).collect();
        owners.sort_unstable();
        owners.dedup();
        for owner in owners {
            if !self.pool.is_open(owner).await {
                let retired = self.registry.retire(owner);
                debug!(session = %owner, retired, "session closed elsewhere, tools retired");
            }
        }
    }

    async fn drop_session(&mut self, session: SessionHandle) {
        let name = self.pool.evict(session).await;
        let retired = self.registry.retire(session);
        warn!(
            server = name.as_deref().unwrap_or("?"),
            %session,
            retired,
            "session removed from routing"
        );
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<SessionPool<C>> {
        &self.pool
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn state(&self) -> State {
        self.state
    }
}

/// Drop leading tool results whose assistant request fell out of the window.
fn request_window(window: &[Message]) -> &[Message] {
    let start = window
        .iter()
        .position(|m| !matches!(m, Message::ToolResult { .. }))
        .unwrap_or(window.len());
    &window[start..]
}

/// Connect every configured server, register its tools, and report how many
/// came up. A server that fails to connect or list its tools is logged and
/// skipped.
pub async fn connect_all(
    pool: &SessionPool<mcp::Server>,
    configs: Vec<mcp::ServerConfig>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for config in configs {
        let name = config.name.clone();
        let handle = match pool.connect(config).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(server = %name, error = %e, "skipping server");
                continue;
            }
        };
        match pool.discover_tools(handle).await {
            Ok(tools) => {
                let names: Vec<_> = tools.iter().map(|t| t.name.clone()).collect();
                info!(server = %name, tools = ?names, "connected to server");
                registry.register(handle, tools);
            }
            Err(e) => {
                warn!(server = %name, error = %e, "tool discovery failed, dropping server");
                pool.evict(handle).await;
            }
        }
    }
    registry
}
