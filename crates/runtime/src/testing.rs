//! In-memory channels and scripted backends for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::model::{
    Arguments, Backend, Completion, CompletionRequest, Message, ModelError, ToolCall,
    ToolDescriptor,
};
use crate::pool::{Channel, Fault};

/// Tracks how many calls are in flight at once across channels sharing it.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    inner: Arc<(AtomicUsize, AtomicUsize)>,
}

impl Gauge {
    fn enter(&self) {
        let now = self.inner.0.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.1.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.inner.0.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.inner.1.load(Ordering::SeqCst)
    }
}

/// Calls received by a [`FakeChannel`].
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<Vec<(String, Arguments)>>>,
}

impl CallLog {
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn arguments(&self) -> Vec<Arguments> {
        self.inner.lock().unwrap().iter().map(|(_, a)| a.clone()).collect()
    }
}

pub struct FakeChannel {
    tools: Vec<ToolDescriptor>,
    replies: HashMap<String, Result<String, Fault>>,
    list_fault: Option<Fault>,
    close_fault: Option<Fault>,
    delay: Duration,
    gauge: Gauge,
    calls: CallLog,
    closed: Arc<AtomicBool>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            replies: HashMap::new(),
            list_fault: None,
            close_fault: None,
            delay: Duration::ZERO,
            gauge: Gauge::default(),
            calls: CallLog::default(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tool(mut self, name: &str) -> Self {
        self.tools.push(ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: serde_json::json!({"type": "object"}),
        });
        self
    }

    pub fn reply(mut self, tool: &str, content: &str) -> Self {
        self.replies.insert(tool.to_string(), Ok(content.to_string()));
        self
    }

    pub fn fault(mut self, tool: &str, fault: Fault) -> Self {
        self.replies.insert(tool.to_string(), Err(fault));
        self
    }

    pub fn list_fault(mut self, fault: Fault) -> Self {
        self.list_fault = Some(fault);
        self
    }

    pub fn close_fault(mut self, fault: Fault) -> Self {
        self.close_fault = Some(fault);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn gauge(mut self, gauge: Gauge) -> Self {
        self.gauge = gauge;
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl Channel for FakeChannel {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, Fault> {
        match &self.list_fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(self.tools.clone()),
        }
    }

    async fn call_tool(&self, name: &str, arguments: Arguments) -> Result<String, Fault> {
        self.calls
            .inner
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));
        self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.gauge.leave();
        self.replies
            .get(name)
            .cloned()
            .unwrap_or_else(|| Err(Fault::Remote(format!("no such tool: {name}"))))
    }

    async fn close(&self) -> Result<(), Fault> {
        self.closed.store(true, Ordering::SeqCst);
        match &self.close_fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }
}

/// Backend that replays canned completions and records every request.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<Completion, ModelError>>>,
    seen: Arc<Mutex<Vec<Vec<Message>>>>,
    delay: Duration,
}

impl ScriptedBackend {
    pub fn new(script: impl IntoIterator<Item = Completion>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn then_fail(self, error: ModelError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Message lists from every request so far.
    pub fn requests(&self) -> Arc<Mutex<Vec<Vec<Message>>>> {
        Arc::clone(&self.seen)
    }
}

impl Backend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ModelError> {
        self.seen.lock().unwrap().push(request.messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Api("script exhausted".into())))
    }
}

pub fn text(content: &str) -> Completion {
    Completion {
        content: content.to_string(),
        ..Completion::default()
    }
}

pub fn calls(content: &str, requested: &[(&str, &str, Value)]) -> Completion {
    Completion {
        content: content.to_string(),
        tool_calls: requested
            .iter()
            .map(|(id, name, args)| ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.as_object().cloned().unwrap_or_default(),
            })
            .collect(),
        ..Completion::default()
    }
}
