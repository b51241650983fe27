//! A tool server running as a child process, spoken to over its stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, Incoming, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId, Tool,
};

/// Default timeout for a single request/response exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a server gets to exit on its own after stdin is closed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Longest line accepted from a server, in bytes.
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// How to launch one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Both ends of the stdio pipeline. Held under one lock so a request and
/// its response are never interleaved with another exchange.
struct Pipe {
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// A spawned server and the pipe to it.
pub struct Server {
    config: ServerConfig,
    process: Mutex<Child>,
    pipe: Mutex<Pipe>,
    next_id: AtomicI64,
    initialized: AtomicBool,
    server_info: Mutex<Option<InitializeResult>>,
    timeout: Duration,
}

impl Server {
    /// Start the process. The handshake is a separate step, see [`Server::initialize`].
    pub async fn spawn(config: ServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut process = cmd.spawn()?;
        debug!(server = %config.name, pid = ?process.id(), "spawned MCP server");

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("failed to capture stdin")))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("failed to capture stdout")))?;

        Ok(Self {
            config,
            process: Mutex::new(process),
            pipe: Mutex::new(Pipe {
                stdin: Some(stdin),
                stdout: BufReader::new(stdout),
            }),
            next_id: AtomicI64::new(1),
            initialized: AtomicBool::new(false),
            server_info: Mutex::new(None),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Perform the MCP handshake (must be called before other operations).
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams::default();
        let result: InitializeResult = self.request("initialize", Some(params)).await?;

        self.notify(JsonRpcNotification::new("notifications/initialized"))
            .await?;

        debug!(
            server = %self.config.name,
            remote = %result.server_info.name,
            protocol = %result.protocol_version,
            "MCP handshake complete"
        );

        *self.server_info.lock().await = Some(result.clone());
        self.initialized.store(true, Ordering::SeqCst);

        Ok(result)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// What the server reported about itself, once initialized.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.lock().await.clone()
    }

    /// Fetch the server's tool catalog.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let result: ListToolsResult = self.request("tools/list", None::<()>).await?;
        Ok(result.tools)
    }

    /// Call a tool by name.
    ///
    /// A result flagged `isError` is returned as [`Error::ToolCallFailed`].
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResult> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };

        let result: CallToolResult = self.request("tools/call", Some(params)).await?;

        if result.is_error {
            return Err(Error::ToolCallFailed(result.text()));
        }

        Ok(result)
    }

    pub async fn is_running(&self) -> bool {
        let mut process = self.process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    /// Shut the server down: close stdin, give it a moment to exit, then kill.
    pub async fn shutdown(&self) -> Result<()> {
        drop(self.pipe.lock().await.stdin.take());

        let mut process = self.process.lock().await;
        match timeout(SHUTDOWN_GRACE, process.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(server = %self.config.name, %status, "MCP server exited");
            }
            Err(_) => {
                warn!(server = %self.config.name, "MCP server ignored stdin close, killing");
                process.kill().await?;
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R>
    where
        P: Serialize,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_request_id();
        let mut request = JsonRpcRequest::new(id.clone(), method);
        if let Some(p) = params {
            request = request.with_params(p);
        }

        let mut pipe = self.pipe.lock().await;
        let Pipe { stdin, stdout } = &mut *pipe;
        let stdin = stdin.as_mut().ok_or(Error::ServerExited)?;
        write_message(stdin, &request).await?;

        let response = timeout(
            self.timeout,
            read_response(stdout, stdin, &id, MAX_OUTPUT_SIZE),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        drop(pipe);

        let result_value = response.into_result()?;
        let result: R = serde_json::from_value(result_value)?;

        Ok(result)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        let mut pipe = self.pipe.lock().await;
        let stdin = pipe.stdin.as_mut().ok_or(Error::ServerExited)?;
        write_message(stdin, &notification).await
    }
}

async fn write_message<W>(writer: &mut W, message: &impl Serialize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(message)?;
    trace!(message = %json, "-> server");
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line of at most `max_line` bytes, newline excluded.
///
/// Returns `None` at end of stream. The read itself is bounded, so an
/// oversized line is rejected without buffering all of it.
async fn read_line_bounded<R>(reader: &mut R, max_line: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = max_line as u64 + 1;
    let bytes_read = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > max_line {
        return Err(Error::OutputTooLarge {
            size: buf.len(),
            max: max_line,
        });
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Read lines until the response to `id` arrives.
///
/// Notifications are skipped, and so is any line that is not a JSON-RPC
/// message (servers sometimes print banners to stdout). Server-initiated
/// requests get an answer so the server is not left waiting: `ping`
/// succeeds, anything else is refused. Responses to earlier, abandoned
/// requests are discarded.
async fn read_response<R, W>(
    reader: &mut R,
    writer: &mut W,
    id: &RequestId,
    max_line: usize,
) -> Result<JsonRpcResponse>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(line) = read_line_bounded(reader, max_line).await? else {
            return Err(Error::ServerExited);
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        trace!(message = %line, "<- server");

        let incoming = match Incoming::parse(line) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(%line, error = %e, "skipping non-protocol output from server");
                continue;
            }
        };

        match incoming {
            Incoming::Response(response) if &response.id == id => return Ok(response),
            Incoming::Response(response) if is_stale(&response.id, id) => {
                debug!(stale = ?response.id, "discarding response to abandoned request");
            }
            Incoming::Response(response) => {
                return Err(Error::InvalidResponse(format!(
                    "reply to unknown request {:?} while waiting for {id:?}",
                    response.id
                )));
            }
            Incoming::Notification { method } => {
                trace!(%method, "skipping server notification");
            }
            Incoming::Request { id: request_id, method } => {
                let reply = if method == "ping" {
                    serde_json::json!({"jsonrpc": "2.0", "id": request_id, "result": {}})
                } else {
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": request_id,
                        "error": {"code": -32601, "message": format!("method not supported: {method}")}
                    })
                };
                write_message(writer, &reply).await?;
            }
        }
    }
}

fn is_stale(got: &RequestId, expected: &RequestId) -> bool {
    matches!((got, expected), (RequestId::Number(g), RequestId::Number(e)) if g < e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_launch_details() {
        let config = ServerConfig {
            name: "music".to_string(),
            command: "python".to_string(),
            args: vec!["music_player_server.py".to_string()],
            env: HashMap::new(),
        };
        assert_eq!(config.name, "music");
        assert_eq!(config.args.len(), 1);
    }

    #[test]
    fn stale_ids_are_older_numbers() {
        assert!(is_stale(&RequestId::Number(2), &RequestId::Number(5)));
        assert!(!is_stale(&RequestId::Number(6), &RequestId::Number(5)));
        assert!(!is_stale(&RequestId::from("a"), &RequestId::Number(5)));
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let config = ServerConfig {
            name: "ghost".to_string(),
            command: "/nonexistent/switchboard-test-server".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        };
        let err = Server::spawn(config).await.err().unwrap();
        assert!(matches!(err, Error::Io(_)));
    }

    fn lines(messages: &[&str]) -> Vec<u8> {
        messages.iter().flat_map(|m| format!("{m}\n").into_bytes()).collect()
    }

    fn replies(written: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(written)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn banner_and_notifications_are_skipped() {
        let input = lines(&[
            "Server running",
            r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}"#,
            "",
            r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#,
        ]);
        let mut written = Vec::new();

        let response = read_response(&mut input.as_slice(), &mut written, &RequestId::from(3), 1024)
            .await
            .unwrap();

        assert_eq!(response.into_result().unwrap(), serde_json::json!({"ok": true}));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn server_requests_are_answered() {
        let input = lines(&[
            r#"{"jsonrpc":"2.0","id":"s1","method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":7,"method":"sampling/createMessage","params":{}}"#,
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
        ]);
        let mut written = Vec::new();

        read_response(&mut input.as_slice(), &mut written, &RequestId::from(1), 1024)
            .await
            .unwrap();

        let replies = replies(&written);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], serde_json::json!({"jsonrpc": "2.0", "id": "s1", "result": {}}));
        assert_eq!(replies[1]["id"], 7);
        assert_eq!(replies[1]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn abandoned_replies_are_discarded() {
        let input = lines(&[
            r#"{"jsonrpc":"2.0","id":1,"result":"late"}"#,
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-1,"message":"late too"}}"#,
            r#"{"jsonrpc":"2.0","id":3,"result":"current"}"#,
        ]);

        let response = read_response(&mut input.as_slice(), &mut Vec::new(), &RequestId::from(3), 1024)
            .await
            .unwrap();

        assert_eq!(response.into_result().unwrap(), "current");
    }

    #[tokio::test]
    async fn reply_to_unknown_request_is_rejected() {
        let input = lines(&[r#"{"jsonrpc":"2.0","id":9,"result":{}}"#]);

        let err = read_response(&mut input.as_slice(), &mut Vec::new(), &RequestId::from(3), 1024)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn end_of_stream_means_server_exited() {
        let err = read_response(&mut &b""[..], &mut Vec::new(), &RequestId::from(1), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerExited));

        let input = lines(&[r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#]);
        let err = read_response(&mut input.as_slice(), &mut Vec::new(), &RequestId::from(1), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerExited));
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let input = format!("{}\n", "x".repeat(40));

        let err = read_response(&mut input.as_bytes(), &mut Vec::new(), &RequestId::from(1), 16)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::OutputTooLarge { size: 17, max: 16 }));
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let exact = format!("{}\n{}", "y".repeat(16), "rest");
        let mut reader = exact.as_bytes();

        let first = read_line_bounded(&mut reader, 16).await.unwrap();
        assert_eq!(first.as_deref(), Some("yyyyyyyyyyyyyyyy"));
        let second = read_line_bounded(&mut reader, 16).await.unwrap();
        assert_eq!(second.as_deref(), Some("rest"));
        assert_eq!(read_line_bounded(&mut reader, 16).await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_survives_startup_banner() {
        let script = r#"echo 'Server running'
read -r _
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"kb"}}}'
read -r _
"#;
        let config = ServerConfig {
            name: "kb".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        };
        let server = Server::spawn(config).await.unwrap();

        let info = server.initialize().await.unwrap();

        assert_eq!(info.server_info.name, "kb");
        assert!(server.is_initialized());
        server.shutdown().await.unwrap();
    }
}
