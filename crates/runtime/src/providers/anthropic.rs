//! Anthropic API backend.

use crate::model::{
    Arguments, Backend, Completion, CompletionRequest, Message, ModelError, ToolCall,
    ToolDescriptor, Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ApiContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ApiTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiResponseBlock>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicBackendBuilder {
    api_key: String,
    model: String,
    max_tokens: u32,
    system: Option<String>,
}

impl AnthropicBackendBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            system: None,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn build(self) -> AnthropicBackend {
        AnthropicBackend {
            client: reqwest::Client::new(),
            api_key: self.api_key,
            model: self.model,
            max_tokens: self.max_tokens,
            system: self.system,
        }
    }
}

/// Anthropic API backend.
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    system: Option<String>,
}

impl AnthropicBackend {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> AnthropicBackendBuilder {
        AnthropicBackendBuilder::new(api_key, model)
    }

    /// Converts the conversation into alternating user/assistant turns.
    ///
    /// Consecutive tool results collapse into one user message carrying a
    /// `tool_result` block per invocation.
    fn messages_to_api(messages: &[Message]) -> Vec<ApiMessage> {
        let mut out: Vec<ApiMessage> = Vec::with_capacity(messages.len());
        for msg in messages {
            match msg {
                Message::User { content } => out.push(ApiMessage {
                    role: "user",
                    content: ApiContent::Text(content.clone()),
                }),
                Message::Assistant {
                    content,
                    tool_calls,
                } if tool_calls.is_empty() => out.push(ApiMessage {
                    role: "assistant",
                    content: ApiContent::Text(content.clone()),
                }),
                Message::Assistant {
                    content,
                    tool_calls,
                } => {
                    let text = (!content.is_empty()).then(|| ApiContentBlock::Text {
                        text: content.clone(),
                    });
                    let uses = tool_calls.iter().map(|call| ApiContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: Value::Object(call.arguments.clone()),
                    });
                    out.push(ApiMessage {
                        role: "assistant",
                        content: ApiContent::Blocks(text.into_iter().chain(uses).collect()),
                    });
                }
                Message::ToolResult {
                    invocation_id,
                    content,
                    is_error,
                } => {
                    let block = ApiContentBlock::ToolResult {
                        tool_use_id: invocation_id.clone(),
                        content: content.clone(),
                        is_error: *is_error,
                    };
                    let open_results = out
                        .last_mut()
                        .filter(|last| last.role == "user")
                        .and_then(|last| match &mut last.content {
                            ApiContent::Blocks(blocks) => Some(blocks),
                            ApiContent::Text(_) => None,
                        });
                    match open_results {
                        Some(blocks) => blocks.push(block),
                        None => out.push(ApiMessage {
                            role: "user",
                            content: ApiContent::Blocks(vec![block]),
                        }),
                    }
                }
            }
        }
        out
    }

    fn tool_to_api(spec: &ToolDescriptor) -> ApiTool<'_> {
        ApiTool {
            name: &spec.name,
            description: &spec.description,
            input_schema: &spec.input_schema,
        }
    }

    fn response_to_completion(blocks: Vec<ApiResponseBlock>) -> Result<Completion, ModelError> {
        let mut text = Vec::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block {
                ApiResponseBlock::Text { text: t } => text.push(t),
                ApiResponseBlock::ToolUse { id, name, input } => {
                    let arguments = match input {
                        Value::Object(map) => map,
                        Value::Null => Arguments::new(),
                        other => {
                            return Err(ModelError::InvalidResponse(format!(
                                "input for {name} is not an object: {other}"
                            )));
                        }
                    };
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments,
                    });
                }
                ApiResponseBlock::Unknown => {}
            }
        }
        Ok(Completion {
            content: text.join(""),
            tool_calls,
            usage: Usage::default(),
        })
    }
}

impl std::fmt::Display for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anthropic({})", self.model)
    }
}

impl Backend for AnthropicBackend {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ModelError> {
        let api_request = ApiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: Self::messages_to_api(request.messages),
            system: self.system.as_deref(),
            tools: request.tools.iter().map(Self::tool_to_api).collect(),
        };

        debug!(
            model = %self.model,
            messages = api_request.messages.len(),
            tools = api_request.tools.len(),
            "sending completion request"
        );

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "provider returned error");
            return Err(ModelError::Api(format!("{status}: {body}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        let mut completion = Self::response_to_completion(api_response.content)?;
        completion.usage = Usage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        };
        Ok(completion)
    }
}
