//! OpenAI-compatible chat completions backend.
//!
//! Works with any endpoint exposing `/chat/completions` with function
//! calling (OpenAI, DeepSeek, OpenRouter, Ollama, vLLM, ...).

use crate::model::{
    Arguments, Backend, Completion, CompletionRequest, Message, ModelError, ToolCall,
    ToolDescriptor, Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, PartialEq)]
struct ApiMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ApiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ApiFunctionCall {
    name: String,
    /// JSON-encoded argument object.
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize)]
struct ApiTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ApiFunction<'a>,
}

#[derive(Debug, Serialize)]
struct ApiFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiBackendBuilder {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: Option<u32>,
    system: Option<String>,
}

impl OpenAiBackendBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: None,
            system: None,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn build(self) -> OpenAiBackend {
        OpenAiBackend {
            client: reqwest::Client::new(),
            api_key: self.api_key,
            model: self.model,
            base_url: self.base_url,
            max_tokens: self.max_tokens,
            system: self.system,
        }
    }
}

/// OpenAI-compatible chat completions backend.
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: Option<u32>,
    system: Option<String>,
}

impl OpenAiBackend {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> OpenAiBackendBuilder {
        OpenAiBackendBuilder::new(api_key, model)
    }

    fn message_to_api(msg: &Message) -> ApiMessage {
        match msg {
            Message::User { content } => ApiMessage {
                role: "user",
                content: Some(content.clone()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
            Message::Assistant {
                content,
                tool_calls,
            } => ApiMessage {
                role: "assistant",
                content: (!content.is_empty() || tool_calls.is_empty()).then(|| content.clone()),
                tool_calls: tool_calls.iter().map(Self::call_to_api).collect(),
                tool_call_id: None,
            },
            Message::ToolResult {
                invocation_id,
                content,
                is_error,
            } => ApiMessage {
                role: "tool",
                content: Some(if *is_error {
                    format!("Error: {content}")
                } else {
                    content.clone()
                }),
                tool_calls: Vec::new(),
                tool_call_id: Some(invocation_id.clone()),
            },
        }
    }

    fn call_to_api(call: &ToolCall) -> ApiToolCall {
        ApiToolCall {
            id: call.id.clone(),
            call_type: function_type(),
            function: ApiFunctionCall {
                name: call.name.clone(),
                arguments: Value::Object(call.arguments.clone()).to_string(),
            },
        }
    }

    fn tool_to_api(spec: &ToolDescriptor) -> ApiTool<'_> {
        ApiTool {
            tool_type: "function",
            function: ApiFunction {
                name: &spec.name,
                description: &spec.description,
                parameters: &spec.input_schema,
            },
        }
    }

    fn call_from_api(call: ApiToolCall) -> Result<ToolCall, ModelError> {
        let raw = call.function.arguments.trim();
        let arguments = if raw.is_empty() {
            Arguments::new()
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(Value::Null) => Arguments::new(),
                Ok(other) => {
                    return Err(ModelError::InvalidResponse(format!(
                        "arguments for {} are not an object: {other}",
                        call.function.name
                    )));
                }
                Err(e) => {
                    return Err(ModelError::InvalidResponse(format!(
                        "arguments for {} are not valid JSON: {e}",
                        call.function.name
                    )));
                }
            }
        };
        Ok(ToolCall {
            id: call.id,
            name: call.function.name,
            arguments,
        })
    }

    fn build_messages(&self, messages: &[Message]) -> Vec<ApiMessage> {
        let system = self.system.as_ref().map(|s| ApiMessage {
            role: "system",
            content: Some(s.clone()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        });
        system
            .into_iter()
            .chain(messages.iter().map(Self::message_to_api))
            .collect()
    }
}

impl std::fmt::Display for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "openai({}, {})", self.model, self.base_url)
    }
}

impl Backend for OpenAiBackend {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ModelError> {
        let api_request = ApiRequest {
            model: &self.model,
            messages: self.build_messages(request.messages),
            tools: request.tools.iter().map(Self::tool_to_api).collect(),
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            model = %self.model,
            messages = api_request.messages.len(),
            tools = api_request.tools.len(),
            "sending completion request"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
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

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidResponse("no choices in response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(Self::call_from_api)
            .collect::<Result<Vec<_>, _>>()?;

        let usage = api_response
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolOutput;
    use serde_json::json;

    fn backend() -> OpenAiBackend {
        OpenAiBackend::builder("sk-test", "deepseek-chat")
            .base_url("https://api.deepseek.com/v1/")
            .system("Be brief.")
            .build()
    }

    #[test]
    fn display_trims_base_url() {
        assert_eq!(
            backend().to_string(),
            "openai(deepseek-chat, https://api.deepseek.com/v1)"
        );
    }

    #[test]
    fn conversation_maps_to_chat_messages() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "play_music".into(),
            arguments: json!({"index": 2}).as_object().cloned().unwrap(),
        };
        let messages = [
            Message::user("play the second song"),
            Message::tool_calls("", vec![call]),
            Message::tool_result(ToolOutput::success("call_1", "now playing track B")),
            Message::tool_result(ToolOutput::failure("call_2", "Invalid index")),
        ];
        let api = serde_json::to_value(backend().build_messages(&messages)).unwrap();

        assert_eq!(api[0], json!({"role": "system", "content": "Be brief."}));
        assert_eq!(api[1], json!({"role": "user", "content": "play the second song"}));
        assert_eq!(api[2]["role"], "assistant");
        assert_eq!(api[2]["content"], Value::Null);
        assert_eq!(api[2]["tool_calls"][0]["type"], "function");
        assert_eq!(api[2]["tool_calls"][0]["function"]["name"], "play_music");
        assert_eq!(
            api[2]["tool_calls"][0]["function"]["arguments"],
            r#"{"index":2}"#
        );
        assert_eq!(
            api[3],
            json!({"role": "tool", "content": "now playing track B", "tool_call_id": "call_1"})
        );
        assert_eq!(api[4]["content"], "Error: Invalid index");
    }

    #[test]
    fn tools_map_to_functions() {
        let spec = ToolDescriptor {
            name: "get_knowledge".into(),
            description: "Look up MCP docs".into(),
            input_schema: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        };
        let api = serde_json::to_value(OpenAiBackend::tool_to_api(&spec)).unwrap();
        assert_eq!(api["type"], "function");
        assert_eq!(api["function"]["name"], "get_knowledge");
        assert_eq!(api["function"]["parameters"]["properties"]["query"]["type"], "string");
    }

    #[test]
    fn response_tool_calls_parse_arguments() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function",
                         "function": {"name": "play_music", "arguments": "{\"index\": 2}"}},
                        {"id": "call_2", "type": "function",
                         "function": {"name": "pause_music", "arguments": ""}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7}
        });
        let response: ApiResponse = serde_json::from_value(body).unwrap();
        let choice = response.choices.into_iter().next().unwrap();
        let calls: Vec<_> = choice
            .message
            .tool_calls
            .unwrap()
            .into_iter()
            .map(OpenAiBackend::call_from_api)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(calls[0].arguments["index"], 2);
        assert!(calls[1].arguments.is_empty());
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        let call = ApiToolCall {
            id: "c".into(),
            call_type: function_type(),
            function: ApiFunctionCall {
                name: "play_music".into(),
                arguments: "[1, 2]".into(),
            },
        };
        assert!(matches!(
            OpenAiBackend::call_from_api(call),
            Err(ModelError::InvalidResponse(_))
        ));
    }
}
