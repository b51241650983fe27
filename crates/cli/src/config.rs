//! Configuration loading: switchboard.toml and the MCP server list.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use mcp::ServerConfig;
use runtime::Settings;
use runtime::providers::{AnthropicBackend, AnyBackend, OpenAiBackend};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "switchboard.toml";
pub const DEFAULT_SERVERS_FILE: &str = "mcp_server_config.json";

pub const API_KEY_VAR: &str = "SWITCHBOARD_API_KEY";
pub const MODEL_VAR: &str = "SWITCHBOARD_MODEL";

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.deepseek.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "deepseek-chat";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Any OpenAI-compatible chat completions endpoint.
    #[default]
    OpenAi,
    Anthropic,
}

/// Backend provider configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default)]
    pub provider: Provider,

    /// Model to use. Falls back to a per-provider default.
    pub model: Option<String>,

    /// Endpoint root for OpenAI-compatible providers.
    pub base_url: Option<String>,

    /// Prefer the SWITCHBOARD_API_KEY environment variable over this.
    pub api_key: Option<String>,

    pub max_tokens: Option<u32>,

    pub system_prompt: Option<String>,
}

/// Conversation loop tunables.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub window_size: usize,
    pub max_rounds: usize,
    pub tool_timeout_secs: u64,
    pub completion_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            window_size: settings.window_size,
            max_rounds: settings.max_rounds,
            tool_timeout_secs: settings.tool_timeout.as_secs(),
            completion_timeout_secs: settings.completion_timeout.as_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::Invalid("orchestrator.window_size must be at least 1".into()));
        }
        if self.max_rounds == 0 {
            return Err(ConfigError::Invalid("orchestrator.max_rounds must be at least 1".into()));
        }
        if self.tool_timeout_secs == 0 {
            return Err(ConfigError::Invalid("orchestrator.tool_timeout_secs must be at least 1".into()));
        }
        if self.completion_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.completion_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(Settings {
            window_size: self.window_size,
            max_rounds: self.max_rounds,
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            completion_timeout: Duration::from_secs(self.completion_timeout_secs),
        })
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load the file if it exists, otherwise use defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Model id, with the environment taking precedence over the file.
    pub fn model(&self, env_model: Option<String>) -> String {
        env_model
            .or_else(|| self.backend.model.clone())
            .unwrap_or_else(|| match self.backend.provider {
                Provider::OpenAi => DEFAULT_OPENAI_MODEL.to_string(),
                Provider::Anthropic => DEFAULT_ANTHROPIC_MODEL.to_string(),
            })
    }

    pub fn api_key(&self, env_key: Option<String>) -> Result<String, ConfigError> {
        env_key
            .filter(|key| !key.is_empty())
            .or_else(|| self.backend.api_key.clone())
            .ok_or(ConfigError::MissingApiKey)
    }

    /// Build the configured completion backend.
    pub fn backend(
        &self,
        env_key: Option<String>,
        env_model: Option<String>,
    ) -> Result<AnyBackend, ConfigError> {
        let api_key = self.api_key(env_key)?;
        let model = self.model(env_model);
        let backend = &self.backend;

        let built: AnyBackend = match backend.provider {
            Provider::OpenAi => {
                let mut builder = OpenAiBackend::builder(api_key, model).base_url(
                    backend
                        .base_url
                        .as_deref()
                        .unwrap_or(DEFAULT_OPENAI_BASE_URL),
                );
                if let Some(max_tokens) = backend.max_tokens {
                    builder = builder.max_tokens(max_tokens);
                }
                if let Some(system) = &backend.system_prompt {
                    builder = builder.system(system);
                }
                builder.build().into()
            }
            Provider::Anthropic => {
                let mut builder = AnthropicBackend::builder(api_key, model);
                if let Some(max_tokens) = backend.max_tokens {
                    builder = builder.max_tokens(max_tokens);
                }
                if let Some(system) = &backend.system_prompt {
                    builder = builder.system(system);
                }
                builder.build().into()
            }
        };
        Ok(built)
    }
}

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(rename = "mcpServers")]
    mcp_servers: BTreeMap<String, ServerEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Load the tool server list, ordered by server id.
pub fn load_servers(path: impl AsRef<Path>) -> Result<Vec<ServerConfig>, ConfigError> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_servers(&content)
}

pub fn parse_servers(json: &str) -> Result<Vec<ServerConfig>, ConfigError> {
    let file: ServersFile =
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
    file.mcp_servers
        .into_iter()
        .map(|(name, entry)| {
            if entry.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("server '{name}' has no command")));
            }
            Ok(ServerConfig {
                name,
                command: entry.command,
                args: entry.args,
                env: entry.env,
            })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("API key not configured: set {API_KEY_VAR} or backend.api_key")]
    MissingApiKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.backend.provider, Provider::OpenAi);
        assert_eq!(config.model(None), "deepseek-chat");
        assert_eq!(config.orchestrator.settings().unwrap(), Settings::default());
    }

    #[test]
    fn parses_full_config() {
        let config = Config::parse(
            r#"
            [backend]
            provider = "anthropic"
            model = "claude-opus"
            api_key = "file-key"
            max_tokens = 1024
            system_prompt = "Be brief."

            [orchestrator]
            window_size = 8
            max_rounds = 4
            tool_timeout_secs = 5
            completion_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.provider, Provider::Anthropic);
        assert_eq!(config.backend.max_tokens, Some(1024));
        let settings = config.orchestrator.settings().unwrap();
        assert_eq!(settings.window_size, 8);
        assert_eq!(settings.max_rounds, 4);
        assert_eq!(settings.tool_timeout, Duration::from_secs(5));
        assert_eq!(settings.completion_timeout, Duration::from_secs(30));
    }

    #[test]
    fn environment_overrides_file() {
        let config = Config::parse("[backend]\nmodel = \"m1\"\napi_key = \"k1\"").unwrap();
        assert_eq!(config.model(Some("m2".into())), "m2");
        assert_eq!(config.model(None), "m1");
        assert_eq!(config.api_key(Some("k2".into())).unwrap(), "k2");
        assert_eq!(config.api_key(Some(String::new())).unwrap(), "k1");
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let config = Config::default();
        assert!(matches!(config.api_key(None), Err(ConfigError::MissingApiKey)));
        assert!(config.backend(None, None).is_err());
    }

    #[test]
    fn builds_selected_backend() {
        let config = Config::parse("[backend]\nprovider = \"anthropic\"").unwrap();
        let backend = config.backend(Some("key".into()), None).unwrap();
        assert_eq!(backend.to_string(), "anthropic(claude-sonnet-4-20250514)");

        let backend = Config::default().backend(Some("key".into()), None).unwrap();
        assert_eq!(
            backend.to_string(),
            "openai(deepseek-chat, https://api.deepseek.com/v1)"
        );
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = Config::parse("[orchestrator]\nwindow_size = 0").unwrap();
        assert!(matches!(config.orchestrator.settings(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        for key in ["tool_timeout_secs", "completion_timeout_secs"] {
            let config = Config::parse(&format!("[orchestrator]\n{key} = 0")).unwrap();
            match config.orchestrator.settings() {
                Err(ConfigError::Invalid(reason)) => assert!(reason.contains(key)),
                other => panic!("expected {key} = 0 to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Config::parse("[backend]\noauth_token = \"x\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn servers_load_in_id_order() {
        let servers = parse_servers(
            r#"{
                "mcpServers": {
                    "music": {"command": "python", "args": ["music_server.py"]},
                    "knowledge": {"command": "uv", "args": ["run", "kb.py"], "env": {"KB": "docs"}}
                }
            }"#,
        )
        .unwrap();
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["knowledge", "music"]);
        assert_eq!(servers[0].args, ["run", "kb.py"]);
        assert_eq!(servers[0].env["KB"], "docs");
        assert!(servers[1].env.is_empty());
    }

    #[test]
    fn server_without_command_is_rejected() {
        let result = parse_servers(r#"{"mcpServers": {"x": {"command": " "}}}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn servers_file_requires_mcp_servers_key() {
        assert!(matches!(parse_servers("{}"), Err(ConfigError::Parse(_))));
    }
}
