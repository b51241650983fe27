//! LLM provider adapters.
//!
//! Each provider implements [`Backend`] for its specific API.

mod anthropic;
mod openai;

pub use anthropic::{AnthropicBackend, AnthropicBackendBuilder};
pub use openai::{DEFAULT_BASE_URL, OpenAiBackend, OpenAiBackendBuilder};

use crate::model::{Backend, Completion, CompletionRequest, ModelError};

/// A backend chosen at runtime from configuration.
pub enum AnyBackend {
    OpenAi(OpenAiBackend),
    Anthropic(AnthropicBackend),
}

impl std::fmt::Display for AnyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi(backend) => write!(f, "{backend}"),
            Self::Anthropic(backend) => write!(f, "{backend}"),
        }
    }
}

impl From<OpenAiBackend> for AnyBackend {
    fn from(backend: OpenAiBackend) -> Self {
        Self::OpenAi(backend)
    }
}

impl From<AnthropicBackend> for AnyBackend {
    fn from(backend: AnthropicBackend) -> Self {
        Self::Anthropic(backend)
    }
}

impl Backend for AnyBackend {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ModelError> {
        match self {
            Self::OpenAi(backend) => backend.complete(request).await,
            Self::Anthropic(backend) => backend.complete(request).await,
        }
    }
}
