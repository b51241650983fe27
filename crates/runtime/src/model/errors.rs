use thiserror::Error;

/// Failure of a completion request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// The request never got an HTTP response.
    #[error("completion request failed: {0}")]
    Network(String),

    /// The provider answered with a non-success status.
    #[error("provider rejected request: {0}")]
    Api(String),

    /// The provider's reply did not match its documented shape.
    #[error("unreadable provider response: {0}")]
    InvalidResponse(String),
}
