//! Completion protocol types and backend trait.

pub mod errors;
pub mod types;

pub use errors::ModelError;
pub use types::{
    Arguments, Backend, Completion, CompletionRequest, Message, Role, ToolCall, ToolDescriptor,
    ToolOutput, Usage,
};
