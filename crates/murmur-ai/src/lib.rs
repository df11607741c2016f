//! Completion-service client for Murmur: Anthropic Messages API plumbing.

mod anthropic;
mod retry;
mod types;

pub use anthropic::{AnthropicClient, AnthropicConfig};
pub use types::{ChatMessage, ChatRole, CompletionClient, MurmurAiError};
