//! Completion client for Parley.
//!
//! Pure HTTP client for an OpenAI-compatible chat completions endpoint.

mod client;
mod error;
mod types;

pub use client::{Completer, CompletionClient, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
pub use error::{CompletionError, Result};
pub use types::{ChatMessage, Role, Usage};
