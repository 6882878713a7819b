//! LLM provider calls routed through the key executor.

pub mod gemini;
pub mod manager;

pub use gemini::{ChatMessage, ChatRole};
pub use manager::LlmManager;
