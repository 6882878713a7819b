//! keyrotor: API key rotation and quota management for AI provider calls.

pub mod config;
pub mod error;
pub mod keys;
pub mod llm;

pub use error::{Error, ExecuteError, KeyError, Result};
