//! Top-level error types for keyrotor.

use crate::keys::Provider;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of the rotation engine itself, as opposed to upstream call failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Nothing in the store and no manual override configured.
    #[error("missing API key for {provider}: add one in the admin dashboard or set a local override")]
    MissingApiKey { provider: Provider },

    #[error("system busy: no active API keys available for {provider}")]
    NoActiveKeys { provider: Provider },

    #[error("{provider} service busy, retried {attempts} times")]
    RetriesExhausted { provider: Provider, attempts: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(Provider),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("completion failed: {0}")]
    Completion(#[from] rig::completion::CompletionError),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Outcome of a failed rotated call: either the engine gave up, or the
/// upstream operation failed with an error that is not worth rotating for.
#[derive(Debug)]
pub enum ExecuteError<E> {
    Key(KeyError),
    Upstream(E),
}

impl<E> ExecuteError<E> {
    pub fn key_error(&self) -> Option<&KeyError> {
        match self {
            Self::Key(error) => Some(error),
            Self::Upstream(_) => None,
        }
    }

    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Key(_) => None,
            Self::Upstream(error) => Some(error),
        }
    }
}

impl<E> From<KeyError> for ExecuteError<E> {
    fn from(error: KeyError) -> Self {
        Self::Key(error)
    }
}

impl<E: fmt::Display> fmt::Display for ExecuteError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(error) => error.fmt(f),
            Self::Upstream(error) => error.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ExecuteError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Key(error) => error.source(),
            Self::Upstream(error) => error.source(),
        }
    }
}

impl From<ExecuteError<LlmError>> for Error {
    fn from(error: ExecuteError<LlmError>) -> Self {
        match error {
            ExecuteError::Key(error) => Error::Key(error),
            ExecuteError::Upstream(error) => Error::Llm(error),
        }
    }
}
