//! Credential records, rotation events, and the redacted secret wrapper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Id of the operator-supplied local override credential.
pub const OVERRIDE_KEY_ID: &str = "local-user-key";
/// Id of the configured fallback credential.
pub const FALLBACK_KEY_ID: &str = "env-fallback";
/// Alias written to the rotation log when no replacement key exists.
pub const NONE_AVAILABLE: &str = "None Available";

/// Upstream AI services a credential can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Provider {
    Google,
    OpenAi,
    DeepSeek,
    Claude,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Google,
        Provider::OpenAi,
        Provider::DeepSeek,
        Provider::Claude,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "GOOGLE",
            Provider::OpenAi => "OPENAI",
            Provider::DeepSeek => "DEEPSEEK",
            Provider::Claude => "CLAUDE",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GOOGLE" | "GEMINI" => Ok(Provider::Google),
            "OPENAI" => Ok(Provider::OpenAi),
            "DEEPSEEK" => Ok(Provider::DeepSeek),
            "CLAUDE" | "ANTHROPIC" => Ok(Provider::Claude),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Exhausted,
    Suspended,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Exhausted => "exhausted",
            KeyStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(KeyStatus::Active),
            "exhausted" => Ok(KeyStatus::Exhausted),
            "suspended" => Ok(KeyStatus::Suspended),
            other => Err(format!("unknown key status: {other}")),
        }
    }
}

/// Where a credential came from. Only store-backed credentials can be
/// rotated or have their usage persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    Store,
    Override,
    Fallback,
}

/// An API key. `Debug` and `Display` never print the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Last four characters, for operator listings.
    pub fn hint(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "****".into();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{tail}")
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub id: String,
    pub provider: Provider,
    pub secret: Secret,
    pub alias: String,
    pub status: KeyStatus,
    pub usage_count: u64,
    pub usage_limit: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub added_by: String,
    pub created_at: DateTime<Utc>,
    pub origin: CredentialOrigin,
}

impl CredentialRecord {
    /// Active and below its usage ceiling.
    pub fn is_eligible(&self) -> bool {
        self.status == KeyStatus::Active && self.usage_count < self.usage_limit
    }

    pub fn is_store_backed(&self) -> bool {
        self.origin == CredentialOrigin::Store
    }

    /// The configured last-resort credential for a provider.
    pub fn fallback(provider: Provider, secret: Secret) -> Self {
        let now = Utc::now();
        Self {
            id: FALLBACK_KEY_ID.into(),
            provider,
            secret,
            alias: "System Env".into(),
            status: KeyStatus::Active,
            usage_count: 0,
            usage_limit: u64::MAX,
            last_used: None,
            added_by: "system".into(),
            created_at: now,
            origin: CredentialOrigin::Fallback,
        }
    }
}

/// Parameters for creating a store-backed credential.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub provider: Provider,
    pub secret: Secret,
    pub alias: String,
    pub usage_limit: u64,
    pub added_by: String,
}

impl NewCredential {
    pub const DEFAULT_ALIAS: &'static str = "New Key";
    pub const DEFAULT_USAGE_LIMIT: u64 = 1000;

    pub fn new(provider: Provider, secret: Secret) -> Self {
        Self {
            provider,
            secret,
            alias: Self::DEFAULT_ALIAS.into(),
            usage_limit: Self::DEFAULT_USAGE_LIMIT,
            added_by: "admin".into(),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn usage_limit(mut self, limit: u64) -> Self {
        self.usage_limit = limit;
        self
    }

    pub fn added_by(mut self, who: impl Into<String>) -> Self {
        self.added_by = who.into();
        self
    }

    pub(crate) fn into_record(self, id: String, now: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord {
            id,
            provider: self.provider,
            secret: self.secret,
            alias: self.alias,
            status: KeyStatus::Active,
            usage_count: 0,
            usage_limit: self.usage_limit,
            last_used: None,
            added_by: self.added_by,
            created_at: now,
            origin: CredentialOrigin::Store,
        }
    }
}

/// Append-only audit entry written whenever a key is marked exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub timestamp: DateTime<Utc>,
    pub provider: Provider,
    pub previous_alias: String,
    pub new_alias: String,
    pub reason: String,
}
