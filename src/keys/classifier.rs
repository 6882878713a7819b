//! Decides whether an upstream failure should trigger a key rotation.

use crate::keys::record::Provider;
use std::collections::HashMap;
use std::sync::Arc;

/// Substrings that mark an error as quota or rate-limit related.
pub const DEFAULT_QUOTA_PATTERNS: &[&str] =
    &["quota", "429", "rate limit", "insufficient", "billing", "403"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The key is spent; rotate and retry with the next one.
    Quota,
    /// Anything else. Propagated to the caller untouched.
    Fatal,
}

/// Classifies an opaque upstream failure by its rendered message.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, provider: Provider, message: &str) -> FailureClass;
}

/// Lower-cases the message and looks for any configured pattern.
#[derive(Debug, Clone)]
pub struct SubstringClassifier {
    patterns: Vec<String>,
}

impl SubstringClassifier {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

impl Default for SubstringClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA_PATTERNS)
    }
}

impl ErrorClassifier for SubstringClassifier {
    fn classify(&self, _provider: Provider, message: &str) -> FailureClass {
        let message = message.to_lowercase();
        if self.patterns.iter().any(|p| message.contains(p.as_str())) {
            FailureClass::Quota
        } else {
            FailureClass::Fatal
        }
    }
}

/// Dispatches to a provider-specific classifier, falling back to a default.
pub struct PerProviderClassifier {
    default: Arc<dyn ErrorClassifier>,
    overrides: HashMap<Provider, Arc<dyn ErrorClassifier>>,
}

impl PerProviderClassifier {
    pub fn new(default: Arc<dyn ErrorClassifier>) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with(mut self, provider: Provider, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.overrides.insert(provider, classifier);
        self
    }
}

impl ErrorClassifier for PerProviderClassifier {
    fn classify(&self, provider: Provider, message: &str) -> FailureClass {
        self.overrides
            .get(&provider)
            .unwrap_or(&self.default)
            .classify(provider, message)
    }
}
