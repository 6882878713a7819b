//! API key selection, rotation and usage accounting.

pub mod cache;
pub mod classifier;
pub mod executor;
pub mod overrides;
pub mod record;
pub mod rotation;
pub mod selector;
pub mod sqlite;
pub mod store;
pub mod usage;

pub use cache::KeyCache;
pub use classifier::{ErrorClassifier, FailureClass, PerProviderClassifier, SubstringClassifier};
pub use executor::{KeyExecutor, KeyExecutorBuilder};
pub use overrides::{ManualOverride, OverrideSettings};
pub use record::{
    CredentialOrigin, CredentialRecord, KeyStatus, NewCredential, Provider, RotationEvent, Secret,
};
pub use rotation::RotationController;
pub use selector::{FallbackCredential, KeySelector};
pub use sqlite::SqliteCredentialStore;
pub use store::{CredentialStore, MemoryCredentialStore, RotationLog};
pub use usage::UsageRecorder;
