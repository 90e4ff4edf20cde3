//! Formgate - receiver for signed interactive-form submissions.
//!
//! Submissions posted from email-embedded forms are signed by the sending
//! platform. This library verifies them against the platform's published
//! RSA keys and keeps accepted submissions in a bounded store.
//!
//! ## Architecture
//!
//! ```text
//! POST /submit → SignatureVerifier (KeyCache) → IngestionPipeline → SubmissionStore
//!                                                                    ↳ PersistenceWriter
//! ```

pub mod config;
pub mod error;
pub mod keys;
pub mod pipeline;
pub mod signature;
pub mod store;
pub mod web;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use error::{ErrorKind, KeyCodecError, KeyFetchError, PersistenceError, VerifyError};
pub use keys::{HttpKeySource, KeyCache, KeySource};
pub use pipeline::{IngestDecision, IngestionPipeline, InboundSubmission, KeyUnavailablePolicy};
pub use signature::SignatureVerifier;
pub use store::{JsonDirRepository, PersistenceWriter, SubmissionStore};
pub use web::AppState;
