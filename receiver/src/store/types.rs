//! Submission records and query types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Largest page a single `list` call returns.
pub const MAX_PAGE_SIZE: usize = 500;

/// Page size used when the caller asks for zero.
pub const DEFAULT_PAGE_SIZE: usize = 50;

// =============================================================================
// Submission
// =============================================================================

/// An accepted form submission. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Store-assigned id; empty until inserted.
    #[serde(default)]
    pub id: String,
    pub form_id: String,
    /// Submitted field values
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub metadata: SubmissionMetadata,
}

/// Request context captured alongside a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionMetadata {
    /// Verified sender address, when the transport provided one
    #[serde(default)]
    pub sender_identity: Option<String>,
    #[serde(default)]
    pub client_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
    /// False only for submissions accepted without keys under a fail-open policy
    pub signature_valid: bool,
    /// Key that verified the signature
    #[serde(default)]
    pub key_id: Option<String>,
}

impl Submission {
    pub fn new(form_id: String, fields: Map<String, Value>, metadata: SubmissionMetadata) -> Self {
        Self {
            id: String::new(),
            form_id,
            fields,
            metadata,
        }
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.metadata.received_at
    }

    /// Case-insensitive substring match over field values and metadata strings.
    ///
    /// `needle` must already be lowercase.
    pub fn matches_term(&self, needle: &str) -> bool {
        let metadata = [
            Some(self.form_id.as_str()),
            self.metadata.sender_identity.as_deref(),
            self.metadata.client_address.as_deref(),
            self.metadata.user_agent.as_deref(),
        ];
        if metadata
            .into_iter()
            .flatten()
            .any(|s| s.to_lowercase().contains(needle))
        {
            return true;
        }

        self.fields.values().any(|v| value_contains(v, needle))
    }
}

fn value_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Bool(b) => b.to_string().contains(needle),
        Value::Number(n) => n.to_string().contains(needle),
        Value::Array(items) => items.iter().any(|v| value_contains(v, needle)),
        Value::Object(map) => map.values().any(|v| value_contains(v, needle)),
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Predicates for `list`; every provided predicate must hold.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub form_id: Option<String>,
    /// Inclusive lower bound on `received_at`
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `received_at`
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub validated_only: bool,
}

impl ListFilter {
    pub fn matches(&self, submission: &Submission) -> bool {
        let received_at = submission.received_at();

        self.form_id
            .as_deref()
            .map_or(true, |f| submission.form_id == f)
            && self.from.map_or(true, |from| received_at >= from)
            && self.until.map_or(true, |until| received_at <= until)
            && (!self.validated_only || submission.metadata.signature_valid)
    }
}

/// One page of `list` results.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionPage {
    pub items: Vec<Submission>,
    /// Matches across all pages
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Summary counters for health reporting.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub total: usize,
    pub capacity: usize,
    pub validated: usize,
    pub by_form: BTreeMap<String, usize>,
}
