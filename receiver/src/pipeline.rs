//! Accept/reject decision for one inbound submission.
//!
//! ```text
//! InboundSubmission → SignatureVerifier → payload decode → SubmissionStore → IngestDecision
//! ```

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{ErrorKind, VerifyError};
use crate::signature::SignatureVerifier;
use crate::store::{Submission, SubmissionMetadata, SubmissionStore};

/// Form id used when neither the body nor the transport names one.
pub const DEFAULT_FORM_ID: &str = "default";

/// What to do when a well-formed, fresh request cannot be verified because
/// no keys have ever been loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyUnavailablePolicy {
    /// Reject with `key_unavailable`.
    #[default]
    FailClosed,
    /// Accept, recording `signature_valid = false`.
    FailOpen,
}

impl FromStr for KeyUnavailablePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_closed" | "closed" => Ok(KeyUnavailablePolicy::FailClosed),
            "fail_open" | "open" => Ok(KeyUnavailablePolicy::FailOpen),
            other => Err(format!("unknown key unavailable policy '{}'", other)),
        }
    }
}

/// One request as handed over by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct InboundSubmission {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub sender_identity: Option<String>,
    pub client_address: Option<String>,
    pub user_agent: Option<String>,
    pub content_type: Option<String>,
    /// Form id supplied out of band (e.g. a query parameter)
    pub form_id: Option<String>,
    /// Body bytes exactly as transmitted
    pub body: Vec<u8>,
}

/// Result reported back to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestDecision {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

impl IngestDecision {
    fn accepted(submission_id: String, key_id: Option<String>) -> Self {
        Self {
            accepted: true,
            reason: None,
            submission_id: Some(submission_id),
            key_id,
        }
    }

    fn rejected(reason: ErrorKind) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            submission_id: None,
            key_id: None,
        }
    }
}

/// Verifies, decodes and stores inbound submissions.
pub struct IngestionPipeline {
    verifier: SignatureVerifier,
    store: Arc<SubmissionStore>,
    policy: KeyUnavailablePolicy,
    allowed_forms: Option<HashSet<String>>,
}

impl IngestionPipeline {
    pub fn new(
        verifier: SignatureVerifier,
        store: Arc<SubmissionStore>,
        policy: KeyUnavailablePolicy,
    ) -> Self {
        Self {
            verifier,
            store,
            policy,
            allowed_forms: None,
        }
    }

    /// Only accept these form ids.
    pub fn with_allowed_forms(mut self, forms: impl IntoIterator<Item = String>) -> Self {
        self.allowed_forms = Some(forms.into_iter().collect());
        self
    }

    pub fn store(&self) -> &Arc<SubmissionStore> {
        &self.store
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub async fn ingest(&self, request: InboundSubmission) -> IngestDecision {
        let verified = self
            .verifier
            .verify(
                request.signature.as_deref(),
                request.timestamp.as_deref(),
                &request.body,
            )
            .await;

        let key_id = match verified {
            Ok(v) => Some(v.key_id),
            Err(VerifyError::KeyUnavailable) if self.policy == KeyUnavailablePolicy::FailOpen => {
                warn!(
                    client_address = request.client_address.as_deref().unwrap_or(""),
                    "ingest_accepting_unverified"
                );
                None
            }
            Err(e) => {
                warn!(
                    reason = %e.kind(),
                    error = %e,
                    client_address = request.client_address.as_deref().unwrap_or(""),
                    "ingest_rejected"
                );
                return IngestDecision::rejected(e.kind());
            }
        };

        let (form_id, fields) =
            match decode_payload(&request.body, request.content_type.as_deref()) {
                Ok(mut fields) => {
                    let form_id = take_form_id(&mut fields)
                        .or(request.form_id.clone())
                        .unwrap_or_else(|| DEFAULT_FORM_ID.to_string());
                    (form_id, fields)
                }
                Err(e) => {
                    warn!(error = %e, body_length = request.body.len(), "ingest_payload_malformed");
                    return IngestDecision::rejected(ErrorKind::MalformedPayload);
                }
            };

        if let Some(allowed) = &self.allowed_forms {
            if !allowed.contains(&form_id) {
                warn!(form_id = %form_id, "ingest_form_not_allowed");
                return IngestDecision::rejected(ErrorKind::FormNotAllowed);
            }
        }

        let field_count = fields.len();
        let submission = Submission::new(
            form_id,
            fields,
            SubmissionMetadata {
                sender_identity: request.sender_identity,
                client_address: request.client_address,
                user_agent: request.user_agent,
                received_at: Utc::now(),
                signature_valid: key_id.is_some(),
                key_id: key_id.clone(),
            },
        );
        let form_id = submission.form_id.clone();
        let submission_id = self.store.insert(submission);

        info!(
            submission_id = %submission_id,
            form_id = %form_id,
            key_id = key_id.as_deref().unwrap_or(""),
            fields = field_count,
            "ingest_accepted"
        );

        IngestDecision::accepted(submission_id, key_id)
    }
}

/// Decode a verified body into a field map.
///
/// Form-encoded bodies repeat keys for multi-value fields; those become arrays.
fn decode_payload(body: &[u8], content_type: Option<&str>) -> Result<Map<String, Value>, String> {
    let is_form = content_type
        .map(|ct| ct.to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    if is_form {
        let mut fields = Map::new();
        for (key, value) in url::form_urlencoded::parse(body) {
            let value = Value::String(value.into_owned());
            match fields.get_mut(key.as_ref()) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    fields.insert(key.into_owned(), value);
                }
            }
        }
        return Ok(fields);
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err("body is not a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn take_form_id(fields: &mut Map<String, Value>) -> Option<String> {
    for key in ["formId", "form_id"] {
        if let Some(Value::String(id)) = fields.get(key) {
            if !id.trim().is_empty() {
                let id = id.trim().to_string();
                fields.remove(key);
                return Some(id);
            }
        }
    }
    None
}
