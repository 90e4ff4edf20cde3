//! Remote key sources.
//!
//! The signer publishes its current key set as a JSON document, either
//! `{"keys": [{"kid", "n", "e"}, ...]}` or a bare array of the same entries.
//! Entries are returned raw; decoding them is the cache's job so that one
//! bad entry never poisons the rest of the set.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::KeyFetchError;

/// One entry of the remote key document, exactly as published.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteKey {
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub kty: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyDocument {
    Set { keys: Vec<RemoteKey> },
    Bare(Vec<RemoteKey>),
}

/// Parse a key document body.
pub fn parse_key_document(body: &[u8]) -> Result<Vec<RemoteKey>, KeyFetchError> {
    let doc: KeyDocument =
        serde_json::from_slice(body).map_err(|e| KeyFetchError::Malformed(e.to_string()))?;

    Ok(match doc {
        KeyDocument::Set { keys } => keys,
        KeyDocument::Bare(keys) => keys,
    })
}

/// Something that can produce the signer's current key set.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<RemoteKey>, KeyFetchError>;
}

/// Fetches the key document over HTTPS.
#[derive(Clone)]
pub struct HttpKeySource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpKeySource {
    /// Create a source for `url`; every request is bounded by `timeout`.
    pub fn new(url: String, timeout: Duration) -> Result<Self, KeyFetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeyFetchError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn transport_error(&self, e: reqwest::Error) -> KeyFetchError {
        if e.is_timeout() {
            KeyFetchError::Timeout(self.timeout)
        } else {
            KeyFetchError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<Vec<RemoteKey>, KeyFetchError> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = status.as_u16(), "key_source_bad_status");
            return Err(KeyFetchError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;

        let keys = parse_key_document(&body)?;

        info!(
            url = %self.url,
            body_length = body.len(),
            entries = keys.len(),
            "key_source_fetched"
        );

        Ok(keys)
    }
}
