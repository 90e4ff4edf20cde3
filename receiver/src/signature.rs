//! Submission signature verification.
//!
//! Senders sign each submission with RSASSA-PKCS1-v1_5 over SHA-256. Two
//! headers carry the envelope:
//!
//! - signature: `rsa-sha256=<base64 signature>`
//! - timestamp: Unix epoch seconds (milliseconds are tolerated)
//!
//! The signed message is `<timestamp header>.<raw body bytes>`. The body is
//! used exactly as received; it must never be re-serialized before this check.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use tracing::{debug, warn};

use crate::error::VerifyError;
use crate::keys::{KeyCache, KeyCacheSnapshot};

/// The only supported algorithm tag.
pub const SIGNATURE_ALGORITHM: &str = "rsa-sha256";

/// Default accepted clock skew in either direction (5 minutes).
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(300);

/// Timestamps above this are read as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// A parsed signature header plus its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEnvelope {
    pub algorithm_tag: String,
    pub signature_bytes: Vec<u8>,
    /// Claimed signing time in Unix seconds.
    pub claimed_timestamp: i64,
    /// The timestamp header exactly as sent; part of the signed message.
    pub timestamp_raw: String,
}

impl SignatureEnvelope {
    /// Parse both headers. Any shape problem is a `SignatureFormat` error.
    pub fn parse(
        signature_header: Option<&str>,
        timestamp_header: Option<&str>,
    ) -> Result<Self, VerifyError> {
        let header = signature_header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(VerifyError::SignatureFormat("missing signature header"))?;

        let (algorithm_tag, encoded) = header
            .split_once('=')
            .ok_or(VerifyError::SignatureFormat("missing algorithm prefix"))?;
        if !algorithm_tag.eq_ignore_ascii_case(SIGNATURE_ALGORITHM) {
            return Err(VerifyError::SignatureFormat("unknown algorithm prefix"));
        }

        let encoded = encoded.trim();
        let signature_bytes = STANDARD_LENIENT
            .decode(encoded)
            .or_else(|_| URL_SAFE_LENIENT.decode(encoded))
            .map_err(|_| VerifyError::SignatureFormat("signature is not base64"))?;
        if signature_bytes.is_empty() {
            return Err(VerifyError::SignatureFormat("empty signature"));
        }

        let timestamp_raw = timestamp_header
            .filter(|t| !t.trim().is_empty())
            .ok_or(VerifyError::SignatureFormat("missing timestamp header"))?;
        let claimed: i64 = timestamp_raw
            .trim()
            .parse()
            .map_err(|_| VerifyError::SignatureFormat("timestamp is not an integer"))?;
        let claimed_timestamp = if claimed > MILLIS_THRESHOLD {
            claimed / 1000
        } else {
            claimed
        };

        Ok(Self {
            algorithm_tag: algorithm_tag.to_ascii_lowercase(),
            signature_bytes,
            claimed_timestamp,
            timestamp_raw: timestamp_raw.to_string(),
        })
    }

    /// `<timestamp>.<body>`, byte for byte.
    pub fn canonical_message(&self, body: &[u8]) -> Vec<u8> {
        let mut message = Vec::with_capacity(self.timestamp_raw.len() + 1 + body.len());
        message.extend_from_slice(self.timestamp_raw.as_bytes());
        message.push(b'.');
        message.extend_from_slice(body);
        message
    }
}

/// Reject timestamps further than `max_skew` from `now`, in either direction.
pub fn check_freshness(claimed: i64, now: i64, max_skew: Duration) -> Result<(), VerifyError> {
    let age = now.abs_diff(claimed);
    if age > max_skew.as_secs() {
        warn!(
            claimed = claimed,
            now = now,
            age_seconds = age,
            max_skew_seconds = max_skew.as_secs(),
            "signature_timestamp_expired"
        );
        return Err(VerifyError::TimestampExpired {
            claimed,
            now,
            window_secs: max_skew.as_secs(),
        });
    }
    Ok(())
}

/// Try every key of one snapshot; return the id of the first that verifies.
pub fn verify_with_snapshot(
    snapshot: &KeyCacheSnapshot,
    message: &[u8],
    signature: &[u8],
) -> Result<String, VerifyError> {
    if snapshot.is_empty() {
        return Err(VerifyError::KeyUnavailable);
    }

    for key in snapshot.keys() {
        if key.verify(message, signature) {
            return Ok(key.key_id().to_string());
        }
        debug!(key_id = %key.key_id(), "signature_key_no_match");
    }

    warn!(
        keys_tried = snapshot.len(),
        signature_length = signature.len(),
        "signature_mismatch"
    );
    Err(VerifyError::SignatureInvalid {
        keys_tried: snapshot.len(),
    })
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub key_id: String,
    pub timestamp: i64,
}

/// Verifies signed submissions against the cached signer keys.
#[derive(Clone)]
pub struct SignatureVerifier {
    cache: KeyCache,
    max_skew: Duration,
}

impl SignatureVerifier {
    pub fn new(cache: KeyCache, max_skew: Duration) -> Self {
        Self { cache, max_skew }
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    pub async fn verify(
        &self,
        signature_header: Option<&str>,
        timestamp_header: Option<&str>,
        body: &[u8],
    ) -> Result<VerifiedSignature, VerifyError> {
        self.verify_at(signature_header, timestamp_header, body, unix_now())
            .await
    }

    /// [`verify`](Self::verify) against an explicit clock reading.
    pub async fn verify_at(
        &self,
        signature_header: Option<&str>,
        timestamp_header: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<VerifiedSignature, VerifyError> {
        let envelope = SignatureEnvelope::parse(signature_header, timestamp_header).map_err(|e| {
            warn!(
                has_signature = signature_header.is_some(),
                has_timestamp = timestamp_header.is_some(),
                error = %e,
                "signature_envelope_invalid"
            );
            e
        })?;

        check_freshness(envelope.claimed_timestamp, now, self.max_skew)?;

        let message = envelope.canonical_message(body);

        let mut snapshot = self.cache.current_snapshot();
        if snapshot.is_empty() {
            // Nothing usable yet: wait for one fetch before giving up.
            if let Ok(refreshed) = self.cache.await_refresh().await {
                snapshot = refreshed;
            }
        }

        let key_id = verify_with_snapshot(&snapshot, &message, &envelope.signature_bytes)?;
        debug!(
            key_id = %key_id,
            generation = snapshot.generation(),
            "signature_verified"
        );

        Ok(VerifiedSignature {
            key_id,
            timestamp: envelope.claimed_timestamp,
        })
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::error::KeyFetchError;
    use crate::keys::DEFAULT_KEY_TTL;
    use crate::testutil::{now_secs, signers, MockKeySource};

    fn verifier(source: Arc<MockKeySource>) -> SignatureVerifier {
        let cache = KeyCache::new(source, DEFAULT_KEY_TTL, Duration::from_secs(1));
        SignatureVerifier::new(cache, DEFAULT_MAX_SKEW)
    }

    fn both_keys() -> Arc<MockKeySource> {
        Arc::new(MockKeySource::new(
            signers().iter().map(|s| s.remote_key()).collect(),
        ))
    }

    #[test]
    fn test_parse_envelope() {
        let envelope =
            SignatureEnvelope::parse(Some("rsa-sha256=AQID"), Some("1700000000")).unwrap();
        assert_eq!(envelope.algorithm_tag, "rsa-sha256");
        assert_eq!(envelope.signature_bytes, vec![1, 2, 3]);
        assert_eq!(envelope.claimed_timestamp, 1_700_000_000);
        assert_eq!(envelope.canonical_message(b"{}"), b"1700000000.{}".to_vec());
    }

    #[test]
    fn test_parse_envelope_accepts_url_safe_and_millis() {
        let envelope =
            SignatureEnvelope::parse(Some("RSA-SHA256=-_8"), Some("1700000000123")).unwrap();
        assert_eq!(envelope.signature_bytes, vec![0xfb, 0xff]);
        assert_eq!(envelope.claimed_timestamp, 1_700_000_000);
        // The raw header, not the normalized value, is what was signed.
        assert_eq!(envelope.timestamp_raw, "1700000000123");
    }

    #[test]
    fn test_parse_envelope_format_errors() {
        let cases: [(Option<&str>, Option<&str>); 7] = [
            (None, Some("1")),
            (Some("   "), Some("1")),
            (Some("AQID"), Some("1")),
            (Some("hmac-sha256=AQID"), Some("1")),
            (Some("rsa-sha256=@@@"), Some("1")),
            (Some("rsa-sha256=AQID"), None),
            (Some("rsa-sha256=AQID"), Some("yesterday")),
        ];
        for (signature, timestamp) in cases {
            assert!(
                matches!(
                    SignatureEnvelope::parse(signature, timestamp),
                    Err(VerifyError::SignatureFormat(_))
                ),
                "expected format error for {:?}/{:?}",
                signature,
                timestamp
            );
        }
    }

    #[test]
    fn test_check_freshness_window() {
        let window = Duration::from_secs(300);
        assert!(check_freshness(1000, 1000, window).is_ok());
        assert!(check_freshness(700, 1000, window).is_ok());
        assert!(check_freshness(1300, 1000, window).is_ok());
        assert!(check_freshness(699, 1000, window).is_err());
        assert!(check_freshness(1301, 1000, window).is_err());
    }

    #[tokio::test]
    async fn test_valid_signature_reports_matching_key() {
        let source = both_keys();
        let verifier = verifier(source.clone());
        let body = br#"{"formId":"contact","email":"a@example.com"}"#;
        let timestamp = (now_secs() - 10).to_string();

        for signer in signers() {
            let header = signer.signature_header(&timestamp, body);
            let verified = verifier
                .verify(Some(&header), Some(&timestamp), body)
                .await
                .unwrap();
            assert_eq!(verified.key_id, signer.key_id);
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_old_timestamp_rejected_even_with_valid_signature() {
        let verifier = verifier(both_keys());
        let body = b"{}";
        let timestamp = (now_secs() - 360).to_string();
        let header = signers()[0].signature_header(&timestamp, body);

        let err = verifier
            .verify(Some(&header), Some(&timestamp), body)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::TimestampExpired { .. }));
    }

    #[tokio::test]
    async fn test_format_error_happens_before_key_lookup() {
        let source = both_keys();
        let verifier = verifier(source.clone());
        let timestamp = now_secs().to_string();

        let err = verifier
            .verify(Some("c2lnbmF0dXJl"), Some(&timestamp), b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::SignatureFormat(_)));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_signer_is_signature_invalid() {
        let source = Arc::new(MockKeySource::new(vec![signers()[0].remote_key()]));
        let verifier = verifier(source);
        let body = b"{}";
        let timestamp = now_secs().to_string();
        let header = signers()[1].signature_header(&timestamp, body);

        let err = verifier
            .verify(Some(&header), Some(&timestamp), body)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::SignatureInvalid { keys_tried: 1 }));
    }

    #[tokio::test]
    async fn test_reserialized_body_does_not_verify() {
        let verifier = verifier(both_keys());
        let body = br#"{"a": 1, "b": 2}"#;
        let timestamp = now_secs().to_string();
        let header = signers()[0].signature_header(&timestamp, body);

        let reencoded = serde_json::to_vec(
            &serde_json::from_slice::<serde_json::Value>(body).unwrap(),
        )
        .unwrap();
        assert_ne!(reencoded, body.to_vec());

        let err = verifier
            .verify(Some(&header), Some(&timestamp), &reencoded)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::SignatureInvalid { .. }));
    }

    #[tokio::test]
    async fn test_no_keys_is_key_unavailable() {
        let source = Arc::new(MockKeySource::failing(KeyFetchError::Transport(
            "connection refused".to_string(),
        )));
        let verifier = verifier(source);
        let body = b"{}";
        let timestamp = now_secs().to_string();
        let header = signers()[0].signature_header(&timestamp, body);

        let err = verifier
            .verify(Some(&header), Some(&timestamp), body)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::KeyUnavailable));
    }

    #[tokio::test]
    async fn test_previous_snapshot_still_verifies_after_failed_refresh() {
        let source = both_keys();
        let verifier = verifier(source.clone());
        verifier.cache().refresh().await.unwrap();

        source.set_response(Err(KeyFetchError::Malformed("eof".to_string())));
        assert!(verifier.cache().refresh().await.is_err());

        let body = b"{}";
        let timestamp = now_secs().to_string();
        let header = signers()[1].signature_header(&timestamp, body);
        let verified = verifier
            .verify(Some(&header), Some(&timestamp), body)
            .await
            .unwrap();
        assert_eq!(verified.key_id, "key-b");
    }

    #[tokio::test]
    async fn test_concurrent_verifications_after_ttl_share_one_fetch() {
        let source = Arc::new(
            MockKeySource::new(signers().iter().map(|s| s.remote_key()).collect())
                .with_delay(Duration::from_millis(50)),
        );
        let cache = KeyCache::new(source.clone(), Duration::from_millis(10), Duration::from_secs(1));
        let verifier = SignatureVerifier::new(cache, DEFAULT_MAX_SKEW);
        verifier.cache().refresh().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let body = b"{}";
        let timestamp = now_secs().to_string();
        let header = signers()[0].signature_header(&timestamp, body);

        let results = futures::future::join_all(
            (0..24).map(|_| verifier.verify(Some(&header), Some(&timestamp), body)),
        )
        .await;
        assert!(results.iter().all(|r| r.is_ok()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        // One initial fetch plus exactly one background refresh.
        assert_eq!(source.calls(), 2);
    }
}
