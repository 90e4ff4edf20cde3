//! Signer key cache.
//!
//! Holds the signer's keys as one immutable [`KeyCacheSnapshot`] behind a
//! pointer swap. Readers clone the `Arc` and never see a half-built map;
//! a refresh builds the complete replacement before publishing it.
//!
//! # Refresh
//!
//! - [`KeyCache::current_snapshot`] never waits. A stale snapshot is still
//!   returned, and at most one background refresh is started for it.
//! - [`KeyCache::await_refresh`] waits for fresh keys. Concurrent callers
//!   share one fetch: whoever queued behind an attempt that finished while
//!   they waited takes its outcome instead of fetching again.
//! - Every fetch is bounded by the configured timeout. A failed fetch keeps
//!   the previous snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rsa::{
    pkcs1v15::{Signature, VerifyingKey},
    pkcs8::DecodePublicKey,
    signature::Verifier,
    RsaPublicKey,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::codec::KeyDescriptor;
use super::source::{KeySource, RemoteKey};
use crate::error::{KeyCodecError, KeyFetchError};

/// Default snapshot time-to-live (24 hours).
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default hard timeout for one key fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// A decoded, ready-to-use verification key.
pub struct PublicKeyHandle {
    key_id: String,
    der: Vec<u8>,
    fingerprint: String,
    verifying_key: VerifyingKey<Sha256>,
}

impl PublicKeyHandle {
    /// Encode `descriptor` and decode the result with the RSA primitive.
    pub fn from_descriptor(descriptor: &KeyDescriptor) -> Result<Self, KeyCodecError> {
        let der = descriptor.to_spki_der()?;
        let public_key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| KeyCodecError::Der(e.to_string()))?;

        let digest = Sha256::digest(&der);
        let fingerprint = hex::encode(&digest[..8]);

        Ok(Self {
            key_id: descriptor.key_id.clone(),
            der,
            fingerprint,
            verifying_key: VerifyingKey::<Sha256>::new(public_key),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// DER `SubjectPublicKeyInfo` of this key.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// First 8 bytes of SHA-256 over the DER, hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// RSASSA-PKCS1-v1_5 / SHA-256 check of `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        self.verifying_key.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for PublicKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKeyHandle")
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint)
            .field("der_length", &self.der.len())
            .finish()
    }
}

/// One immutable generation of the key set.
#[derive(Debug, Default)]
pub struct KeyCacheSnapshot {
    keys: HashMap<String, Arc<PublicKeyHandle>>,
    fetched_at: Option<Instant>,
    generation: u64,
}

impl KeyCacheSnapshot {
    /// Build a snapshot from already-decoded keys.
    pub fn from_keys(keys: impl IntoIterator<Item = PublicKeyHandle>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|k| (k.key_id.clone(), Arc::new(k)))
                .collect(),
            fetched_at: Some(Instant::now()),
            generation: 0,
        }
    }

    pub fn get(&self, key_id: &str) -> Option<&Arc<PublicKeyHandle>> {
        self.keys.get(key_id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Arc<PublicKeyHandle>> {
        self.keys.values()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Time since the fetch that produced this snapshot; `None` if never fetched.
    pub fn age(&self) -> Option<Duration> {
        self.fetched_at.map(|t| t.elapsed())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        match self.age() {
            Some(age) => age > ttl,
            None => true,
        }
    }
}

/// Shared, cheaply cloneable handle to the key cache.
#[derive(Clone)]
pub struct KeyCache {
    inner: Arc<KeyCacheInner>,
}

struct KeyCacheInner {
    source: Arc<dyn KeySource>,
    ttl: Duration,
    fetch_timeout: Duration,
    snapshot: RwLock<Arc<KeyCacheSnapshot>>,
    /// Serializes fetches. Holds the error of the last failed attempt.
    refresh_lock: Mutex<Option<KeyFetchError>>,
    /// Completed fetch attempts, successful or not.
    attempts: AtomicU64,
    background_refresh: AtomicBool,
    refresh_failures: AtomicU64,
}

impl KeyCache {
    pub fn new(source: Arc<dyn KeySource>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self::with_snapshot(source, ttl, fetch_timeout, KeyCacheSnapshot::default())
    }

    /// Start from a pre-built snapshot instead of an empty one.
    pub fn with_snapshot(
        source: Arc<dyn KeySource>,
        ttl: Duration,
        fetch_timeout: Duration,
        snapshot: KeyCacheSnapshot,
    ) -> Self {
        Self {
            inner: Arc::new(KeyCacheInner {
                source,
                ttl,
                fetch_timeout,
                snapshot: RwLock::new(Arc::new(snapshot)),
                refresh_lock: Mutex::new(None),
                attempts: AtomicU64::new(0),
                background_refresh: AtomicBool::new(false),
                refresh_failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Number of fetches attempted so far.
    pub fn refresh_count(&self) -> u64 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    pub fn refresh_failures(&self) -> u64 {
        self.inner.refresh_failures.load(Ordering::Relaxed)
    }

    /// Return the live snapshot without waiting.
    ///
    /// If it is stale a single background refresh is started; the caller
    /// still gets the current (stale) snapshot.
    pub fn current_snapshot(&self) -> Arc<KeyCacheSnapshot> {
        let snapshot = self.inner.snapshot.read().clone();
        if snapshot.is_stale(self.inner.ttl) {
            self.spawn_background_refresh();
        }
        snapshot
    }

    fn spawn_background_refresh(&self) {
        if self
            .inner
            .background_refresh
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // A refresh may have published between the caller's read and the flag.
        if !self.inner.snapshot.read().is_stale(self.inner.ttl) {
            self.inner.background_refresh.store(false, Ordering::Release);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.inner.background_refresh.store(false, Ordering::Release);
            debug!("key_cache_background_refresh_no_runtime");
            return;
        };

        // Captured now so a fetch finishing before the task runs is shared.
        let observed = self.inner.attempts.load(Ordering::Acquire);
        let cache = self.clone();
        runtime.spawn(async move {
            debug!("key_cache_background_refresh_start");
            if let Err(e) = cache.refresh_after(observed).await {
                warn!(error = %e, "key_cache_background_refresh_failed");
            }
            cache.inner.background_refresh.store(false, Ordering::Release);
        });
    }

    /// Wait for a fresh snapshot, sharing the fetch with concurrent callers.
    ///
    /// A failed fetch still succeeds with the previous snapshot when that
    /// snapshot has keys; only a cache with nothing usable returns the error.
    pub async fn await_refresh(&self) -> Result<Arc<KeyCacheSnapshot>, KeyFetchError> {
        let observed = self.inner.attempts.load(Ordering::Acquire);
        self.refresh_after(observed).await
    }

    /// Fetch unless an attempt completed since `observed` was read.
    async fn refresh_after(&self, observed: u64) -> Result<Arc<KeyCacheSnapshot>, KeyFetchError> {
        let mut last_error = self.inner.refresh_lock.lock().await;

        let outcome = if self.inner.attempts.load(Ordering::Acquire) != observed {
            // Another caller fetched while we queued; share its result.
            match last_error.as_ref() {
                Some(e) => Err(e.clone()),
                None => Ok(self.inner.snapshot.read().clone()),
            }
        } else {
            let result = self.fetch_and_publish().await;
            *last_error = result.as_ref().err().cloned();
            result
        };
        drop(last_error);

        match outcome {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                let previous = self.inner.snapshot.read().clone();
                if previous.is_empty() {
                    Err(e)
                } else {
                    warn!(
                        error = %e,
                        keys = previous.len(),
                        generation = previous.generation,
                        "key_cache_serving_previous_snapshot"
                    );
                    Ok(previous)
                }
            }
        }
    }

    /// Fetch the key set now, regardless of freshness.
    ///
    /// Unlike [`await_refresh`](Self::await_refresh) a failed fetch is always
    /// returned as an error; the previous snapshot stays published either way.
    pub async fn refresh(&self) -> Result<Arc<KeyCacheSnapshot>, KeyFetchError> {
        let mut last_error = self.inner.refresh_lock.lock().await;
        let result = self.fetch_and_publish().await;
        *last_error = result.as_ref().err().cloned();
        result
    }

    /// Caller must hold `refresh_lock`.
    async fn fetch_and_publish(&self) -> Result<Arc<KeyCacheSnapshot>, KeyFetchError> {
        let started = Instant::now();
        let fetched =
            tokio::time::timeout(self.inner.fetch_timeout, self.inner.source.fetch()).await;

        let result = match fetched {
            Err(_) => Err(KeyFetchError::Timeout(self.inner.fetch_timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(entries)) => {
                let (keys, skipped) = build_key_map(entries);
                if keys.is_empty() {
                    Err(KeyFetchError::NoUsableKeys { skipped })
                } else {
                    Ok(self.publish(keys, skipped, started))
                }
            }
        };

        self.inner.attempts.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = &result {
            self.inner.refresh_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                has_previous_snapshot = !self.inner.snapshot.read().is_empty(),
                "key_cache_refresh_failed"
            );
        }
        result
    }

    fn publish(
        &self,
        keys: HashMap<String, Arc<PublicKeyHandle>>,
        skipped: usize,
        started: Instant,
    ) -> Arc<KeyCacheSnapshot> {
        let mut slot = self.inner.snapshot.write();
        let snapshot = Arc::new(KeyCacheSnapshot {
            keys,
            fetched_at: Some(Instant::now()),
            generation: slot.generation + 1,
        });
        *slot = Arc::clone(&snapshot);
        drop(slot);

        info!(
            keys = snapshot.len(),
            skipped = skipped,
            generation = snapshot.generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "key_cache_refreshed"
        );
        snapshot
    }
}

/// Decode every usable entry; returns the map and the number skipped.
fn build_key_map(entries: Vec<RemoteKey>) -> (HashMap<String, Arc<PublicKeyHandle>>, usize) {
    let mut keys = HashMap::with_capacity(entries.len());
    let mut skipped = 0;

    for entry in entries {
        match decode_entry(&entry) {
            Ok(handle) => {
                debug!(
                    key_id = %handle.key_id,
                    fingerprint = %handle.fingerprint,
                    "key_descriptor_decoded"
                );
                if let Some(previous) = keys.insert(handle.key_id.clone(), Arc::new(handle)) {
                    warn!(key_id = %previous.key_id, "key_descriptor_duplicate_kid");
                }
            }
            Err(e) => {
                skipped += 1;
                warn!(
                    key_id = entry.kid.as_deref().unwrap_or("<missing>"),
                    error = %e,
                    "key_descriptor_skipped"
                );
            }
        }
    }

    (keys, skipped)
}

fn decode_entry(entry: &RemoteKey) -> Result<PublicKeyHandle, KeyCodecError> {
    if let Some(kty) = entry.kty.as_deref() {
        if kty != "RSA" {
            return Err(KeyCodecError::Format("unsupported key type"));
        }
    }
    let kid = entry
        .kid
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or(KeyCodecError::Format("missing kid"))?;
    let n = entry.n.as_deref().ok_or(KeyCodecError::Format("missing n"))?;
    let e = entry.e.as_deref().ok_or(KeyCodecError::Format("missing e"))?;

    let descriptor = KeyDescriptor::from_base64url(kid, n, e)?;
    PublicKeyHandle::from_descriptor(&descriptor)
}
