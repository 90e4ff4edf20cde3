//! Test fixtures: RSA signers and a scriptable key source.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    OnceLock,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use parking_lot::Mutex;
use rsa::{
    pkcs1v15::SigningKey,
    signature::{SignatureEncoding, Signer},
    traits::PublicKeyParts,
    RsaPrivateKey,
};
use sha2::Sha256;

use crate::error::KeyFetchError;
use crate::keys::{KeySource, RemoteKey};

/// Key size for fixtures; small enough to generate quickly in debug builds.
const TEST_KEY_BITS: usize = 1024;

/// A private key with the id it is published under.
pub struct TestSigner {
    pub key_id: String,
    private: RsaPrivateKey,
}

impl TestSigner {
    fn generate(key_id: &str) -> Self {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, TEST_KEY_BITS).expect("generate test key");
        Self {
            key_id: key_id.to_string(),
            private,
        }
    }

    pub fn modulus(&self) -> Vec<u8> {
        self.private.n().to_bytes_be()
    }

    pub fn exponent(&self) -> Vec<u8> {
        self.private.e().to_bytes_be()
    }

    /// The entry this key would have in the remote key document.
    pub fn remote_key(&self) -> RemoteKey {
        RemoteKey {
            kid: Some(self.key_id.clone()),
            kty: Some("RSA".to_string()),
            n: Some(URL_SAFE_NO_PAD.encode(self.modulus())),
            e: Some(URL_SAFE_NO_PAD.encode(self.exponent())),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        SigningKey::<Sha256>::new(self.private.clone())
            .sign(message)
            .to_vec()
    }

    /// `rsa-sha256=<base64>` over `<timestamp>.<body>`.
    pub fn signature_header(&self, timestamp: &str, body: &[u8]) -> String {
        let mut message = Vec::with_capacity(timestamp.len() + 1 + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.push(b'.');
        message.extend_from_slice(body);
        format!("rsa-sha256={}", STANDARD.encode(self.sign(&message)))
    }
}

/// Two distinct signers, generated once per test binary.
pub fn signers() -> &'static [TestSigner; 2] {
    static SIGNERS: OnceLock<[TestSigner; 2]> = OnceLock::new();
    SIGNERS.get_or_init(|| [TestSigner::generate("key-a"), TestSigner::generate("key-b")])
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Key source returning a scripted response and counting calls.
pub struct MockKeySource {
    response: Mutex<Result<Vec<RemoteKey>, KeyFetchError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockKeySource {
    pub fn new(keys: Vec<RemoteKey>) -> Self {
        Self {
            response: Mutex::new(Ok(keys)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: KeyFetchError) -> Self {
        Self {
            response: Mutex::new(Err(error)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_response(&self, response: Result<Vec<RemoteKey>, KeyFetchError>) {
        *self.response.lock() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for MockKeySource {
    async fn fetch(&self) -> Result<Vec<RemoteKey>, KeyFetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response.lock().clone()
    }
}
