//! Signer key handling.
//!
//! ```text
//! key document → source (raw entries) → codec (DER SPKI) → cache (snapshot)
//! ```

pub mod cache;
pub mod codec;
pub mod source;

pub use cache::{
    KeyCache, KeyCacheSnapshot, PublicKeyHandle, DEFAULT_FETCH_TIMEOUT, DEFAULT_KEY_TTL,
};
pub use codec::{encode_rsa_spki, KeyDescriptor};
pub use source::{parse_key_document, HttpKeySource, KeySource, RemoteKey};
