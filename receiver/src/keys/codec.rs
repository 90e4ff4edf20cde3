//! RSA public key material codec.
//!
//! Remote signers publish keys as a base64url modulus/exponent pair. The
//! verification primitive wants an X.509 `SubjectPublicKeyInfo`, so this
//! module emits exactly that structure and nothing else:
//!
//! ```text
//! SEQUENCE {
//!   SEQUENCE { OID 1.2.840.113549.1.1.1, NULL }
//!   BIT STRING (0 unused bits) {
//!     SEQUENCE { INTEGER n, INTEGER e }
//!   }
//! }
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::error::KeyCodecError;

const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_SEQUENCE: u8 = 0x30;

/// `SEQUENCE { OID rsaEncryption, NULL }`, pre-encoded.
const RSA_ALGORITHM_IDENTIFIER: [u8; 15] = [
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// A key as distributed by the remote signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub key_id: String,
    /// Unsigned big-endian modulus.
    pub modulus: Vec<u8>,
    /// Unsigned big-endian public exponent.
    pub exponent: Vec<u8>,
}

impl KeyDescriptor {
    /// Build a descriptor from the base64url `n`/`e` strings of a key document entry.
    pub fn from_base64url(key_id: &str, n: &str, e: &str) -> Result<Self, KeyCodecError> {
        Ok(Self {
            key_id: key_id.to_string(),
            modulus: decode_base64url("n", n)?,
            exponent: decode_base64url("e", e)?,
        })
    }

    /// Encode this descriptor as DER `SubjectPublicKeyInfo`.
    pub fn to_spki_der(&self) -> Result<Vec<u8>, KeyCodecError> {
        encode_rsa_spki(&self.modulus, &self.exponent)
    }
}

fn decode_base64url(field: &'static str, value: &str) -> Result<Vec<u8>, KeyCodecError> {
    // Some publishers keep the padding; the no-pad engine rejects it.
    URL_SAFE_NO_PAD
        .decode(value.trim().trim_end_matches('='))
        .map_err(|source| KeyCodecError::Base64 { field, source })
}

/// Encode an RSA `(modulus, exponent)` pair as DER `SubjectPublicKeyInfo`.
pub fn encode_rsa_spki(modulus: &[u8], exponent: &[u8]) -> Result<Vec<u8>, KeyCodecError> {
    if modulus.is_empty() {
        return Err(KeyCodecError::Format("empty modulus"));
    }
    if exponent.is_empty() {
        return Err(KeyCodecError::Format("empty exponent"));
    }

    let mut rsa_public_key = Vec::with_capacity(modulus.len() + exponent.len() + 16);
    encode_unsigned_integer(&mut rsa_public_key, modulus, "zero modulus")?;
    encode_unsigned_integer(&mut rsa_public_key, exponent, "zero exponent")?;
    let rsa_public_key = wrap(TAG_SEQUENCE, &rsa_public_key);

    let mut bit_string = Vec::with_capacity(rsa_public_key.len() + 1);
    bit_string.push(0x00);
    bit_string.extend_from_slice(&rsa_public_key);

    let mut body = Vec::with_capacity(RSA_ALGORITHM_IDENTIFIER.len() + bit_string.len() + 8);
    body.extend_from_slice(&RSA_ALGORITHM_IDENTIFIER);
    body.extend_from_slice(&wrap(TAG_BIT_STRING, &bit_string));

    Ok(wrap(TAG_SEQUENCE, &body))
}

/// Append a DER INTEGER holding the unsigned big-endian `value`.
fn encode_unsigned_integer(
    out: &mut Vec<u8>,
    value: &[u8],
    zero_error: &'static str,
) -> Result<(), KeyCodecError> {
    let first_nonzero = value
        .iter()
        .position(|b| *b != 0)
        .ok_or(KeyCodecError::Format(zero_error))?;
    let value = &value[first_nonzero..];

    // A set high bit would read back as a negative number.
    let pad = value[0] & 0x80 != 0;
    let len = value.len() + usize::from(pad);

    out.push(TAG_INTEGER);
    encode_length(out, len);
    if pad {
        out.push(0x00);
    }
    out.extend_from_slice(value);
    Ok(())
}

fn wrap(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    encode_length(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

/// Append a DER length: short form below 128, long form otherwise.
fn encode_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }

    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let significant = &bytes[skip..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}
