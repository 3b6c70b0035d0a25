//! Hashing and random-secret helpers shared by every lifecycle component.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::error::{Error, Result};

/// Hash a raw token so only the digest ever reaches storage or logs.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compare two secrets without leaking the position of the first difference.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// 256 bits from the OS RNG, URL-safe base64 without padding (43 chars).
///
/// # Errors
/// Returns [`Error::Validation`] if the OS RNG fails.
pub fn random_code() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| Error::Validation(format!("failed to generate random code: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}
