//! PKCE (RFC 7636) verifier and challenge helpers.
//!
//! Stateless: the authorization-code flow stores the pending challenge and calls
//! [`validate_code_challenge`] when the verifier is presented.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use super::error::{Error, Result};
use super::hash::constant_time_eq;

pub const MIN_CODE_VERIFIER_LENGTH: usize = 43;
pub const MAX_CODE_VERIFIER_LENGTH: usize = 128;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum CodeChallengeMethod {
    #[default]
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl CodeChallengeMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }
}

impl fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = Error;

    fn from_str(method: &str) -> Result<Self> {
        match method {
            "S256" => Ok(Self::S256),
            "plain" => Ok(Self::Plain),
            _ => Err(Error::InvalidMethod),
        }
    }
}

/// A verifier with its derived challenge, as held by a public client between the
/// authorize and token calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PkceParams {
    pub code_verifier: String,
    pub code_challenge: String,
    pub code_challenge_method: CodeChallengeMethod,
}

impl PkceParams {
    /// Fresh S256 triple.
    ///
    /// # Errors
    /// Fails only if the OS RNG fails.
    pub fn generate() -> Result<Self> {
        let code_verifier = generate_code_verifier()?;
        let code_challenge = generate_code_challenge(&code_verifier, CodeChallengeMethod::S256)?;
        Ok(Self {
            code_verifier,
            code_challenge,
            code_challenge_method: CodeChallengeMethod::S256,
        })
    }
}

/// 32 random bytes encoded as unpadded base64url: always 43 unreserved characters.
///
/// # Errors
/// Fails only if the OS RNG fails.
pub fn generate_code_verifier() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| Error::Validation(format!("failed to generate code verifier: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

#[must_use]
pub fn is_valid_code_verifier(verifier: &str) -> bool {
    (MIN_CODE_VERIFIER_LENGTH..=MAX_CODE_VERIFIER_LENGTH).contains(&verifier.len())
        && verifier.chars().all(is_unreserved)
}

/// Derive the challenge for `verifier`.
///
/// # Errors
/// [`Error::InvalidVerifier`] for a malformed verifier.
pub fn generate_code_challenge(verifier: &str, method: CodeChallengeMethod) -> Result<String> {
    if !is_valid_code_verifier(verifier) {
        return Err(Error::InvalidVerifier);
    }
    match method {
        CodeChallengeMethod::S256 => {
            let digest = Sha256::digest(verifier.as_bytes());
            Ok(Base64UrlUnpadded::encode_string(&digest))
        }
        CodeChallengeMethod::Plain => Ok(verifier.to_string()),
    }
}

/// String-method variant used at API boundaries.
///
/// # Errors
/// [`Error::InvalidMethod`] for anything other than `S256`/`plain`, otherwise as
/// [`generate_code_challenge`].
pub fn derive_challenge(verifier: &str, method: &str) -> Result<String> {
    if !is_valid_code_verifier(verifier) {
        return Err(Error::InvalidVerifier);
    }
    generate_code_challenge(verifier, method.parse()?)
}

/// Recompute the challenge and compare it to `challenge` in constant time.
///
/// # Errors
/// [`Error::InvalidVerifier`], [`Error::InvalidChallenge`] (empty challenge),
/// [`Error::InvalidMethod`] or [`Error::ChallengeMismatch`].
pub fn validate_code_challenge(verifier: &str, challenge: &str, method: &str) -> Result<()> {
    if !is_valid_code_verifier(verifier) {
        return Err(Error::InvalidVerifier);
    }
    if challenge.is_empty() {
        return Err(Error::InvalidChallenge);
    }
    let expected = derive_challenge(verifier, method)?;
    if constant_time_eq(&expected, challenge) {
        Ok(())
    } else {
        Err(Error::ChallengeMismatch)
    }
}

/// Check the PKCE parameters of an authorize request and return the effective method.
///
/// A challenge without a method defaults to `plain`. Returns `None` when PKCE is not
/// in use.
///
/// # Errors
/// [`Error::ChallengeRequired`] / [`Error::MethodRequired`] when `required`, and
/// [`Error::InvalidMethod`] for an unsupported method.
pub fn validate_pkce_request(
    challenge: &str,
    method: &str,
    required: bool,
) -> Result<Option<CodeChallengeMethod>> {
    if required {
        if challenge.is_empty() {
            return Err(Error::ChallengeRequired);
        }
        if method.is_empty() {
            return Err(Error::MethodRequired);
        }
    }

    let method = if method.is_empty() {
        None
    } else {
        Some(method.parse::<CodeChallengeMethod>()?)
    };

    if challenge.is_empty() {
        return Ok(None);
    }
    Ok(Some(method.unwrap_or(CodeChallengeMethod::Plain)))
}
