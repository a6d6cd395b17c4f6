// common/src/initdata.rs
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::models::user::AuthUser;

type HmacSha256 = Hmac<Sha256>;

/// Reason an identity assertion failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyFailure {
    #[error("Missing hash")]
    MissingHash,
    #[error("Malformed field")]
    MalformedField,
    #[error("Invalid data hash")]
    InvalidHash,
    #[error("Server configuration error")]
    ServerMisconfigured,
}

/// Outcome of verifying an identity assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub reason: Option<VerifyFailure>,
}

impl VerificationResult {
    fn ok() -> Self {
        Self { valid: true, reason: None }
    }

    fn fail(reason: VerifyFailure) -> Self {
        Self { valid: false, reason: Some(reason) }
    }
}

/// Error extracting the embedded user profile from an assertion
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("initData has no user field")]
    MissingUser,
    #[error("malformed user field: {0}")]
    MalformedUser(#[from] serde_json::Error),
    #[error("malformed initData field")]
    MalformedField,
}

/// Verify the signature of an identity assertion against the bot credential.
///
/// The assertion is an `&`-separated, percent-encoded field list signed by
/// the host platform: the `hash` field carries HMAC-SHA256 over the remaining
/// fields (sorted by name, joined `key=value` with `\n`), keyed with
/// SHA-256 of the bot credential. Stateless and safe to call concurrently;
/// the credential is supplied per call.
pub fn verify(init_data: &str, bot_token: &str) -> VerificationResult {
    // A missing credential is a deployment fault, not attacker input
    if bot_token.is_empty() {
        return VerificationResult::fail(VerifyFailure::ServerMisconfigured);
    }

    let mut fields = match parse_fields(init_data) {
        Ok(fields) => fields,
        Err(_) => return VerificationResult::fail(VerifyFailure::MalformedField),
    };

    let received_hash = match fields.remove("hash") {
        Some(hash) => hash,
        None => return VerificationResult::fail(VerifyFailure::MissingHash),
    };
    // The companion signature field is not part of the authenticated data
    fields.remove("signature");

    // data_check_string: remaining fields sorted by name, one per line
    let canonical = fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");

    let secret_key = Sha256::digest(bot_token.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&secret_key)
        .expect("HMAC accepts keys of any length");
    mac.update(canonical.as_bytes());
    let computed = mac.finalize().into_bytes();

    let received = match hex::decode(&received_hash) {
        Ok(bytes) => bytes,
        Err(_) => return VerificationResult::fail(VerifyFailure::InvalidHash),
    };

    // Length mismatch fails before the comparison runs
    if received.len() != computed.len() {
        return VerificationResult::fail(VerifyFailure::InvalidHash);
    }

    if bool::from(computed.as_slice().ct_eq(received.as_slice())) {
        VerificationResult::ok()
    } else {
        VerificationResult::fail(VerifyFailure::InvalidHash)
    }
}

/// Extract the user profile embedded in an assertion's `user` field.
///
/// Call only after `verify` has accepted the assertion; this does not check
/// the signature.
pub fn parse_auth_user(init_data: &str) -> Result<AuthUser, ProfileError> {
    let fields = parse_fields(init_data).map_err(|_| ProfileError::MalformedField)?;
    let raw = fields.get("user").ok_or(ProfileError::MissingUser)?;
    let user = serde_json::from_str(raw)?;
    Ok(user)
}

/// Look up a single decoded field of an assertion without verifying it
pub fn parse_field(init_data: &str, key: &str) -> Option<String> {
    parse_fields(init_data).ok()?.remove(key)
}

struct FieldError;

// Fields sorted by name; a repeated name keeps its last occurrence
fn parse_fields(init_data: &str) -> Result<BTreeMap<String, String>, FieldError> {
    let mut fields = BTreeMap::new();
    for pair in init_data.split('&') {
        if pair.is_empty() {
            continue;
        }
        // Everything after the first '=' belongs to the value
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        let key = decode_component(key)?;
        let value = decode_component(value)?;
        if key.is_empty() {
            return Err(FieldError);
        }
        fields.insert(key, value);
    }
    Ok(fields)
}

fn decode_component(raw: &str) -> Result<String, FieldError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| FieldError)
}
