//! HMAC-SHA256 Webhook Signing
//!
//! Verifies inbound webhook signatures and produces signatures in the same
//! wire formats. Two schemes are supported:
//!
//! - Versioned: `"{version}=" + hex(hmac(secret, "{version}:{timestamp}:{body}"))`
//!   with a freshness window on the timestamp (chat platforms).
//! - Body digest: `"{prefix}=" + hex(hmac(secret, body))` (source-hosting platforms).
//!
//! Verification never panics on malformed input; every failure is reported as
//! a [`VerifyFailure`].

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default freshness window for timestamped signatures.
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Why a signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyFailure {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("malformed timestamp")]
    MalformedTimestamp,
    #[error("timestamp outside tolerance window")]
    StaleTimestamp,
    #[error("signature mismatch")]
    Mismatch,
}

/// Result of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub reason: Option<VerifyFailure>,
}

impl Verification {
    const fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    const fn fail(reason: VerifyFailure) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }

    /// Convert into a `Result`, for `?`-style callers.
    pub fn into_result(self) -> Result<(), VerifyFailure> {
        match self.reason {
            None => Ok(()),
            Some(reason) => Err(reason),
        }
    }
}

/// How a provider signs its deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Timestamped canonical string, e.g. `v0:1700000000:{body}`.
    Versioned { version: String },
    /// HMAC over the raw body only, e.g. `sha256=<hex>`.
    BodyDigest { prefix: String },
}

impl SignatureScheme {
    pub fn versioned(version: impl Into<String>) -> Self {
        Self::Versioned {
            version: version.into(),
        }
    }

    pub fn body_digest(prefix: impl Into<String>) -> Self {
        Self::BodyDigest {
            prefix: prefix.into(),
        }
    }
}

fn mac_for(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size")
}

/// Split `"{label}=<hex>"` and decode the hex digest.
fn decode_signature(signature: &str, label: &str) -> Option<Vec<u8>> {
    let (found, digest) = signature.trim().split_once('=')?;
    if found != label || digest.len() != 64 {
        return None;
    }
    hex::decode(digest).ok()
}

/// Verify a timestamped signature against the current wall clock.
///
/// `timestamp` is the raw header value (unix seconds).
pub fn verify(
    secret: &[u8],
    version: &str,
    raw_body: &[u8],
    signature: &str,
    timestamp: &str,
    tolerance_secs: u64,
) -> Verification {
    verify_at(
        secret,
        version,
        raw_body,
        signature,
        timestamp,
        tolerance_secs,
        chrono::Utc::now().timestamp(),
    )
}

/// Verify a timestamped signature with an explicit version and clock reading.
pub fn verify_at(
    secret: &[u8],
    version: &str,
    raw_body: &[u8],
    signature: &str,
    timestamp: &str,
    tolerance_secs: u64,
    now_unix: i64,
) -> Verification {
    let Ok(ts) = timestamp.trim().parse::<i64>() else {
        return Verification::fail(VerifyFailure::MalformedTimestamp);
    };

    // Replay protection comes before any HMAC work.
    if now_unix.abs_diff(ts) > tolerance_secs {
        return Verification::fail(VerifyFailure::StaleTimestamp);
    }

    let Some(provided) = decode_signature(signature, version) else {
        return Verification::fail(VerifyFailure::MalformedSignature);
    };

    let mut mac = mac_for(secret);
    mac.update(version.as_bytes());
    mac.update(b":");
    mac.update(timestamp.trim().as_bytes());
    mac.update(b":");
    mac.update(raw_body);

    // `verify_slice` compares in constant time.
    match mac.verify_slice(&provided) {
        Ok(()) => Verification::ok(),
        Err(_) => Verification::fail(VerifyFailure::Mismatch),
    }
}

/// Verify a body-only signature (`"{prefix}=<hex>"`).
pub fn verify_body(secret: &[u8], prefix: &str, raw_body: &[u8], signature: &str) -> Verification {
    let Some(provided) = decode_signature(signature, prefix) else {
        return Verification::fail(VerifyFailure::MalformedSignature);
    };

    let mut mac = mac_for(secret);
    mac.update(raw_body);

    match mac.verify_slice(&provided) {
        Ok(()) => Verification::ok(),
        Err(_) => Verification::fail(VerifyFailure::Mismatch),
    }
}

/// Produce a versioned signature header value.
pub fn sign_versioned(secret: &[u8], version: &str, timestamp: i64, raw_body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(format!("{version}:{timestamp}:").as_bytes());
    mac.update(raw_body);
    format!("{version}={}", hex::encode(mac.finalize().into_bytes()))
}

/// Produce a body-digest signature header value.
pub fn sign_body(secret: &[u8], prefix: &str, raw_body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(raw_body);
    format!("{prefix}={}", hex::encode(mac.finalize().into_bytes()))
}
