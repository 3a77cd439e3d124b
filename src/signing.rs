//! HMAC-SHA256 payload signatures for signed deliveries and their receivers.
//!
//! The signed string is `"{timestamp}.{payload}"` when a timestamp is sent,
//! otherwise the payload alone. Signatures travel as `sha256=<hex>`.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::http::split_header;

type HmacSha256 = Hmac<Sha256>;

const SCHEME_PREFIX: &str = "sha256=";

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Hook-Signature";
pub const DEFAULT_TIMESTAMP_HEADER: &str = "X-Hook-Timestamp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingTimestamp,
    InvalidTimestamp,
    StaleTimestamp,
    MalformedSignature,
    InvalidSignature,
    InvalidKey,
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationError::MissingSignature => write!(f, "signature header missing"),
            VerificationError::MissingTimestamp => write!(f, "timestamp header missing"),
            VerificationError::InvalidTimestamp => write!(f, "timestamp is not a unix time"),
            VerificationError::StaleTimestamp => write!(f, "timestamp outside tolerance"),
            VerificationError::MalformedSignature => write!(f, "signature is not sha256=<hex>"),
            VerificationError::InvalidSignature => write!(f, "signature mismatch"),
            VerificationError::InvalidKey => write!(f, "secret rejected by hmac"),
        }
    }
}

impl std::error::Error for VerificationError {}

fn signed_bytes(payload: &[u8], timestamp: Option<&str>) -> Vec<u8> {
    match timestamp {
        Some(ts) => {
            let mut data = Vec::with_capacity(ts.len() + 1 + payload.len());
            data.extend_from_slice(ts.as_bytes());
            data.push(b'.');
            data.extend_from_slice(payload);
            data
        }
        None => payload.to_vec(),
    }
}

fn keyed(secret: &[u8]) -> Result<HmacSha256, VerificationError> {
    HmacSha256::new_from_slice(secret).map_err(|_| VerificationError::InvalidKey)
}

/// Sign `payload`, returning the `sha256=<hex>` header value.
pub fn compute_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
) -> Result<String, VerificationError> {
    let mut mac = keyed(secret)?;
    mac.update(&signed_bytes(payload, timestamp));
    Ok(format!("{}{}", SCHEME_PREFIX, hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time check of a `sha256=<hex>` value. The prefix is optional.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
    signature: &str,
) -> Result<(), VerificationError> {
    let encoded = signature.strip_prefix(SCHEME_PREFIX).unwrap_or(signature);
    let expected = hex::decode(encoded).map_err(|_| VerificationError::MalformedSignature)?;

    let mut mac = keyed(secret)?;
    mac.update(&signed_bytes(payload, timestamp));
    mac.verify_slice(&expected)
        .map_err(|_| VerificationError::InvalidSignature)
}

/// True when `timestamp_secs` is at most `tolerance_secs` away from now,
/// in either direction.
pub fn is_timestamp_fresh(timestamp_secs: i64, now_secs: i64, tolerance_secs: i64) -> bool {
    (now_secs - timestamp_secs).abs() <= tolerance_secs
}

/// Signature and timestamp pulled from `Name: value` headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

pub fn parse_signature_headers(
    headers: &[String],
    signature_header: &str,
    timestamp_header: &str,
) -> ParsedSignature {
    let mut parsed = ParsedSignature::default();
    for (name, value) in headers.iter().filter_map(|h| split_header(h)) {
        if name.eq_ignore_ascii_case(signature_header) {
            parsed.signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(timestamp_header) {
            parsed.timestamp = Some(value.to_string());
        }
    }
    parsed
}

/// Receiver-side check of a signed delivery.
///
/// When `tolerance_secs` is `Some`, a timestamp header is required and must
/// be fresh. With `None` the payload alone is verified.
pub fn verify_delivery(
    headers: &[String],
    payload: &[u8],
    secret: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    tolerance_secs: Option<i64>,
    now_secs: i64,
) -> Result<(), VerificationError> {
    let parsed = parse_signature_headers(headers, signature_header, timestamp_header);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;

    let Some(tolerance) = tolerance_secs else {
        return verify_signature(secret, payload, None, &signature);
    };

    let raw = parsed.timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let ts: i64 = raw.parse().map_err(|_| VerificationError::InvalidTimestamp)?;
    if !is_timestamp_fresh(ts, now_secs, tolerance) {
        return Err(VerificationError::StaleTimestamp);
    }
    verify_signature(secret, payload, Some(&raw), &signature)
}
