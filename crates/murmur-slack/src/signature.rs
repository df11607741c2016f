//! Slack `v0=` request signature verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Freshness window for the request timestamp header, in seconds.
pub const SIGNATURE_MAX_AGE_SECONDS: u64 = 300;

/// Verifies a Slack webhook signature.
///
/// Returns false for any missing or malformed input; never errors.
/// The digest is HMAC-SHA256 over `"v0:{timestamp}:{body}"` and the
/// comparison runs through the mac's constant-time `verify_slice`.
pub fn verify_signature(
    secret: &str,
    signature_header: Option<&str>,
    timestamp_header: Option<&str>,
    raw_body: &[u8],
    now_unix: u64,
) -> bool {
    let Some(signature) = signature_header.map(str::trim).filter(|v| !v.is_empty()) else {
        return false;
    };
    let Some(timestamp) = timestamp_header.map(str::trim).filter(|v| !v.is_empty()) else {
        return false;
    };
    if !timestamp_is_fresh(timestamp, now_unix) {
        return false;
    }

    let Some(digest_hex) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Some(signature_bytes) = decode_hex(digest_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(raw_body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn timestamp_is_fresh(timestamp: &str, now_unix: u64) -> bool {
    let Ok(timestamp_seconds) = timestamp.parse::<u64>() else {
        return false;
    };
    now_unix.saturating_sub(timestamp_seconds) <= SIGNATURE_MAX_AGE_SECONDS
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() % 2 != 0 {
        return None;
    }

    let raw = trimmed.as_bytes();
    let mut bytes = Vec::with_capacity(trimmed.len() / 2);
    let mut index = 0usize;
    while index < raw.len() {
        let hex = std::str::from_utf8(&raw[index..index + 2]).ok()?;
        bytes.push(u8::from_str_radix(hex, 16).ok()?);
        index += 2;
    }
    Some(bytes)
}
