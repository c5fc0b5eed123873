//! Signature helpers for worker callbacks.
//!
//! Workers sign the raw request body with HMAC-SHA256 using the shared
//! `WORKER_HMAC_SECRET` and send the hex digest in the `X-Worker-Signature`
//! header, optionally prefixed with `sha256=`.

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 of `message` and return it hex-encoded.
///
/// # Errors
///
/// Returns `InvalidLength` if the MAC rejects the key. HMAC accepts keys of
/// any size, so this does not happen with `sha2`.
pub fn hmac_sha256_hex(secret: &[u8], message: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check a worker signature header against the body.
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    if signature.is_empty() {
        return false;
    }
    match hmac_sha256_hex(secret.as_bytes(), body) {
        Ok(expected) => constant_time_eq(&expected, &signature.to_ascii_lowercase()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sha256_matches_known_vector() {
        // RFC 4231 test case 2.
        let result = hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            result,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn constant_time_eq_compares_content_and_length() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
        assert!(!constant_time_eq("abc", "ABC"));
    }

    #[test]
    fn verify_signature_accepts_prefixed_and_uppercase_digests() {
        let body = br#"{"worker_id":"w1"}"#;
        let digest = hmac_sha256_hex(b"s3cret", body).unwrap();
        assert!(verify_signature("s3cret", body, &digest));
        assert!(verify_signature("s3cret", body, &format!("sha256={digest}")));
        assert!(verify_signature("s3cret", body, &digest.to_uppercase()));
    }

    #[test]
    fn verify_signature_rejects_tampering() {
        let digest = hmac_sha256_hex(b"s3cret", b"body").unwrap();
        assert!(!verify_signature("s3cret", b"body2", &digest));
        assert!(!verify_signature("other", b"body", &digest));
        assert!(!verify_signature("s3cret", b"body", ""));
        assert!(!verify_signature("s3cret", b"body", "sha256="));
    }
}
