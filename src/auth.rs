//! Request authentication: shared-secret header and optional HMAC signature.
//!
//! Both checks are pure functions over the configured secrets and the
//! incoming header values; everything else (status codes, header names)
//! lives in the HTTP layer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Shared-secret check. An empty configured key disables the check.
pub fn check_api_key(configured: &str, header: Option<&str>) -> bool {
    if configured.is_empty() {
        return true;
    }
    header == Some(configured)
}

/// Verify a base64-encoded HMAC-SHA256 over the raw request body.
///
/// An empty signing secret disables the check entirely (any header value,
/// or none, is accepted). With a secret configured, a missing header is a
/// rejection and the comparison is constant time.
pub fn verify_signature(secret: &str, raw_body: &[u8], header: Option<&str>) -> bool {
    if secret.is_empty() {
        return true;
    }
    let Some(sig_b64) = header else {
        return false;
    };
    let Ok(sig) = BASE64.decode(sig_b64) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_body);
    mac.verify_slice(&sig).is_ok()
}

/// Compute the signature a client would send for `raw_body`.
pub fn sign_body(secret: &str, raw_body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_body);
    BASE64.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_disabled_when_empty() {
        assert!(check_api_key("", None));
        assert!(check_api_key("", Some("anything")));
    }

    #[test]
    fn api_key_must_match_exactly() {
        assert!(check_api_key("dev", Some("dev")));
        assert!(!check_api_key("dev", Some("DEV")));
        assert!(!check_api_key("dev", None));
    }

    #[test]
    fn signature_disabled_without_secret() {
        assert!(verify_signature("", b"body", None));
        assert!(verify_signature("", b"body", Some("garbage")));
    }

    #[test]
    fn signature_required_with_secret() {
        assert!(!verify_signature("secret", b"body", None));
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"group_name":"G1","summary":"s"}"#;
        let sig = sign_body("secret", body);
        assert!(verify_signature("secret", body, Some(&sig)));
        // Wrong body, wrong secret, or malformed base64 all fail.
        assert!(!verify_signature("secret", b"other", Some(&sig)));
        assert!(!verify_signature("other", body, Some(&sig)));
        assert!(!verify_signature("secret", body, Some("!!not-base64!!")));
    }
}
