//! Request signing for the settlement rail and idempotency key derivation.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Sign a transfer body with the proxy's signing secret.
/// Returns the hex-encoded HMAC-SHA256.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Derive the settlement idempotency key for one tool invocation.
///
/// The caller-supplied key alone is not enough: two agents may reuse the same
/// value against different providers. Fields are length-prefixed so
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn idempotency_key(provider_id: &str, tool: &str, caller_key: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [provider_id, tool, caller_key] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_hex_hmac() {
        let sig = sign_body(b"funding-secret", b"{\"amount\":\"1\"}");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, sign_body(b"funding-secret", b"{\"amount\":\"1\"}"));
    }

    #[test]
    fn test_signature_covers_body_and_secret() {
        let sig = sign_body(b"funding-secret", b"{\"amount\":\"1\"}");
        assert_ne!(sig, sign_body(b"funding-secret", b"{\"amount\":\"100\"}"));
        assert_ne!(sig, sign_body(b"other-secret", b"{\"amount\":\"1\"}"));
    }

    #[test]
    fn test_idempotency_key_is_stable_and_scoped() {
        let a = idempotency_key("weather", "forecast", "req-1");
        assert_eq!(a, idempotency_key("weather", "forecast", "req-1"));
        assert_ne!(a, idempotency_key("weather", "forecast", "req-2"));
        assert_ne!(a, idempotency_key("news", "forecast", "req-1"));
        assert_ne!(
            idempotency_key("ab", "c", "x"),
            idempotency_key("a", "bc", "x")
        );
    }
}
