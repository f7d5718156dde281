// fiber-core: Canonical serialization and HMAC signing material

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Serialize to canonical JSON: compact, keys sorted.
///
/// Routing through `serde_json::Value` sorts object keys (the default map is
/// a BTreeMap), so the probe and the gateway agree on the byte sequence.
pub fn canonical_json<T: Serialize>(value: &T) -> CoreResult<String> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Build the signing message: `batch_id:timestamp:nonce:body_hash`.
pub fn signing_message(batch_id: &str, timestamp: &str, nonce: &str, body: &[u8]) -> String {
    format!(
        "{}:{}:{}:{}",
        batch_id,
        timestamp,
        nonce,
        sha256_hex(body)
    )
}

/// HMAC-SHA256 over the federation secret, hex encoded.
pub fn sign_message(secret: &str, message: &str) -> CoreResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CoreError::Signing(format!("invalid key length: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a hex signature.
pub fn verify_signature(secret: &str, message: &str, signature_hex: &str) -> bool {
    let raw = match hex::decode(signature_hex) {
        Ok(raw) => raw,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let v = json!({"zeta": 1, "alpha": {"nested_z": 2, "nested_a": 3}});
        let s = canonical_json(&v).unwrap();
        assert_eq!(s, r#"{"alpha":{"nested_a":3,"nested_z":2},"zeta":1}"#);
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let msg = signing_message("b-1", "2026-01-01T00:00:00Z", "n-1", b"{}");
        let sig = sign_message("secret", &msg).unwrap();
        assert!(verify_signature("secret", &msg, &sig));
    }

    #[test]
    fn test_wrong_secret_fails_verification() {
        let msg = signing_message("b-1", "2026-01-01T00:00:00Z", "n-1", b"{}");
        let sig = sign_message("secret", &msg).unwrap();
        assert!(!verify_signature("other", &msg, &sig));
    }

    #[test]
    fn test_tampered_body_changes_message() {
        let a = signing_message("b", "t", "n", b"payload");
        let b = signing_message("b", "t", "n", b"payload2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        assert!(!verify_signature("secret", "message", "not-hex!"));
    }
}
