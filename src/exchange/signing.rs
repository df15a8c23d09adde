//! Per-venue REST request signing. Each exchange signs a slightly different
//! canonical string; the shared primitive is HMAC, varying only in the
//! hash function and encoding (hex vs base64).

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Binance/MEXC/BingX: HMAC-SHA256 over the query string, hex-encoded.
pub fn hmac_sha256_hex(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// OKX: HMAC-SHA256 over `timestamp+method+path+body`, base64-encoded.
pub fn hmac_sha256_base64(secret: &str, payload: &str) -> String {
    use base64::Engine as _;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Gate.io: HMAC-SHA512 over the signed string, hex-encoded.
pub fn hmac_sha512_hex(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Builds the OKX canonical pre-sign string:
/// `{timestamp}{METHOD}{requestPath}{body}`.
pub fn okx_presign_string(timestamp: &str, method: &str, path: &str, body: &str) -> String {
    format!("{timestamp}{method}{path}{body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sha256_hex_is_deterministic() {
        let sig1 = hmac_sha256_hex("secret", "payload");
        let sig2 = hmac_sha256_hex("secret", "payload");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
    }

    #[test]
    fn hmac_sha256_base64_produces_standard_base64() {
        let sig = hmac_sha256_base64("secret", "payload");
        assert!(!sig.is_empty());
        assert!(base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &sig).is_ok());
    }

    #[test]
    fn okx_presign_string_concatenates_in_order() {
        let s = okx_presign_string("123", "GET", "/api/v5/x", "");
        assert_eq!(s, "123GET/api/v5/x");
    }
}
