//! `request_source` sealed-box construction (§4.9/§6): an anonymous X25519
//! sealed box (libsodium's `crypto_box_seal` construction) of
//! `{origin, ip, time, user_agent}`, keyed to the recipient's client id
//! interpreted as a raw 32-byte Curve25519 public key.

use rand::rngs::OsRng;
use serde::Serialize;

use crate::error::BridgeError;

#[derive(Serialize)]
struct RequestSource<'a> {
    origin: &'a str,
    ip: &'a str,
    time: i64,
    user_agent: &'a str,
}

/// `client_id` must hex-decode to exactly 32 bytes to be usable as a
/// Curve25519 public key; anything else fails the request per §6.
pub fn seal_request_source(
    client_id: &str,
    origin: &str,
    ip: &str,
    user_agent: &str,
    now_ms: i64,
) -> Result<Vec<u8>, BridgeError> {
    let key_bytes = hex::decode(client_id).map_err(|_| BridgeError::Crypto("client id is not valid hex".into()))?;
    let key_array: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| BridgeError::Crypto("client id is not a 32-byte key".into()))?;
    let recipient = crypto_box::PublicKey::from(key_array);

    let body = RequestSource {
        origin,
        ip,
        time: now_ms,
        user_agent,
    };
    let plaintext = serde_json::to_vec(&body).map_err(|e| BridgeError::Crypto(e.to_string()))?;

    recipient.seal(&mut OsRng, &plaintext).map_err(|e| BridgeError::Crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_hex_client_id() {
        let err = seal_request_source("not-hex!!", "o", "i", "ua", 0).unwrap_err();
        assert!(matches!(err, BridgeError::Crypto(_)));
    }

    #[test]
    fn rejects_wrong_length_key() {
        let short = hex::encode([1u8; 16]);
        let err = seal_request_source(&short, "o", "i", "ua", 0).unwrap_err();
        assert!(matches!(err, BridgeError::Crypto(_)));
    }

    #[test]
    fn seals_a_valid_32_byte_key() {
        let secret = crypto_box::SecretKey::generate(&mut OsRng);
        let public_hex = hex::encode(secret.public_key().as_bytes());
        let sealed = seal_request_source(&public_hex, "https://a.com", "1.2.3.4", "ua", 1_700_000_000_000).unwrap();
        assert!(!sealed.is_empty());
    }
}
