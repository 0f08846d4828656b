//! Web Push message encryption and VAPID signing
//!
//! Byte-exact implementations of RFC 8188 (`aes128gcm` content encoding)
//! and RFC 8292 (VAPID). Push services reject anything that deviates, so
//! the record layout and the raw `r||s` JWT signature are fixed here:
//!
//! ```text
//! salt(16) || rs(4 BE = 4096) || idlen(1) || server_pub(65) || ciphertext
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes128Gcm;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use p256::{ecdh::EphemeralSecret, PublicKey};
use sha2::Sha256;

/// Record size advertised in the encryption content header.
const RECORD_SIZE: u32 = 4096;
/// VAPID tokens are short-lived: 12 hours.
const VAPID_EXPIRY_SECONDS: i64 = 12 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum WebPushError {
    #[error("invalid subscription key: {0}")]
    InvalidKey(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// URL-safe base64 without padding, as used throughout the Web Push wire
/// formats.
pub fn b64_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode base64 tolerantly: browsers hand out both URL-safe and standard
/// alphabets, with and without padding.
pub fn b64_decode(data: &str) -> Result<Vec<u8>, WebPushError> {
    let normalized = data.replace('+', "-").replace('/', "_");
    let trimmed = normalized.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| WebPushError::InvalidKey(e.to_string()))
}

/// Encrypt a payload for a subscription (RFC 8188, `aes128gcm`).
///
/// Returns the complete message body: content header followed by the
/// single encrypted record.
pub fn encrypt(
    plaintext: &[u8],
    p256dh_b64: &str,
    auth_b64: &str,
) -> Result<Vec<u8>, WebPushError> {
    let user_pub_bytes = b64_decode(p256dh_b64)?;
    let auth_secret = b64_decode(auth_b64)?;

    let user_pub = PublicKey::from_sec1_bytes(&user_pub_bytes)
        .map_err(|e| WebPushError::InvalidKey(e.to_string()))?;

    // Fresh ephemeral key per message.
    let server_secret = EphemeralSecret::random(&mut OsRng);
    let server_pub_bytes = server_secret.public_key().to_encoded_point(false);
    let server_pub_bytes = server_pub_bytes.as_bytes();
    let shared = server_secret.diffie_hellman(&user_pub);

    let salt: [u8; 16] = rand::random();

    // IKM: HKDF over the ECDH secret, salted with the subscription's auth
    // secret, bound to both public keys.
    let mut ikm_info = Vec::with_capacity(14 + user_pub_bytes.len() + server_pub_bytes.len());
    ikm_info.extend_from_slice(b"WebPush: info\0");
    ikm_info.extend_from_slice(&user_pub_bytes);
    ikm_info.extend_from_slice(server_pub_bytes);

    let mut ikm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(&auth_secret), shared.raw_secret_bytes().as_slice())
        .expand(&ikm_info, &mut ikm)
        .map_err(|e| WebPushError::Crypto(e.to_string()))?;

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut cek = [0u8; 16];
    hkdf.expand(b"Content-Encoding: aes128gcm\0", &mut cek)
        .map_err(|e| WebPushError::Crypto(e.to_string()))?;
    let mut nonce = [0u8; 12];
    hkdf.expand(b"Content-Encoding: nonce\0", &mut nonce)
        .map_err(|e| WebPushError::Crypto(e.to_string()))?;

    // Single record: plaintext, 0x02 delimiter (last record), no padding.
    let mut padded = Vec::with_capacity(plaintext.len() + 1);
    padded.extend_from_slice(plaintext);
    padded.push(0x02);

    let cipher = Aes128Gcm::new_from_slice(&cek)
        .map_err(|e| WebPushError::Crypto(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&nonce), padded.as_slice())
        .map_err(|e| WebPushError::Crypto(e.to_string()))?;

    let mut body =
        Vec::with_capacity(16 + 4 + 1 + server_pub_bytes.len() + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(server_pub_bytes.len() as u8);
    body.extend_from_slice(server_pub_bytes);
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

/// Build the `Authorization: vapid t=<jwt>, k=<pub>` header value for a
/// push endpoint (RFC 8292).
///
/// The JWT is ES256-signed with the raw 64-byte `r||s` signature; `aud` is
/// the scheme://host origin of the endpoint.
pub fn vapid_authorization(
    endpoint: &str,
    private_key_b64: &str,
    subject: &str,
    now_unix: i64,
) -> Result<String, WebPushError> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| WebPushError::InvalidEndpoint(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| WebPushError::InvalidEndpoint("endpoint has no host".into()))?;
    let audience = match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    };

    let private_bytes = b64_decode(private_key_b64)?;
    let signing_key = SigningKey::from_slice(&private_bytes)
        .map_err(|e| WebPushError::InvalidKey(e.to_string()))?;

    let header_b64 = b64_encode(br#"{"typ":"JWT","alg":"ES256"}"#);
    let claims = serde_json::json!({
        "aud": audience,
        "exp": now_unix + VAPID_EXPIRY_SECONDS,
        "sub": subject,
    });
    let payload_b64 = b64_encode(claims.to_string().as_bytes());
    let signing_input = format!("{header_b64}.{payload_b64}");

    let signature: Signature = signing_key.sign(signing_input.as_bytes());
    let jwt = format!("{signing_input}.{}", b64_encode(signature.to_bytes().as_slice()));

    let public_key = signing_key.verifying_key().to_encoded_point(false);
    Ok(format!("vapid t={jwt}, k={}", b64_encode(public_key.as_bytes())))
}

/// Derive the public key (uncompressed SEC1, base64url) from a VAPID
/// private key. The frontend uses it as `applicationServerKey`.
pub fn vapid_public_key(private_key_b64: &str) -> Result<String, WebPushError> {
    let private_bytes = b64_decode(private_key_b64)?;
    let signing_key = SigningKey::from_slice(&private_bytes)
        .map_err(|e| WebPushError::InvalidKey(e.to_string()))?;
    let public_key = signing_key.verifying_key().to_encoded_point(false);
    Ok(b64_encode(public_key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::VerifyingKey;
    use p256::SecretKey;

    fn subscription_keys() -> (SecretKey, String, String) {
        let user_secret = p256::SecretKey::random(&mut OsRng);
        let p256dh = b64_encode(
            user_secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes(),
        );
        let auth: [u8; 16] = rand::random();
        (user_secret, p256dh, b64_encode(&auth))
    }

    #[test]
    fn encrypted_body_has_rfc8188_layout() {
        let (_, p256dh, auth) = subscription_keys();
        let body = encrypt(b"hello push", &p256dh, &auth).unwrap();

        // salt(16) rs(4) idlen(1) server_pub(65) ciphertext(payload+pad+tag)
        assert_eq!(body.len(), 16 + 4 + 1 + 65 + (10 + 1 + 16));
        let rs = u32::from_be_bytes([body[16], body[17], body[18], body[19]]);
        assert_eq!(rs, 4096);
        assert_eq!(body[20], 65);
        // server public key is an uncompressed SEC1 point
        assert_eq!(body[21], 0x04);
    }

    #[test]
    fn encryption_round_trips_with_subscriber_key() {
        let (user_secret, p256dh, auth_b64) = subscription_keys();
        let body = encrypt(b"fulfillment!", &p256dh, &auth_b64).unwrap();

        let salt = &body[..16];
        let server_pub_bytes = &body[21..86];
        let ciphertext = &body[86..];

        // Subscriber side of the ECDH.
        let server_pub = PublicKey::from_sec1_bytes(server_pub_bytes).unwrap();
        let shared = p256::ecdh::diffie_hellman(
            user_secret.to_nonzero_scalar(),
            server_pub.as_affine(),
        );

        let user_pub_bytes = user_secret.public_key().to_encoded_point(false);
        let mut ikm_info = Vec::new();
        ikm_info.extend_from_slice(b"WebPush: info\0");
        ikm_info.extend_from_slice(user_pub_bytes.as_bytes());
        ikm_info.extend_from_slice(server_pub_bytes);

        let auth = b64_decode(&auth_b64).unwrap();
        let mut ikm = [0u8; 32];
        Hkdf::<Sha256>::new(Some(&auth), shared.raw_secret_bytes())
            .expand(&ikm_info, &mut ikm)
            .unwrap();
        let hkdf = Hkdf::<Sha256>::new(Some(salt), &ikm);
        let mut cek = [0u8; 16];
        hkdf.expand(b"Content-Encoding: aes128gcm\0", &mut cek).unwrap();
        let mut nonce = [0u8; 12];
        hkdf.expand(b"Content-Encoding: nonce\0", &mut nonce).unwrap();

        let cipher = Aes128Gcm::new_from_slice(&cek).unwrap();
        let padded = cipher
            .decrypt(aes_gcm::Nonce::from_slice(&nonce), ciphertext)
            .unwrap();
        assert_eq!(padded, b"fulfillment!\x02");
    }

    #[test]
    fn each_message_uses_fresh_salt_and_key() {
        let (_, p256dh, auth) = subscription_keys();
        let a = encrypt(b"x", &p256dh, &auth).unwrap();
        let b = encrypt(b"x", &p256dh, &auth).unwrap();
        assert_ne!(a[..16], b[..16]);
        assert_ne!(a[21..86], b[21..86]);
    }

    #[test]
    fn vapid_jwt_verifies_and_carries_claims() {
        let signing = SecretKey::random(&mut OsRng);
        let private_b64 = b64_encode(signing.to_bytes().as_slice());

        let header = vapid_authorization(
            "https://fcm.googleapis.com/fcm/send/xyz",
            &private_b64,
            "mailto:admin@example.com",
            1_700_000_000,
        )
        .unwrap();

        let token = header
            .strip_prefix("vapid t=")
            .unwrap()
            .split(", k=")
            .next()
            .unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let claims: serde_json::Value =
            serde_json::from_slice(&b64_decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["aud"], "https://fcm.googleapis.com");
        assert_eq!(claims["exp"], 1_700_000_000i64 + 12 * 3600);
        assert_eq!(claims["sub"], "mailto:admin@example.com");

        // Raw r||s signature, 64 bytes, verifiable with the advertised key.
        let sig_bytes = b64_decode(parts[2]).unwrap();
        assert_eq!(sig_bytes.len(), 64);
        let key_b64 = header.split(", k=").nth(1).unwrap();
        let pub_bytes = b64_decode(key_b64).unwrap();
        let verifying = VerifyingKey::from_sec1_bytes(&pub_bytes).unwrap();
        let signature = Signature::from_slice(&sig_bytes).unwrap();
        let signing_input = format!("{}.{}", parts[0], parts[1]);
        verifying.verify(signing_input.as_bytes(), &signature).unwrap();
    }

    #[test]
    fn vapid_audience_keeps_explicit_port() {
        let signing = SecretKey::random(&mut OsRng);
        let private_b64 = b64_encode(signing.to_bytes().as_slice());
        let header =
            vapid_authorization("https://push.example.com:8443/send/1", &private_b64, "mailto:x@y.z", 0)
                .unwrap();
        let token = header
            .strip_prefix("vapid t=")
            .unwrap()
            .split(", k=")
            .next()
            .unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&b64_decode(token.split('.').nth(1).unwrap()).unwrap()).unwrap();
        assert_eq!(claims["aud"], "https://push.example.com:8443");
    }

    #[test]
    fn public_key_derivation_matches_signer() {
        let signing = SecretKey::random(&mut OsRng);
        let private_b64 = b64_encode(signing.to_bytes().as_slice());
        let derived = vapid_public_key(&private_b64).unwrap();
        let expected = b64_encode(signing.public_key().to_encoded_point(false).as_bytes());
        assert_eq!(derived, expected);
    }

    #[test]
    fn decode_tolerates_standard_alphabet_and_padding() {
        let data = vec![0xfb, 0xff, 0x00, 0x7e];
        let standard = base64::engine::general_purpose::STANDARD.encode(&data);
        assert_eq!(b64_decode(&standard).unwrap(), data);
        assert_eq!(b64_decode(&b64_encode(&data)).unwrap(), data);
    }
}
