//! # The Envelope
//!
//! The trust primitive everything else in the registry depends on. An
//! envelope is an opaque base64 string whose contents only the intended
//! recipient can read:
//!
//! - **Inbound** (request) envelopes are RSA-OAEP-SHA256 ciphertexts
//!   addressed to the registry's public key. Anyone can build one; only
//!   the registry can open it.
//! - **Outbound** (response) envelopes are AES-256-GCM ciphertexts sealed
//!   with a session key the caller embedded inside its own request. Only
//!   that caller, holding the matching key, can read the reply.
//!
//! The split follows from RSA's hard per-block plaintext limit
//! (446 bytes at 4096 bits), so the protocol keeps *requests* small and
//! pushes bulky replies — voucher batches, mostly — through the
//! unbounded symmetric path. [`encrypt`] refuses oversized plaintexts
//! with [`CryptoError::PayloadTooLarge`] rather than silently chunking.
//!
//! ## Symmetric wire format
//!
//! `seal_session` packs `nonce || ciphertext` into one buffer before
//! base64 — the first 12 bytes are a random GCM nonce, the rest is
//! ciphertext plus the 16-byte auth tag. `open_session` expects the same.
//!
//! ## Error discipline
//!
//! Malformed base64, bad JSON, and wrong-key failures come back as
//! distinct variants for *internal* observability, but the HTTP layer
//! must collapse them into a single "not valid" answer. Telling an
//! attacker which stage of decryption failed is an oracle.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;

use crate::config::{OAEP_DIGEST_LENGTH, SESSION_NONCE_LENGTH};
use crate::error::CryptoError;

use super::keys::SessionKey;

/// Maximum plaintext the given public key admits under OAEP-SHA256.
fn oaep_budget(key: &RsaPublicKey) -> usize {
    key.size() - 2 * OAEP_DIGEST_LENGTH - 2
}

/// Serialize `content` to canonical JSON and seal it to `recipient`.
///
/// Returns the base64-encoded RSA-OAEP ciphertext. Fails with
/// [`CryptoError::PayloadTooLarge`] when the JSON exceeds the modulus
/// budget — the caller should carry a session key and use
/// [`seal_session`] for anything bulky.
pub fn encrypt<T: Serialize>(content: &T, recipient: &RsaPublicKey) -> Result<String, CryptoError> {
    let plaintext = serde_json::to_vec(content).map_err(|_| CryptoError::Malformed)?;

    let max = oaep_budget(recipient);
    if plaintext.len() > max {
        return Err(CryptoError::PayloadTooLarge {
            size: plaintext.len(),
            max,
        });
    }

    let ciphertext = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &plaintext)
        .map_err(|_| CryptoError::InvalidKey)?;

    Ok(BASE64.encode(ciphertext))
}

/// Open an RSA envelope with the registry's private key and deserialize
/// the JSON inside into `T`.
///
/// [`CryptoError::Malformed`] covers bad base64 and bad JSON;
/// [`CryptoError::DecryptionFailed`] covers everything the cipher
/// rejects. Network callers must see both as the same uniform failure.
pub fn decrypt<T: DeserializeOwned>(
    payload: &str,
    private_key: &RsaPrivateKey,
) -> Result<T, CryptoError> {
    let ciphertext = BASE64.decode(payload).map_err(|_| CryptoError::Malformed)?;

    let plaintext = private_key
        .decrypt(Oaep::new::<Sha256>(), &ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Malformed)
}

/// Seal a response for the caller holding `key`.
///
/// AES-256-GCM with a fresh random 96-bit nonce per call; output is
/// `base64(nonce || ciphertext)`. No size limit — this is the path
/// voucher batches travel.
pub fn seal_session<T: Serialize>(content: &T, key: &SessionKey) -> Result<String, CryptoError> {
    let plaintext = serde_json::to_vec(content).map_err(|_| CryptoError::Malformed)?;

    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;

    let mut nonce_bytes = [0u8; SESSION_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let mut sealed = Vec::with_capacity(SESSION_NONCE_LENGTH + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(sealed))
}

/// Open a session-sealed payload with the matching key.
///
/// Expects the `base64(nonce || ciphertext)` format produced by
/// [`seal_session`]. A wrong key, a flipped bit, or a truncated buffer
/// all surface as the same [`CryptoError::DecryptionFailed`].
pub fn open_session<T: DeserializeOwned>(
    payload: &str,
    key: &SessionKey,
) -> Result<T, CryptoError> {
    let sealed = BASE64.decode(payload).map_err(|_| CryptoError::Malformed)?;
    if sealed.len() < SESSION_NONCE_LENGTH {
        return Err(CryptoError::Malformed);
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(SESSION_NONCE_LENGTH);
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::RegistryKeyPair;
    use serde::Deserialize;
    use std::sync::OnceLock;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        otc: String,
        password: String,
        amount: u32,
    }

    fn probe() -> Probe {
        Probe {
            otc: "7e9a1c9e-1111-4222-8333-444455556666".to_string(),
            password: "ab12".to_string(),
            amount: 5,
        }
    }

    // Prime generation is expensive even at 2048 bits; every test in this
    // module shares one keypair.
    fn keys() -> &'static RegistryKeyPair {
        static KEYS: OnceLock<RegistryKeyPair> = OnceLock::new();
        KEYS.get_or_init(|| RegistryKeyPair::generate_with_bits(2048).expect("keygen"))
    }

    #[test]
    fn asymmetric_roundtrip() {
        let sealed = encrypt(&probe(), keys().public_key()).unwrap();
        let opened: Probe = decrypt(&sealed, keys().private_key()).unwrap();
        assert_eq!(opened, probe());
    }

    #[test]
    fn wrong_private_key_fails_uniformly() {
        let other = RegistryKeyPair::generate_with_bits(2048).unwrap();
        let sealed = encrypt(&probe(), keys().public_key()).unwrap();
        let result: Result<Probe, _> = decrypt(&sealed, other.private_key());
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn bad_base64_is_malformed() {
        let result: Result<Probe, _> = decrypt("!!!not base64!!!", keys().private_key());
        assert!(matches!(result, Err(CryptoError::Malformed)));
    }

    #[test]
    fn oversized_payload_rejected_with_budget() {
        // 2048-bit key: budget is 256 - 66 = 190 bytes.
        let big = Probe {
            otc: "x".repeat(500),
            password: "ab12".to_string(),
            amount: 1,
        };
        let result = encrypt(&big, keys().public_key());
        match result {
            Err(CryptoError::PayloadTooLarge { size, max }) => {
                assert!(size > max);
                assert_eq!(max, 190);
            }
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn session_roundtrip() {
        let key = SessionKey::generate();
        let sealed = seal_session(&probe(), &key).unwrap();
        let opened: Probe = open_session(&sealed, &key).unwrap();
        assert_eq!(opened, probe());
    }

    #[test]
    fn session_wrong_key_fails() {
        let sealed = seal_session(&probe(), &SessionKey::generate()).unwrap();
        let result: Result<Probe, _> = open_session(&sealed, &SessionKey::generate());
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn session_tampered_ciphertext_fails() {
        let key = SessionKey::generate();
        let sealed = seal_session(&probe(), &key).unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = BASE64.encode(raw);
        let result: Result<Probe, _> = open_session(&tampered, &key);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn session_truncated_payload_is_malformed() {
        let key = SessionKey::generate();
        let short = BASE64.encode([0u8; 4]);
        let result: Result<Probe, _> = open_session(&short, &key);
        assert!(matches!(result, Err(CryptoError::Malformed)));
    }

    #[test]
    fn session_nonces_never_repeat() {
        let key = SessionKey::generate();
        let a = BASE64.decode(seal_session(&probe(), &key).unwrap()).unwrap();
        let b = BASE64.decode(seal_session(&probe(), &key).unwrap()).unwrap();
        assert_ne!(&a[..SESSION_NONCE_LENGTH], &b[..SESSION_NONCE_LENGTH]);
    }

    #[test]
    fn session_path_carries_large_payloads() {
        // Exactly what the asymmetric path cannot do: a voucher batch
        // far beyond any RSA block.
        #[derive(Serialize, Deserialize)]
        struct Batch {
            vouchers: Vec<String>,
        }
        let key = SessionKey::generate();
        let batch = Batch {
            vouchers: (0..500).map(|i| format!("voucher-secret-{i}")).collect(),
        };
        let sealed = seal_session(&batch, &key).unwrap();
        let opened: Batch = open_session(&sealed, &key).unwrap();
        assert_eq!(opened.vouchers.len(), 500);
    }
}
