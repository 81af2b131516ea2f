//! # Key Material
//!
//! Two kinds of keys exist in the protocol:
//!
//! - The registry's long-lived **RSA keypair**. Sources and POS terminals
//!   hold the public half and use it to seal requests; only the registry
//!   can open them.
//! - Short-lived **session keys**: 32 random bytes minted client-side,
//!   embedded inside an encrypted request, and used by the registry to
//!   seal exactly one response. One direction, one message, then gone.
//!   This is what lets two parties exchange secrets without ever sharing
//!   a long-term one.
//!
//! Session keys travel as base64 strings on the wire; the decode path is
//! strict about length because a truncated key silently becomes a
//! different cipher strength.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::config::{RSA_MODULUS_BITS, SESSION_KEY_LENGTH};
use crate::error::CryptoError;

// ---------------------------------------------------------------------------
// Registry Keypair
// ---------------------------------------------------------------------------

/// The registry's asymmetric identity.
///
/// Wraps the RSA private/public pair so the rest of the crate never
/// handles raw `rsa` types for key management. Generating 4096-bit
/// primes takes seconds; production deployments load a persisted key
/// via [`RegistryKeyPair::from_private_pem`] instead.
#[derive(Clone)]
pub struct RegistryKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RegistryKeyPair {
    /// Generate a fresh keypair at the deployment modulus size.
    ///
    /// Takes seconds on commodity hardware. Meant for provisioning, not
    /// per-request use.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(RSA_MODULUS_BITS)
    }

    /// Generate a keypair at an explicit modulus size.
    ///
    /// The envelope derives its plaintext budget from the actual key, so
    /// smaller keys work end to end — tests lean on this to avoid paying
    /// for 4096-bit prime generation on every run.
    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(|_| CryptoError::InvalidKey)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Load a keypair from a PKCS#8 PEM-encoded private key.
    pub fn from_private_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem).map_err(|_| CryptoError::InvalidKey)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// The private half. Stays inside the registry process.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// The public half, distributed to Sources and POS terminals.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Export the public key as SPKI PEM for distribution.
    pub fn public_pem(&self) -> Result<String, CryptoError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| CryptoError::InvalidKey)
    }
}

impl std::fmt::Debug for RegistryKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never let key material wander into logs.
        f.debug_struct("RegistryKeyPair").finish_non_exhaustive()
    }
}

/// Parse a caller-supplied public key from SPKI PEM.
///
/// Used for asynchronous flows where the registry encrypts to the
/// sender's own public key instead of a session key.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|_| CryptoError::InvalidKey)
}

// ---------------------------------------------------------------------------
// Session Key
// ---------------------------------------------------------------------------

/// A client-minted symmetric key for sealing one response.
///
/// 32 bytes, AES-256-GCM. The registry never persists these — a session
/// key lives exactly as long as the request/response exchange it rides in.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LENGTH]);

impl SessionKey {
    /// Mint a fresh random session key. Called by the *client* side of
    /// the exchange; the registry only ever parses them.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a base64-encoded session key from a request payload.
    ///
    /// Rejects anything that is not exactly 32 decoded bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(encoded).map_err(|_| CryptoError::InvalidKey)?;
        let bytes: [u8; SESSION_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(bytes))
    }

    /// Encode for embedding in a request payload.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Raw key bytes for the cipher.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_base64_roundtrip() {
        let key = SessionKey::generate();
        let encoded = key.to_base64();
        let decoded = SessionKey::from_base64(&encoded).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn session_key_rejects_wrong_length() {
        let short = BASE64.encode([0u8; 16]);
        assert!(matches!(
            SessionKey::from_base64(&short),
            Err(CryptoError::InvalidKey)
        ));
    }

    #[test]
    fn session_key_rejects_garbage() {
        assert!(SessionKey::from_base64("not//valid==base64!!").is_err());
    }

    #[test]
    fn session_keys_are_unique() {
        // If two fresh keys collide, the RNG is broken and nothing else
        // in this crate matters.
        assert_ne!(SessionKey::generate(), SessionKey::generate());
    }

    #[test]
    fn debug_output_redacts_key_bytes() {
        let key = SessionKey::generate();
        let printed = format!("{key:?}");
        assert_eq!(printed, "SessionKey(..)");
        assert!(!printed.contains(&key.to_base64()));
    }

    #[test]
    fn public_pem_parses_back() {
        let pair = RegistryKeyPair::generate_with_bits(2048).unwrap();
        let pem = pair.public_pem().unwrap();
        let parsed = public_key_from_pem(&pem).unwrap();
        assert_eq!(&parsed, pair.public_key());
    }
}
