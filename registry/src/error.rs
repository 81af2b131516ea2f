//! Error types for the WOM registry protocol core.
//!
//! Three concerns, three enums:
//!
//! - [`CryptoError`] — the envelope could not be built or opened.
//! - [`ProtocolError`] — the request was well-formed but the protocol
//!   refused it (replayed nonce, wrong password, dead code, ...).
//! - [`StoreError`] — the storage collaborator itself failed.
//!
//! The split matters at the boundary: a [`ProtocolError`] means "your
//! request was invalid, retrying the same thing will not help", while a
//! [`StoreError`] (surfaced as [`ProtocolError::Storage`]) means "the
//! registry is unwell, try again later". Crypto failures are collapsed
//! into a uniform "not valid" answer before they reach the network —
//! the distinction between bad base64 and a wrong key is nobody's
//! business but ours.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the crypto envelope.
///
/// Variants are coarse. Callers that talk to the network
/// must map all of these to one generic "invalid request" response;
/// anything finer-grained is an oracle.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The key material could not be parsed or has the wrong length.
    #[error("invalid key material")]
    InvalidKey,

    /// The plaintext exceeds the asymmetric block limit. Callers needing
    /// more room must supply a session key and use the symmetric path.
    #[error("payload too large for asymmetric envelope: {size} bytes, max {max}")]
    PayloadTooLarge {
        /// Serialized payload size in bytes.
        size: usize,
        /// Maximum plaintext the current modulus admits.
        max: usize,
    },

    /// The payload is not valid base64, or the decrypted bytes are not
    /// the JSON we expected.
    #[error("malformed payload")]
    Malformed,

    /// Decryption failed — wrong key or tampered ciphertext. We do not
    /// distinguish the two.
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Errors raised by the one-time-code protocols.
///
/// These map one-to-one onto the caller-visible outcome set. Note that
/// `WrongPassword`, `Expired`, `Void` and `NotFound` must all be
/// presented to network callers with the same level of detail — enough
/// to act on, not enough to brute-force against.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The `(party, nonce)` pair was already used. No record was created.
    #[error("duplicate nonce for party {party}")]
    DuplicateNonce {
        /// The source or POS identifier that replayed the nonce.
        party: String,
    },

    /// No code exists under this identifier.
    #[error("code {0} not found")]
    NotFound(Uuid),

    /// The code exists but its validity window has closed.
    #[error("code {0} expired")]
    Expired(Uuid),

    /// The code has already reached its terminal state. Exactly-once
    /// means exactly once.
    #[error("code {0} already performed")]
    AlreadyPerformed(Uuid),

    /// The code was voided — attempt exhaustion or explicit invalidation.
    #[error("code {0} is void")]
    Void(Uuid),

    /// The supplied password does not match. The attempt counter has
    /// already been incremented by the time this is returned.
    #[error("wrong password for code {0}")]
    WrongPassword(Uuid),

    /// Fewer eligible vouchers exist than the payment requires. Nothing
    /// was spent.
    #[error("insufficient vouchers: required {required}, available {available}")]
    InsufficientVouchers {
        /// Units the payment asked for.
        required: u64,
        /// Eligible units actually present.
        available: u64,
    },

    /// The envelope could not be opened or built.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The storage collaborator failed. Distinct from every protocol
    /// outcome so callers can retry later instead of giving up.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// Errors raised by the storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Shorthand result for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
