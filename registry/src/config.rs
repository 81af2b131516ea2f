//! # Registry Policy & Constants
//!
//! Every magic number in the registry lives here. The constants are the
//! compile-time defaults; [`RegistryPolicy`] is the runtime knob set that
//! deployments actually tune. The two are wired together through
//! `RegistryPolicy::default()`, so a test that builds a default policy is
//! testing the same numbers production ships with.
//!
//! The attempt threshold and password shape are security policy, not
//! implementation detail: the password only has to survive
//! `MAX_VERIFICATION_ATTEMPTS` guesses before the code voids itself, so
//! a short human-typeable secret is enough. Resist the urge to make it
//! longer — these get read over the phone and typed on POS keypads.

use chrono::Duration;

// ---------------------------------------------------------------------------
// Asymmetric Envelope Parameters
// ---------------------------------------------------------------------------

/// RSA modulus size for registry keys, in bits. 4096 is the deployment
/// convention; smaller keys shrink the envelope's plaintext budget.
pub const RSA_MODULUS_BITS: usize = 4096;

/// OAEP digest output length in bytes (SHA-256).
pub const OAEP_DIGEST_LENGTH: usize = 32;

/// Maximum plaintext an OAEP envelope admits for the default modulus:
/// `modulus_bytes - 2 * digest_len - 2`. Payloads above this must ride
/// the symmetric session-key path instead.
pub const MAX_ENVELOPE_PLAINTEXT: usize = RSA_MODULUS_BITS / 8 - 2 * OAEP_DIGEST_LENGTH - 2;

// ---------------------------------------------------------------------------
// Symmetric Session Parameters
// ---------------------------------------------------------------------------

/// AES-256-GCM key length in bytes. Session keys are generated
/// client-side and embedded inside the encrypted request.
pub const SESSION_KEY_LENGTH: usize = 32;

/// AES-GCM nonce length in bytes. 96 bits, the standard GCM nonce size.
pub const SESSION_NONCE_LENGTH: usize = 12;

// ---------------------------------------------------------------------------
// One-Time Code Policy
// ---------------------------------------------------------------------------

/// Default OTC password length. Four symbols over [`PASSWORD_ALPHABET`]
/// gives ~923k combinations against a 3-guess budget — comfortably
/// infeasible, still typeable on a keypad.
pub const PASSWORD_LENGTH: usize = 4;

/// Characters OTC passwords are drawn from. Lowercase and digits with
/// the ambiguous glyphs (`i`, `l`, `o`, `0`, `1`) removed, because these
/// codes get transcribed from emails and paper.
pub const PASSWORD_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

/// Consecutive wrong-password verifications tolerated before the code
/// transitions to `Void`. Terminal: not even the correct password
/// resurrects a voided code.
pub const MAX_VERIFICATION_ATTEMPTS: u32 = 3;

/// How long a generation request stays confirmable. Generous — the OTC
/// travels out-of-band (typically email) and recipients are slow.
pub const GENERATION_TTL_HOURS: i64 = 24 * 7;

/// How long a payment request stays confirmable. Tight — the Pocket is
/// standing at the till.
pub const PAYMENT_TTL_MINUTES: i64 = 15;

// ---------------------------------------------------------------------------
// Runtime Policy
// ---------------------------------------------------------------------------

/// Tunable policy for a registry instance.
///
/// Attempt thresholds, password shape and code TTLs are configuration,
/// not hard-coded behavior. Build one with
/// `RegistryPolicy::default()` and override fields as needed.
#[derive(Clone, Debug)]
pub struct RegistryPolicy {
    /// OTC password length in symbols.
    pub password_length: usize,
    /// Alphabet OTC passwords are drawn from.
    pub password_alphabet: &'static [u8],
    /// Wrong-password verifications tolerated before voiding.
    pub max_attempts: u32,
    /// Validity window for generation codes, from `created_at`.
    pub generation_ttl: Duration,
    /// Validity window for payment codes, from `created_at`.
    pub payment_ttl: Duration,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            password_length: PASSWORD_LENGTH,
            password_alphabet: PASSWORD_ALPHABET,
            max_attempts: MAX_VERIFICATION_ATTEMPTS,
            generation_ttl: Duration::hours(GENERATION_TTL_HOURS),
            payment_ttl: Duration::minutes(PAYMENT_TTL_MINUTES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_budget_matches_oaep_formula() {
        // 4096-bit modulus, SHA-256 OAEP: 512 - 64 - 2 = 446 bytes.
        assert_eq!(MAX_ENVELOPE_PLAINTEXT, 446);
    }

    #[test]
    fn alphabet_has_no_ambiguous_glyphs() {
        for banned in [b'i', b'l', b'o', b'0', b'1'] {
            assert!(!PASSWORD_ALPHABET.contains(&banned));
        }
        assert!(PASSWORD_ALPHABET.iter().all(u8::is_ascii_alphanumeric));
    }

    #[test]
    fn default_policy_mirrors_constants() {
        let policy = RegistryPolicy::default();
        assert_eq!(policy.password_length, PASSWORD_LENGTH);
        assert_eq!(policy.max_attempts, MAX_VERIFICATION_ATTEMPTS);
        assert_eq!(policy.generation_ttl, Duration::hours(GENERATION_TTL_HOURS));
        assert_eq!(policy.payment_ttl, Duration::minutes(PAYMENT_TTL_MINUTES));
    }

    #[test]
    fn password_space_exceeds_attempt_budget_by_orders_of_magnitude() {
        let space = (PASSWORD_ALPHABET.len() as u64).pow(PASSWORD_LENGTH as u32);
        // 31^4 = 923,521. Three guesses against that is noise.
        assert!(space > 900_000);
        assert!(space / u64::from(MAX_VERIFICATION_ATTEMPTS) > 100_000);
    }
}
