//! # One-Time Codes
//!
//! The OTC is the unit of authorization in the registry: a 128-bit
//! random identity paired with a short human-typeable password. Minted
//! when a generation or payment request is registered, delivered
//! out-of-band, and consumed exactly once (or repeatedly, for persistent
//! payment offers) through the state machine
//!
//! ```text
//! Created ──▶ Verified ──▶ Performed
//!    │            │
//!    └────────────┴──▶ Void        (attempt exhaustion / invalidation)
//! ```
//!
//! `Performed` and `Void` are terminal: no state-changing operation may
//! succeed against a code that reached either. Codes are never deleted —
//! a voided or performed code stays on disk as the audit trail.
//!
//! ## Concurrency
//!
//! Every mutation goes through the storage collaborator's compare-and-
//! swap. A transition is a load, a pure state check, and a conditional
//! swap; when the swap loses a race the operation reloads and
//! re-evaluates, so two concurrent `verify` + `mark_performed` sequences
//! can never both win — the loser re-reads a terminal state and reports
//! [`ProtocolError::AlreadyPerformed`].
//!
//! ## Timing
//!
//! Password checks use a fold-over-bytes comparison with no early exit.
//! The attempt counter already hands callers a coarse oracle; there is
//! no reason to hand them a fine-grained one too.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RegistryPolicy;
use crate::error::{ProtocolError, StoreResult};
use crate::storage::RegistryStore;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Which protocol minted a code. Drives TTL selection and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CodeKind {
    /// Voucher-issuance flow (Source side).
    Generation,
    /// Payment/redemption flow (POS side).
    Payment,
}

/// Lifecycle state of a code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CodeState {
    /// Minted, not yet acted on.
    Created,
    /// Verified; for persistent payment offers this is the resting state
    /// between confirmations.
    Verified,
    /// Consumed. Terminal.
    Performed,
    /// Invalidated. Terminal.
    Void,
}

/// A persisted one-time code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeCode {
    /// 128-bit random identity. Globally unique, never reused.
    pub id: Uuid,
    /// Which protocol owns this code.
    pub kind: CodeKind,
    /// The short secret delivered out-of-band alongside the id.
    pub password: String,
    /// Mint time.
    pub created_at: DateTime<Utc>,
    /// End of the validity window, derived from `created_at` plus the
    /// per-kind TTL. Checked at read time; there is no background sweep.
    /// Binds `Created` codes only — a code that settled at `Verified`
    /// stays usable past this instant until explicitly closed.
    pub expires_on: DateTime<Utc>,
    /// Failed password verifications so far.
    pub attempts: u32,
    /// Current lifecycle state.
    pub state: CodeState,
    /// When the code reached `Verified`, if it has.
    pub verified_at: Option<DateTime<Utc>>,
    /// When the code reached `Performed`, if it has.
    pub performed_at: Option<DateTime<Utc>>,
    /// Forward-compatibility side-map for unknown fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl OneTimeCode {
    /// Whether the code is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, CodeState::Performed | CodeState::Void)
    }

    /// Whether the validity window has closed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_on
    }
}

/// Read-only view of a code's standing, served to polling clients.
///
/// Derived from the stored record plus the clock; producing one never
/// mutates anything, not even the attempt counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CodeStatus {
    /// Confirmable, nothing has happened yet.
    Pending,
    /// Verified; persistent offers sit here between confirmations,
    /// exempt from the validity window.
    Verified,
    /// Consumed.
    Performed,
    /// Validity window closed before the code ever settled.
    Expired,
    /// Invalidated.
    Void,
    /// No such code.
    NotFound,
}

// ---------------------------------------------------------------------------
// Password helpers
// ---------------------------------------------------------------------------

/// Draw a fresh password from the policy alphabet.
pub(crate) fn generate_password(policy: &RegistryPolicy) -> String {
    let alphabet = policy.password_alphabet;
    (0..policy.password_length)
        .map(|_| alphabet[OsRng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Constant-time-equivalent comparison: fold XOR over all bytes, no
/// early exit on mismatch. Length differences fail fast — password
/// length is public policy, not a secret.
fn passwords_match(expected: &str, supplied: &str) -> bool {
    let a = expected.as_bytes();
    let b = supplied.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Registry engine
// ---------------------------------------------------------------------------

/// Mints, verifies, and retires one-time codes against the storage
/// collaborator.
///
/// Cheap to clone; both protocols hold one.
#[derive(Clone)]
pub struct OtcRegistry {
    store: Arc<dyn RegistryStore>,
    policy: RegistryPolicy,
}

impl OtcRegistry {
    /// Build an engine over a store with the given policy.
    pub fn new(store: Arc<dyn RegistryStore>, policy: RegistryPolicy) -> Self {
        Self { store, policy }
    }

    /// The policy this engine enforces.
    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    /// Mint and persist a fresh code in `Created` state.
    ///
    /// Identity uniqueness is delegated to UUIDv4 entropy; collisions
    /// are treated as negligible, not mechanically checked.
    pub fn mint(&self, kind: CodeKind) -> StoreResult<OneTimeCode> {
        let now = Utc::now();
        let ttl = self.ttl_for(kind);
        let code = OneTimeCode {
            id: Uuid::new_v4(),
            kind,
            password: generate_password(&self.policy),
            created_at: now,
            expires_on: now + ttl,
            attempts: 0,
            state: CodeState::Created,
            verified_at: None,
            performed_at: None,
            extra: BTreeMap::new(),
        };
        self.store.insert_code(&code)?;
        info!(id = %code.id, kind = ?kind, expires_on = %code.expires_on, "minted one-time code");
        Ok(code)
    }

    fn ttl_for(&self, kind: CodeKind) -> Duration {
        match kind {
            CodeKind::Generation => self.policy.generation_ttl,
            CodeKind::Payment => self.policy.payment_ttl,
        }
    }

    /// Check a supplied password against the code.
    ///
    /// Terminal codes, and `Created` codes whose window has closed, are
    /// rejected without touching the attempt counter. `Verified` codes
    /// ignore the window — a standing offer stays verifiable until
    /// deactivated. A wrong password increments the counter atomically, and
    /// the increment that reaches the policy threshold voids the code in
    /// the same swap. Success mutates nothing — legitimate retries of
    /// the correct password before the terminal transition are allowed.
    pub fn verify(&self, id: Uuid, supplied: &str) -> Result<(), ProtocolError> {
        loop {
            let code = self
                .store
                .load_code(id)?
                .ok_or(ProtocolError::NotFound(id))?;

            match code.state {
                CodeState::Void => return Err(ProtocolError::Void(id)),
                CodeState::Performed => return Err(ProtocolError::AlreadyPerformed(id)),
                CodeState::Created | CodeState::Verified => {}
            }

            // The validity window bounds the time to first settlement.
            // A Verified code (a standing payment offer) is past that
            // point and stays usable until explicitly closed.
            if code.state == CodeState::Created && code.is_expired(Utc::now()) {
                return Err(ProtocolError::Expired(id));
            }

            if passwords_match(&code.password, supplied) {
                return Ok(());
            }

            let mut updated = code.clone();
            updated.attempts += 1;
            if updated.attempts >= self.policy.max_attempts {
                updated.state = CodeState::Void;
            }

            if self.store.swap_code(&code, &updated)? {
                if updated.state == CodeState::Void {
                    warn!(id = %id, attempts = updated.attempts, "attempt budget exhausted, code voided");
                } else {
                    warn!(id = %id, attempts = updated.attempts, "wrong password");
                }
                return Err(ProtocolError::WrongPassword(id));
            }
            // Lost a race against a concurrent mutation; re-read and
            // re-evaluate from the fresh state.
        }
    }

    /// Transition `Created → Verified`.
    ///
    /// Idempotent when the code is already `Verified`; fails with the
    /// terminal outcome otherwise.
    pub fn mark_verified(&self, id: Uuid) -> Result<(), ProtocolError> {
        loop {
            let code = self
                .store
                .load_code(id)?
                .ok_or(ProtocolError::NotFound(id))?;

            match code.state {
                CodeState::Verified => return Ok(()),
                CodeState::Performed => return Err(ProtocolError::AlreadyPerformed(id)),
                CodeState::Void => return Err(ProtocolError::Void(id)),
                CodeState::Created => {}
            }

            let mut updated = code.clone();
            updated.state = CodeState::Verified;
            updated.verified_at = Some(Utc::now());

            if self.store.swap_code(&code, &updated)? {
                info!(id = %id, "code verified");
                return Ok(());
            }
        }
    }

    /// Transition into the terminal `Performed` state.
    ///
    /// Accepted from `Created` (single-step flows stamp `verified_at` in
    /// the same swap) and from `Verified`. A code already `Performed`
    /// fails with [`ProtocolError::AlreadyPerformed`] — this is the
    /// linearization point that makes redemption exactly-once: of any
    /// number of concurrent callers, exactly one swap wins.
    pub fn mark_performed(&self, id: Uuid) -> Result<(), ProtocolError> {
        loop {
            let code = self
                .store
                .load_code(id)?
                .ok_or(ProtocolError::NotFound(id))?;

            match code.state {
                CodeState::Performed => return Err(ProtocolError::AlreadyPerformed(id)),
                CodeState::Void => return Err(ProtocolError::Void(id)),
                CodeState::Created | CodeState::Verified => {}
            }

            let now = Utc::now();
            let mut updated = code.clone();
            updated.state = CodeState::Performed;
            updated.verified_at = updated.verified_at.or(Some(now));
            updated.performed_at = Some(now);

            if self.store.swap_code(&code, &updated)? {
                info!(id = %id, "code performed");
                return Ok(());
            }
        }
    }

    /// Explicitly invalidate a non-terminal code.
    pub fn mark_void(&self, id: Uuid) -> Result<(), ProtocolError> {
        loop {
            let code = self
                .store
                .load_code(id)?
                .ok_or(ProtocolError::NotFound(id))?;

            match code.state {
                CodeState::Void => return Ok(()),
                CodeState::Performed => return Err(ProtocolError::AlreadyPerformed(id)),
                CodeState::Created | CodeState::Verified => {}
            }

            let mut updated = code.clone();
            updated.state = CodeState::Void;

            if self.store.swap_code(&code, &updated)? {
                warn!(id = %id, "code voided");
                return Ok(());
            }
        }
    }

    /// Read-only standing of a code. Never mutates, not even attempts.
    pub fn status(&self, id: Uuid) -> StoreResult<CodeStatus> {
        let Some(code) = self.store.load_code(id)? else {
            return Ok(CodeStatus::NotFound);
        };

        Ok(match code.state {
            CodeState::Performed => CodeStatus::Performed,
            CodeState::Void => CodeStatus::Void,
            CodeState::Created if code.is_expired(Utc::now()) => CodeStatus::Expired,
            CodeState::Verified => CodeStatus::Verified,
            CodeState::Created => CodeStatus::Pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RegistryDb;

    fn engine() -> OtcRegistry {
        let store = Arc::new(RegistryDb::open_temporary().expect("temp db"));
        OtcRegistry::new(store, RegistryPolicy::default())
    }

    fn engine_with(policy: RegistryPolicy) -> OtcRegistry {
        let store = Arc::new(RegistryDb::open_temporary().expect("temp db"));
        OtcRegistry::new(store, policy)
    }

    #[test]
    fn mint_produces_created_code_with_policy_password() {
        let otc = engine();
        let code = otc.mint(CodeKind::Generation).unwrap();

        assert_eq!(code.state, CodeState::Created);
        assert_eq!(code.attempts, 0);
        assert_eq!(code.password.len(), otc.policy().password_length);
        assert!(code
            .password
            .bytes()
            .all(|b| otc.policy().password_alphabet.contains(&b)));
        assert_eq!(
            code.expires_on - code.created_at,
            otc.policy().generation_ttl
        );
    }

    #[test]
    fn payment_codes_get_the_tight_ttl() {
        let otc = engine();
        let code = otc.mint(CodeKind::Payment).unwrap();
        assert_eq!(code.expires_on - code.created_at, otc.policy().payment_ttl);
    }

    #[test]
    fn verify_accepts_correct_password_without_mutation() {
        let otc = engine();
        let code = otc.mint(CodeKind::Generation).unwrap();

        otc.verify(code.id, &code.password).unwrap();
        // Repeat of the same correct password still fine — legitimate
        // retries are not attempts.
        otc.verify(code.id, &code.password).unwrap();

        let stored = otc.store.load_code(code.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.state, CodeState::Created);
    }

    #[test]
    fn wrong_password_increments_attempts() {
        let otc = engine();
        let code = otc.mint(CodeKind::Generation).unwrap();

        let err = otc.verify(code.id, "zzzz").unwrap_err();
        assert!(matches!(err, ProtocolError::WrongPassword(id) if id == code.id));

        let stored = otc.store.load_code(code.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.state, CodeState::Created);
    }

    #[test]
    fn attempt_exhaustion_voids_the_code_for_good() {
        let otc = engine();
        let code = otc.mint(CodeKind::Generation).unwrap();

        for _ in 0..otc.policy().max_attempts {
            let err = otc.verify(code.id, "zzzz").unwrap_err();
            assert!(matches!(err, ProtocolError::WrongPassword(_)));
        }

        // The code is now void; even the correct password gets Void.
        let err = otc.verify(code.id, &code.password).unwrap_err();
        assert!(matches!(err, ProtocolError::Void(_)));
        assert_eq!(otc.status(code.id).unwrap(), CodeStatus::Void);
    }

    #[test]
    fn terminal_outcomes_do_not_touch_the_counter() {
        let otc = engine();
        let code = otc.mint(CodeKind::Generation).unwrap();
        otc.mark_performed(code.id).unwrap();

        // Wrong password against a performed code: AlreadyPerformed, and
        // no attempt side effect.
        let err = otc.verify(code.id, "zzzz").unwrap_err();
        assert!(matches!(err, ProtocolError::AlreadyPerformed(_)));
        let stored = otc.store.load_code(code.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
    }

    #[test]
    fn expired_code_rejected_without_mutation() {
        let policy = RegistryPolicy {
            payment_ttl: Duration::minutes(-1), // already expired at mint
            ..Default::default()
        };
        let otc = engine_with(policy);
        let code = otc.mint(CodeKind::Payment).unwrap();

        let err = otc.verify(code.id, &code.password).unwrap_err();
        assert!(matches!(err, ProtocolError::Expired(_)));
        let stored = otc.store.load_code(code.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert_eq!(otc.status(code.id).unwrap(), CodeStatus::Expired);
    }

    #[test]
    fn verified_code_ignores_the_validity_window() {
        // A code that settled at Verified (a standing payment offer)
        // must keep verifying past expires_on; only Created codes die
        // of TTL.
        let otc = engine();
        let now = Utc::now();
        let code = OneTimeCode {
            id: Uuid::new_v4(),
            kind: CodeKind::Payment,
            password: "ab12".to_string(),
            created_at: now - Duration::hours(2),
            expires_on: now - Duration::hours(1),
            attempts: 0,
            state: CodeState::Verified,
            verified_at: Some(now - Duration::hours(2)),
            performed_at: None,
            extra: BTreeMap::new(),
        };
        otc.store.insert_code(&code).unwrap();

        otc.verify(code.id, "ab12").unwrap();
        assert_eq!(otc.status(code.id).unwrap(), CodeStatus::Verified);

        // Closing it still works, and is what actually ends the offer.
        otc.mark_performed(code.id).unwrap();
        assert_eq!(otc.status(code.id).unwrap(), CodeStatus::Performed);
    }

    #[test]
    fn unknown_code_is_not_found() {
        let otc = engine();
        let ghost = Uuid::new_v4();
        assert!(matches!(
            otc.verify(ghost, "ab12").unwrap_err(),
            ProtocolError::NotFound(_)
        ));
        assert_eq!(otc.status(ghost).unwrap(), CodeStatus::NotFound);
    }

    #[test]
    fn mark_verified_is_idempotent() {
        let otc = engine();
        let code = otc.mint(CodeKind::Payment).unwrap();

        otc.mark_verified(code.id).unwrap();
        otc.mark_verified(code.id).unwrap(); // no-op, not an error

        let stored = otc.store.load_code(code.id).unwrap().unwrap();
        assert_eq!(stored.state, CodeState::Verified);
        assert!(stored.verified_at.is_some());
    }

    #[test]
    fn mark_performed_twice_reports_already_performed() {
        let otc = engine();
        let code = otc.mint(CodeKind::Generation).unwrap();

        otc.mark_performed(code.id).unwrap();
        let err = otc.mark_performed(code.id).unwrap_err();
        assert!(matches!(err, ProtocolError::AlreadyPerformed(_)));
    }

    #[test]
    fn performed_from_created_stamps_both_timestamps() {
        let otc = engine();
        let code = otc.mint(CodeKind::Generation).unwrap();
        otc.mark_performed(code.id).unwrap();

        let stored = otc.store.load_code(code.id).unwrap().unwrap();
        assert!(stored.verified_at.is_some());
        assert!(stored.performed_at.is_some());
    }

    #[test]
    fn void_blocks_every_transition() {
        let otc = engine();
        let code = otc.mint(CodeKind::Payment).unwrap();
        otc.mark_void(code.id).unwrap();
        otc.mark_void(code.id).unwrap(); // idempotent

        assert!(matches!(
            otc.mark_verified(code.id).unwrap_err(),
            ProtocolError::Void(_)
        ));
        assert!(matches!(
            otc.mark_performed(code.id).unwrap_err(),
            ProtocolError::Void(_)
        ));
    }

    #[test]
    fn concurrent_mark_performed_has_exactly_one_winner() {
        use std::thread;

        let otc = engine();
        let code = otc.mint(CodeKind::Payment).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let otc = otc.clone();
                let id = code.id;
                thread::spawn(move || otc.mark_performed(id).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1, "exactly one concurrent caller may perform a code");
    }

    #[test]
    fn passwords_match_is_exact() {
        assert!(passwords_match("ab12", "ab12"));
        assert!(!passwords_match("ab12", "ab13"));
        assert!(!passwords_match("ab12", "ab1"));
        assert!(!passwords_match("ab12", "AB12"));
    }

    #[test]
    fn generated_passwords_stay_in_alphabet() {
        let policy = RegistryPolicy::default();
        for _ in 0..50 {
            let pw = generate_password(&policy);
            assert_eq!(pw.len(), policy.password_length);
            assert!(pw.bytes().all(|b| policy.password_alphabet.contains(&b)));
        }
    }
}
