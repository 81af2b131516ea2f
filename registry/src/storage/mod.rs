//! # Storage Collaborator
//!
//! The protocol core never talks to a database directly; it talks to
//! [`RegistryStore`], the contract this module pins down. The contract
//! is small but strict:
//!
//! - every `swap_*` is an atomic compare-and-swap at identifier
//!   granularity — "replace the record iff it still looks exactly like
//!   `expected`". All state transitions ride on this; the core never
//!   read-then-writes without it.
//! - `claim_nonce` is an atomic first-claim: exactly one caller per
//!   `(scope, party, nonce)` triple ever sees `true`.
//! - nothing is ever physically deleted. Performed and voided records
//!   are the audit trail.
//!
//! [`RegistryDb`] is the shipped implementation over sled.

mod db;

pub use db::RegistryDb;

use uuid::Uuid;

use crate::auth::{ApiKey, Source};
use crate::error::StoreResult;
use crate::generation::GenerationRequest;
use crate::otc::OneTimeCode;
use crate::payment::PaymentRequest;
use crate::voucher::Voucher;

/// Which protocol's nonce space a claim belongs to. Source and POS
/// identifiers live in different namespaces; their nonces must too.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonceScope {
    /// `(source_id, nonce)` claims.
    Generation,
    /// `(pos_id, nonce)` claims.
    Payment,
}

impl NonceScope {
    pub(crate) fn prefix(self) -> &'static str {
        match self {
            NonceScope::Generation => "g",
            NonceScope::Payment => "p",
        }
    }
}

/// The persistence interface the protocol core consumes.
///
/// Implementations must make every method atomic at the granularity of
/// the identifier it touches, and must be safe to call from any number
/// of threads.
pub trait RegistryStore: Send + Sync {
    // -- One-time codes -----------------------------------------------------

    /// Persist a freshly minted code.
    fn insert_code(&self, code: &OneTimeCode) -> StoreResult<()>;

    /// Load a code by identity.
    fn load_code(&self, id: Uuid) -> StoreResult<Option<OneTimeCode>>;

    /// Replace the stored code iff it currently equals `expected`.
    /// Returns `false` when the swap lost to a concurrent writer.
    fn swap_code(&self, expected: &OneTimeCode, updated: &OneTimeCode) -> StoreResult<bool>;

    // -- Nonce replay guard -------------------------------------------------

    /// Atomically claim `(scope, party, nonce)`. `true` exactly once,
    /// ever; `false` for every replay.
    fn claim_nonce(&self, scope: NonceScope, party: &str, nonce: &str) -> StoreResult<bool>;

    // -- Generation requests ------------------------------------------------

    /// Persist a new generation request.
    fn insert_generation(&self, record: &GenerationRequest) -> StoreResult<()>;

    /// Load a generation request by its OTC id.
    fn load_generation(&self, otc_id: Uuid) -> StoreResult<Option<GenerationRequest>>;

    /// CAS-replace a generation request.
    fn swap_generation(
        &self,
        expected: &GenerationRequest,
        updated: &GenerationRequest,
    ) -> StoreResult<bool>;

    // -- Payment requests ---------------------------------------------------

    /// Persist a new payment request.
    fn insert_payment(&self, record: &PaymentRequest) -> StoreResult<()>;

    /// Load a payment request by its OTC id.
    fn load_payment(&self, otc_id: Uuid) -> StoreResult<Option<PaymentRequest>>;

    /// CAS-replace a payment request.
    fn swap_payment(&self, expected: &PaymentRequest, updated: &PaymentRequest)
        -> StoreResult<bool>;

    // -- Vouchers -----------------------------------------------------------

    /// Persist a materialized voucher.
    fn insert_voucher(&self, voucher: &Voucher) -> StoreResult<()>;

    /// Load a voucher by identity.
    fn load_voucher(&self, id: Uuid) -> StoreResult<Option<Voucher>>;

    /// CAS-replace a voucher (unit spends ride on this).
    fn swap_voucher(&self, expected: &Voucher, updated: &Voucher) -> StoreResult<bool>;

    /// Every voucher in the pool, spent and unspent. Selection and
    /// eligibility are the caller's concern.
    fn vouchers(&self) -> StoreResult<Vec<Voucher>>;

    // -- Directory ----------------------------------------------------------

    /// Persist an API key.
    fn insert_api_key(&self, key: &ApiKey) -> StoreResult<()>;

    /// Load an API key by its bearer token.
    fn load_api_key(&self, key: &str) -> StoreResult<Option<ApiKey>>;

    /// Persist a Source directory entry.
    fn insert_source(&self, source: &Source) -> StoreResult<()>;

    /// Load a Source by id.
    fn load_source(&self, id: &str) -> StoreResult<Option<Source>>;
}
