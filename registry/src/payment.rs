//! # Payment Protocol
//!
//! The redemption flow, POS side:
//!
//! 1. A POS registers a payment request: how many voucher units it wants,
//!    an optional eligibility filter, and the acknowledgment URLs both
//!    sides will be pointed at. The registry mints an OTC for the offer.
//! 2. A Pocket confirms with the OTC pair. The registry selects vouchers
//!    satisfying the stored filter, spends the requested units, and
//!    records a confirmation timestamp.
//!
//! Two shapes of offer exist. A **single-use** request performs on its
//! first confirmation and rejects every later one. A **persistent**
//! offer — a standing payment point, think a donation box — settles at
//! `Verified` and accepts any number of confirmations, each appending to
//! the `confirmations` list, until explicitly deactivated.
//!
//! There is no partial payment: when fewer eligible units exist than the
//! request demands, the confirm fails with `InsufficientVouchers` and no
//! voucher is touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RegistryPolicy;
use crate::error::ProtocolError;
use crate::otc::{CodeKind, CodeStatus, OtcRegistry};
use crate::storage::{NonceScope, RegistryStore};
use crate::voucher::{Voucher, VoucherFilter};

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Acknowledgment URLs a payment registration carries: where to send
/// the Pocket after redemption and where the POS polls for completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckUrls {
    /// Redirect target for the paying Pocket.
    pub pocket: String,
    /// Callback the POS watches.
    pub pos: String,
}

/// One recorded confirmation against a payment request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    /// When the confirmation happened.
    pub performed_at: DateTime<Utc>,
}

/// A persisted payment/redemption transaction.
///
/// As with generation, the OTC state lives in the code store under the
/// same id; this record holds the offer itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// The OTC this request is keyed by.
    pub otc_id: Uuid,
    /// The POS that registered the offer.
    pub pos_id: String,
    /// Anti-replay token, unique per POS across time.
    pub nonce: String,
    /// Voucher units a confirmation must spend. No partial payment.
    pub amount: u64,
    /// Eligibility predicate, stored verbatim from registration.
    pub filter: Option<VoucherFilter>,
    /// Acknowledgment URLs for both parties.
    pub ack_urls: AckUrls,
    /// Whether the offer accepts repeated confirmations.
    pub persistent: bool,
    /// Confirmations recorded so far, in order. At most one for a
    /// single-use request.
    pub confirmations: Vec<Confirmation>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Forward-compatibility side-map for unknown fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PaymentRequest {
    /// The canonical "last paid" timestamp: the latest confirmation.
    pub fn last_paid_at(&self) -> Option<DateTime<Utc>> {
        self.confirmations.last().map(|c| c.performed_at)
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// State machine driver for merchant payments.
#[derive(Clone)]
pub struct PaymentProtocol {
    store: Arc<dyn RegistryStore>,
    otc: OtcRegistry,
}

impl PaymentProtocol {
    /// Build the protocol over a store with the given policy.
    pub fn new(store: Arc<dyn RegistryStore>, policy: RegistryPolicy) -> Self {
        let otc = OtcRegistry::new(Arc::clone(&store), policy);
        Self { store, otc }
    }

    /// Register a payment request.
    ///
    /// Duplicate `(pos_id, nonce)` pairs are rejected before any write.
    /// The filter is stored verbatim for confirmation time.
    pub fn register(
        &self,
        pos_id: &str,
        nonce: &str,
        amount: u64,
        filter: Option<VoucherFilter>,
        ack_urls: AckUrls,
        persistent: bool,
    ) -> Result<(Uuid, String), ProtocolError> {
        if !self.store.claim_nonce(NonceScope::Payment, pos_id, nonce)? {
            return Err(ProtocolError::DuplicateNonce {
                party: pos_id.to_string(),
            });
        }

        let code = self.otc.mint(CodeKind::Payment)?;
        let record = PaymentRequest {
            otc_id: code.id,
            pos_id: pos_id.to_string(),
            nonce: nonce.to_string(),
            amount,
            filter,
            ack_urls,
            persistent,
            confirmations: Vec::new(),
            created_at: code.created_at,
            extra: BTreeMap::new(),
        };
        self.store.insert_payment(&record)?;

        info!(
            otc = %code.id,
            pos = %pos_id,
            amount,
            persistent,
            "payment request registered"
        );

        Ok((code.id, code.password))
    }

    /// Confirm a payment: verify the OTC, spend eligible vouchers, and
    /// record the confirmation.
    ///
    /// Selection happens against the filter stored at registration.
    /// When fewer eligible units exist than `amount`, the call fails
    /// with [`ProtocolError::InsufficientVouchers`] and no voucher
    /// state changes — units taken before a mid-spend shortfall are put
    /// back, and the offer stays confirmable. On success the redeemed
    /// vouchers are returned with `count` set to the units taken from
    /// each.
    pub fn confirm(&self, otc_id: Uuid, password: &str) -> Result<Vec<Voucher>, ProtocolError> {
        self.otc.verify(otc_id, password)?;

        let record = self
            .store
            .load_payment(otc_id)?
            .ok_or(ProtocolError::NotFound(otc_id))?;

        let now = Utc::now();
        let eligible = self.eligible_vouchers(&record, now)?;
        let available: u64 = eligible.iter().map(|v| v.count).sum();
        if available < record.amount {
            return Err(ProtocolError::InsufficientVouchers {
                required: record.amount,
                available,
            });
        }

        // Spend before the state transition. The offer must only reach a
        // settled state once its units are actually in hand; a shortfall
        // inside `spend` refunds itself and leaves the code untouched.
        let redeemed = self.spend(eligible, record.amount)?;

        // State gate. Single-use offers take the terminal transition
        // here — of any number of racing confirms, one passes and the
        // rest observe AlreadyPerformed. Persistent offers settle at
        // Verified (idempotent) and stay open. A loser has already
        // decremented its units, so it puts them back before reporting.
        let gate = if record.persistent {
            self.otc.mark_verified(otc_id)
        } else {
            self.otc.mark_performed(otc_id)
        };
        if let Err(err) = gate {
            self.refund(&redeemed)?;
            return Err(err);
        }

        self.append_confirmation(otc_id, now)?;

        info!(
            otc = %otc_id,
            units = record.amount,
            vouchers = redeemed.len(),
            persistent = record.persistent,
            "payment confirmed"
        );

        Ok(redeemed)
    }

    /// Close a persistent offer. After this, further confirmations get
    /// [`ProtocolError::AlreadyPerformed`].
    pub fn deactivate(&self, otc_id: Uuid) -> Result<(), ProtocolError> {
        self.otc.mark_performed(otc_id)?;
        info!(otc = %otc_id, "payment offer deactivated");
        Ok(())
    }

    /// Read-only standing of a payment code. Safe to poll: mutates
    /// neither state nor attempt counters.
    pub fn status(&self, otc_id: Uuid) -> Result<CodeStatus, ProtocolError> {
        Ok(self.otc.status(otc_id)?)
    }

    /// Load the persisted request record.
    pub fn request(&self, otc_id: Uuid) -> Result<Option<PaymentRequest>, ProtocolError> {
        Ok(self.store.load_payment(otc_id)?)
    }

    /// Vouchers the stored filter accepts, with units remaining.
    fn eligible_vouchers(
        &self,
        record: &PaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<Voucher>, ProtocolError> {
        let filter = record.filter.clone().unwrap_or_default();
        Ok(self
            .store
            .vouchers()?
            .into_iter()
            .filter(|v| v.count > 0 && filter.matches(v, now))
            .collect())
    }

    /// Spend `needed` units across the eligible set, oldest first.
    ///
    /// Each decrement is a CAS; a lost race reloads the voucher and
    /// retries against its fresh state. Returns the redeemed views with
    /// `count` = units taken.
    fn spend(&self, mut eligible: Vec<Voucher>, total: u64) -> Result<Vec<Voucher>, ProtocolError> {
        eligible.sort_by_key(|v| v.timestamp);

        let mut needed = total;
        let mut redeemed = Vec::new();

        for voucher in eligible {
            if needed == 0 {
                break;
            }
            let mut current = voucher;
            loop {
                if current.count == 0 {
                    break;
                }
                let take = current.count.min(needed);
                let mut updated = current.clone();
                updated.count -= take;

                if self.store.swap_voucher(&current, &updated)? {
                    let mut view = updated;
                    view.count = take;
                    redeemed.push(view);
                    needed -= take;
                    break;
                }

                match self.store.load_voucher(current.id)? {
                    Some(fresh) => current = fresh,
                    None => break,
                }
            }
        }

        if needed > 0 {
            // The pool drained between the availability check and the
            // spend — a concurrent confirmation took the same vouchers.
            // Put back what this caller already took; no confirmation
            // happened, so no unit may stay spent.
            warn!(required = total, short_by = needed, "voucher pool drained mid-confirmation");
            self.refund(&redeemed)?;
            return Err(ProtocolError::InsufficientVouchers {
                required: total,
                available: total - needed,
            });
        }

        Ok(redeemed)
    }

    /// Return spent units to their vouchers, one CAS per record. Used
    /// when a confirm loses the state gate or the pool drains mid-spend;
    /// `redeemed` views carry `count` = units taken, which is exactly
    /// what goes back.
    fn refund(&self, redeemed: &[Voucher]) -> Result<(), ProtocolError> {
        for view in redeemed {
            loop {
                // Vouchers are never deleted; a missing record here
                // means the store itself lost data, and there is nothing
                // left to refund into.
                let Some(current) = self.store.load_voucher(view.id)? else {
                    break;
                };
                let mut updated = current.clone();
                updated.count += view.count;
                if self.store.swap_voucher(&current, &updated)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Append a confirmation timestamp to the record, CAS-guarded so
    /// concurrent confirmations of a persistent offer never lose an
    /// entry.
    fn append_confirmation(&self, otc_id: Uuid, at: DateTime<Utc>) -> Result<(), ProtocolError> {
        loop {
            let Some(current) = self.store.load_payment(otc_id)? else {
                return Err(ProtocolError::NotFound(otc_id));
            };
            let mut updated = current.clone();
            updated.confirmations.push(Confirmation { performed_at: at });
            if self.store.swap_payment(&current, &updated)? {
                return Ok(());
            }
        }
    }
}
