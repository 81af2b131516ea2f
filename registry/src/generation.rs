//! # Generation Protocol
//!
//! The voucher-issuance flow, Source side:
//!
//! 1. A Source registers a generation request declaring the voucher
//!    batch it wants to issue. The registry mints an OTC and hands the
//!    `(id, password)` pair back for out-of-band delivery to the
//!    eventual recipient.
//! 2. The recipient confirms with the pair. The vouchers materialize —
//!    exactly the batch declared at registration, never regenerated or
//!    resized — and are returned exactly once.
//!
//! A replayed `(source_id, nonce)` is rejected before anything is
//! written; an abandoned request stays confirmable until its code
//! expires. The confirm path rides the OTC engine's `Performed`
//! transition for its exactly-once guarantee: whoever wins that swap
//! materializes the batch, everyone else gets `AlreadyPerformed`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::RegistryPolicy;
use crate::courier::{Courier, OtcDelivery};
use crate::error::ProtocolError;
use crate::otc::{CodeKind, CodeStatus, OtcRegistry};
use crate::storage::{NonceScope, RegistryStore};
use crate::voucher::{Voucher, VoucherSpec};

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A persisted voucher-issuance transaction.
///
/// The OTC itself (password, attempts, state) lives in the code store
/// under the same id; this record carries the domain side — who asked,
/// for what, and what came of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// The OTC this request is keyed by.
    pub otc_id: Uuid,
    /// The Source that registered the request.
    pub source_id: String,
    /// Anti-replay token, unique per Source across time.
    pub nonce: String,
    /// The voucher batch declared at registration. Frozen from then on.
    pub specs: Vec<VoucherSpec>,
    /// Total units materialized, resolved at confirmation. `None` until
    /// the vouchers exist.
    pub total_voucher_count: Option<u64>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Forward-compatibility side-map for unknown fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl GenerationRequest {
    /// Number of voucher specifications declared.
    pub fn amount(&self) -> usize {
        self.specs.len()
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// State machine driver for voucher issuance.
#[derive(Clone)]
pub struct GenerationProtocol {
    store: Arc<dyn RegistryStore>,
    otc: OtcRegistry,
    courier: Option<Arc<dyn Courier>>,
}

impl GenerationProtocol {
    /// Build the protocol over a store with the given policy.
    pub fn new(store: Arc<dyn RegistryStore>, policy: RegistryPolicy) -> Self {
        let otc = OtcRegistry::new(Arc::clone(&store), policy);
        Self {
            store,
            otc,
            courier: None,
        }
    }

    /// Attach a courier; freshly minted OTC pairs are scheduled on it
    /// for out-of-band delivery.
    pub fn with_courier(mut self, courier: Arc<dyn Courier>) -> Self {
        self.courier = Some(courier);
        self
    }

    /// Register a voucher-issuance request.
    ///
    /// Rejects [`ProtocolError::DuplicateNonce`] without writing
    /// anything when `(source_id, nonce)` was seen before. On success
    /// the request is persisted in `Created` state and the OTC pair is
    /// returned (and scheduled on the courier, when one is attached).
    pub fn register(
        &self,
        source_id: &str,
        nonce: &str,
        specs: Vec<VoucherSpec>,
    ) -> Result<(Uuid, String), ProtocolError> {
        if !self
            .store
            .claim_nonce(NonceScope::Generation, source_id, nonce)?
        {
            return Err(ProtocolError::DuplicateNonce {
                party: source_id.to_string(),
            });
        }

        let code = self.otc.mint(CodeKind::Generation)?;
        let record = GenerationRequest {
            otc_id: code.id,
            source_id: source_id.to_string(),
            nonce: nonce.to_string(),
            specs,
            total_voucher_count: None,
            created_at: code.created_at,
            extra: BTreeMap::new(),
        };
        self.store.insert_generation(&record)?;

        info!(
            otc = %code.id,
            source = %source_id,
            specs = record.amount(),
            "generation request registered"
        );

        if let Some(courier) = &self.courier {
            courier.schedule(OtcDelivery {
                otc: code.id,
                password: code.password.clone(),
                recipient: source_id.to_string(),
                kind: CodeKind::Generation,
            });
        }

        Ok((code.id, code.password))
    }

    /// Confirm a generation request and materialize its vouchers.
    ///
    /// Verification outcomes (`NotFound`, `Expired`, `Void`,
    /// `WrongPassword`, `AlreadyPerformed`) surface unchanged. On
    /// success the batch declared at registration is created atomically
    /// after the `Performed` transition — a second call with the correct
    /// credentials gets [`ProtocolError::AlreadyPerformed`], never a
    /// duplicate batch.
    pub fn confirm(&self, otc_id: Uuid, password: &str) -> Result<Vec<Voucher>, ProtocolError> {
        self.otc.verify(otc_id, password)?;

        // Exactly-once gate: of any number of racing confirms, one wins
        // this transition and materializes; the rest observe
        // AlreadyPerformed.
        self.otc.mark_performed(otc_id)?;

        let record = self
            .store
            .load_generation(otc_id)?
            .ok_or(ProtocolError::NotFound(otc_id))?;

        let now = Utc::now();
        let mut vouchers = Vec::with_capacity(record.specs.len());
        for spec in &record.specs {
            let voucher = spec.materialize(otc_id, now);
            self.store.insert_voucher(&voucher)?;
            vouchers.push(voucher);
        }

        let total_units: u64 = vouchers.iter().map(|v| v.count).sum();
        self.resolve_total(otc_id, total_units)?;

        info!(
            otc = %otc_id,
            vouchers = vouchers.len(),
            units = total_units,
            "generation confirmed, vouchers materialized"
        );

        Ok(vouchers)
    }

    /// Read-only standing of a generation code.
    pub fn status(&self, otc_id: Uuid) -> Result<CodeStatus, ProtocolError> {
        Ok(self.otc.status(otc_id)?)
    }

    /// Load the persisted request record.
    pub fn request(&self, otc_id: Uuid) -> Result<Option<GenerationRequest>, ProtocolError> {
        Ok(self.store.load_generation(otc_id)?)
    }

    /// Stamp the resolved voucher count onto the record. CAS loop —
    /// only this path writes the field, but the swap still guards
    /// against unrelated concurrent edits.
    fn resolve_total(&self, otc_id: Uuid, total_units: u64) -> Result<(), ProtocolError> {
        loop {
            let Some(current) = self.store.load_generation(otc_id)? else {
                return Err(ProtocolError::NotFound(otc_id));
            };
            let mut updated = current.clone();
            updated.total_voucher_count = Some(total_units);
            if self.store.swap_generation(&current, &updated)? {
                return Ok(());
            }
        }
    }
}
