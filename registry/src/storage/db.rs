//! # RegistryDb — Persistent Storage Engine
//!
//! The sled-backed implementation of [`RegistryStore`]. All on-disk data
//! flows through this module.
//!
//! ## Tree Layout
//!
//! sled organizes data into named "trees", each an independent B+ tree
//! with its own keyspace:
//!
//! | Tree          | Key                       | Value                      |
//! |---------------|---------------------------|----------------------------|
//! | `codes`       | OTC id (16B)              | `json(OneTimeCode)`        |
//! | `generations` | OTC id (16B)              | `json(GenerationRequest)`  |
//! | `payments`    | OTC id (16B)              | `json(PaymentRequest)`     |
//! | `vouchers`    | voucher id (16B)          | `json(Voucher)`            |
//! | `nonces`      | `scope:party:nonce` UTF-8 | claim timestamp (RFC 3339) |
//! | `api_keys`    | bearer token (UTF-8)      | `json(ApiKey)`             |
//! | `sources`     | source id (UTF-8)         | `json(Source)`             |
//!
//! ## Atomicity
//!
//! Every `swap_*` maps straight onto sled's `compare_and_swap`, comparing
//! serialized bytes. That works because values are canonical JSON: struct
//! fields serialize in declaration order, side-maps are `BTreeMap`s, and
//! timestamps round-trip exactly — so re-serializing a record that was
//! just loaded reproduces the stored bytes verbatim. `claim_nonce` is a
//! `compare_and_swap` from absent, which makes the first claimant the
//! only claimant.

use sled::{Db, Tree};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{NonceScope, RegistryStore};
use crate::auth::{ApiKey, Source};
use crate::error::{StoreError, StoreResult};
use crate::generation::GenerationRequest;
use crate::otc::OneTimeCode;
use crate::payment::PaymentRequest;
use crate::voucher::Voucher;

// ---------------------------------------------------------------------------
// RegistryDb
// ---------------------------------------------------------------------------

/// Persistent storage engine for the voucher registry.
///
/// Wraps a sled `Db` instance and exposes the [`RegistryStore`] contract
/// over named trees. Values are serde_json for debuggability and so the
/// forward-compatibility side-maps survive round trips.
///
/// # Thread Safety
///
/// sled is inherently thread-safe — trees support concurrent reads and
/// atomic conditional writes. `RegistryDb` can be shared across threads
/// via `Arc<RegistryDb>` without external synchronization.
#[derive(Debug, Clone)]
pub struct RegistryDb {
    /// The underlying sled database handle.
    db: Db,
    /// One-time codes indexed by id.
    codes: Tree,
    /// Generation requests indexed by OTC id.
    generations: Tree,
    /// Payment requests indexed by OTC id.
    payments: Tree,
    /// Vouchers indexed by id.
    vouchers: Tree,
    /// Claimed `(scope, party, nonce)` triples.
    nonces: Tree,
    /// API keys indexed by bearer token.
    api_keys: Tree,
    /// Source directory indexed by id.
    sources: Tree,
}

impl RegistryDb {
    /// Open or create a database at the given filesystem path.
    ///
    /// If the directory doesn't exist, sled creates it. If the database
    /// already exists, it's opened and all existing data is available
    /// immediately.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that is cleaned up automatically when
    /// the `RegistryDb` is dropped.
    ///
    /// Ideal for unit tests — no filesystem side effects, no cleanup needed.
    pub fn open_temporary() -> StoreResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    /// Internal constructor: opens named trees from an existing sled `Db`.
    fn from_db(db: Db) -> StoreResult<Self> {
        let codes = db.open_tree("codes")?;
        let generations = db.open_tree("generations")?;
        let payments = db.open_tree("payments")?;
        let vouchers = db.open_tree("vouchers")?;
        let nonces = db.open_tree("nonces")?;
        let api_keys = db.open_tree("api_keys")?;
        let sources = db.open_tree("sources")?;

        Ok(Self {
            db,
            codes,
            generations,
            payments,
            vouchers,
            nonces,
            api_keys,
            sources,
        })
    }

    /// Force a flush of all pending writes to disk.
    ///
    /// sled buffers writes in memory for performance. This call blocks
    /// until all data is durable on the underlying storage device.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // -- Typed tree helpers -------------------------------------------------

    fn put<T: Serialize>(tree: &Tree, key: &[u8], value: &T) -> StoreResult<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        tree.insert(key, bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> StoreResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => {
                let value: T = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Replace `key` with `updated` iff the stored bytes equal the
    /// serialization of `expected`. `false` means a concurrent writer
    /// got there first (or the key is gone).
    fn cas<T: Serialize>(tree: &Tree, key: &[u8], expected: &T, updated: &T) -> StoreResult<bool> {
        let old =
            serde_json::to_vec(expected).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let new =
            serde_json::to_vec(updated).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(tree
            .compare_and_swap(key, Some(old), Some(new))?
            .is_ok())
    }

    fn nonce_key(scope: NonceScope, party: &str, nonce: &str) -> String {
        format!("{}:{}:{}", scope.prefix(), party, nonce)
    }
}

impl RegistryStore for RegistryDb {
    // -- One-time codes -----------------------------------------------------

    fn insert_code(&self, code: &OneTimeCode) -> StoreResult<()> {
        Self::put(&self.codes, code.id.as_bytes(), code)
    }

    fn load_code(&self, id: Uuid) -> StoreResult<Option<OneTimeCode>> {
        Self::get(&self.codes, id.as_bytes())
    }

    fn swap_code(&self, expected: &OneTimeCode, updated: &OneTimeCode) -> StoreResult<bool> {
        Self::cas(&self.codes, expected.id.as_bytes(), expected, updated)
    }

    // -- Nonce replay guard -------------------------------------------------

    fn claim_nonce(&self, scope: NonceScope, party: &str, nonce: &str) -> StoreResult<bool> {
        let key = Self::nonce_key(scope, party, nonce);
        let claimed_at = chrono::Utc::now().to_rfc3339();
        Ok(self
            .nonces
            .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(claimed_at.as_bytes()))?
            .is_ok())
    }

    // -- Generation requests ------------------------------------------------

    fn insert_generation(&self, record: &GenerationRequest) -> StoreResult<()> {
        Self::put(&self.generations, record.otc_id.as_bytes(), record)
    }

    fn load_generation(&self, otc_id: Uuid) -> StoreResult<Option<GenerationRequest>> {
        Self::get(&self.generations, otc_id.as_bytes())
    }

    fn swap_generation(
        &self,
        expected: &GenerationRequest,
        updated: &GenerationRequest,
    ) -> StoreResult<bool> {
        Self::cas(
            &self.generations,
            expected.otc_id.as_bytes(),
            expected,
            updated,
        )
    }

    // -- Payment requests ---------------------------------------------------

    fn insert_payment(&self, record: &PaymentRequest) -> StoreResult<()> {
        Self::put(&self.payments, record.otc_id.as_bytes(), record)
    }

    fn load_payment(&self, otc_id: Uuid) -> StoreResult<Option<PaymentRequest>> {
        Self::get(&self.payments, otc_id.as_bytes())
    }

    fn swap_payment(
        &self,
        expected: &PaymentRequest,
        updated: &PaymentRequest,
    ) -> StoreResult<bool> {
        Self::cas(&self.payments, expected.otc_id.as_bytes(), expected, updated)
    }

    // -- Vouchers -----------------------------------------------------------

    fn insert_voucher(&self, voucher: &Voucher) -> StoreResult<()> {
        Self::put(&self.vouchers, voucher.id.as_bytes(), voucher)
    }

    fn load_voucher(&self, id: Uuid) -> StoreResult<Option<Voucher>> {
        Self::get(&self.vouchers, id.as_bytes())
    }

    fn swap_voucher(&self, expected: &Voucher, updated: &Voucher) -> StoreResult<bool> {
        Self::cas(&self.vouchers, expected.id.as_bytes(), expected, updated)
    }

    fn vouchers(&self) -> StoreResult<Vec<Voucher>> {
        let mut all = Vec::new();
        for entry in self.vouchers.iter() {
            let (_key, bytes) = entry?;
            let voucher: Voucher = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            all.push(voucher);
        }
        Ok(all)
    }

    // -- Directory ----------------------------------------------------------

    fn insert_api_key(&self, key: &ApiKey) -> StoreResult<()> {
        Self::put(&self.api_keys, key.key.as_bytes(), key)
    }

    fn load_api_key(&self, key: &str) -> StoreResult<Option<ApiKey>> {
        Self::get(&self.api_keys, key.as_bytes())
    }

    fn insert_source(&self, source: &Source) -> StoreResult<()> {
        Self::put(&self.sources, source.id.as_bytes(), source)
    }

    fn load_source(&self, id: &str) -> StoreResult<Option<Source>> {
        Self::get(&self.sources, id.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryPolicy;
    use crate::otc::{CodeKind, CodeState};
    use crate::voucher::{GeoPoint, VoucherSpec};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    // -- Helpers ------------------------------------------------------------

    fn make_code() -> OneTimeCode {
        let now = Utc::now();
        OneTimeCode {
            id: Uuid::new_v4(),
            kind: CodeKind::Generation,
            password: "ab12".to_string(),
            created_at: now,
            expires_on: now + RegistryPolicy::default().generation_ttl,
            attempts: 0,
            state: CodeState::Created,
            verified_at: None,
            performed_at: None,
            extra: BTreeMap::new(),
        }
    }

    fn make_voucher() -> Voucher {
        let spec = VoucherSpec {
            aim_code: "H".to_string(),
            position: GeoPoint {
                latitude: 46.07,
                longitude: 11.12,
            },
            timestamp: None,
            count: 3,
        };
        spec.materialize(Uuid::new_v4(), Utc::now())
    }

    // -- Tests --------------------------------------------------------------

    #[test]
    fn open_temporary_database() {
        let db = RegistryDb::open_temporary().expect("should create temp db");
        assert!(db.vouchers().unwrap().is_empty());
    }

    #[test]
    fn open_persistent_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let code = make_code();
        {
            let db = RegistryDb::open(dir.path()).expect("should open db");
            db.insert_code(&code).unwrap();
            db.flush().unwrap();
        }

        let db = RegistryDb::open(dir.path()).expect("should reopen db");
        let reloaded = db.load_code(code.id).unwrap().expect("code should persist");
        assert_eq!(reloaded, code);
    }

    #[test]
    fn code_roundtrip() {
        let db = RegistryDb::open_temporary().unwrap();
        let code = make_code();
        db.insert_code(&code).unwrap();

        let loaded = db.load_code(code.id).unwrap().expect("code should exist");
        assert_eq!(loaded, code);
        assert!(db.load_code(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn swap_code_succeeds_against_current_value() {
        let db = RegistryDb::open_temporary().unwrap();
        let code = make_code();
        db.insert_code(&code).unwrap();

        let mut updated = code.clone();
        updated.state = CodeState::Performed;
        updated.performed_at = Some(Utc::now());
        assert!(db.swap_code(&code, &updated).unwrap());
        assert_eq!(db.load_code(code.id).unwrap().unwrap(), updated);
    }

    #[test]
    fn swap_code_fails_against_stale_expectation() {
        let db = RegistryDb::open_temporary().unwrap();
        let code = make_code();
        db.insert_code(&code).unwrap();

        let mut first = code.clone();
        first.attempts = 1;
        assert!(db.swap_code(&code, &first).unwrap());

        // The original snapshot is stale now.
        let mut second = code.clone();
        second.state = CodeState::Void;
        assert!(!db.swap_code(&code, &second).unwrap());
        assert_eq!(db.load_code(code.id).unwrap().unwrap(), first);
    }

    #[test]
    fn reloaded_record_is_a_valid_swap_expectation() {
        // Re-serializing a loaded record must reproduce the stored
        // bytes, otherwise every retry loop would spin forever.
        let db = RegistryDb::open_temporary().unwrap();
        let code = make_code();
        db.insert_code(&code).unwrap();

        let loaded = db.load_code(code.id).unwrap().unwrap();
        let mut updated = loaded.clone();
        updated.attempts = 2;
        assert!(db.swap_code(&loaded, &updated).unwrap());
    }

    #[test]
    fn unknown_fields_survive_the_roundtrip() {
        let db = RegistryDb::open_temporary().unwrap();
        let mut code = make_code();
        code.extra
            .insert("issuerNote".to_string(), serde_json::json!("festival"));
        db.insert_code(&code).unwrap();

        let loaded = db.load_code(code.id).unwrap().unwrap();
        assert_eq!(loaded.extra["issuerNote"], serde_json::json!("festival"));
        assert_eq!(loaded, code);
    }

    #[test]
    fn claim_nonce_first_claim_wins() {
        let db = RegistryDb::open_temporary().unwrap();
        assert!(db
            .claim_nonce(NonceScope::Generation, "source-1", "n-1")
            .unwrap());
        assert!(!db
            .claim_nonce(NonceScope::Generation, "source-1", "n-1")
            .unwrap());
    }

    #[test]
    fn nonce_scopes_and_parties_are_independent() {
        let db = RegistryDb::open_temporary().unwrap();
        assert!(db
            .claim_nonce(NonceScope::Generation, "source-1", "n-1")
            .unwrap());
        // Same nonce, different scope.
        assert!(db.claim_nonce(NonceScope::Payment, "source-1", "n-1").unwrap());
        // Same nonce and scope, different party.
        assert!(db
            .claim_nonce(NonceScope::Generation, "source-2", "n-1")
            .unwrap());
    }

    #[test]
    fn concurrent_nonce_claims_have_one_winner() {
        let db = Arc::new(RegistryDb::open_temporary().unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    db.claim_nonce(NonceScope::Payment, "pos-1", "n-contested")
                        .unwrap()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("claimant thread should not panic"))
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn voucher_scan_returns_everything() {
        let db = RegistryDb::open_temporary().unwrap();
        let a = make_voucher();
        let b = make_voucher();
        db.insert_voucher(&a).unwrap();
        db.insert_voucher(&b).unwrap();

        let all = db.vouchers().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&a));
        assert!(all.contains(&b));
    }

    #[test]
    fn voucher_swap_decrements_count() {
        let db = RegistryDb::open_temporary().unwrap();
        let voucher = make_voucher();
        db.insert_voucher(&voucher).unwrap();

        let mut spent = voucher.clone();
        spent.count -= 1;
        assert!(db.swap_voucher(&voucher, &spent).unwrap());
        assert_eq!(db.load_voucher(voucher.id).unwrap().unwrap().count, 2);

        // Replaying the same spend against the stale snapshot fails.
        assert!(!db.swap_voucher(&voucher, &spent).unwrap());
    }

    #[test]
    fn directory_roundtrip() {
        let db = RegistryDb::open_temporary().unwrap();
        let source = Source {
            id: "source-1".to_string(),
            name: "Comune di Prova".to_string(),
            deleted: false,
            extra: BTreeMap::new(),
        };
        let key = ApiKey {
            key: "key-abc".to_string(),
            controlled_entity_id: source.id.clone(),
            kind: crate::auth::ApiKeyKind::SourceAdministrator,
            expired: false,
            extra: BTreeMap::new(),
        };

        db.insert_source(&source).unwrap();
        db.insert_api_key(&key).unwrap();

        assert_eq!(db.load_source("source-1").unwrap().unwrap(), source);
        assert_eq!(db.load_api_key("key-abc").unwrap().unwrap(), key);
        assert!(db.load_api_key("missing").unwrap().is_none());
    }

    #[test]
    fn concurrent_reads_do_not_block() {
        let db = Arc::new(RegistryDb::open_temporary().unwrap());
        let mut ids = Vec::new();
        for _ in 0..10 {
            let voucher = make_voucher();
            ids.push(voucher.id);
            db.insert_voucher(&voucher).unwrap();
        }
        let ids = Arc::new(ids);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = Arc::clone(&db);
                let ids = Arc::clone(&ids);
                thread::spawn(move || {
                    for id in ids.iter() {
                        assert!(db.load_voucher(*id).unwrap().is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("reader thread should not panic");
        }
    }
}
