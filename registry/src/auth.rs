//! # API Key Authority
//!
//! Long-lived API keys authenticate a Source's administrative identity
//! on source-scoped endpoints. This is the least clever component in
//! the crate: a key maps to exactly one Source, grants
//! exactly the `User` role, and anything irregular — expired, wrong
//! kind, orphaned — authenticates to nothing.
//!
//! An *absent* credential is not a failure: the authority reports
//! [`AuthOutcome::NoCredentials`] so the surrounding HTTP layer can fall
//! through to its other authentication schemes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreResult;
use crate::storage::RegistryStore;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What a key is allowed to act as. Only one kind exists today; the
/// enum stays so stored records with future kinds deserialize once this
/// build learns about them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApiKeyKind {
    /// Administrative access to a single Source.
    SourceAdministrator,
}

/// A persisted API key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    /// The opaque bearer token itself. Also the storage key.
    pub key: String,
    /// The Source this key controls.
    pub controlled_entity_id: String,
    /// What the key acts as.
    pub kind: ApiKeyKind,
    /// Soft-revocation flag. Expired keys authenticate to nothing.
    pub expired: bool,
    /// Forward-compatibility side-map for unknown fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A voucher-issuing party in the directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Source identity.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Soft-deletion flag. Deleted Sources cannot be authenticated to.
    pub deleted: bool,
    /// Forward-compatibility side-map for unknown fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// The single role this authority can grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Ordinary authenticated user, scoped to one Source.
    User,
}

/// An authenticated identity: exactly one Source, fixed role. This
/// authority never grants elevated or multi-entity privileges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// The single Source the caller may act on.
    pub source_id: String,
    /// Always [`Role::User`].
    pub role: Role,
}

/// Why a presented key was rejected. Internal detail — the HTTP layer
/// answers a bare 403 regardless.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    /// No key by that value exists.
    UnknownKey,
    /// The key exists but has been expired.
    Expired,
    /// The key's kind grants nothing on this surface.
    UnsupportedKind,
    /// The controlled Source is gone or soft-deleted.
    SourceMissing,
}

/// Result of an authentication attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthOutcome {
    /// The key checked out; here is who the caller is.
    Granted(Principal),
    /// No credential was presented — fall through to other schemes.
    NoCredentials,
    /// A credential was presented and rejected.
    Denied(DenyReason),
}

// ---------------------------------------------------------------------------
// Authority
// ---------------------------------------------------------------------------

/// Validates API keys against the store.
#[derive(Clone)]
pub struct ApiKeyAuthority {
    store: Arc<dyn RegistryStore>,
}

impl ApiKeyAuthority {
    /// Build the authority over a store.
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    /// Authenticate an `X-WOM-ApiKey` header value.
    ///
    /// `None` or a blank header is [`AuthOutcome::NoCredentials`]; every
    /// other irregularity is a [`AuthOutcome::Denied`] with the reason.
    /// Storage failures propagate so the caller can answer "try again
    /// later" instead of a misleading 403.
    pub fn authenticate(&self, header: Option<&str>) -> StoreResult<AuthOutcome> {
        let Some(presented) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(AuthOutcome::NoCredentials);
        };

        let Some(api_key) = self.store.load_api_key(presented)? else {
            warn!("unknown api key presented");
            return Ok(AuthOutcome::Denied(DenyReason::UnknownKey));
        };

        if api_key.expired {
            warn!(source = %api_key.controlled_entity_id, "expired api key presented");
            return Ok(AuthOutcome::Denied(DenyReason::Expired));
        }

        match api_key.kind {
            ApiKeyKind::SourceAdministrator => {}
        }

        let source = self.store.load_source(&api_key.controlled_entity_id)?;
        match source {
            Some(source) if !source.deleted => Ok(AuthOutcome::Granted(Principal {
                source_id: source.id,
                role: Role::User,
            })),
            _ => {
                warn!(source = %api_key.controlled_entity_id, "api key points at missing or deleted source");
                Ok(AuthOutcome::Denied(DenyReason::SourceMissing))
            }
        }
    }
}
