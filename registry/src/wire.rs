//! # Wire Shapes
//!
//! The JSON envelope format used uniformly across the generation and
//! payment flows, and the typed content objects that live inside the
//! encrypted payloads. The HTTP layer deals only in
//! [`RegistryRequest`]/[`RegistryResponse`]; everything sensitive rides
//! inside `payload` as an envelope ciphertext.
//!
//! Request contents carry the caller's `session_key` so the registry
//! can seal the matching response to it — the one-directional hybrid
//! scheme that spares both sides a persistent shared secret. The nonce
//! appears both in clear (for routing-layer replay checks) and inside
//! the ciphertext; the service layer must reject requests where the two
//! disagree, otherwise the clear half could be swapped under a replayed
//! ciphertext.
//!
//! Every response shape is a plain struct with one fixed layout per
//! endpoint. No hierarchies, no dynamic typing.

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{self, SessionKey};
use crate::error::CryptoError;
use crate::otc::CodeStatus;
use crate::payment::AckUrls;
use crate::voucher::{Voucher, VoucherFilter, VoucherSpec};

// ---------------------------------------------------------------------------
// Outer envelope
// ---------------------------------------------------------------------------

/// The outer request every protocol endpoint accepts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRequest {
    /// Routing identity in the clear — a Source or POS id, number or
    /// string depending on the deployment's id scheme.
    pub clear_id: serde_json::Value,
    /// Anti-replay nonce in the clear; must match the one inside the
    /// encrypted content.
    pub nonce: String,
    /// Base64 envelope ciphertext addressed to the registry key.
    pub payload: String,
}

/// The outer response: nothing but a sealed payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryResponse {
    /// Base64 ciphertext sealed to the caller's session key (or, for
    /// asynchronous flows, the caller's public key).
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Decrypted request contents
// ---------------------------------------------------------------------------

/// Content of a generation registration payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRegisterContent {
    /// Must equal the clear-text nonce of the outer request.
    pub nonce: String,
    /// The voucher batch to declare.
    pub vouchers: Vec<VoucherSpec>,
    /// Session key for sealing the response.
    pub session_key: String,
}

/// Content of a payment registration payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRegisterContent {
    /// Must equal the clear-text nonce of the outer request.
    pub nonce: String,
    /// Voucher units the payment demands.
    pub amount: u64,
    /// Optional eligibility filter, stored verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<VoucherFilter>,
    /// Acknowledgment URLs for Pocket and POS.
    pub ack_urls: AckUrls,
    /// Whether the offer accepts repeated confirmations.
    #[serde(default)]
    pub persistent: bool,
    /// Session key for sealing the response.
    pub session_key: String,
}

/// Content of a confirm payload — shared by both flows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmContent {
    /// The code being confirmed.
    pub otc: Uuid,
    /// The code password.
    pub password: String,
    /// Session key for sealing the response.
    pub session_key: String,
}

/// Content of a status probe payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusContent {
    /// The code being probed.
    pub otc: Uuid,
    /// Session key for sealing the response.
    pub session_key: String,
}

// ---------------------------------------------------------------------------
// Response contents
// ---------------------------------------------------------------------------

/// Registration succeeded; here is the minted pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtcIssuedContent {
    /// The code identity.
    pub otc: Uuid,
    /// The code password, for out-of-band relay.
    pub password: String,
}

/// A generation confirm succeeded; the materialized batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherBatchContent {
    /// The vouchers, secrets included — this is the one time they cross
    /// the wire in full.
    pub vouchers: Vec<Voucher>,
}

/// A payment confirm succeeded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfirmedContent {
    /// Where to send the Pocket next.
    pub ack_url: String,
    /// The redeemed vouchers, `count` = units taken from each.
    pub vouchers: Vec<Voucher>,
}

/// Answer to a status probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponseContent {
    /// The code probed.
    pub otc: Uuid,
    /// Its current standing.
    pub status: CodeStatus,
}

// ---------------------------------------------------------------------------
// Glue
// ---------------------------------------------------------------------------

/// Open a request's payload with the registry's private key.
pub fn open_request<T: DeserializeOwned>(
    request: &RegistryRequest,
    private_key: &RsaPrivateKey,
) -> Result<T, CryptoError> {
    crypto::decrypt(&request.payload, private_key)
}

/// Seal a response to the caller's session key.
pub fn seal_response<T: Serialize>(
    content: &T,
    session_key: &SessionKey,
) -> Result<RegistryResponse, CryptoError> {
    Ok(RegistryResponse {
        payload: crypto::seal_session(content, session_key)?,
    })
}

/// Seal a response to a public key — the asynchronous-flow variant
/// where no session key accompanied the request. Subject to the
/// asymmetric size limit; bulky contents must go through
/// [`seal_response`].
pub fn seal_response_for_key<T: Serialize>(
    content: &T,
    recipient: &RsaPublicKey,
) -> Result<RegistryResponse, CryptoError> {
    Ok(RegistryResponse {
        payload: crypto::encrypt(content, recipient)?,
    })
}
