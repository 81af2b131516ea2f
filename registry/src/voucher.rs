//! # Vouchers & Filters
//!
//! A voucher is the unit of value the registry issues and redeems. Each
//! one carries the context it was earned in — an *aim* (social purpose
//! code), a position, a timestamp — and a redemption `secret` the Pocket
//! presents at payment time. Block-issued vouchers represent multiple
//! identical units through `count`/`initial_count`; redemption decrements
//! `count` instead of deleting the record, so the audit trail survives.
//!
//! [`VoucherFilter`] is the matching predicate a payment request pins
//! down at registration time: aim-code prefix, geographic bounding box,
//! maximum age. A confirmation may only spend vouchers the filter
//! accepts.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Geography
// ---------------------------------------------------------------------------

/// A WGS84 point. No altitude — vouchers are earned on the ground.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, positive north.
    pub latitude: f64,
    /// Longitude in degrees, positive east.
    pub longitude: f64,
}

/// An axis-aligned bounding box, corners given as the map reads them:
/// `left_top` is the north-west corner, `right_bottom` the south-east.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoBounds {
    /// North-west corner.
    pub left_top: GeoPoint,
    /// South-east corner.
    pub right_bottom: GeoPoint,
}

impl GeoBounds {
    /// Whether `point` lies inside the box (edges inclusive).
    ///
    /// Boxes spanning the antimeridian are not supported; nobody has
    /// issued a voucher in the middle of the Pacific yet.
    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.latitude <= self.left_top.latitude
            && point.latitude >= self.right_bottom.latitude
            && point.longitude >= self.left_top.longitude
            && point.longitude <= self.right_bottom.longitude
    }
}

// ---------------------------------------------------------------------------
// Voucher
// ---------------------------------------------------------------------------

/// Length of the random redemption secret, in bytes (hex-encoded on the
/// wire, so 32 characters).
const SECRET_LENGTH: usize = 16;

/// A materialized voucher.
///
/// Created in a batch when its owning generation request is confirmed,
/// never regenerated or resized afterward. `generation_request_id` is a
/// back-reference for auditing only — the request does not own the
/// voucher once it exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    /// Voucher identity.
    pub id: Uuid,
    /// Opaque redemption token the Pocket presents at payment.
    pub secret: String,
    /// Aim (social purpose) code, e.g. `"H"` or `"E2"`.
    pub aim_code: String,
    /// Where the voucher was earned.
    pub position: GeoPoint,
    /// When the voucher was earned.
    pub timestamp: DateTime<Utc>,
    /// Units remaining. Zero means fully redeemed.
    pub count: u64,
    /// Units issued originally. Never changes.
    pub initial_count: u64,
    /// The generation request this voucher was materialized from.
    pub generation_request_id: Uuid,
    /// Forward-compatibility bag: fields this build does not know are
    /// collected here on read and written back untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// What a Source declares at registration time: the shape of a voucher
/// that will exist once the request is confirmed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherSpec {
    /// Aim code for the vouchers in this spec.
    pub aim_code: String,
    /// Position the vouchers are earned at.
    pub position: GeoPoint,
    /// Earn timestamp; `None` means "when confirmed".
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Units this spec materializes as a single block voucher.
    #[serde(default = "default_count")]
    pub count: u64,
}

fn default_count() -> u64 {
    1
}

impl VoucherSpec {
    /// Materialize this spec into a voucher owned by `generation_request_id`.
    pub fn materialize(&self, generation_request_id: Uuid, now: DateTime<Utc>) -> Voucher {
        let mut secret = [0u8; SECRET_LENGTH];
        OsRng.fill_bytes(&mut secret);

        Voucher {
            id: Uuid::new_v4(),
            secret: hex::encode(secret),
            aim_code: self.aim_code.clone(),
            position: self.position,
            timestamp: self.timestamp.unwrap_or(now),
            count: self.count,
            initial_count: self.count,
            generation_request_id,
            extra: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// The matching predicate a payment request stores verbatim at
/// registration and applies at confirmation.
///
/// All clauses are optional and conjunctive: an empty filter accepts
/// every voucher.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherFilter {
    /// Aim-code prefix: `"H"` matches `"H"` and `"H3"`, not `"E"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aim: Option<String>,
    /// Geographic bounding box the voucher position must fall in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<GeoBounds>,
    /// Maximum voucher age in days, measured at confirmation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<i64>,
}

impl VoucherFilter {
    /// Whether `voucher` satisfies every clause of this filter at `now`.
    ///
    /// Does not look at `count` — exhaustion is the caller's concern,
    /// eligibility is ours.
    pub fn matches(&self, voucher: &Voucher, now: DateTime<Utc>) -> bool {
        if let Some(aim) = &self.aim {
            if !voucher.aim_code.starts_with(aim.as_str()) {
                return false;
            }
        }

        if let Some(bounds) = &self.bounds {
            if !bounds.contains(&voucher.position) {
                return false;
            }
        }

        if let Some(max_age) = self.max_age_days {
            let cutoff = now - Duration::days(max_age);
            if voucher.timestamp < cutoff {
                return false;
            }
        }

        true
    }
}
