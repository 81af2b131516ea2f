// Copyright (c) 2026 WOM Platform. MIT License.
// See LICENSE for details.

//! # WOM Registry — Protocol Core
//!
//! The registry side of the Worth One Minute voucher protocol: the
//! component that mints one-time codes, materializes vouchers, and
//! redeems them exactly once, no matter how rudely concurrent the
//! callers are.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of
//! the registry:
//!
//! - **crypto** — The RSA-OAEP envelope and the AES-GCM session path.
//! - **otc** — One-time codes: mint, verify, and the state machine.
//! - **voucher** — Vouchers, specs, and eligibility filters.
//! - **generation** — The Instrument-facing issuance flow.
//! - **payment** — The POS-facing redemption flow.
//! - **auth** — API key authentication for Source administrators.
//! - **courier** — The out-of-band OTC delivery seam.
//! - **wire** — The JSON envelope shapes both flows speak.
//! - **storage** — The persistence contract and its sled engine.
//! - **config** — Protocol constants and the tunable policy knobs.
//!
//! ## Design Philosophy
//!
//! 1. Every state transition is an atomic conditional write. Losing a
//!    race is normal; double-spending is not.
//! 2. Secrets cross the wire exactly once, inside a sealed payload.
//! 3. Wrong password and unknown code look identical from outside.
//! 4. If it touches redemption, it has tests. Plural.

pub mod auth;
pub mod config;
pub mod courier;
pub mod crypto;
pub mod error;
pub mod generation;
pub mod otc;
pub mod payment;
pub mod storage;
pub mod voucher;
pub mod wire;

pub use config::RegistryPolicy;
pub use error::{CryptoError, ProtocolError, StoreError};
pub use generation::GenerationProtocol;
pub use otc::{CodeKind, CodeState, CodeStatus, OtcRegistry};
pub use payment::PaymentProtocol;
pub use storage::{RegistryDb, RegistryStore};
pub use voucher::{Voucher, VoucherFilter, VoucherSpec};
