//! # Cryptographic Boundary
//!
//! Everything that crosses in or out of the registry passes through this
//! module. Two layers:
//!
//! - [`keys`] — RSA registry keypairs and client-supplied symmetric
//!   session keys.
//! - [`envelope`] — the encrypt/decrypt wrapper itself: RSA-OAEP for
//!   inbound requests addressed to the registry, AES-256-GCM for
//!   responses sealed to the caller's session key.
//!
//! Every function here is a pure transform over its inputs. No shared
//! mutable state, safe to call from any number of concurrent requests.

pub mod envelope;
pub mod keys;

pub use envelope::{decrypt, encrypt, open_session, seal_session};
pub use keys::{RegistryKeyPair, SessionKey};
