//! # OTC Courier
//!
//! Freshly minted OTC pairs reach their recipients out-of-band — email,
//! mostly. Actual delivery (templating, SMTP, retry queues) is someone
//! else's problem; the protocol core only needs a place to hand the
//! pair off. [`Courier`] is that seam: the core calls `schedule`, the
//! hosting application drains deliveries however it likes.
//!
//! [`ChannelCourier`] is the reference implementation over a plain
//! channel, good enough for embedding and for tests. `schedule` never
//! blocks and never fails the protocol operation that triggered it — a
//! voucher issuance does not roll back because the mail queue hiccuped.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::otc::CodeKind;

/// One OTC pair headed out-of-band.
#[derive(Clone, Debug, PartialEq)]
pub struct OtcDelivery {
    /// The code identity.
    pub otc: Uuid,
    /// The code password.
    pub password: String,
    /// Who the pair should reach (a Source or POS identifier; the
    /// hosting application resolves it to an address).
    pub recipient: String,
    /// Which flow minted the code.
    pub kind: CodeKind,
}

/// The delivery seam the protocol core schedules on.
pub trait Courier: Send + Sync {
    /// Queue a delivery. Must not block and must not fail the caller.
    fn schedule(&self, delivery: OtcDelivery);
}

/// Channel-backed courier: deliveries land on an [`mpsc`] receiver the
/// hosting application drains.
///
/// [`mpsc`]: std::sync::mpsc
pub struct ChannelCourier {
    tx: Mutex<Sender<OtcDelivery>>,
}

impl ChannelCourier {
    /// Build a courier and the receiver its deliveries arrive on.
    pub fn new() -> (Arc<Self>, Receiver<OtcDelivery>) {
        let (tx, rx) = channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }
}

impl Courier for ChannelCourier {
    fn schedule(&self, delivery: OtcDelivery) {
        debug!(otc = %delivery.otc, recipient = %delivery.recipient, "otc delivery scheduled");
        // A closed receiver means the host stopped draining; dropping
        // the delivery is the contract, not an error.
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(delivery);
        }
    }
}

/// Drain every pending delivery through `handler`. Returns how many
/// were processed. Does not wait for new ones.
pub fn process<F: FnMut(OtcDelivery)>(rx: &Receiver<OtcDelivery>, mut handler: F) -> usize {
    let mut processed = 0;
    while let Ok(delivery) = rx.try_recv() {
        handler(delivery);
        processed += 1;
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(n: u32) -> OtcDelivery {
        OtcDelivery {
            otc: Uuid::new_v4(),
            password: format!("pw{n}"),
            recipient: "source-1".to_string(),
            kind: CodeKind::Generation,
        }
    }

    #[test]
    fn scheduled_deliveries_arrive_in_order() {
        let (courier, rx) = ChannelCourier::new();
        courier.schedule(delivery(1));
        courier.schedule(delivery(2));

        let mut passwords = Vec::new();
        let processed = process(&rx, |d| passwords.push(d.password));
        assert_eq!(processed, 2);
        assert_eq!(passwords, vec!["pw1", "pw2"]);
    }

    #[test]
    fn schedule_survives_a_dropped_receiver() {
        let (courier, rx) = ChannelCourier::new();
        drop(rx);
        // Must not panic or block.
        courier.schedule(delivery(1));
    }

    #[test]
    fn process_on_empty_channel_is_zero() {
        let (_courier, rx) = ChannelCourier::new();
        assert_eq!(process(&rx, |_| panic!("nothing to process")), 0);
    }
}
