//! The transport seam.
//!
//! The real carrier (websocket, ZMQ, stdio) lives outside the core; the
//! replicator only needs somewhere to hand outbound frames. Delivery is
//! fire-and-forget — ordering and reliability are the channel's concern.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use tallyproto::SyncFrame;

/// Outbound side of a sync channel.
pub trait SyncLink: Send + Sync {
    fn publish(&self, frame: SyncFrame);
}

/// Discards every frame. For standalone replicators and tests that only
/// exercise local behavior.
pub struct NullLink;

impl SyncLink for NullLink {
    fn publish(&self, _frame: SyncFrame) {}
}

/// A link backed by an in-process channel. The receiver half is what a
/// transport task (or a test harness pumping frames into the peer) drains.
pub struct ChannelLink {
    tx: Mutex<Sender<SyncFrame>>,
}

impl ChannelLink {
    pub fn pair() -> (Arc<ChannelLink>, Receiver<SyncFrame>) {
        let (tx, rx) = channel();
        (Arc::new(ChannelLink { tx: Mutex::new(tx) }), rx)
    }
}

impl SyncLink for ChannelLink {
    fn publish(&self, frame: SyncFrame) {
        let _ = self.tx.lock().unwrap().send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_link_delivers_in_order() {
        let (link, rx) = ChannelLink::pair();
        for revision in 1..=3 {
            link.publish(SyncFrame::Broadcast {
                namespace: "bundle".to_string(),
                name: "state".to_string(),
                revision,
                operations: vec![],
            });
        }
        let revisions: Vec<u64> = rx
            .try_iter()
            .map(|frame| match frame {
                SyncFrame::Broadcast { revision, .. } => revision,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }
}
