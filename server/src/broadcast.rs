//! Push channel fan-out.
//!
//! Events are serialized once and handed to a tokio broadcast channel; every
//! connected WebSocket observer holds its own receiver.

use relay_common::PushEvent;
use tokio::sync::broadcast;
use tracing::{debug, trace};

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<String>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Best effort: with nobody connected the event is simply dropped.
    pub fn publish(&self, event: &PushEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                debug!(error = %e, event = event.name(), "Failed to serialize push event");
                return;
            }
        };

        match self.tx.send(json) {
            Ok(n) => trace!(receivers = n, event = event.name(), "Push event sent"),
            Err(_) => trace!(event = event.name(), "No push observers connected"),
        }
    }
}
