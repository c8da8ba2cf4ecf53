/// Change notifications for the presentation layer
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What changed in the derived views; readers re-query the core on receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Messages between the viewer and `peer_id` changed
    ConversationChanged { peer_id: String },
    /// Every view was emptied (viewer change, feed failure)
    ViewReset,
    /// The active conversation target changed
    PeerSelected { peer_id: Option<String> },
    /// A feed was re-established after a failure
    Resubscribed { conversation: bool },
}

impl SyncEvent {
    /// Wire form for a presentation layer across a process boundary
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}
