use crate::ids::{ConversationId, DeviceId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Identifier of the last event fully and durably applied. Advances
/// monotonically; only a full-resync reset may replace it wholesale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationCursor(pub u64);

/// A decrypted inbound message as handed to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingMessage {
    pub event_id: u64,
    pub conversation: ConversationId,
    pub sender: UserId,
    pub sender_device: DeviceId,
    pub plaintext: Vec<u8>,
    pub timestamp: u64,
}

pub type EventReceiver = broadcast::Receiver<IncomingMessage>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IncomingMessage>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, message: IncomingMessage) {
        let _ = self.tx.send(message);
    }
}
