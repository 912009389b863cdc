use crate::error::CoreError;
use crate::policy::Policy;
use crate::storage::KeyValueStore;
use crate::time::now_ms;
use parley_api::types::{ConversationId, NewOtrMessage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const OUTBOX_PREFIX: &str = "outbox:";

/// One durably queued send: the already-built envelope and where it goes.
/// Queued before the first network attempt so a crash mid-send resumes the
/// exact same bytes instead of re-encrypting.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxItem {
    pub id: Uuid,
    pub conversation: ConversationId,
    pub message: NewOtrMessage,
    pub created_at_ms: u64,
    pub next_retry_ms: u64,
    pub tries: u32,
}

impl OutboxItem {
    pub fn new(conversation: ConversationId, message: NewOtrMessage) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            conversation,
            message,
            created_at_ms: now,
            next_retry_ms: now,
            tries: 0,
        }
    }
}

#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn KeyValueStore>,
}

impl Outbox {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn put(&self, item: &OutboxItem) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(item).map_err(|_| CoreError::Storage)?;
        self.store.put(&Self::item_key(&item.id), &bytes).await
    }

    pub async fn mark_sent(&self, id: &Uuid) -> Result<(), CoreError> {
        self.store.delete(&Self::item_key(id)).await
    }

    pub async fn load_all_due(&self, now: u64, limit: usize) -> Result<Vec<OutboxItem>, CoreError> {
        let mut due = Vec::new();
        for key in self.store.keys_with_prefix(OUTBOX_PREFIX).await? {
            if due.len() >= limit {
                break;
            }
            if let Some(bytes) = self.store.get(&key).await? {
                if let Ok(item) = serde_json::from_slice::<OutboxItem>(&bytes) {
                    if item.next_retry_ms <= now {
                        due.push(item);
                    }
                }
            }
        }
        due.sort_by_key(|item| item.created_at_ms);
        Ok(due)
    }

    pub async fn bump_retry(&self, id: &Uuid, policy: &Policy) -> Result<(), CoreError> {
        let key = Self::item_key(id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(());
        };
        let mut item: OutboxItem =
            serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)?;
        item.tries = item.tries.saturating_add(1);
        let factor = 1u64 << (item.tries.saturating_sub(1).min(16));
        let base = policy.backoff_initial_ms.saturating_mul(factor);
        let capped = base.min(policy.backoff_max_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2 + 1);
        item.next_retry_ms = now_ms().saturating_add(capped + jitter);
        let updated = serde_json::to_vec(&item).map_err(|_| CoreError::Storage)?;
        self.store.put(&key, &updated).await
    }

    fn item_key(id: &Uuid) -> String {
        format!("{}{}", OUTBOX_PREFIX, id)
    }
}
