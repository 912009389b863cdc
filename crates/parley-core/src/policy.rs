use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub outbox_batch_send: usize,
    pub max_retry_window_secs: u64,
    pub prekey_refill_threshold: u16,
    pub slow_sync_retry_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            outbox_batch_send: 8,
            max_retry_window_secs: 86_400,
            prekey_refill_threshold: 20,
            slow_sync_retry_ms: 5_000,
        }
    }
}
