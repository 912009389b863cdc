use crate::ids::{DeviceId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub self_user: UserId,
    pub self_device: DeviceId,
    pub device_label: Option<String>,
    /// Qualified prekey routes when true; the legacy unqualified route
    /// otherwise. Owned by the process, not probed at runtime.
    pub federation_aware: bool,
    pub prekey_batch: u16,
    pub last_resort_prekey_id: u16,
    pub event_buffer: usize,
    /// Background resubmission of queued envelopes. Off means the caller
    /// drives retries via `resume_pending_sends`.
    pub auto_flush_outbox: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            self_user: UserId::new("self"),
            self_device: DeviceId::new("self-device"),
            device_label: None,
            federation_aware: true,
            prekey_batch: 100,
            last_resort_prekey_id: u16::MAX,
            event_buffer: 256,
            auto_flush_outbox: true,
        }
    }
}
