pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod fanout;
pub mod ids;
pub mod outbox;
pub mod policy;
pub mod prekeys;
pub mod reconcile;
pub mod registration;
pub mod sender;
pub mod session;
pub mod storage;
pub mod sync;
pub mod time;
pub mod transport;

use crate::config::CoreConfig;
use crate::crypto::ratchet::StepRatchet;
use crate::error::CoreError;
use crate::event::{EventBus, EventReceiver};
use crate::fanout::FanoutEncoder;
use crate::ids::{DeviceId, UserId};
use crate::outbox::Outbox;
use crate::policy::Policy;
use crate::prekeys::{PreKeyFetcher, RecipientMap};
use crate::registration::SharedDeviceKeys;
use crate::sender::{MessageSender, SendSummary};
use crate::session::SessionStore;
use crate::storage::KeyValueStore;
use crate::sync::{SyncEngine, SyncState};
use crate::transport::{ConversationSink, EventStreamApi, MessageApi, PreKeyApi, SlowSyncApi};
use parley_api::types::ConversationId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Composition root. Owns the engine components and wires them to the
/// caller-supplied collaborators; no ambient globals.
#[derive(Clone)]
pub struct Core {
    config: CoreConfig,
    policy: Policy,
    store: Arc<dyn KeyValueStore>,
    device_keys: SharedDeviceKeys,
    prekey_api: Arc<dyn PreKeyApi>,
    sessions: Arc<SessionStore>,
    sender: Arc<MessageSender>,
    sync: Arc<SyncEngine>,
    events: EventBus,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub async fn init(
        config: CoreConfig,
        policy: Policy,
        store: Arc<dyn KeyValueStore>,
        message_api: Arc<dyn MessageApi>,
        prekey_api: Arc<dyn PreKeyApi>,
        stream_api: Arc<dyn EventStreamApi>,
        slow_sync_api: Arc<dyn SlowSyncApi>,
        sink: Arc<dyn ConversationSink>,
    ) -> Result<Self, CoreError> {
        let keys =
            registration::load_or_register(store.as_ref(), prekey_api.as_ref(), &config).await?;
        let device_keys: SharedDeviceKeys = Arc::new(Mutex::new(keys));
        let sessions = Arc::new(SessionStore::new(
            Arc::new(StepRatchet::new()),
            store.clone(),
            device_keys.clone(),
        ));
        let fetcher = PreKeyFetcher::new(prekey_api.clone(), config.federation_aware);
        let encoder = FanoutEncoder::new(
            sessions.clone(),
            fetcher,
            config.self_user.clone(),
            config.self_device.clone(),
        );
        let outbox = Outbox::new(store.clone());
        let sender = Arc::new(MessageSender::new(
            encoder,
            message_api,
            outbox,
            policy.clone(),
        ));
        let events = EventBus::new(config.event_buffer);
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            stream_api,
            slow_sync_api,
            sessions.clone(),
            sink,
            events.clone(),
            policy.clone(),
        ));
        let core = Self {
            config,
            policy,
            store,
            device_keys,
            prekey_api,
            sessions,
            sender,
            sync,
            events,
        };
        if core.config.auto_flush_outbox && core.policy.outbox_batch_send > 0 {
            core.start_outbox_worker();
        }
        Ok(core)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        plaintext: &[u8],
        recipients: &RecipientMap,
    ) -> Result<SendSummary, CoreError> {
        self.sender.send(conversation, plaintext, recipients).await
    }

    /// Replays envelopes that were durably queued but never acknowledged,
    /// byte-identical. Called once on restart.
    pub async fn resume_pending_sends(&self) -> Result<usize, CoreError> {
        self.sender.flush_pending().await
    }

    pub fn start_sync(&self) {
        self.sync.start();
    }

    pub fn sync_engine(&self) -> Arc<SyncEngine> {
        self.sync.clone()
    }

    pub async fn sync_state(&self) -> SyncState {
        self.sync.state().await
    }

    pub fn session_store(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    /// Explicit device removal; the pair needs a fresh handshake afterwards.
    pub async fn drop_device(&self, user: &UserId, device: &DeviceId) -> Result<(), CoreError> {
        self.sessions.drop_session(user, device).await
    }

    pub async fn refill_prekeys(&self) -> Result<u16, CoreError> {
        let mut keys = self.device_keys.lock().await;
        registration::refill_prekeys(
            self.store.as_ref(),
            self.prekey_api.as_ref(),
            &mut keys,
            &self.config,
            &self.policy,
        )
        .await
    }

    fn start_outbox_worker(&self) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(250));
            loop {
                ticker.tick().await;
                let _ = sender.flush_pending().await;
            }
        });
    }
}

#[cfg(test)]
mod tests;
