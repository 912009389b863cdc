use crate::error::CoreError;
use crate::event::{EventBus, IncomingMessage, NotificationCursor};
use crate::ids::{ConversationId, DeviceId, UserId};
use crate::policy::Policy;
use crate::session::SessionStore;
use crate::storage::KeyValueStore;
use crate::transport::{ConversationSink, EventStreamApi, SlowSyncApi};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parley_api::types::{EventDto, EventKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const CURSOR_KEY: &str = "sync:cursor";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    NotStarted,
    SlowSyncing,
    Live,
    Degraded,
}

/// Keeps the local view of server-side events consistent: an incremental
/// live stream when the cursor is valid, full resynchronization when it is
/// not. The cursor advances strictly after an event's side effects are
/// durable, never before.
pub struct SyncEngine {
    store: Arc<dyn KeyValueStore>,
    stream: Arc<dyn EventStreamApi>,
    slow: Arc<dyn SlowSyncApi>,
    sessions: Arc<SessionStore>,
    sink: Arc<dyn ConversationSink>,
    events: EventBus,
    policy: Policy,
    state: Mutex<SyncState>,
    slow_gate: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        stream: Arc<dyn EventStreamApi>,
        slow: Arc<dyn SlowSyncApi>,
        sessions: Arc<SessionStore>,
        sink: Arc<dyn ConversationSink>,
        events: EventBus,
        policy: Policy,
    ) -> Self {
        Self {
            store,
            stream,
            slow,
            sessions,
            sink,
            events,
            policy,
            state: Mutex::new(SyncState::NotStarted),
            slow_gate: Mutex::new(()),
        }
    }

    pub async fn state(&self) -> SyncState {
        *self.state.lock().await
    }

    async fn set_state(&self, next: SyncState) {
        let mut guard = self.state.lock().await;
        if *guard != next {
            log::info!("sync {:?} -> {:?}", *guard, next);
            *guard = next;
        }
    }

    pub async fn cursor(&self) -> Result<Option<NotificationCursor>, CoreError> {
        Ok(self.read_cursor().await?.map(NotificationCursor))
    }

    async fn read_cursor(&self) -> Result<Option<u64>, CoreError> {
        let Some(bytes) = self.store.get(CURSOR_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<u64>(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                log::error!("cursor store corrupt");
                self.set_state(SyncState::Degraded).await;
                Err(CoreError::Degraded)
            }
        }
    }

    async fn write_cursor(&self, id: u64) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(&id).map_err(|_| CoreError::Storage)?;
        if self.store.put(CURSOR_KEY, &bytes).await.is_err() {
            self.set_state(SyncState::Degraded).await;
            return Err(CoreError::Degraded);
        }
        Ok(())
    }

    /// NotStarted -> Live when a valid cursor exists, SlowSyncing when not.
    pub async fn bootstrap(&self) -> Result<SyncState, CoreError> {
        match self.read_cursor().await? {
            Some(_) => self.set_state(SyncState::Live).await,
            None => self.set_state(SyncState::SlowSyncing).await,
        }
        Ok(self.state().await)
    }

    /// Full resynchronization. At most one runs at a time; a second
    /// request while one is in flight is a no-op ("keep" semantics).
    /// Returns false when nothing was started.
    pub async fn slow_sync(&self) -> Result<bool, CoreError> {
        let Ok(_gate) = self.slow_gate.try_lock() else {
            return Ok(false);
        };
        if self.state().await != SyncState::SlowSyncing {
            return Ok(false);
        }
        let watermark = self.slow.fetch_full_state().await?;
        self.write_cursor(watermark).await?;
        self.set_state(SyncState::Live).await;
        log::info!("slow sync complete, cursor at {}", watermark);
        Ok(true)
    }

    /// One live connection: subscribe at the cursor and apply events until
    /// the stream ends. A rejected cursor falls back to slow sync.
    pub async fn run_live_once(&self) -> Result<(), CoreError> {
        if self.state().await != SyncState::Live {
            return Ok(());
        }
        let cursor = self.read_cursor().await?;
        let mut rx = match self.stream.subscribe(cursor).await {
            Ok(rx) => rx,
            Err(CoreError::CursorRejected) => {
                log::warn!("cursor {:?} rejected by stream, resyncing", cursor);
                self.set_state(SyncState::SlowSyncing).await;
                return Err(CoreError::CursorRejected);
            }
            Err(err) => return Err(err),
        };
        while let Some(event) = rx.recv().await {
            self.apply_event(&event).await?;
        }
        Ok(())
    }

    /// Applies one event idempotently and advances the cursor afterwards.
    /// Ids at or below the cursor are duplicates and are discarded.
    pub async fn apply_event(&self, event: &EventDto) -> Result<(), CoreError> {
        let cursor = self.read_cursor().await?;
        if cursor.map_or(false, |c| event.id <= c) {
            log::debug!("discarding duplicate event {}", event.id);
            return Ok(());
        }
        match event.kind {
            EventKind::MessageAdd => self.apply_message(event).await?,
            EventKind::ClientRemove => {
                let user = UserId::from(&event.from_user);
                let device = DeviceId::from(&event.from_client);
                self.sessions.drop_session(&user, &device).await?;
                self.sink.store_system_event(event).await?;
            }
            EventKind::MemberJoin | EventKind::MemberLeave => {
                self.sink.store_system_event(event).await?;
            }
        }
        self.write_cursor(event.id).await
    }

    async fn apply_message(&self, event: &EventDto) -> Result<(), CoreError> {
        let Some(payload) = event.payload.as_ref() else {
            return self.sink.store_system_event(event).await;
        };
        let Ok(ciphertext) = STANDARD.decode(payload) else {
            log::warn!("undecodable payload on event {}", event.id);
            return Ok(());
        };
        let user = UserId::from(&event.from_user);
        let device = DeviceId::from(&event.from_client);
        let plaintext = match self.decrypt_event(&user, &device, &ciphertext).await {
            Ok(plaintext) => plaintext,
            Err(CoreError::Storage) => return Err(CoreError::Storage),
            Err(CoreError::Degraded) => return Err(CoreError::Degraded),
            Err(err) => {
                // Fatal for this ciphertext only; the stream moves on.
                log::warn!("event {} from {}/{} dropped: {}", event.id, user, device, err);
                None
            }
        };
        if let Some(plaintext) = plaintext {
            let message = IncomingMessage {
                event_id: event.id,
                conversation: ConversationId::new(event.conversation.value.clone()),
                sender: user,
                sender_device: device,
                plaintext,
                timestamp: event.time,
            };
            self.sink.store_message(&message).await?;
            self.events.publish(message);
        }
        Ok(())
    }

    async fn decrypt_event(
        &self,
        user: &UserId,
        device: &DeviceId,
        ciphertext: &[u8],
    ) -> Result<Option<Vec<u8>>, CoreError> {
        match self.sessions.decrypt(user, device, ciphertext).await {
            Ok(plaintext) => Ok(Some(plaintext)),
            // Already decrypted once; an applied no-op, not a failure.
            Err(CoreError::DuplicatedMessage) => Ok(None),
            Err(CoreError::SessionNotFound) => {
                self.sessions
                    .establish_from_handshake(user, device, ciphertext)
                    .await?;
                match self.sessions.decrypt(user, device, ciphertext).await {
                    Ok(plaintext) => Ok(Some(plaintext)),
                    Err(CoreError::DuplicatedMessage) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Back to a freshly-installed sync state. The only way out of
    /// Degraded, and the only sanctioned cursor rollback.
    pub async fn reset(&self) -> Result<(), CoreError> {
        self.store.delete(CURSOR_KEY).await?;
        self.set_state(SyncState::NotStarted).await;
        Ok(())
    }

    /// Long-lived driver task: one owner for the live stream, slow sync
    /// retried with backoff, Degraded parks until reset.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                match engine.state().await {
                    SyncState::NotStarted => {
                        if engine.bootstrap().await.is_err() {
                            break;
                        }
                    }
                    SyncState::SlowSyncing => {
                        if engine.slow_sync().await.is_err() {
                            tokio::time::sleep(Duration::from_millis(
                                engine.policy.slow_sync_retry_ms,
                            ))
                            .await;
                        }
                    }
                    SyncState::Live => {
                        let _ = engine.run_live_once().await;
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                    SyncState::Degraded => break,
                }
            }
        });
    }
}
