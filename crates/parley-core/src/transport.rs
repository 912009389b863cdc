use crate::error::CoreError;
use crate::event::IncomingMessage;
use async_trait::async_trait;
use parley_api::types::{
    ClientId, ClientMismatch, ConversationId, EventDto, NewClientRequest, NewOtrMessage,
    PreKeyDto, PreKeyMapResponse, QualifiedId, UserClients,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Outcome of one envelope submission. A mismatch is data, not an error;
/// network trouble is a `CoreError::Transport`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendAttempt {
    Sent,
    Mismatch(ClientMismatch),
}

#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn post_message(
        &self,
        conversation: &ConversationId,
        message: &NewOtrMessage,
    ) -> Result<SendAttempt, CoreError>;
}

#[async_trait]
pub trait PreKeyApi: Send + Sync {
    /// Federation-qualified route; primary.
    async fn list_prekeys(&self, request: &[UserClients]) -> Result<PreKeyMapResponse, CoreError>;
    /// Legacy unqualified route; fallback for pre-federation backends.
    async fn prekeys(&self, request: &[UserClients]) -> Result<PreKeyMapResponse, CoreError>;
    async fn register_client(
        &self,
        user: &QualifiedId,
        client: &ClientId,
        request: &NewClientRequest,
    ) -> Result<(), CoreError>;
    async fn upload_prekeys(
        &self,
        user: &QualifiedId,
        client: &ClientId,
        prekeys: &[PreKeyDto],
    ) -> Result<(), CoreError>;
    async fn remaining_prekeys(
        &self,
        user: &QualifiedId,
        client: &ClientId,
    ) -> Result<u16, CoreError>;
}

/// One subscription yields a finite sequence of ordered events; the
/// channel closing ends the connection and the caller resubscribes at its
/// cursor. A cursor the server no longer knows is `CursorRejected`.
#[async_trait]
pub trait EventStreamApi: Send + Sync {
    async fn subscribe(&self, cursor: Option<u64>) -> Result<mpsc::Receiver<EventDto>, CoreError>;
}

#[async_trait]
pub trait SlowSyncApi: Send + Sync {
    /// Full state fetch. Returns the most recent event id observed as of
    /// resync start, which becomes the fresh cursor.
    async fn fetch_full_state(&self) -> Result<u64, CoreError>;
}

#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn store_message(&self, message: &IncomingMessage) -> Result<(), CoreError>;
    async fn store_system_event(&self, event: &EventDto) -> Result<(), CoreError>;
}

struct RemoteDevice {
    identity_key: String,
    signing_key: String,
    signed_prekey: parley_api::types::SignedPreKeyDto,
    queue: VecDeque<PreKeyDto>,
    last_resort: PreKeyDto,
    exhausted: bool,
}

#[derive(Default)]
struct BackendState {
    devices: HashMap<(QualifiedId, ClientId), RemoteDevice>,
    posted: Vec<(ConversationId, NewOtrMessage)>,
    mismatches: VecDeque<ClientMismatch>,
    fail_posts: usize,
    fail_prekey_fetches: usize,
    qualified_routes: bool,
    events: Vec<EventDto>,
    next_event_id: u64,
    oldest_retained: u64,
    slow_sync_failures: usize,
}

/// Test backend covering all server-side collaborators: prekey registry,
/// message intake with scripted mismatches, event stream and slow sync.
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                qualified_routes: true,
                next_event_id: 1,
                ..BackendState::default()
            })),
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn disable_qualified_routes(&self) {
        self.state.lock().await.qualified_routes = false;
    }

    pub async fn prime_mismatch(&self, mismatch: ClientMismatch) {
        self.state.lock().await.mismatches.push_back(mismatch);
    }

    pub async fn fail_next_posts(&self, count: usize) {
        self.state.lock().await.fail_posts = count;
    }

    pub async fn fail_next_prekey_fetches(&self, count: usize) {
        self.state.lock().await.fail_prekey_fetches = count;
    }

    pub async fn fail_next_slow_syncs(&self, count: usize) {
        self.state.lock().await.slow_sync_failures = count;
    }

    /// Marks a device as having nothing to hand out, not even last-resort.
    pub async fn exhaust_prekeys(&self, user: &QualifiedId, client: &ClientId) {
        if let Some(device) = self
            .state
            .lock()
            .await
            .devices
            .get_mut(&(user.clone(), client.clone()))
        {
            device.queue.clear();
            device.exhausted = true;
        }
    }

    pub async fn posted(&self) -> Vec<(ConversationId, NewOtrMessage)> {
        self.state.lock().await.posted.clone()
    }

    pub async fn take_posted(&self) -> Vec<(ConversationId, NewOtrMessage)> {
        std::mem::take(&mut self.state.lock().await.posted)
    }

    pub async fn remaining_for(&self, user: &QualifiedId, client: &ClientId) -> usize {
        self.state
            .lock()
            .await
            .devices
            .get(&(user.clone(), client.clone()))
            .map(|d| d.queue.len())
            .unwrap_or(0)
    }

    /// Appends a ciphertext event and returns its assigned id.
    pub async fn push_event(
        &self,
        conversation: &ConversationId,
        from_user: &QualifiedId,
        from_client: &ClientId,
        kind: parley_api::types::EventKind,
        payload: Option<String>,
        time: u64,
    ) -> u64 {
        let mut state = self.state.lock().await;
        let id = state.next_event_id;
        state.next_event_id += 1;
        state.events.push(EventDto {
            id,
            kind,
            conversation: conversation.clone(),
            from_user: from_user.clone(),
            from_client: from_client.clone(),
            payload,
            time,
        });
        id
    }

    /// Drops history up to `id`, so older cursors get rejected on
    /// subscribe, the way a server expires its notification backlog.
    pub async fn expire_events_through(&self, id: u64) {
        let mut state = self.state.lock().await;
        state.events.retain(|e| e.id > id);
        state.oldest_retained = id;
    }

    pub async fn latest_event_id(&self) -> u64 {
        self.state
            .lock()
            .await
            .events
            .iter()
            .map(|e| e.id)
            .max()
            .unwrap_or(0)
    }

    async fn fetch(&self, request: &[UserClients]) -> Result<PreKeyMapResponse, CoreError> {
        let mut state = self.state.lock().await;
        if state.fail_prekey_fetches > 0 {
            state.fail_prekey_fetches -= 1;
            return Err(CoreError::Transport("prekey_fetch".to_string()));
        }
        let mut users = Vec::new();
        for entry in request.iter() {
            let mut clients = Vec::new();
            for client in entry.clients.iter() {
                let key = (entry.user.clone(), client.clone());
                let prekey = match state.devices.get_mut(&key) {
                    None => None,
                    Some(device) if device.exhausted => None,
                    Some(device) => {
                        let (prekey, last_resort) = match device.queue.pop_front() {
                            Some(p) => (p, false),
                            None => (device.last_resort.clone(), true),
                        };
                        Some(parley_api::types::PreKeyBundleDto {
                            identity_key: device.identity_key.clone(),
                            signing_key: device.signing_key.clone(),
                            signed_prekey: device.signed_prekey.clone(),
                            prekey,
                            last_resort,
                        })
                    }
                };
                clients.push(parley_api::types::ClientPreKeyEntry {
                    client: client.clone(),
                    prekey,
                });
            }
            users.push(parley_api::types::UserPreKeyEntry {
                user: entry.user.clone(),
                clients,
            });
        }
        Ok(PreKeyMapResponse { users })
    }
}

#[async_trait]
impl MessageApi for InMemoryBackend {
    async fn post_message(
        &self,
        conversation: &ConversationId,
        message: &NewOtrMessage,
    ) -> Result<SendAttempt, CoreError> {
        let mut state = self.state.lock().await;
        if state.fail_posts > 0 {
            state.fail_posts -= 1;
            return Err(CoreError::Transport("post".to_string()));
        }
        if let Some(mismatch) = state.mismatches.pop_front() {
            return Ok(SendAttempt::Mismatch(mismatch));
        }
        state.posted.push((conversation.clone(), message.clone()));
        Ok(SendAttempt::Sent)
    }
}

#[async_trait]
impl PreKeyApi for InMemoryBackend {
    async fn list_prekeys(&self, request: &[UserClients]) -> Result<PreKeyMapResponse, CoreError> {
        if !self.state.lock().await.qualified_routes {
            return Err(CoreError::Transport("no_qualified_route".to_string()));
        }
        self.fetch(request).await
    }

    async fn prekeys(&self, request: &[UserClients]) -> Result<PreKeyMapResponse, CoreError> {
        self.fetch(request).await
    }

    async fn register_client(
        &self,
        user: &QualifiedId,
        client: &ClientId,
        request: &NewClientRequest,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state.devices.insert(
            (user.clone(), client.clone()),
            RemoteDevice {
                identity_key: request.identity_key.clone(),
                signing_key: request.signing_key.clone(),
                signed_prekey: request.signed_prekey.clone(),
                queue: request.prekeys.iter().cloned().collect(),
                last_resort: request.last_resort_prekey.clone(),
                exhausted: false,
            },
        );
        Ok(())
    }

    async fn upload_prekeys(
        &self,
        user: &QualifiedId,
        client: &ClientId,
        prekeys: &[PreKeyDto],
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let device = state
            .devices
            .get_mut(&(user.clone(), client.clone()))
            .ok_or(CoreError::SessionNotFound)?;
        device.queue.extend(prekeys.iter().cloned());
        Ok(())
    }

    async fn remaining_prekeys(
        &self,
        user: &QualifiedId,
        client: &ClientId,
    ) -> Result<u16, CoreError> {
        Ok(self.remaining_for(user, client).await as u16)
    }
}

#[async_trait]
impl EventStreamApi for InMemoryBackend {
    async fn subscribe(&self, cursor: Option<u64>) -> Result<mpsc::Receiver<EventDto>, CoreError> {
        let state = self.state.lock().await;
        if let Some(cursor) = cursor {
            if cursor < state.oldest_retained {
                return Err(CoreError::CursorRejected);
            }
        }
        let after = cursor.unwrap_or(0);
        let mut pending: Vec<EventDto> = state
            .events
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.id);
        let (tx, rx) = mpsc::channel(pending.len().max(1));
        for event in pending {
            let _ = tx.try_send(event);
        }
        Ok(rx)
    }
}

#[async_trait]
impl SlowSyncApi for InMemoryBackend {
    async fn fetch_full_state(&self) -> Result<u64, CoreError> {
        let mut state = self.state.lock().await;
        if state.slow_sync_failures > 0 {
            state.slow_sync_failures -= 1;
            return Err(CoreError::Transport("slow_sync".to_string()));
        }
        // Latest assigned id, known even when the backlog has expired.
        Ok(state.next_event_id - 1)
    }
}

#[derive(Clone, Default)]
pub struct InMemorySink {
    messages: Arc<Mutex<Vec<IncomingMessage>>>,
    system: Arc<Mutex<Vec<EventDto>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<IncomingMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn system_events(&self) -> Vec<EventDto> {
        self.system.lock().await.clone()
    }
}

#[async_trait]
impl ConversationSink for InMemorySink {
    async fn store_message(&self, message: &IncomingMessage) -> Result<(), CoreError> {
        self.messages.lock().await.push(message.clone());
        Ok(())
    }

    async fn store_system_event(&self, event: &EventDto) -> Result<(), CoreError> {
        self.system.lock().await.push(event.clone());
        Ok(())
    }
}
