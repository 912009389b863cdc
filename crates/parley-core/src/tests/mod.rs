pub mod sender_tests;
pub mod sync_tests;

use crate::config::CoreConfig;
use crate::crypto::handshake::PreKeyBundle;
use crate::ids::{DeviceId, UserId};
use crate::policy::Policy;
use crate::prekeys::{PreKeyFetcher, PreKeySlot, RecipientMap};
use crate::storage::InMemoryStore;
use crate::transport::{InMemoryBackend, InMemorySink};
use crate::Core;
use parley_api::types::{ClientId, ConversationId, EventKind, QualifiedId};
use std::collections::HashMap;
use std::sync::Arc;

pub struct TestPeer {
    pub core: Core,
    pub store: Arc<InMemoryStore>,
    pub sink: Arc<InMemorySink>,
    pub user: UserId,
    pub device: DeviceId,
}

impl TestPeer {
    pub fn qualified(&self) -> QualifiedId {
        (&self.user).into()
    }

    pub fn client(&self) -> ClientId {
        (&self.device).into()
    }
}

pub fn test_config(user: &str, device: &str) -> CoreConfig {
    CoreConfig {
        self_user: UserId::qualified(user, "example.com"),
        self_device: DeviceId::new(device),
        prekey_batch: 8,
        auto_flush_outbox: false,
        ..CoreConfig::default()
    }
}

pub fn test_policy() -> Policy {
    Policy {
        backoff_initial_ms: 10,
        backoff_max_ms: 50,
        ..Policy::default()
    }
}

pub async fn spawn_peer(backend: &InMemoryBackend, user: &str, device: &str) -> TestPeer {
    spawn_peer_with(backend, test_config(user, device)).await
}

pub async fn spawn_peer_with(backend: &InMemoryBackend, config: CoreConfig) -> TestPeer {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(InMemorySink::new());
    let user = config.self_user.clone();
    let device = config.self_device.clone();
    let core = Core::init(
        config,
        test_policy(),
        store.clone(),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        sink.clone(),
    )
    .await
    .expect("core init");
    TestPeer {
        core,
        store,
        sink,
        user,
        device,
    }
}

pub fn recipients(entries: &[(&UserId, &DeviceId)]) -> RecipientMap {
    let mut map: RecipientMap = HashMap::new();
    for (user, device) in entries {
        map.entry((*user).clone())
            .or_default()
            .push((*device).clone());
    }
    map
}

pub fn conversation(name: &str) -> ConversationId {
    ConversationId::new(name)
}

pub async fn bundle_for(backend: &InMemoryBackend, target: &TestPeer) -> PreKeyBundle {
    let fetcher = PreKeyFetcher::new(Arc::new(backend.clone()), true);
    let map = recipients(&[(&target.user, &target.device)]);
    let slots = fetcher.fetch_one(&map).await.expect("prekey fetch");
    let slot = slots.into_values().next().expect("slot");
    match slot {
        PreKeySlot::Bundle(bundle) => *bundle,
        PreKeySlot::Unavailable => panic!("prekey unavailable"),
    }
}

/// Moves every posted payload addressed to `target` into the event stream,
/// the way the server fans a submitted envelope out to recipient devices.
pub async fn deliver_posted(
    backend: &InMemoryBackend,
    sender: &TestPeer,
    target: &TestPeer,
) -> Vec<u64> {
    let mut ids = Vec::new();
    for (conversation, message) in backend.take_posted().await {
        for user_entry in message.recipients.iter() {
            if user_entry.user != target.qualified() {
                continue;
            }
            for client_entry in user_entry.clients.iter() {
                if client_entry.client != target.client() {
                    continue;
                }
                let id = backend
                    .push_event(
                        &conversation,
                        &sender.qualified(),
                        &sender.client(),
                        EventKind::MessageAdd,
                        Some(client_entry.payload.clone()),
                        7,
                    )
                    .await;
                ids.push(id);
            }
        }
    }
    ids
}
