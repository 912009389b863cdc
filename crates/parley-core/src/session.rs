use crate::crypto::handshake::{self, PreKeyBundle};
use crate::crypto::ratchet::{peek_handshake, RatchetError, SessionCipher, SessionState};
use crate::error::CoreError;
use crate::ids::{session_key, DeviceId, UserId};
use crate::registration::SharedDeviceKeys;
use crate::storage::KeyValueStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const SESSION_PREFIX: &str = "session:";

/// Opaque reference to one established (user, device) session. Callers
/// never see ratchet internals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    pub user: UserId,
    pub device: DeviceId,
}

#[derive(Default)]
struct SessionSlot {
    state: Option<SessionState>,
    loaded: bool,
}

/// Owns all per-device ratchet state. Operations on one pair are strictly
/// serialized through that pair's slot lock; different pairs run
/// concurrently. Every ratchet advance is persisted before returning.
pub struct SessionStore {
    cipher: Arc<dyn SessionCipher>,
    store: Arc<dyn KeyValueStore>,
    device_keys: SharedDeviceKeys,
    slots: Mutex<HashMap<String, Arc<Mutex<SessionSlot>>>>,
}

impl SessionStore {
    pub fn new(
        cipher: Arc<dyn SessionCipher>,
        store: Arc<dyn KeyValueStore>,
        device_keys: SharedDeviceKeys,
    ) -> Self {
        Self {
            cipher,
            store,
            device_keys,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, user: &UserId, device: &DeviceId) -> Arc<Mutex<SessionSlot>> {
        let key = session_key(user, device);
        let mut slots = self.slots.lock().await;
        slots.entry(key).or_default().clone()
    }

    async fn load_if_needed(
        &self,
        slot: &mut SessionSlot,
        user: &UserId,
        device: &DeviceId,
    ) -> Result<(), CoreError> {
        if slot.loaded {
            return Ok(());
        }
        let key = storage_key(user, device);
        if let Some(bytes) = self.store.get(&key).await? {
            let state = serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)?;
            slot.state = Some(state);
        }
        slot.loaded = true;
        Ok(())
    }

    async fn persist(
        &self,
        user: &UserId,
        device: &DeviceId,
        state: &SessionState,
    ) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(state).map_err(|_| CoreError::Storage)?;
        self.store.put(&storage_key(user, device), &bytes).await
    }

    pub async fn has_session(&self, user: &UserId, device: &DeviceId) -> Result<bool, CoreError> {
        let slot = self.slot(user, device).await;
        let mut guard = slot.lock().await;
        self.load_if_needed(&mut guard, user, device).await?;
        Ok(guard.state.is_some())
    }

    /// Returns the existing session, or performs the one-time handshake
    /// from `bootstrap`. No session and no prekey is `NoBootstrapMaterial`.
    pub async fn ensure_session(
        &self,
        user: &UserId,
        device: &DeviceId,
        bootstrap: Option<&PreKeyBundle>,
    ) -> Result<SessionHandle, CoreError> {
        let slot = self.slot(user, device).await;
        let mut guard = slot.lock().await;
        self.load_if_needed(&mut guard, user, device).await?;
        if guard.state.is_some() {
            return Ok(SessionHandle {
                user: user.clone(),
                device: device.clone(),
            });
        }
        let bundle = bootstrap.ok_or(CoreError::NoBootstrapMaterial)?;
        let identity = {
            let keys = self.device_keys.lock().await;
            keys.identity.clone()
        };
        let (agreement, material) =
            handshake::initiate(&identity, bundle).map_err(|_| CoreError::HandshakeFailed)?;
        let state = SessionState::initiator(agreement.root_key, material, agreement.associated_data);
        self.persist(user, device, &state).await?;
        guard.state = Some(state);
        log::debug!("session established with {}/{}", user, device);
        Ok(SessionHandle {
            user: user.clone(),
            device: device.clone(),
        })
    }

    /// Builds the responder half of a session from the handshake material
    /// embedded in a first-flight ciphertext, consuming the addressed
    /// one-time prekey.
    pub async fn establish_from_handshake(
        &self,
        user: &UserId,
        device: &DeviceId,
        ciphertext: &[u8],
    ) -> Result<SessionHandle, CoreError> {
        let material = peek_handshake(ciphertext).ok_or(CoreError::NoBootstrapMaterial)?;
        let slot = self.slot(user, device).await;
        let mut guard = slot.lock().await;
        self.load_if_needed(&mut guard, user, device).await?;
        if guard.state.is_some() {
            return Ok(SessionHandle {
                user: user.clone(),
                device: device.clone(),
            });
        }
        let agreement = {
            let mut keys = self.device_keys.lock().await;
            let prekey = keys
                .take_prekey(material.prekey_id)
                .ok_or(CoreError::HandshakeFailed)?;
            let output =
                handshake::respond(&keys.identity, &keys.signed_prekey, &prekey, &material)
                    .map_err(|_| CoreError::HandshakeFailed)?;
            keys.persist(self.store.as_ref()).await?;
            output
        };
        let state = SessionState::responder(agreement.root_key, agreement.associated_data);
        self.persist(user, device, &state).await?;
        guard.state = Some(state);
        log::debug!("accepted handshake from {}/{}", user, device);
        Ok(SessionHandle {
            user: user.clone(),
            device: device.clone(),
        })
    }

    /// Advances the sending ratchet exactly one step. The new state is
    /// durable before the ciphertext is returned.
    pub async fn encrypt(
        &self,
        handle: &SessionHandle,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        let slot = self.slot(&handle.user, &handle.device).await;
        let mut guard = slot.lock().await;
        self.load_if_needed(&mut guard, &handle.user, &handle.device)
            .await?;
        let state = guard.state.as_mut().ok_or(CoreError::SessionNotFound)?;
        let ciphertext = self
            .cipher
            .encrypt_step(state, plaintext)
            .map_err(map_ratchet)?;
        let snapshot = state.clone();
        self.persist(&handle.user, &handle.device, &snapshot).await?;
        Ok(ciphertext)
    }

    /// `SessionNotFound` means the caller should try
    /// `establish_from_handshake` first; `DuplicatedMessage` is an
    /// idempotent rejection the caller treats as already-applied.
    pub async fn decrypt(
        &self,
        user: &UserId,
        device: &DeviceId,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        let slot = self.slot(user, device).await;
        let mut guard = slot.lock().await;
        self.load_if_needed(&mut guard, user, device).await?;
        let state = guard.state.as_mut().ok_or(CoreError::SessionNotFound)?;
        let plaintext = self
            .cipher
            .decrypt_step(state, ciphertext)
            .map_err(map_ratchet)?;
        let snapshot = state.clone();
        self.persist(user, device, &snapshot).await?;
        Ok(plaintext)
    }

    /// Explicit device removal. Encrypt/decrypt for the pair require a
    /// fresh handshake afterwards.
    pub async fn drop_session(&self, user: &UserId, device: &DeviceId) -> Result<(), CoreError> {
        let slot = self.slot(user, device).await;
        let mut guard = slot.lock().await;
        guard.state = None;
        guard.loaded = true;
        self.store.delete(&storage_key(user, device)).await
    }
}

fn storage_key(user: &UserId, device: &DeviceId) -> String {
    format!("{}{}", SESSION_PREFIX, session_key(user, device))
}

fn map_ratchet(err: RatchetError) -> CoreError {
    match err {
        RatchetError::Replay => CoreError::DuplicatedMessage,
        RatchetError::Decryption => CoreError::Validation("ciphertext".to_string()),
        RatchetError::Codec => CoreError::Validation("ciphertext_codec".to_string()),
    }
}
