use crate::config::CoreConfig;
use crate::crypto::handshake::{
    generate_identity_keypair, generate_prekey, generate_signed_prekey, IdentityKeyPair,
    OneTimePreKeyPair, SignedPreKeyPair,
};
use crate::error::CoreError;
use crate::policy::Policy;
use crate::storage::KeyValueStore;
use crate::transport::PreKeyApi;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use parley_api::types::{NewClientRequest, PreKeyDto, SignedPreKeyDto};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use x25519_dalek::StaticSecret;

const DEVICE_KEYS_KEY: &str = "device:keys";

/// Local device key material: identity, signed prekey, and the one-time
/// prekey privates still waiting to be consumed by inbound handshakes.
pub struct DeviceKeys {
    pub identity: IdentityKeyPair,
    pub signed_prekey: SignedPreKeyPair,
    pub one_time: HashMap<u16, OneTimePreKeyPair>,
    pub last_resort: OneTimePreKeyPair,
}

#[derive(Serialize, Deserialize)]
struct StoredPreKey {
    id: u16,
    private: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct StoredDeviceKeys {
    identity_dh: [u8; 32],
    signing: [u8; 32],
    signed_prekey_id: u32,
    signed_prekey: [u8; 32],
    signed_prekey_signature: Vec<u8>,
    one_time: Vec<StoredPreKey>,
    last_resort: StoredPreKey,
}

impl DeviceKeys {
    pub fn generate(config: &CoreConfig) -> Self {
        let identity = generate_identity_keypair();
        let signed_prekey = generate_signed_prekey(&identity, 1);
        let one_time: HashMap<u16, OneTimePreKeyPair> = (0..config.prekey_batch)
            .filter(|id| *id != config.last_resort_prekey_id)
            .map(|id| (id, generate_prekey(id)))
            .collect();
        let last_resort = generate_prekey(config.last_resort_prekey_id);
        Self {
            identity,
            signed_prekey,
            one_time,
            last_resort,
        }
    }

    /// Hands out the private half for an inbound handshake. One-time keys
    /// are consumed; the last-resort key is never exhausted.
    pub fn take_prekey(&mut self, id: u16) -> Option<OneTimePreKeyPair> {
        if id == self.last_resort.id {
            return Some(self.last_resort.clone());
        }
        self.one_time.remove(&id)
    }

    pub fn remaining(&self) -> usize {
        self.one_time.len()
    }

    pub fn upload_request(&self, label: Option<String>) -> NewClientRequest {
        let mut prekeys: Vec<PreKeyDto> = self.one_time.values().map(prekey_dto).collect();
        prekeys.sort_by_key(|p| p.id);
        NewClientRequest {
            identity_key: STANDARD.encode(self.identity.dh_public),
            signing_key: STANDARD.encode(VerifyingKey::from(&self.identity.signing).to_bytes()),
            signed_prekey: SignedPreKeyDto {
                id: self.signed_prekey.id,
                key: STANDARD.encode(self.signed_prekey.public),
                signature: STANDARD.encode(self.signed_prekey.signature.to_bytes()),
            },
            prekeys,
            last_resort_prekey: prekey_dto(&self.last_resort),
            label,
        }
    }

    fn to_stored(&self) -> StoredDeviceKeys {
        StoredDeviceKeys {
            identity_dh: self.identity.dh_private.to_bytes(),
            signing: self.identity.signing.to_bytes(),
            signed_prekey_id: self.signed_prekey.id,
            signed_prekey: self.signed_prekey.private.to_bytes(),
            signed_prekey_signature: self.signed_prekey.signature.to_bytes().to_vec(),
            one_time: self
                .one_time
                .values()
                .map(|p| StoredPreKey {
                    id: p.id,
                    private: p.private.to_bytes(),
                })
                .collect(),
            last_resort: StoredPreKey {
                id: self.last_resort.id,
                private: self.last_resort.private.to_bytes(),
            },
        }
    }

    fn from_stored(stored: StoredDeviceKeys) -> Result<Self, CoreError> {
        let dh_private = StaticSecret::from(stored.identity_dh);
        let dh_public = x25519_dalek::PublicKey::from(&dh_private).to_bytes();
        let signing = SigningKey::from_bytes(&stored.signing);
        let signature_bytes: [u8; 64] = stored
            .signed_prekey_signature
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::Storage)?;
        let signed_private = StaticSecret::from(stored.signed_prekey);
        let signed_public = x25519_dalek::PublicKey::from(&signed_private).to_bytes();
        let identity = IdentityKeyPair {
            dh_private,
            dh_public,
            signing,
        };
        let signed_prekey = SignedPreKeyPair {
            id: stored.signed_prekey_id,
            private: signed_private,
            public: signed_public,
            signature: Signature::from_bytes(&signature_bytes),
        };
        let one_time = stored
            .one_time
            .into_iter()
            .map(|p| (p.id, restore_prekey(p)))
            .collect();
        let last_resort = restore_prekey(stored.last_resort);
        Ok(Self {
            identity,
            signed_prekey,
            one_time,
            last_resort,
        })
    }

    pub async fn persist(&self, store: &dyn KeyValueStore) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(&self.to_stored()).map_err(|_| CoreError::Storage)?;
        store.put(DEVICE_KEYS_KEY, &bytes).await
    }

    pub async fn load(store: &dyn KeyValueStore) -> Result<Option<Self>, CoreError> {
        let Some(bytes) = store.get(DEVICE_KEYS_KEY).await? else {
            return Ok(None);
        };
        let stored: StoredDeviceKeys =
            serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)?;
        Ok(Some(Self::from_stored(stored)?))
    }
}

fn prekey_dto(prekey: &OneTimePreKeyPair) -> PreKeyDto {
    PreKeyDto {
        id: prekey.id,
        key: STANDARD.encode(prekey.public),
    }
}

fn restore_prekey(stored: StoredPreKey) -> OneTimePreKeyPair {
    let private = StaticSecret::from(stored.private);
    let public = x25519_dalek::PublicKey::from(&private).to_bytes();
    OneTimePreKeyPair {
        id: stored.id,
        private,
        public,
    }
}

/// Device bootstrap: reuse persisted keys, or generate a fresh set and
/// publish it so peers can open sessions with this device.
pub async fn load_or_register(
    store: &dyn KeyValueStore,
    api: &dyn PreKeyApi,
    config: &CoreConfig,
) -> Result<DeviceKeys, CoreError> {
    if let Some(keys) = DeviceKeys::load(store).await? {
        return Ok(keys);
    }
    let keys = DeviceKeys::generate(config);
    api.register_client(
        &(&config.self_user).into(),
        &(&config.self_device).into(),
        &keys.upload_request(config.device_label.clone()),
    )
    .await?;
    keys.persist(store).await?;
    log::info!("registered device {}", config.self_device);
    Ok(keys)
}

/// Tops the published prekey pool back up once the server-side remainder
/// drops under the policy threshold.
pub async fn refill_prekeys(
    store: &dyn KeyValueStore,
    api: &dyn PreKeyApi,
    keys: &mut DeviceKeys,
    config: &CoreConfig,
    policy: &Policy,
) -> Result<u16, CoreError> {
    let user = (&config.self_user).into();
    let client = (&config.self_device).into();
    let remaining = api.remaining_prekeys(&user, &client).await?;
    if remaining >= policy.prekey_refill_threshold {
        return Ok(0);
    }
    let start = keys
        .one_time
        .keys()
        .max()
        .copied()
        .unwrap_or(0)
        .saturating_add(1);
    let mut fresh = Vec::new();
    let mut id = start;
    while fresh.len() < config.prekey_batch as usize && id < u16::MAX {
        if id != config.last_resort_prekey_id {
            fresh.push(generate_prekey(id));
        }
        id += 1;
    }
    let dtos: Vec<PreKeyDto> = fresh.iter().map(prekey_dto).collect();
    api.upload_prekeys(&user, &client, &dtos).await?;
    for prekey in fresh {
        keys.one_time.insert(prekey.id, prekey);
    }
    keys.persist(store).await?;
    log::debug!("uploaded {} fresh prekeys", dtos.len());
    Ok(dtos.len() as u16)
}

/// Convenience alias used by the composition root.
pub type SharedDeviceKeys = Arc<tokio::sync::Mutex<DeviceKeys>>;
