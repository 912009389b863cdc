use crate::crypto::handshake::PreKeyBundle;
use crate::error::CoreError;
use crate::ids::{DeviceId, UserId};
use crate::transport::PreKeyApi;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parley_api::types::{PreKeyBundleDto, UserClients};
use std::collections::HashMap;
use std::sync::Arc;

pub type RecipientMap = HashMap<UserId, Vec<DeviceId>>;

/// Per-device outcome of a batched fetch. `Unavailable` is a normal,
/// recoverable condition; transport failures fail the whole request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreKeySlot {
    Bundle(Box<PreKeyBundle>),
    Unavailable,
}

#[derive(Clone)]
pub struct PreKeyFetcher {
    api: Arc<dyn PreKeyApi>,
    federation_aware: bool,
}

impl PreKeyFetcher {
    pub fn new(api: Arc<dyn PreKeyApi>, federation_aware: bool) -> Self {
        Self {
            api,
            federation_aware,
        }
    }

    /// Resolves one unused prekey per requested device in a single round
    /// trip. Devices the server cannot serve come back as `Unavailable`.
    pub async fn fetch_one(
        &self,
        per_device: &RecipientMap,
    ) -> Result<HashMap<(UserId, DeviceId), PreKeySlot>, CoreError> {
        let request: Vec<UserClients> = per_device
            .iter()
            .map(|(user, devices)| UserClients {
                user: user.into(),
                clients: devices.iter().map(Into::into).collect(),
            })
            .collect();
        let response = if self.federation_aware {
            self.api.list_prekeys(&request).await?
        } else {
            self.api.prekeys(&request).await?
        };
        let mut slots: HashMap<(UserId, DeviceId), PreKeySlot> = per_device
            .iter()
            .flat_map(|(user, devices)| {
                devices
                    .iter()
                    .map(move |device| ((user.clone(), device.clone()), PreKeySlot::Unavailable))
            })
            .collect();
        for entry in response.users.iter() {
            let user = UserId::from(&entry.user);
            for client in entry.clients.iter() {
                let device = DeviceId::from(&client.client);
                let key = (user.clone(), device.clone());
                if !slots.contains_key(&key) {
                    continue;
                }
                if let Some(dto) = client.prekey.as_ref() {
                    let bundle = decode_bundle(&user, &device, dto)?;
                    slots.insert(key, PreKeySlot::Bundle(Box::new(bundle)));
                }
            }
        }
        Ok(slots)
    }
}

pub fn decode_bundle(
    user: &UserId,
    device: &DeviceId,
    dto: &PreKeyBundleDto,
) -> Result<PreKeyBundle, CoreError> {
    Ok(PreKeyBundle {
        user: user.clone(),
        device: device.clone(),
        identity_dh: decode_key32(&dto.identity_key)?,
        identity_signing: decode_key32(&dto.signing_key)?,
        signed_prekey_id: dto.signed_prekey.id,
        signed_prekey: decode_key32(&dto.signed_prekey.key)?,
        signed_prekey_signature: decode_key64(&dto.signed_prekey.signature)?,
        prekey_id: dto.prekey.id,
        prekey: decode_key32(&dto.prekey.key)?,
        last_resort: dto.last_resort,
    })
}

fn decode_key32(value: &str) -> Result<[u8; 32], CoreError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|_| CoreError::Validation("prekey_encoding".to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::Validation("prekey_length".to_string()))
}

fn decode_key64(value: &str) -> Result<[u8; 64], CoreError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|_| CoreError::Validation("signature_encoding".to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::Validation("signature_length".to_string()))
}
