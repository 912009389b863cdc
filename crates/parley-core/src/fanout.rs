use crate::error::CoreError;
use crate::ids::{DeviceId, UserId};
use crate::prekeys::{PreKeyFetcher, PreKeySlot, RecipientMap};
use crate::session::SessionStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parley_api::types::{ClientId, NewOtrMessage, OtrClientEntry, OtrUserEntry};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of one fan-out pass. Skipped devices had no prekey to bootstrap
/// with; failed devices hit a per-device crypto error. Neither aborts the
/// rest of the envelope.
#[derive(Clone, Debug)]
pub struct EncodeOutcome {
    pub message: NewOtrMessage,
    pub encrypted: Vec<(UserId, DeviceId)>,
    pub skipped: Vec<(UserId, DeviceId)>,
    pub failed: Vec<(UserId, DeviceId)>,
}

/// Turns one plaintext into one ciphertext per reachable recipient device,
/// creating sessions on demand. Not idempotent: every call advances
/// ratchets, so transport retries must resubmit the built envelope.
pub struct FanoutEncoder {
    sessions: Arc<SessionStore>,
    fetcher: PreKeyFetcher,
    self_user: UserId,
    self_device: DeviceId,
}

impl FanoutEncoder {
    pub fn new(
        sessions: Arc<SessionStore>,
        fetcher: PreKeyFetcher,
        self_user: UserId,
        self_device: DeviceId,
    ) -> Self {
        Self {
            sessions,
            fetcher,
            self_user,
            self_device,
        }
    }

    pub async fn encode(
        &self,
        plaintext: &[u8],
        recipients: &RecipientMap,
    ) -> Result<EncodeOutcome, CoreError> {
        let mut ready: Vec<(UserId, DeviceId)> = Vec::new();
        let mut missing: RecipientMap = HashMap::new();
        for (user, devices) in recipients.iter() {
            for device in devices.iter() {
                if *user == self.self_user && *device == self.self_device {
                    continue;
                }
                if self.sessions.has_session(user, device).await? {
                    ready.push((user.clone(), device.clone()));
                } else {
                    missing
                        .entry(user.clone())
                        .or_default()
                        .push(device.clone());
                }
            }
        }
        let mut skipped = Vec::new();
        let mut failed = Vec::new();
        if !missing.is_empty() {
            // One round trip for every sessionless device in the envelope.
            let slots = self.fetcher.fetch_one(&missing).await?;
            for ((user, device), slot) in slots.into_iter() {
                match slot {
                    PreKeySlot::Bundle(bundle) => {
                        match self
                            .sessions
                            .ensure_session(&user, &device, Some(bundle.as_ref()))
                            .await
                        {
                            Ok(_) => ready.push((user, device)),
                            Err(CoreError::HandshakeFailed) => {
                                log::warn!("handshake failed for {}/{}", user, device);
                                failed.push((user, device));
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    PreKeySlot::Unavailable => skipped.push((user, device)),
                }
            }
        }
        let mut per_user: HashMap<UserId, Vec<OtrClientEntry>> = HashMap::new();
        let mut encrypted = Vec::new();
        for (user, device) in ready.into_iter() {
            let handle = crate::session::SessionHandle {
                user: user.clone(),
                device: device.clone(),
            };
            match self.sessions.encrypt(&handle, plaintext).await {
                Ok(ciphertext) => {
                    per_user.entry(user.clone()).or_default().push(OtrClientEntry {
                        client: ClientId::from(&device),
                        payload: STANDARD.encode(&ciphertext),
                    });
                    encrypted.push((user, device));
                }
                Err(CoreError::Storage) => return Err(CoreError::Storage),
                Err(err) => {
                    log::warn!("encrypt failed for {}/{}: {}", user, device, err);
                    failed.push((user, device));
                }
            }
        }
        let mut recipients: Vec<OtrUserEntry> = per_user
            .into_iter()
            .map(|(user, clients)| OtrUserEntry {
                user: (&user).into(),
                clients,
            })
            .collect();
        recipients.sort_by(|a, b| a.user.id.cmp(&b.user.id));
        for entry in recipients.iter_mut() {
            entry.clients.sort_by(|a, b| a.client.value.cmp(&b.client.value));
        }
        Ok(EncodeOutcome {
            message: NewOtrMessage {
                sender: ClientId::from(&self.self_device),
                recipients,
                native_push: true,
                transient: false,
            },
            encrypted,
            skipped,
            failed,
        })
    }
}
