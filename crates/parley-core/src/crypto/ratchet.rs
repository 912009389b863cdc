use crate::crypto::handshake::HandshakeMaterial;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RatchetError {
    Replay,
    Decryption,
    Codec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// Ratchet state for one (user, device) pair. Counters only ever advance;
/// the set of consumed receive counters backs replay rejection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionState {
    root_key: [u8; 32],
    role: SessionRole,
    send_counter: u64,
    received: BTreeSet<u64>,
    pending_handshake: Option<HandshakeMaterial>,
    associated_data: Vec<u8>,
}

/// Ciphertext wire form. `handshake` rides along until the initiator has
/// seen one inbound message, so an unsessioned responder can bootstrap.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CipherMessage {
    pub counter: u64,
    pub handshake: Option<HandshakeMaterial>,
    pub body: Vec<u8>,
}

impl SessionState {
    pub fn initiator(
        root_key: [u8; 32],
        handshake: HandshakeMaterial,
        associated_data: Vec<u8>,
    ) -> Self {
        Self {
            root_key,
            role: SessionRole::Initiator,
            send_counter: 0,
            received: BTreeSet::new(),
            pending_handshake: Some(handshake),
            associated_data,
        }
    }

    pub fn responder(root_key: [u8; 32], associated_data: Vec<u8>) -> Self {
        Self {
            root_key,
            role: SessionRole::Responder,
            send_counter: 0,
            received: BTreeSet::new(),
            pending_handshake: None,
            associated_data,
        }
    }

    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }
}

pub fn peek_handshake(ciphertext: &[u8]) -> Option<HandshakeMaterial> {
    serde_json::from_slice::<CipherMessage>(ciphertext)
        .ok()
        .and_then(|m| m.handshake)
}

/// The narrow primitive boundary. The engine only ever calls these two
/// steps; key schedule and AEAD live behind it.
pub trait SessionCipher: Send + Sync {
    fn encrypt_step(
        &self,
        state: &mut SessionState,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, RatchetError>;
    fn decrypt_step(
        &self,
        state: &mut SessionState,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, RatchetError>;
}

/// Counter-derived message keys over the session root key; each counter
/// value maps to exactly one key, so a step is never reused.
#[derive(Clone, Copy, Default)]
pub struct StepRatchet;

impl StepRatchet {
    pub fn new() -> Self {
        Self
    }
}

impl SessionCipher for StepRatchet {
    fn encrypt_step(
        &self,
        state: &mut SessionState,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let counter = state.send_counter.saturating_add(1);
        let key = message_key(&state.root_key, send_label(state.role), counter);
        let body = seal(&key, counter, plaintext, &state.associated_data)?;
        state.send_counter = counter;
        let message = CipherMessage {
            counter,
            handshake: state.pending_handshake.clone(),
            body,
        };
        serde_json::to_vec(&message).map_err(|_| RatchetError::Codec)
    }

    fn decrypt_step(
        &self,
        state: &mut SessionState,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let message: CipherMessage =
            serde_json::from_slice(ciphertext).map_err(|_| RatchetError::Codec)?;
        if state.received.contains(&message.counter) {
            return Err(RatchetError::Replay);
        }
        let key = message_key(&state.root_key, recv_label(state.role), message.counter);
        let plaintext = open(&key, message.counter, &message.body, &state.associated_data)?;
        state.received.insert(message.counter);
        // Peer provably has the session now; stop re-sending bootstrap material.
        state.pending_handshake = None;
        Ok(plaintext)
    }
}

fn send_label(role: SessionRole) -> &'static [u8] {
    match role {
        SessionRole::Initiator => b"parley:step:i2r",
        SessionRole::Responder => b"parley:step:r2i",
    }
}

fn recv_label(role: SessionRole) -> &'static [u8] {
    match role {
        SessionRole::Initiator => b"parley:step:r2i",
        SessionRole::Responder => b"parley:step:i2r",
    }
}

fn message_key(root_key: &[u8; 32], label: &[u8], counter: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(root_key);
    hasher.update(label);
    hasher.update(&counter.to_be_bytes());
    hasher.finalize().into()
}

fn nonce_for(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(bytes)
}

fn seal(
    key: &[u8; 32],
    counter: u64,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, RatchetError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            &nonce_for(counter),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| RatchetError::Decryption)
}

fn open(
    key: &[u8; 32],
    counter: u64,
    body: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, RatchetError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            &nonce_for(counter),
            Payload {
                msg: body,
                aad: associated_data,
            },
        )
        .map_err(|_| RatchetError::Decryption)
}
