use crate::ids::{DeviceId, UserId};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    InvalidSignedPreKey,
    UnknownPreKey,
}

#[derive(Clone)]
pub struct IdentityKeyPair {
    pub dh_private: StaticSecret,
    pub dh_public: [u8; 32],
    pub signing: SigningKey,
}

#[derive(Clone)]
pub struct SignedPreKeyPair {
    pub id: u32,
    pub private: StaticSecret,
    pub public: [u8; 32],
    pub signature: Signature,
}

#[derive(Clone)]
pub struct OneTimePreKeyPair {
    pub id: u16,
    pub private: StaticSecret,
    pub public: [u8; 32],
}

/// Public bootstrap material for one remote device, decoded from the prekey
/// fetch response. Consumed exactly once per session establishment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub user: UserId,
    pub device: DeviceId,
    pub identity_dh: [u8; 32],
    pub identity_signing: [u8; 32],
    pub signed_prekey_id: u32,
    pub signed_prekey: [u8; 32],
    pub signed_prekey_signature: [u8; 64],
    pub prekey_id: u16,
    pub prekey: [u8; 32],
    pub last_resort: bool,
}

/// Travels inside first-flight ciphertexts so the responder can establish
/// its half of the session from the message alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandshakeMaterial {
    pub identity_dh: [u8; 32],
    pub identity_signing: [u8; 32],
    pub ephemeral: [u8; 32],
    pub signed_prekey_id: u32,
    pub prekey_id: u16,
}

pub struct AgreementOutput {
    pub root_key: [u8; 32],
    pub associated_data: Vec<u8>,
}

pub fn generate_identity_keypair() -> IdentityKeyPair {
    let dh_private = StaticSecret::random_from_rng(OsRng);
    let dh_public = X25519Public::from(&dh_private).to_bytes();
    let signing = SigningKey::generate(&mut OsRng);
    IdentityKeyPair {
        dh_private,
        dh_public,
        signing,
    }
}

pub fn generate_signed_prekey(identity: &IdentityKeyPair, id: u32) -> SignedPreKeyPair {
    let private = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&private).to_bytes();
    let signature = identity.signing.sign(&public);
    SignedPreKeyPair {
        id,
        private,
        public,
        signature,
    }
}

pub fn generate_prekey(id: u16) -> OneTimePreKeyPair {
    let private = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&private).to_bytes();
    OneTimePreKeyPair {
        id,
        private,
        public,
    }
}

/// Initiator side: verify the signed prekey, run the four agreements and
/// derive the session root key plus the material the responder needs.
pub fn initiate(
    initiator: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<(AgreementOutput, HandshakeMaterial), HandshakeError> {
    verify_signed_prekey(bundle)?;
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral).to_bytes();
    let dh1 = initiator
        .dh_private
        .diffie_hellman(&X25519Public::from(bundle.signed_prekey));
    let dh2 = ephemeral.diffie_hellman(&X25519Public::from(bundle.identity_dh));
    let dh3 = ephemeral.diffie_hellman(&X25519Public::from(bundle.signed_prekey));
    let dh4 = ephemeral.diffie_hellman(&X25519Public::from(bundle.prekey));
    let root_key = kdf_root(&[
        dh1.as_bytes(),
        dh2.as_bytes(),
        dh3.as_bytes(),
        dh4.as_bytes(),
    ]);
    let initiator_signing = VerifyingKey::from(&initiator.signing).to_bytes();
    let associated_data = build_ad(&bundle.identity_dh, &initiator_signing, &initiator.dh_public);
    let material = HandshakeMaterial {
        identity_dh: initiator.dh_public,
        identity_signing: initiator_signing,
        ephemeral: ephemeral_public,
        signed_prekey_id: bundle.signed_prekey_id,
        prekey_id: bundle.prekey_id,
    };
    Ok((
        AgreementOutput {
            root_key,
            associated_data,
        },
        material,
    ))
}

/// Responder side: rebuild the same root key from the initiator's material
/// and the local private halves addressed by its prekey ids.
pub fn respond(
    responder: &IdentityKeyPair,
    signed_prekey: &SignedPreKeyPair,
    prekey: &OneTimePreKeyPair,
    material: &HandshakeMaterial,
) -> Result<AgreementOutput, HandshakeError> {
    if signed_prekey.id != material.signed_prekey_id || prekey.id != material.prekey_id {
        return Err(HandshakeError::UnknownPreKey);
    }
    let initiator_identity = X25519Public::from(material.identity_dh);
    let initiator_ephemeral = X25519Public::from(material.ephemeral);
    let dh1 = signed_prekey.private.diffie_hellman(&initiator_identity);
    let dh2 = responder.dh_private.diffie_hellman(&initiator_ephemeral);
    let dh3 = signed_prekey.private.diffie_hellman(&initiator_ephemeral);
    let dh4 = prekey.private.diffie_hellman(&initiator_ephemeral);
    let root_key = kdf_root(&[
        dh1.as_bytes(),
        dh2.as_bytes(),
        dh3.as_bytes(),
        dh4.as_bytes(),
    ]);
    let associated_data = build_ad(
        &responder.dh_public,
        &material.identity_signing,
        &material.identity_dh,
    );
    Ok(AgreementOutput {
        root_key,
        associated_data,
    })
}

fn verify_signed_prekey(bundle: &PreKeyBundle) -> Result<(), HandshakeError> {
    let verifying = VerifyingKey::from_bytes(&bundle.identity_signing)
        .map_err(|_| HandshakeError::InvalidSignedPreKey)?;
    let signature = Signature::from_bytes(&bundle.signed_prekey_signature);
    verifying
        .verify_strict(&bundle.signed_prekey, &signature)
        .map_err(|_| HandshakeError::InvalidSignedPreKey)
}

fn kdf_root(inputs: &[&[u8]]) -> [u8; 32] {
    let mut accum = Vec::new();
    for input in inputs {
        accum.extend_from_slice(input);
    }
    let hkdf = Hkdf::<Sha256>::new(None, &accum);
    let mut okm = [0u8; 32];
    let _ = hkdf.expand(b"parley:session:v1", &mut okm);
    okm
}

fn build_ad(
    responder_identity: &[u8; 32],
    initiator_signing: &[u8; 32],
    initiator_dh: &[u8; 32],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(responder_identity);
    out.extend_from_slice(initiator_signing);
    out.extend_from_slice(initiator_dh);
    out
}
