use crate::types::*;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty field {0}")]
    Empty(&'static str),
    #[error("too large {0}")]
    TooLarge(&'static str),
    #[error("duplicate {0}")]
    Duplicate(&'static str),
    #[error("invalid encoding {0}")]
    Encoding(&'static str),
    #[error("invalid prekey id {0}")]
    PreKeyId(u16),
}

pub fn validate_send_request(
    message: &NewOtrMessage,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    if message.sender.value.trim().is_empty() {
        return Err(ValidationError::Empty("sender"));
    }
    if message.recipients.is_empty() {
        return Err(ValidationError::Empty("recipients"));
    }
    for entry in message.recipients.iter() {
        validate_user_entry(entry, limits)?;
    }
    Ok(())
}

fn validate_user_entry(
    entry: &OtrUserEntry,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    if entry.user.id.trim().is_empty() {
        return Err(ValidationError::Empty("user"));
    }
    if entry.clients.is_empty() {
        return Err(ValidationError::Empty("clients"));
    }
    if entry.clients.len() > limits.max_clients_per_user {
        return Err(ValidationError::TooLarge("clients"));
    }
    let mut seen = HashSet::new();
    for client in entry.clients.iter() {
        if !seen.insert(&client.client.value) {
            return Err(ValidationError::Duplicate("client"));
        }
        if client.payload.is_empty() {
            return Err(ValidationError::Empty("payload"));
        }
        let decoded = STANDARD
            .decode(&client.payload)
            .map_err(|_| ValidationError::Encoding("payload"))?;
        if decoded.len() > limits.max_payload_bytes {
            return Err(ValidationError::TooLarge("payload"));
        }
    }
    Ok(())
}

pub fn validate_prekey_upload(
    request: &NewClientRequest,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    if request.prekeys.len() < limits.min_prekeys {
        return Err(ValidationError::Empty("prekeys"));
    }
    let mut ids = HashSet::new();
    for prekey in request.prekeys.iter() {
        if prekey.id == request.last_resort_prekey.id {
            return Err(ValidationError::PreKeyId(prekey.id));
        }
        if !ids.insert(prekey.id) {
            return Err(ValidationError::Duplicate("prekey_id"));
        }
        STANDARD
            .decode(&prekey.key)
            .map_err(|_| ValidationError::Encoding("prekey"))?;
    }
    STANDARD
        .decode(&request.last_resort_prekey.key)
        .map_err(|_| ValidationError::Encoding("last_resort_prekey"))?;
    STANDARD
        .decode(&request.identity_key)
        .map_err(|_| ValidationError::Encoding("identity_key"))?;
    Ok(())
}
