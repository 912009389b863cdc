use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("storage")]
    Storage,
    #[error("validation {0}")]
    Validation(String),
    #[error("transport {0}")]
    Transport(String),
    #[error("no bootstrap material")]
    NoBootstrapMaterial,
    #[error("session not found")]
    SessionNotFound,
    #[error("duplicated message")]
    DuplicatedMessage,
    #[error("handshake failed")]
    HandshakeFailed,
    #[error("recipients unstable")]
    RecipientsUnstable,
    #[error("cursor rejected")]
    CursorRejected,
    #[error("degraded")]
    Degraded,
}
