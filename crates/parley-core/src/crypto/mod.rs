pub mod handshake;
pub mod ratchet;
