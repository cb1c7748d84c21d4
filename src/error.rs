//! Error taxonomy shared by the codec, envelope and relay layers.

use thiserror::Error;

/// Errors surfaced by the protocol core.
///
/// Cryptographic failures are never retried and always reach the caller that
/// attempted the decode. Transport failures are normally absorbed by the
/// relay link's backoff loop and only appear here when every link is gone.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid key material")]
    InvalidKeyMaterial,
    #[error("invalid plaintext length: {0} (expected 1..=65535)")]
    InvalidLength(usize),
    #[error("unsupported payload version: {0}")]
    UnsupportedVersion(u8),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid kind: expected {expected}, found {found}")]
    InvalidKind { expected: u32, found: u32 },
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
    #[error("invalid padding")]
    InvalidPadding,
    #[error("rumor author does not match seal author")]
    SenderMismatch,
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Proxy(#[from] tokio_socks::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
