use thiserror::Error;

/// Errors surfaced by the collaboration engine.
///
/// `Protocol`, `InvalidUpdate`, and `Presence` are recoverable: the offending
/// frame is dropped and the connection that sent it stays open.
/// `RoomNotFound` signals a stale room handle after teardown.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed sync protocol message: {0}")]
    Protocol(#[from] yrs::sync::Error),

    #[error("invalid document update: {0}")]
    InvalidUpdate(String),

    #[error("presence state error: {0}")]
    Presence(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),
}
