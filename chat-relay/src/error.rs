use thiserror::Error;

/// A record that could not be turned into a [`Packet`](crate::packet::Packet).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("record is not a valid packet: {0}")]
    Json(#[from] serde_json::Error),
}
