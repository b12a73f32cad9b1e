//! Protocol and config decoding errors

/// A line that could not be classified. These are logged and dropped, never
/// fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed {token} header: {line:?}")]
    MalformedHeader { token: &'static str, line: String },
    #[error("bad chunk index in {0:?}")]
    BadChunkIndex(String),
    #[error("{token} line needs an id and a value: {line:?}")]
    MissingTokens { token: &'static str, line: String },
    #[error("{0} received with no open config transfer")]
    NoOpenTransfer(&'static str),
    #[error("chunk index {index} out of range ({expected} chunks announced)")]
    ChunkOutOfRange { index: usize, expected: usize },
    #[error("{0} line rejected during config transfer")]
    EventDuringTransfer(&'static str),
}

/// Failure to turn an assembled transfer into a [`crate::Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigDecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] data_encoding::DecodeError),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing base64 chunk {index} of {expected}")]
    MissingChunk { index: usize, expected: usize },
    #[error("duplicate widget id {0:?}")]
    DuplicateWidgetId(String),
    #[error("{found} does not close the open {open} transfer")]
    MismatchedEnd { open: &'static str, found: &'static str },
}
