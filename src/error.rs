use thiserror::Error;

/// Failures surfaced by a negotiation session.
///
/// Asynchronous failures that occur inside callbacks are logged and handled
/// at the boundary where they happen; this type is what reaches the caller
/// (or the `on_session_failed` callback) when a whole negotiation attempt is
/// aborted.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The relay transport refused to connect or dropped before the direct
    /// channel was established.
    #[error("relay transport: {0}")]
    Relay(String),

    /// The capture device could not provide a local media source
    /// (permission denied, no source available).
    #[error("media capture: {0}")]
    Media(String),

    /// A peer connection operation failed.
    #[error("negotiation: {0}")]
    Negotiation(#[from] webrtc::Error),

    /// A signaling frame could not be encoded or decoded.
    #[error("signaling codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// The peer reached a state the protocol does not allow.
    #[error("protocol: {0}")]
    Protocol(String),

    /// `start_as_initiator` was called while a session already exists.
    #[error("a session is already active")]
    AlreadyActive,

    /// The session configuration is invalid.
    #[error("configuration: {0}")]
    Config(String),
}
