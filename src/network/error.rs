// Error taxonomy for a control session
// Transport, protocol, peer and application (server-relayed) failures

use thiserror::Error;

/// Failure surfaced to the UI layer while a session is running
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// WebSocket failed to open, errored, or went away before the link was up
    #[error("WebSocket error: {0}")]
    Signaling(String),

    /// A send was attempted while the data channel was not open
    #[error("Data channel is not open")]
    ChannelNotOpen,

    /// Well-formed frame with content we could not use
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Peer connection or data channel failed/closed
    #[error("WebRTC error: {0}")]
    Peer(String),

    /// `error` frame relayed by the signaling server
    #[error("{0}")]
    Server(String),
}

impl SessionError {
    /// Terminal errors end the session instance (no in-place retry)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::Signaling(_) | SessionError::Peer(_) | SessionError::Server(_)
        )
    }
}

/// Reported and skipped; never tears the session down
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON frame: {0}")]
    InvalidJson(String),

    #[error("Frame has no message type")]
    MissingType,

    #[error("Message type not supported: {0}")]
    UnsupportedType(String),

    #[error("Malformed '{kind}' message: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("Unexpected '{0}' message in current state")]
    Unexpected(String),

    #[error("Invalid ICE candidate: {0}")]
    Candidate(String),

    #[error("Invalid session description: {0}")]
    Sdp(String),

    #[error("Invalid data channel payload: {0}")]
    Payload(String),
}

/// Errors from the underlying peer connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("ICE candidate error: {0}")]
    Candidate(String),

    #[error("Data channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
