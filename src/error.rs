//! Error types for the voicemesh call engine

/// Result type alias using voicemesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local capture device could not be acquired
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Malformed or unrecognized signaling payload
    #[error("Signaling decode error: {0}")]
    SignalingDecode(String),

    /// SDP offer/answer exchange failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// ICE restart budget for a peer link is spent
    #[error("ICE restarts exhausted for peer: {0}")]
    RestartsExhausted(String),

    /// Outbound signaling send failed
    #[error("Transport send error: {0}")]
    TransportSend(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is confined to a single peer link.
    ///
    /// Link-local errors degrade or remove one connection but never
    /// terminate the call session.
    pub fn is_link_local(&self) -> bool {
        matches!(
            self,
            Error::SignalingDecode(_)
                | Error::Negotiation(_)
                | Error::RestartsExhausted(_)
                | Error::TransportSend(_)
                | Error::PeerNotFound(_)
        )
    }

    /// Check if this error terminates the whole call session
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::MediaAcquisition(_) | Error::InvalidConfig(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
