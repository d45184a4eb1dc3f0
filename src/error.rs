use thiserror::Error;

/// Custom error types for the proctoring core
#[derive(Debug, Error)]
pub enum ProctorError {
    /// WebRTC related errors
    #[error("Failed to create peer connection: {0}")]
    PeerConnectionCreation(String),

    #[error("Failed to create offer: {0}")]
    CreateOfferFailed(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswerFailed(String),

    #[error("Invalid SDP format: {0}")]
    InvalidSdp(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescriptionFailed(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidateFailed(String),

    #[error("Failed to add track: {0}")]
    AddTrackFailed(String),

    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    /// Session management errors
    #[error("Session with peer {0} is closed")]
    SessionClosed(String),

    #[error("Connection with peer {0} failed")]
    ConnectionFailed(String),

    /// Signaling errors
    #[error("Invalid signaling message: {0}")]
    InvalidSignalingMessage(String),

    #[error("Signaling channel error: {0}")]
    Signaling(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Media acquisition errors
    #[error("Media permission denied: {0}")]
    MediaPermissionDenied(String),

    #[error("Media device unavailable: {0}")]
    MediaDeviceUnavailable(String),

    /// Attempt and store errors
    #[error("Attempt {0} not found")]
    AttemptNotFound(String),

    #[error("Attempt {0} is already submitted")]
    AlreadySubmitted(String),

    #[error("Attempt {0} is not accepting changes")]
    AttemptClosed(String),

    #[error("Question {0} not found")]
    QuestionNotFound(String),

    #[error("Attempt store error: {0}")]
    Store(String),

    #[error("Submission of attempt {attempt_id} failed: {reason}")]
    SubmissionFailed { attempt_id: String, reason: String },

    #[error("Invalid quiz settings: {0}")]
    InvalidSettings(String),

    /// Question generation errors
    #[error("Invalid generation request: {0}")]
    InvalidGenerationRequest(String),

    #[error("Question generation failed: {0}")]
    Generation(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using ProctorError
pub type Result<T> = std::result::Result<T, ProctorError>;

impl ProctorError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        ProctorError::Internal(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        ProctorError::Store(msg.into())
    }

    pub fn signaling(msg: impl Into<String>) -> Self {
        ProctorError::Signaling(msg.into())
    }

    /// Whether repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProctorError::Store(_)
                | ProctorError::Signaling(_)
                | ProctorError::ConnectionFailed(_)
                | ProctorError::Http(_)
        )
    }

    /// Media errors degrade monitoring instead of stopping the attempt.
    pub fn is_media_failure(&self) -> bool {
        matches!(
            self,
            ProctorError::MediaPermissionDenied(_) | ProctorError::MediaDeviceUnavailable(_)
        )
    }
}

/// Convert webrtc::Error to ProctorError
impl From<webrtc::Error> for ProctorError {
    fn from(err: webrtc::Error) -> Self {
        ProctorError::WebRtcApi(err.to_string())
    }
}
