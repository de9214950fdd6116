//! Common error types for callwire.

use thiserror::Error;

/// Result type alias using callwire's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for callwire operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The call document is missing or carries no usable offer
    #[error("call not found: {0}")]
    CallNotFound(String),

    /// Candidate text did not match the expected token layout
    #[error("malformed candidate {candidate:?}: {reason}")]
    MalformedCandidate { candidate: String, reason: String },

    /// The local video source could not be opened
    #[error("media source unavailable: {0}")]
    MediaSourceUnavailable(String),

    /// The offer was of the wrong type or rejected by the WebRTC engine
    #[error("invalid remote description: {0}")]
    InvalidRemoteDescription(String),

    /// Creating or committing the local answer failed
    #[error("answer generation failed: {0}")]
    AnswerGenerationFailed(String),

    /// The WebRTC engine refused a single remote candidate
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),

    /// Writing to the signaling store failed
    #[error("signaling write failed: {0}")]
    SignalingWriteError(String),

    /// A negotiation step was attempted out of order
    #[error("invalid transition: cannot {attempted} while {state}")]
    InvalidTransition {
        state: &'static str,
        attempted: &'static str,
    },

    /// Every remote candidate was rejected and the policy requires one
    #[error("no viable candidates: {rejected} rejected, 0 applied")]
    NoViableCandidates { rejected: usize },

    /// Service account key could not be loaded or exchanged for a token
    #[error("credentials error: {0}")]
    Credentials(String),

    /// Reading from the signaling store failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a malformed candidate error.
    pub fn malformed_candidate(candidate: &str, reason: impl std::fmt::Display) -> Self {
        Self::MalformedCandidate {
            candidate: candidate.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a call not found error from any displayable type.
    pub fn call_not_found(msg: impl std::fmt::Display) -> Self {
        Self::CallNotFound(msg.to_string())
    }

    /// Create a media source error from any displayable type.
    pub fn media_unavailable(msg: impl std::fmt::Display) -> Self {
        Self::MediaSourceUnavailable(msg.to_string())
    }

    /// Create an invalid remote description error from any displayable type.
    pub fn invalid_remote(msg: impl std::fmt::Display) -> Self {
        Self::InvalidRemoteDescription(msg.to_string())
    }

    /// Create an answer generation error from any displayable type.
    pub fn answer_failed(msg: impl std::fmt::Display) -> Self {
        Self::AnswerGenerationFailed(msg.to_string())
    }

    /// Create a candidate rejected error from any displayable type.
    pub fn candidate_rejected(msg: impl std::fmt::Display) -> Self {
        Self::CandidateRejected(msg.to_string())
    }

    /// Create a signaling write error from any displayable type.
    pub fn signaling_write(msg: impl std::fmt::Display) -> Self {
        Self::SignalingWriteError(msg.to_string())
    }

    /// Create a credentials error from any displayable type.
    pub fn credentials(msg: impl std::fmt::Display) -> Self {
        Self::Credentials(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Whether this error ends the call attempt.
    ///
    /// Per-candidate failures are skipped by the caller; everything else
    /// aborts.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::MalformedCandidate { .. } | Self::CandidateRejected(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
