//! Error taxonomy shared by every pipeline component.
//!
//! Callers decide between "leave the job for redelivery" and "give up on this
//! input" from the error kind alone, via [`PipelineError::is_retryable`].

/// Failure modes of the keyframe, consumer and aggregation paths.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The source video or image is corrupt or undecodable. Never retried.
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    /// Storage, queue or network failure. Retried through redelivery.
    #[error("transient i/o failure: {0}")]
    TransientIo(String),

    /// The detection service failed. `permanent` is set when the provider
    /// rejected the input outright (e.g. HTTP 4xx).
    #[error("detection service failure (permanent: {permanent}): {message}")]
    DetectionService { message: String, permanent: bool },

    /// A queue payload that can never be decoded.
    #[error("malformed job payload: {0}")]
    MalformedJob(String),

    /// A key that the target store cannot address.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

impl PipelineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo(message.into())
    }

    pub fn unreadable(message: impl Into<String>) -> Self {
        Self::SourceUnreadable(message.into())
    }

    /// True when leaving the job unacknowledged can plausibly succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientIo(_) => true,
            Self::DetectionService { permanent, .. } => !permanent,
            Self::SourceUnreadable(_) | Self::MalformedJob(_) | Self::InvalidKey(_) => false,
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::TransientIo(format!("sqlite: {}", err))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::TransientIo(format!("io: {}", err))
    }
}
