/// Result alias that carries the custom [`StemEditError`] type.
pub type Result<T> = std::result::Result<T, StemEditError>;

/// Common error type for the core crate.
///
/// Errors raised while rendering a single edit or encoding a single format are
/// attached to that unit's outcome by the orchestrator; only planning errors
/// end a job outright.
#[derive(Debug, thiserror::Error)]
pub enum StemEditError {
    /// Input bytes could not be probed or decoded into PCM.
    #[error("failed to decode audio: {0}")]
    Decode(String),
    /// A time range fell outside a buffer or was empty.
    #[error("range {start:.3}s..{end:.3}s is invalid for a buffer of {duration:.3}s")]
    Range { start: f64, end: f64, duration: f64 },
    /// Buffers disagree on sample rate or channel count.
    #[error("format mismatch: {0}")]
    FormatMismatch(String),
    /// Buffers passed to `mix` differ in length.
    #[error("length mismatch: {left} frames vs {right} frames")]
    LengthMismatch { left: usize, right: usize },
    #[error("unknown edit type `{0}`")]
    UnknownEditType(String),
    #[error("invalid fade window of {fade} frames between segments of {left} and {right} frames")]
    InvalidFadeWindow {
        fade: usize,
        left: usize,
        right: usize,
    },
    #[error("failed to encode {format}: {reason}")]
    Encode { format: String, reason: String },
    /// Raised by the separation collaborator; surfaced unchanged.
    #[error("separation failed: {0}")]
    Separation(String),
    /// Raised by the metadata-reporting collaborator; surfaced unchanged.
    #[error("metadata report failed: {0}")]
    Report(String),
    #[error("job cancelled")]
    Cancelled,
    #[error("analysis failed: {0}")]
    Analysis(String),
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("job cannot move from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("failed to start render workers: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl StemEditError {
    /// Creates an [`StemEditError::InvalidInput`] from any message.
    pub fn invalid_input<T: Into<String>>(msg: T) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn encode(format: impl ToString, reason: impl ToString) -> Self {
        Self::Encode {
            format: format.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<symphonia::core::errors::Error> for StemEditError {
    fn from(value: symphonia::core::errors::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<lofty::error::LoftyError> for StemEditError {
    fn from(value: lofty::error::LoftyError) -> Self {
        Self::encode("tags", value)
    }
}

impl From<realfft::FftError> for StemEditError {
    fn from(value: realfft::FftError) -> Self {
        Self::Analysis(value.to_string())
    }
}

impl From<rubato::ResampleError> for StemEditError {
    fn from(value: rubato::ResampleError) -> Self {
        Self::Resample(value.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for StemEditError {
    fn from(value: rubato::ResamplerConstructionError) -> Self {
        Self::Resample(value.to_string())
    }
}
