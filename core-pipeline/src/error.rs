use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Ingestion failed: {0}")]
    Ingestion(String),

    #[error("Chapter {index} failed: {message}")]
    Chapter { index: usize, message: String },

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("Audio encoding failed: {0}")]
    Encoding(String),

    #[error("Packaging failed: {0}")]
    Packaging(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Worker pool is not running")]
    PoolNotRunning,

    #[error("A conversion is already running")]
    RunInProgress,

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Memory(#[from] core_memory::MemoryError),
}

impl PipelineError {
    /// Stable code surfaced in chapter events and reports.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Ingestion(_) => "E001",
            PipelineError::Chapter { .. } | PipelineError::Synthesis(_) => "E100",
            PipelineError::Encoding(_) => "E200",
            PipelineError::Packaging(_) => "E203",
            PipelineError::ResourceExhausted(_) => "E300",
            PipelineError::Cancelled => "E400",
            PipelineError::Timeout(_) => "E401",
            PipelineError::InvalidStateTransition { .. }
            | PipelineError::PoolNotRunning
            | PipelineError::RunInProgress
            | PipelineError::Worker(_)
            | PipelineError::Io(_)
            | PipelineError::Config(_)
            | PipelineError::Memory(_) => "E500",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// Errors that end the whole run rather than a single chapter.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Ingestion(_) | PipelineError::Packaging(_) | PipelineError::Config(_)
        )
    }

    pub(crate) fn chapter(index: usize, message: impl Into<String>) -> Self {
        PipelineError::Chapter {
            index,
            message: message.into(),
        }
    }

    pub(crate) fn synthesis(err: BridgeError) -> Self {
        if err.is_resource_exhausted() {
            PipelineError::ResourceExhausted(err.to_string())
        } else {
            PipelineError::Synthesis(err.to_string())
        }
    }

    pub(crate) fn encoding(err: BridgeError) -> Self {
        if err.is_resource_exhausted() {
            PipelineError::ResourceExhausted(err.to_string())
        } else {
            PipelineError::Encoding(err.to_string())
        }
    }
}

impl From<core_runtime::Error> for PipelineError {
    fn from(err: core_runtime::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Worker(format!("malformed worker message: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
