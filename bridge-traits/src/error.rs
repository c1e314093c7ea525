use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Unsupported input: {0}")]
    Unsupported(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Returns `true` when the collaborator ran out of memory or another
    /// bounded resource.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, BridgeError::ResourceExhausted(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
