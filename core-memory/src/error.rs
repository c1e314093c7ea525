use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Memory probe failed: {0}")]
    Probe(#[from] bridge_traits::BridgeError),

    #[error("Invalid buffer shape {shape:?}: {reason}")]
    InvalidShape { shape: Vec<usize>, reason: String },

    #[error("Unload hook '{name}' failed: {message}")]
    Unload { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, MemoryError>;
