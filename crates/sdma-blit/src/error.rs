use thiserror::Error;

use crate::config::ConfigError;
use crate::memory::MemoryError;
use crate::queue::DriverError;

pub type Result<T> = std::result::Result<T, BlitError>;

#[derive(Debug, Error)]
pub enum BlitError {
    /// The request cannot fit in the ring (or in the engine's single-packet
    /// limits). Nothing was written.
    #[error("request of {requested} bytes exceeds ring capacity {capacity}")]
    OutOfResources { requested: u64, capacity: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BlitError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<sdma_protocol::RectCopyError> for BlitError {
    fn from(err: sdma_protocol::RectCopyError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}
