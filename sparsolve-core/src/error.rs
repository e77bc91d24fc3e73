use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Accelerator initialization failed: {0}")]
    AcceleratorInit(String),

    #[error("Accelerator error: {0}")]
    Accelerator(String),

    #[error("No accelerator is attached to this context")]
    AcceleratorUnavailable,

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// A new ghost exchange was issued (or a residency move requested) while
    /// the previous exchange of the same vector is still outstanding.
    #[error("Ghost exchange already in flight for vector '{0}'")]
    ExchangeInFlight(String),

    /// The ghost region was read without a completed exchange in the current round.
    #[error("Ghost values of vector '{0}' are not synchronized")]
    GhostNotSynchronized(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Invalid parallel layout: {0}")]
    InvalidParallelLayout(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = core::result::Result<T, CoreError>;

/// Shorthand used by every size check in the crate.
pub(crate) fn check_size(what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(CoreError::InvalidDimensions(format!(
            "{}: expected {}, got {}",
            what, expected, actual
        )));
    }
    Ok(())
}
