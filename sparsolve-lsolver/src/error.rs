use sparsolve_core::CoreError;
use thiserror::Error;

/// Configuration and factorization failures. Non-convergence and
/// breakdowns are not errors; they are reported through `SolveStatus`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("Solver '{0}' has no operator attached")]
    MissingOperator(String),

    #[error("Solver '{0}' is already built; clear it before building again")]
    AlreadyBuilt(String),

    #[error("Solver '{0}' must be built before use")]
    NotBuilt(String),

    #[error("Block sizes sum to {actual}, operator has {expected} rows")]
    BlockSizeMismatch { expected: usize, actual: usize },

    #[error("Singular system: numerical rank {rank} of {size}")]
    SingularSystem { rank: usize, size: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type Result<T> = core::result::Result<T, SolverError>;
