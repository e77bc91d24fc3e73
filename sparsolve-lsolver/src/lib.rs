//! `sparsolve-lsolver`: iterative and direct solvers for `A x = b`.
//!
//! Every solver and preconditioner implements [`Solver`] over the operand
//! contracts of `sparsolve-core`, so Krylov methods run unchanged on local and
//! distributed operands while the sweeps, ILU, AMG and the dense inversion
//! work on [`sparsolve_core::LocalMatrix`].

pub mod algorithms;
pub mod direct;
pub mod error;
pub mod multigrid;
pub mod preconditioners;
pub mod solver;

pub use error::{Result, SolverError};
pub use solver::{
    Breakdown, ConvergenceCriteria, IterationControl, IterativeBase, SolveReport, SolveStatus,
    Solver, SolverState,
};

// Operand types solvers are instantiated with
pub use sparsolve_core::{
    Context, ContextConfig, CoreError, DiagonalOperator, GlobalMatrix, GlobalVector, LocalMatrix,
    LocalVector, Operator, Residency, SparseMatrix, Triplet, Vector,
};
