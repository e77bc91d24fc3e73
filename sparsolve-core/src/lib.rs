//! # Sparse Solver Core Library
//!
//! Operand contracts, the process [`Context`], host and accelerator (wgpu)
//! storage, and the distributed vector/matrix layer with its ghost exchange.

pub mod buffer;
pub mod comm;
mod context;
pub mod device;
pub mod error;
pub mod global_matrix;
pub mod global_vector;
pub mod local_matrix;
pub mod local_vector;
mod ops;
pub mod parallel_manager;
pub mod sparse_matrix;
pub mod traits;

pub use buffer::DeviceBuffer;
pub use comm::{Communicator, Payload, Request, Tag, ThreadComm};
pub use device::{Context, ContextConfig, GpuDevice};
pub use error::CoreError;
pub use global_matrix::GlobalMatrix;
pub use global_vector::{ExchangeStatus, GlobalVector};
pub use local_matrix::LocalMatrix;
pub use local_vector::LocalVector;
pub use parallel_manager::{ParallelManager, RecvSegment, SendSegment};
pub use sparse_matrix::{DeviceCsr, SparseMatrix, Triplet};
pub use traits::{DiagonalOperator, Operator, Residency, Vector};
