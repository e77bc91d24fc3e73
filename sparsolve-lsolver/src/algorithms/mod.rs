//! Krylov subspace methods and the stationary iteration used as a smoother.
//!
//! All methods are generic over the operand contracts, so the same solver
//! runs on [`sparsolve_core::LocalMatrix`] and [`sparsolve_core::GlobalMatrix`].

pub mod bicgstab; // BiConjugate Gradient Stabilized
pub mod cg; // Preconditioned Conjugate Gradient
pub mod fixed_point; // Richardson / preconditioned relaxation
pub mod gmres; // Restarted GMRES and flexible GMRES
pub mod idr; // Induced Dimension Reduction IDR(s)

pub use bicgstab::BiCgStab;
pub use cg::Cg;
pub use fixed_point::FixedPoint;
pub use gmres::{Fgmres, Gmres, GmresConfig, RestartedGmres};
pub use idr::{Idr, IdrConfig};
