//! Preconditioners: solvers whose `solve` applies `x = M^-1 rhs`.
//!
//! Identity and Jacobi run on any operand type. The triangular sweeps, ILU,
//! block and variable preconditioners operate on [`sparsolve_core::LocalMatrix`].

pub mod block;
pub mod ilu;
pub mod incomplete;
pub mod relaxation;
mod sweep;
pub mod variable;

pub use block::{BlockConfig, BlockPreconditioner};
pub use ilu::{Ilu, IluConfig, IluFactor, MultiColoredIlu};
pub use incomplete::{Ic, Ilut, IlutConfig};
pub use relaxation::{GaussSeidel, MultiColoredGs, MultiColoredSgs, Relaxation, RelaxationConfig, Sgs};
pub use variable::VariablePreconditioner;

use crate::error::{Result, SolverError};
use crate::solver::{check_buildable, SolveReport, SolveStatus, Solver, SolverState};
use log::debug;
use sparsolve_core::{CoreError, DiagonalOperator, Operator, Vector};
use std::marker::PhantomData;
use std::sync::Arc;

/// Report returned by a single preconditioner application.
pub(crate) fn applied() -> SolveReport {
    SolveReport {
        status: SolveStatus::Converged,
        iterations: 1,
        initial_residual: 0.0,
        final_residual: 0.0,
    }
}

/// Operator slot and lifecycle state of a preconditioner.
#[derive(Debug)]
pub(crate) struct Lifecycle<O> {
    pub name: String,
    pub op: Option<Arc<O>>,
    pub state: SolverState,
}

impl<O> Lifecycle<O> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            op: None,
            state: SolverState::Uninitialized,
        }
    }

    pub fn begin_build<V>(&self) -> Result<Arc<O>>
    where
        O: Operator<V>,
        V: Vector,
    {
        check_buildable(self.state, &self.name, self.op.is_some())?;
        let op = self.operator()?;
        if !op.is_square() {
            return Err(SolverError::InvalidParameter(format!(
                "'{}' needs a square operator, got {}x{}",
                self.name,
                op.rows(),
                op.cols()
            )));
        }
        debug!("Building preconditioner {} for {}", self.name, op.info());
        Ok(op)
    }

    pub fn finish_build(&mut self) {
        self.state = SolverState::Built;
    }

    pub fn operator(&self) -> Result<Arc<O>> {
        self.op
            .clone()
            .ok_or_else(|| SolverError::MissingOperator(self.name.clone()))
    }

    pub fn ensure_built(&self) -> Result<()> {
        if self.state != SolverState::Built {
            return Err(SolverError::NotBuilt(self.name.clone()));
        }
        Ok(())
    }

    pub fn begin_solve<V>(&self, rhs: &V, x: &V) -> Result<Arc<O>>
    where
        O: Operator<V>,
        V: Vector,
    {
        self.ensure_built()?;
        let op = self.operator()?;
        if rhs.size() != op.rows() || x.size() != op.rows() {
            return Err(SolverError::Core(CoreError::InvalidDimensions(format!(
                "'{}': operator of size {}, rhs {}, x {}",
                self.name,
                op.rows(),
                rhs.size(),
                x.size()
            ))));
        }
        Ok(op)
    }

    pub fn clear(&mut self) {
        if self.state == SolverState::Built {
            self.state = SolverState::Cleared;
        }
    }
}

/// `x = rhs`.
#[derive(Debug)]
pub struct Identity<O> {
    life: Lifecycle<O>,
}

impl<O> Identity<O> {
    pub fn new() -> Self {
        Self {
            life: Lifecycle::new("Identity"),
        }
    }
}

impl<O> Default for Identity<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O, V> Solver<O, V> for Identity<O>
where
    O: Operator<V>,
    V: Vector,
{
    fn name(&self) -> &str {
        &self.life.name
    }

    fn set_operator(&mut self, op: Arc<O>) {
        self.life.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        self.life.begin_build::<V>()?;
        self.life.finish_build();
        Ok(())
    }

    fn rebuild_numeric(&mut self) -> Result<()> {
        self.life.ensure_built()
    }

    fn clear(&mut self) {
        self.life.clear();
    }

    fn solve(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport> {
        self.life.begin_solve(rhs, &*x)?;
        x.copy_from(rhs)?;
        Ok(applied())
    }

    fn solve_zero_sol(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport> {
        self.solve(rhs, x)
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        Ok(())
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        Ok(())
    }

    fn state(&self) -> SolverState {
        self.life.state
    }

    fn describe(&self) -> String {
        format!("{} [{:?}]", self.life.name, self.life.state)
    }
}

/// Point Jacobi, `x = D^-1 rhs`.
#[derive(Debug)]
pub struct Jacobi<O, V> {
    life: Lifecycle<O>,
    inv_diag: Option<V>,
    _vector: PhantomData<fn() -> V>,
}

impl<O, V> Jacobi<O, V> {
    pub fn new() -> Self {
        Self {
            life: Lifecycle::new("Jacobi"),
            inv_diag: None,
            _vector: PhantomData,
        }
    }

    pub fn inverse_diagonal(&self) -> Option<&V> {
        self.inv_diag.as_ref()
    }
}

impl<O, V> Default for Jacobi<O, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O, V> Solver<O, V> for Jacobi<O, V>
where
    O: DiagonalOperator<V>,
    V: Vector,
{
    fn name(&self) -> &str {
        &self.life.name
    }

    fn set_operator(&mut self, op: Arc<O>) {
        self.life.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        let op = self.life.begin_build::<V>()?;
        self.inv_diag = Some(op.extract_inverse_diagonal("Jacobi inverse diagonal")?);
        self.life.finish_build();
        Ok(())
    }

    fn rebuild_numeric(&mut self) -> Result<()> {
        self.life.ensure_built()?;
        let op = self.life.operator()?;
        let mut inv_diag = op.extract_inverse_diagonal("Jacobi inverse diagonal")?;
        if let Some(old) = self.inv_diag.as_ref() {
            if old.is_accelerator() {
                inv_diag.move_to_accelerator()?;
            }
        }
        self.inv_diag = Some(inv_diag);
        Ok(())
    }

    fn clear(&mut self) {
        self.inv_diag = None;
        self.life.clear();
    }

    fn solve(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport> {
        self.life.begin_solve(rhs, &*x)?;
        let inv_diag = self
            .inv_diag
            .as_ref()
            .ok_or_else(|| SolverError::NotBuilt(self.life.name.clone()))?;
        x.point_wise_mult2(inv_diag, rhs)?;
        Ok(applied())
    }

    fn solve_zero_sol(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport> {
        self.solve(rhs, x)
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        match self.inv_diag.as_mut() {
            Some(d) => Ok(d.move_to_host()?),
            None => Ok(()),
        }
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        match self.inv_diag.as_mut() {
            Some(d) => Ok(d.move_to_accelerator()?),
            None => Ok(()),
        }
    }

    fn state(&self) -> SolverState {
        self.life.state
    }

    fn describe(&self) -> String {
        format!("{} [{:?}]", self.life.name, self.life.state)
    }
}
