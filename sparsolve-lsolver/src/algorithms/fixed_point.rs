use crate::error::{Result, SolverError};
use crate::solver::{
    precondition, residual, ConvergenceCriteria, IterativeBase, SolveReport, Solver, SolverState,
};
use log::debug;
use sparsolve_core::{Operator, Vector};
use std::sync::Arc;

#[derive(Debug)]
struct FixedPointWorkspace<V> {
    r: V,
    z: V,
}

impl<V: Vector> FixedPointWorkspace<V> {
    fn allocate<O: Operator<V>>(op: &O) -> Result<Self> {
        Ok(Self {
            r: op.new_vector("r")?,
            z: op.new_vector("z")?,
        })
    }
}

/// Stationary iteration `x = x + omega * M^-1 (b - A x)`.
///
/// Without a preconditioner this is Richardson's method.
#[derive(Debug)]
pub struct FixedPoint<O, V> {
    base: IterativeBase<O, V>,
    omega: f64,
    workspace: Option<FixedPointWorkspace<V>>,
}

impl<O, V> FixedPoint<O, V>
where
    O: Operator<V>,
    V: Vector,
{
    pub fn new(criteria: ConvergenceCriteria, omega: f64) -> Self {
        Self {
            base: IterativeBase::new("FixedPoint", criteria),
            omega,
            workspace: None,
        }
    }

    pub fn omega(&self) -> f64 {
        self.omega
    }

    pub fn set_relaxation(&mut self, omega: f64) {
        self.omega = omega;
    }

    /// Replaces the stopping rules, e.g. to switch between pre- and
    /// post-smoothing sweep counts.
    pub fn set_criteria(&mut self, criteria: ConvergenceCriteria) {
        self.base.control.set_criteria(criteria);
    }

    pub fn set_preconditioner(&mut self, precond: Box<dyn Solver<O, V>>) -> Result<()> {
        self.base.set_preconditioner(precond)
    }

    pub fn base(&self) -> &IterativeBase<O, V> {
        &self.base
    }
}

impl<O, V> Solver<O, V> for FixedPoint<O, V>
where
    O: Operator<V> + 'static,
    V: Vector + 'static,
{
    fn name(&self) -> &str {
        &self.base.name
    }

    fn set_operator(&mut self, op: Arc<O>) {
        self.base.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        if !(self.omega > 0.0) {
            return Err(SolverError::InvalidParameter(format!(
                "FixedPoint: relaxation must be positive, got {}",
                self.omega
            )));
        }
        let op = self.base.begin_build()?;
        let workspace = FixedPointWorkspace::allocate(op.as_ref());
        let workspace = self.base.finish_build(workspace)?;
        self.workspace = Some(workspace);
        Ok(())
    }

    fn rebuild_numeric(&mut self) -> Result<()> {
        self.base.rebuild_numeric()?;
        Ok(())
    }

    fn clear(&mut self) {
        self.workspace = None;
        self.base.clear();
    }

    fn solve(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport> {
        let op = self.base.begin_solve(rhs, x)?;
        let omega = self.omega;
        let ws = self
            .workspace
            .as_mut()
            .ok_or_else(|| SolverError::NotBuilt(self.base.name.clone()))?;
        let IterativeBase {
            precond, control, ..
        } = &mut self.base;

        let norm = residual(op.as_ref(), rhs, x, &mut ws.r)?;
        if let Some(status) = control.init(norm) {
            return Ok(control.report(status));
        }
        let status = loop {
            precondition(precond, &ws.r, &mut ws.z)?;
            x.add_scale(&ws.z, omega)?;
            let norm = residual(op.as_ref(), rhs, x, &mut ws.r)?;
            if let Some(status) = control.check(norm) {
                break status;
            }
        };
        debug!(
            "FixedPoint: {:?} after {} sweeps, residual {:e}",
            status,
            control.iteration(),
            control.current_residual()
        );
        Ok(control.report(status))
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        if let Some(ws) = self.workspace.as_mut() {
            ws.r.move_to_host()?;
            ws.z.move_to_host()?;
        }
        self.base.move_precond_to_host()
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        if let Some(ws) = self.workspace.as_mut() {
            ws.r.move_to_accelerator()?;
            ws.z.move_to_accelerator()?;
        }
        self.base.move_precond_to_accelerator()
    }

    fn state(&self) -> SolverState {
        self.base.state
    }

    fn describe(&self) -> String {
        format!("{}, omega={}", self.base.describe(), self.omega)
    }
}
