use crate::error::{Result, SolverError};
use crate::solver::{
    precondition, residual, ConvergenceCriteria, IterativeBase, SolveReport, Solver, SolverState,
};
use log::info;
use sparsolve_core::{Operator, Vector};
use std::sync::Arc;

#[derive(Debug)]
struct CgWorkspace<V> {
    r: V,
    z: V,
    p: V,
    q: V,
}

fn allocate<O: Operator<V>, V: Vector>(op: &O) -> Result<CgWorkspace<V>> {
    Ok(CgWorkspace {
        r: op.new_vector("r")?,
        z: op.new_vector("z")?,
        p: op.new_vector("p")?,
        q: op.new_vector("q")?,
    })
}

/// Preconditioned conjugate gradient for symmetric positive definite operators.
#[derive(Debug)]
pub struct Cg<O, V> {
    base: IterativeBase<O, V>,
    workspace: Option<CgWorkspace<V>>,
}

impl<O, V> Cg<O, V>
where
    O: Operator<V>,
    V: Vector,
{
    pub fn new(criteria: ConvergenceCriteria) -> Self {
        Self {
            base: IterativeBase::new("CG", criteria),
            workspace: None,
        }
    }

    pub fn set_preconditioner(&mut self, precond: Box<dyn Solver<O, V>>) -> Result<()> {
        self.base.set_preconditioner(precond)
    }

    pub fn base(&self) -> &IterativeBase<O, V> {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut IterativeBase<O, V> {
        &mut self.base
    }
}

impl<O, V> Default for Cg<O, V>
where
    O: Operator<V>,
    V: Vector,
{
    fn default() -> Self {
        Self::new(ConvergenceCriteria::default())
    }
}

impl<O, V> Solver<O, V> for Cg<O, V>
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
        let op = self.base.begin_build()?;
        let workspace = self.base.finish_build(allocate(op.as_ref()))?;
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
        info!("CG initial residual {:e}", norm);

        precondition(precond, &ws.r, &mut ws.z)?;
        ws.p.copy_from(&ws.z)?;
        let mut rho = ws.r.dot(&ws.z)?;

        let status = loop {
            op.apply(&ws.p, &mut ws.q)?;
            let pq = ws.p.dot(&ws.q)?;
            if pq == 0.0 || !pq.is_finite() {
                return Ok(control.stalled("(p, Ap)", pq));
            }
            let alpha = rho / pq;
            x.add_scale(&ws.p, alpha)?;
            ws.r.add_scale(&ws.q, -alpha)?;

            if let Some(status) = control.check(ws.r.norm()?) {
                break status;
            }

            precondition(precond, &ws.r, &mut ws.z)?;
            let rho_next = ws.r.dot(&ws.z)?;
            if rho == 0.0 {
                return Ok(control.stalled("rho", rho));
            }
            // p = z + beta * p
            ws.p.scale_add(rho_next / rho, &ws.z)?;
            rho = rho_next;
        };

        info!(
            "CG finished: {:?} after {} iterations, residual {:e}",
            status,
            control.iteration(),
            control.current_residual()
        );
        Ok(control.report(status))
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        if let Some(ws) = self.workspace.as_mut() {
            for v in [&mut ws.r, &mut ws.z, &mut ws.p, &mut ws.q] {
                v.move_to_host()?;
            }
        }
        self.base.move_precond_to_host()
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        if let Some(ws) = self.workspace.as_mut() {
            for v in [&mut ws.r, &mut ws.z, &mut ws.p, &mut ws.q] {
                v.move_to_accelerator()?;
            }
        }
        self.base.move_precond_to_accelerator()
    }

    fn state(&self) -> SolverState {
        self.base.state
    }

    fn describe(&self) -> String {
        self.base.describe()
    }
}
