use crate::error::{Result, SolverError};
use crate::solver::{
    precondition, residual, ConvergenceCriteria, IterativeBase, SolveReport, SolveStatus, Solver,
    SolverState,
};
use log::{debug, info};
use sparsolve_core::{Operator, Vector};
use std::sync::Arc;

#[derive(Debug)]
struct BiCgStabWorkspace<V> {
    r: V,
    r_hat_0: V,
    p: V,
    v: V,
    t: V,
    phat: V,
    shat: V,
}

impl<V: Vector> BiCgStabWorkspace<V> {
    fn allocate<O: Operator<V>>(op: &O) -> Result<Self> {
        Ok(Self {
            r: op.new_vector("r")?,
            r_hat_0: op.new_vector("r_hat_0")?,
            p: op.new_vector("p")?,
            v: op.new_vector("v")?,
            t: op.new_vector("t")?,
            phat: op.new_vector("phat")?,
            shat: op.new_vector("shat")?,
        })
    }

    fn vectors(&mut self) -> [&mut V; 7] {
        [
            &mut self.r,
            &mut self.r_hat_0,
            &mut self.p,
            &mut self.v,
            &mut self.t,
            &mut self.phat,
            &mut self.shat,
        ]
    }
}

/// BiConjugate Gradient Stabilized, right preconditioned.
///
/// A recurrence scalar that vanishes relative to the vectors it is formed
/// from (`|(a, b)| <= breakdown_tol * ||a|| ||b||`) ends the solve as
/// `SolveStatus::Stalled`.
#[derive(Debug)]
pub struct BiCgStab<O, V> {
    base: IterativeBase<O, V>,
    breakdown_tol: f64,
    workspace: Option<BiCgStabWorkspace<V>>,
}

impl<O, V> BiCgStab<O, V>
where
    O: Operator<V>,
    V: Vector,
{
    pub fn new(criteria: ConvergenceCriteria) -> Self {
        Self {
            base: IterativeBase::new("BiCGStab", criteria),
            breakdown_tol: f64::EPSILON,
            workspace: None,
        }
    }

    pub fn with_breakdown_tol(mut self, breakdown_tol: f64) -> Self {
        self.breakdown_tol = breakdown_tol;
        self
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

impl<O, V> Default for BiCgStab<O, V>
where
    O: Operator<V>,
    V: Vector,
{
    fn default() -> Self {
        Self::new(ConvergenceCriteria::default())
    }
}

impl<O, V> Solver<O, V> for BiCgStab<O, V>
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
        let workspace = self.base.finish_build(BiCgStabWorkspace::allocate(op.as_ref()))?;
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
        let tol = self.breakdown_tol;
        let ws = self
            .workspace
            .as_mut()
            .ok_or_else(|| SolverError::NotBuilt(self.base.name.clone()))?;
        let IterativeBase {
            precond, control, ..
        } = &mut self.base;

        let mut residual_norm = residual(op.as_ref(), rhs, x, &mut ws.r)?;
        if let Some(status) = control.init(residual_norm) {
            return Ok(control.report(status));
        }
        info!("BiCGStab initial residual {:e}", residual_norm);

        ws.r_hat_0.copy_from(&ws.r)?;
        let r_hat_0_norm = residual_norm;
        let mut rho_prev = 1.0;
        let mut alpha = 1.0;
        let mut omega = 1.0;
        let mut first = true;

        let status = loop {
            let rho = ws.r_hat_0.dot(&ws.r)?;
            if rho.abs() <= tol * r_hat_0_norm * residual_norm {
                return Ok(control.stalled("rho", rho));
            }

            if first {
                ws.p.copy_from(&ws.r)?;
                first = false;
            } else {
                // p = r + beta * (p - omega * v)
                let beta = (rho / rho_prev) * (alpha / omega);
                ws.p.add_scale(&ws.v, -omega)?;
                ws.p.scale_add(beta, &ws.r)?;
            }

            precondition(precond, &ws.p, &mut ws.phat)?;
            op.apply(&ws.phat, &mut ws.v)?;

            let r_hat_0_dot_v = ws.r_hat_0.dot(&ws.v)?;
            if r_hat_0_dot_v.abs() <= tol * r_hat_0_norm * ws.v.norm()? {
                return Ok(control.stalled("(r_hat_0, v)", r_hat_0_dot_v));
            }
            alpha = rho / r_hat_0_dot_v;

            // s = r - alpha * v, kept in r
            ws.r.add_scale(&ws.v, -alpha)?;
            let s_norm = ws.r.norm()?;
            if control.is_converged(s_norm) {
                x.add_scale(&ws.phat, alpha)?;
                debug!("BiCGStab converged on the intermediate residual");
                break control.check(s_norm).unwrap_or(SolveStatus::Converged);
            }

            precondition(precond, &ws.r, &mut ws.shat)?;
            op.apply(&ws.shat, &mut ws.t)?;

            let t_dot_t = ws.t.dot(&ws.t)?;
            if t_dot_t == 0.0 {
                return Ok(control.stalled("(t, t)", t_dot_t));
            }
            omega = ws.t.dot(&ws.r)? / t_dot_t;

            // x = x + alpha * phat + omega * shat
            x.scale_add2(1.0, &ws.phat, alpha, &ws.shat, omega)?;
            // r = s - omega * t
            ws.r.add_scale(&ws.t, -omega)?;

            residual_norm = ws.r.norm()?;
            if let Some(status) = control.check(residual_norm) {
                break status;
            }
            if omega == 0.0 {
                return Ok(control.stalled("omega", omega));
            }
            rho_prev = rho;
        };

        info!(
            "BiCGStab finished: {:?} after {} iterations, residual {:e}",
            status,
            control.iteration(),
            control.current_residual()
        );
        Ok(control.report(status))
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        if let Some(ws) = self.workspace.as_mut() {
            for v in ws.vectors() {
                v.move_to_host()?;
            }
        }
        self.base.move_precond_to_host()
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        if let Some(ws) = self.workspace.as_mut() {
            for v in ws.vectors() {
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
