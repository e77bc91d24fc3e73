use crate::error::{Result, SolverError};
use crate::solver::{
    precondition, residual, ConvergenceCriteria, IterativeBase, SolveReport, SolveStatus, Solver,
    SolverState,
};
use log::info;
use serde::{Deserialize, Serialize};
use sparsolve_core::{Operator, Vector};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmresConfig {
    /// Krylov basis size between restarts.
    pub basis_size: usize,
}

impl Default for GmresConfig {
    fn default() -> Self {
        Self { basis_size: 30 }
    }
}

#[derive(Debug)]
struct GmresWorkspace<V> {
    w: V,
    z: V,
    basis: Vec<V>,
    /// Preconditioned directions, flexible variant only.
    directions: Vec<V>,
    /// Hessenberg matrix, column-major with `m + 1` rows.
    h: Vec<f64>,
    cs: Vec<f64>,
    sn: Vec<f64>,
    g: Vec<f64>,
    y: Vec<f64>,
}

impl<V: Vector> GmresWorkspace<V> {
    fn vectors(&mut self) -> impl Iterator<Item = &mut V> {
        [&mut self.w, &mut self.z]
            .into_iter()
            .chain(self.basis.iter_mut())
            .chain(self.directions.iter_mut())
    }
}

/// Plane rotation `(c, s)` zeroing `b` in `(a, b)`.
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else if b.abs() > a.abs() {
        let t = a / b;
        let s = 1.0 / (1.0 + t * t).sqrt();
        (t * s, s)
    } else {
        let t = b / a;
        let c = 1.0 / (1.0 + t * t).sqrt();
        (c, c * t)
    }
}

/// Restarted GMRES with right preconditioning and Givens rotations.
///
/// With `FLEXIBLE` the preconditioned directions are stored, so the
/// preconditioner may change between iterations (FGMRES).
#[derive(Debug)]
pub struct RestartedGmres<O, V, const FLEXIBLE: bool> {
    base: IterativeBase<O, V>,
    config: GmresConfig,
    workspace: Option<GmresWorkspace<V>>,
}

pub type Gmres<O, V> = RestartedGmres<O, V, false>;
pub type Fgmres<O, V> = RestartedGmres<O, V, true>;

impl<O, V, const FLEXIBLE: bool> RestartedGmres<O, V, FLEXIBLE>
where
    O: Operator<V>,
    V: Vector,
{
    pub fn new(criteria: ConvergenceCriteria, config: GmresConfig) -> Self {
        let name = if FLEXIBLE { "FGMRES" } else { "GMRES" };
        Self {
            base: IterativeBase::new(name, criteria),
            config,
            workspace: None,
        }
    }

    pub fn config(&self) -> &GmresConfig {
        &self.config
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

    fn allocate(op: &O, m: usize) -> Result<GmresWorkspace<V>> {
        let basis = (0..=m)
            .map(|i| op.new_vector(&format!("v{}", i)))
            .collect::<sparsolve_core::error::Result<Vec<_>>>()?;
        let directions = if FLEXIBLE {
            (0..m)
                .map(|i| op.new_vector(&format!("z{}", i)))
                .collect::<sparsolve_core::error::Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        Ok(GmresWorkspace {
            w: op.new_vector("w")?,
            z: op.new_vector("z")?,
            basis,
            directions,
            h: vec![0.0; (m + 1) * m],
            cs: vec![0.0; m],
            sn: vec![0.0; m],
            g: vec![0.0; m + 1],
            y: vec![0.0; m],
        })
    }
}

impl<O, V, const FLEXIBLE: bool> Solver<O, V> for RestartedGmres<O, V, FLEXIBLE>
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
        let m = self.config.basis_size;
        if m == 0 {
            return Err(SolverError::InvalidParameter(format!(
                "{}: basis size must be positive",
                self.base.name
            )));
        }
        let op = self.base.begin_build()?;
        let workspace = Self::allocate(op.as_ref(), m);
        self.workspace = Some(self.base.finish_build(workspace)?);
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
            name,
            precond,
            control,
            ..
        } = &mut self.base;
        let m = self.config.basis_size;
        let at = |i: usize, j: usize| j * (m + 1) + i;

        let mut norm = residual(op.as_ref(), rhs, x, &mut ws.w)?;
        if let Some(status) = control.init(norm) {
            return Ok(control.report(status));
        }
        info!("{} initial residual {:e}", name, norm);

        let status = loop {
            ws.basis[0].copy_from(&ws.w)?;
            ws.basis[0].scale(1.0 / norm)?;
            ws.g.iter_mut().for_each(|g| *g = 0.0);
            ws.g[0] = norm;

            let mut status = None;
            let mut k = 0;
            for j in 0..m {
                // w = A M^-1 v_j
                if FLEXIBLE {
                    precondition(precond, &ws.basis[j], &mut ws.directions[j])?;
                    op.apply(&ws.directions[j], &mut ws.w)?;
                } else {
                    precondition(precond, &ws.basis[j], &mut ws.z)?;
                    op.apply(&ws.z, &mut ws.w)?;
                }

                for i in 0..=j {
                    let hij = ws.w.dot(&ws.basis[i])?;
                    ws.h[at(i, j)] = hij;
                    ws.w.add_scale(&ws.basis[i], -hij)?;
                }
                let h_next = ws.w.norm()?;
                ws.h[at(j + 1, j)] = h_next;

                for i in 0..j {
                    let (hi, hn) = (ws.h[at(i, j)], ws.h[at(i + 1, j)]);
                    ws.h[at(i, j)] = ws.cs[i] * hi + ws.sn[i] * hn;
                    ws.h[at(i + 1, j)] = -ws.sn[i] * hi + ws.cs[i] * hn;
                }
                let (c, s) = givens(ws.h[at(j, j)], h_next);
                ws.cs[j] = c;
                ws.sn[j] = s;
                ws.h[at(j, j)] = c * ws.h[at(j, j)] + s * h_next;
                ws.h[at(j + 1, j)] = 0.0;
                ws.g[j + 1] = -s * ws.g[j];
                ws.g[j] *= c;
                k = j + 1;

                status = control.check(ws.g[j + 1].abs());
                if status.is_some() || h_next == 0.0 {
                    break;
                }
                ws.basis[j + 1].copy_from(&ws.w)?;
                ws.basis[j + 1].scale(1.0 / h_next)?;
            }

            // y = H(0..k, 0..k)^-1 g(0..k)
            for i in (0..k).rev() {
                let mut sum = ws.g[i];
                for l in i + 1..k {
                    sum -= ws.h[at(i, l)] * ws.y[l];
                }
                let pivot = ws.h[at(i, i)];
                if pivot == 0.0 {
                    return Ok(control.stalled("H(i, i)", pivot));
                }
                ws.y[i] = sum / pivot;
            }

            if FLEXIBLE {
                for i in 0..k {
                    x.add_scale(&ws.directions[i], ws.y[i])?;
                }
            } else {
                ws.w.zeros()?;
                for i in 0..k {
                    ws.w.add_scale(&ws.basis[i], ws.y[i])?;
                }
                precondition(precond, &ws.w, &mut ws.z)?;
                x.add_scale(&ws.z, 1.0)?;
            }

            if let Some(status) = status {
                break status;
            }
            norm = residual(op.as_ref(), rhs, x, &mut ws.w)?;
            if control.is_converged(norm) {
                break SolveStatus::Converged;
            }
            log::debug!("{} restart at iteration {}, residual {:e}", name, control.iteration(), norm);
        };

        info!(
            "{} finished: {:?} after {} iterations, residual {:e}",
            name,
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
        format!(
            "{}, basis size {}",
            self.base.describe(),
            self.config.basis_size
        )
    }
}
