use crate::error::{Result, SolverError};
use crate::solver::{
    precondition, residual, ConvergenceCriteria, IterativeBase, SolveMode, SolveReport, Solver,
    SolverState,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sparsolve_core::{Operator, Vector};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdrConfig {
    /// Shadow space dimension.
    pub s: usize,
    /// Seed of the shadow space basis. Must be positive.
    pub seed: u64,
    /// Lower bound on `|(t, r)| / (||t|| ||r||)` before omega is enlarged.
    pub kappa: f64,
    /// `M(k, k)` is singular when `|M(k, k)| <= breakdown_tol * ||G_k||`.
    pub breakdown_tol: f64,
}

impl Default for IdrConfig {
    fn default() -> Self {
        Self {
            s: 4,
            seed: 0x5EED,
            kappa: 0.7,
            breakdown_tol: f64::EPSILON,
        }
    }
}

#[derive(Debug)]
struct IdrWorkspace<V> {
    r: V,
    v: V,
    t: V,
    g: Vec<V>,
    u: Vec<V>,
    /// Orthonormal shadow space basis.
    p: Vec<V>,
    c: Vec<f64>,
    f: Vec<f64>,
    /// `s x s`, row-major.
    m: Vec<f64>,
}

impl<V: Vector> IdrWorkspace<V> {
    fn vectors(&mut self) -> impl Iterator<Item = &mut V> {
        [&mut self.r, &mut self.v, &mut self.t]
            .into_iter()
            .chain(self.g.iter_mut())
            .chain(self.u.iter_mut())
            .chain(self.p.iter_mut())
    }
}

/// Seeded normal vectors orthonormalised with modified Gram-Schmidt.
fn shadow_space<O, V>(op: &O, s: usize, seed: u64) -> Result<Vec<V>>
where
    O: Operator<V>,
    V: Vector,
{
    let mut p: Vec<V> = Vec::with_capacity(s);
    for i in 0..s {
        let mut pi = op.new_vector(&format!("P{}", i))?;
        pi.set_random_normal(seed.wrapping_add(i as u64), 0.0, 1.0)?;
        for pj in &p {
            let proj = pi.dot(pj)?;
            pi.add_scale(pj, -proj)?;
        }
        let norm = pi.norm()?;
        if norm == 0.0 {
            return Err(SolverError::InvalidParameter(format!(
                "shadow space of dimension {} is degenerate for a system of size {}",
                s,
                op.rows()
            )));
        }
        pi.scale(1.0 / norm)?;
        p.push(pi);
    }
    Ok(p)
}

/// Induced Dimension Reduction, IDR(s) with biorthogonalisation.
///
/// Each sweep takes `s` steps in the current IDR space followed by one
/// dimension reduction step, `s + 1` operator applications in total.
#[derive(Debug)]
pub struct Idr<O, V> {
    base: IterativeBase<O, V>,
    config: IdrConfig,
    built_s: usize,
    workspace: Option<IdrWorkspace<V>>,
}

impl<O, V> Idr<O, V>
where
    O: Operator<V>,
    V: Vector,
{
    pub fn new(criteria: ConvergenceCriteria, config: IdrConfig) -> Self {
        Self {
            base: IterativeBase::new("IDR", criteria),
            config,
            built_s: 0,
            workspace: None,
        }
    }

    pub fn config(&self) -> &IdrConfig {
        &self.config
    }

    /// Changes `s`. A built solver regenerates its shadow space at the next
    /// `rebuild_numeric`.
    pub fn set_shadow_space(&mut self, s: usize) {
        self.config.s = s;
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

    fn validate(&self) -> Result<()> {
        if self.config.s == 0 {
            return Err(SolverError::InvalidParameter(
                "IDR: shadow space dimension must be positive".to_string(),
            ));
        }
        if self.config.seed == 0 {
            return Err(SolverError::InvalidParameter(
                "IDR: seed must be positive".to_string(),
            ));
        }
        if !(self.config.kappa > 0.0 && self.config.kappa <= 1.0) {
            return Err(SolverError::InvalidParameter(format!(
                "IDR: kappa must lie in (0, 1], got {}",
                self.config.kappa
            )));
        }
        Ok(())
    }

    fn allocate(&self, op: &O) -> Result<IdrWorkspace<V>> {
        let s = self.config.s;
        let vectors = |prefix: &str| {
            (0..s)
                .map(|i| op.new_vector(&format!("{}{}", prefix, i)))
                .collect::<sparsolve_core::error::Result<Vec<V>>>()
        };
        Ok(IdrWorkspace {
            r: op.new_vector("r")?,
            v: op.new_vector("v")?,
            t: op.new_vector("t")?,
            g: vectors("G")?,
            u: vectors("U")?,
            p: shadow_space(op, s, self.config.seed)?,
            c: vec![0.0; s],
            f: vec![0.0; s],
            m: vec![0.0; s * s],
        })
    }

    fn solve_non_precond(&mut self, op: &O, rhs: &V, x: &mut V) -> Result<SolveReport> {
        self.sweeps::<false>(op, rhs, x)
    }

    fn solve_precond(&mut self, op: &O, rhs: &V, x: &mut V) -> Result<SolveReport> {
        self.sweeps::<true>(op, rhs, x)
    }

    fn sweeps<const PRECOND: bool>(&mut self, op: &O, rhs: &V, x: &mut V) -> Result<SolveReport> {
        let IdrConfig {
            s,
            kappa,
            breakdown_tol,
            ..
        } = self.config;
        let ws = self
            .workspace
            .as_mut()
            .ok_or_else(|| SolverError::NotBuilt(self.base.name.clone()))?;
        let IterativeBase {
            precond, control, ..
        } = &mut self.base;

        let norm = residual(op, rhs, x, &mut ws.r)?;
        if let Some(status) = control.init(norm) {
            return Ok(control.report(status));
        }
        info!("IDR({}) initial residual {:e}", s, norm);

        for k in 0..s {
            ws.g[k].zeros()?;
            ws.u[k].zeros()?;
        }
        ws.m.iter_mut().for_each(|m| *m = 0.0);
        for k in 0..s {
            ws.m[k * s + k] = 1.0;
        }
        let mut omega = 1.0;

        let status = 'outer: loop {
            for i in 0..s {
                ws.f[i] = ws.p[i].dot(&ws.r)?;
            }
            let f_max = ws.f.iter().fold(0.0_f64, |acc, f| acc.max(f.abs()));
            if f_max <= f64::MIN_POSITIVE {
                return Ok(control.stalled("max |f|", f_max));
            }

            for k in 0..s {
                // M(k..s, k..s) c(k..s) = f(k..s), lower triangular
                for i in k..s {
                    let mut sum = ws.f[i];
                    for l in k..i {
                        sum -= ws.m[i * s + l] * ws.c[l];
                    }
                    ws.c[i] = sum / ws.m[i * s + i];
                }

                // v = r - G(k..s) c(k..s)
                ws.v.copy_from(&ws.r)?;
                for i in k..s {
                    ws.v.add_scale(&ws.g[i], -ws.c[i])?;
                }
                if PRECOND {
                    precondition(precond, &ws.v, &mut ws.t)?;
                    std::mem::swap(&mut ws.v, &mut ws.t);
                }

                // U_k = omega * v + U(k..s) c(k..s)
                {
                    let (head, tail) = ws.u.split_at_mut(k + 1);
                    let uk = &mut head[k];
                    uk.scale_add_scale(ws.c[k], &ws.v, omega)?;
                    for (offset, ui) in tail.iter().enumerate() {
                        uk.add_scale(ui, ws.c[k + 1 + offset])?;
                    }
                }
                op.apply(&ws.u[k], &mut ws.g[k])?;

                // Make G_k orthogonal to P_0..P_{k-1}
                {
                    let (g_done, g_rest) = ws.g.split_at_mut(k);
                    let (u_done, u_rest) = ws.u.split_at_mut(k);
                    let (gk, uk) = (&mut g_rest[0], &mut u_rest[0]);
                    for i in 0..k {
                        let alpha = ws.p[i].dot(gk)? / ws.m[i * s + i];
                        gk.add_scale(&g_done[i], -alpha)?;
                        uk.add_scale(&u_done[i], -alpha)?;
                    }
                }
                for i in k..s {
                    ws.m[i * s + k] = ws.p[i].dot(&ws.g[k])?;
                }

                let mkk = ws.m[k * s + k];
                if mkk.abs() <= breakdown_tol * ws.g[k].norm()? {
                    return Ok(control.stalled("M(k, k)", mkk));
                }

                let beta = ws.f[k] / mkk;
                ws.r.add_scale(&ws.g[k], -beta)?;
                x.add_scale(&ws.u[k], beta)?;
                if let Some(status) = control.check(ws.r.norm()?) {
                    break 'outer status;
                }
                for i in k + 1..s {
                    ws.f[i] -= beta * ws.m[i * s + k];
                }
            }

            // Dimension reduction step
            if PRECOND {
                precondition(precond, &ws.r, &mut ws.v)?;
            } else {
                ws.v.copy_from(&ws.r)?;
            }
            op.apply(&ws.v, &mut ws.t)?;

            let t_norm = ws.t.norm()?;
            if t_norm == 0.0 {
                return Ok(control.stalled("(t, t)", 0.0));
            }
            let r_norm = ws.r.norm()?;
            let ts = ws.t.dot(&ws.r)?;
            let rho = (ts / (t_norm * r_norm)).abs();
            omega = ts / (t_norm * t_norm);
            if rho < kappa {
                omega *= kappa / rho;
            }
            if omega == 0.0 || !omega.is_finite() {
                return Ok(control.stalled("omega", omega));
            }
            debug!("IDR dimension reduction: omega = {:e}", omega);

            ws.r.add_scale(&ws.t, -omega)?;
            x.add_scale(&ws.v, omega)?;
            if let Some(status) = control.check(ws.r.norm()?) {
                break status;
            }
        };

        info!(
            "IDR({}) finished: {:?} after {} iterations, residual {:e}",
            s,
            status,
            control.iteration(),
            control.current_residual()
        );
        Ok(control.report(status))
    }
}

impl<O, V> Solver<O, V> for Idr<O, V>
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
        self.validate()?;
        let op = self.base.begin_build()?;
        let workspace = self.allocate(op.as_ref());
        self.workspace = Some(self.base.finish_build(workspace)?);
        self.built_s = self.config.s;
        Ok(())
    }

    /// Rebuilds the preconditioner numerically. The shadow space is
    /// regenerated only when `s` changed since the last build.
    fn rebuild_numeric(&mut self) -> Result<()> {
        let op = self.base.rebuild_numeric()?;
        if self.config.s != self.built_s {
            self.validate()?;
            info!("IDR: shadow space {} -> {}", self.built_s, self.config.s);
            self.workspace = Some(self.allocate(op.as_ref())?);
            self.built_s = self.config.s;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.workspace = None;
        self.built_s = 0;
        self.base.clear();
    }

    fn solve(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport> {
        let op = self.base.begin_solve(rhs, x)?;
        match self.base.mode {
            SolveMode::NonPrecond => self.solve_non_precond(op.as_ref(), rhs, x),
            SolveMode::Precond => self.solve_precond(op.as_ref(), rhs, x),
        }
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
            "{}, s={} seed={:#x} kappa={}",
            self.base.describe(),
            self.config.s,
            self.config.seed,
            self.config.kappa
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparsolve_core::{Context, LocalMatrix, LocalVector, Triplet};

    fn tridiag(ctx: &Arc<Context>, n: usize) -> Arc<LocalMatrix> {
        let mut t = Vec::new();
        for i in 0..n {
            t.push(Triplet::new(i, i, 4.0));
            if i > 0 {
                t.push(Triplet::new(i, i - 1, -1.0));
            }
            if i + 1 < n {
                t.push(Triplet::new(i, i + 1, -1.0));
            }
        }
        Arc::new(LocalMatrix::from_triplets(ctx, "A", n, n, &t).unwrap())
    }

    #[test]
    fn shadow_space_is_orthonormal_and_reproducible() {
        let ctx = Context::host().unwrap();
        let a = tridiag(&ctx, 20);
        let p: Vec<LocalVector> = shadow_space(a.as_ref(), 4, 0x5EED).unwrap();
        let q: Vec<LocalVector> = shadow_space(a.as_ref(), 4, 0x5EED).unwrap();
        for i in 0..4 {
            assert_eq!(p[i].to_vec().unwrap(), q[i].to_vec().unwrap());
            for j in 0..4 {
                let d = p[i].dot(&p[j]).unwrap();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((d - expected).abs() < 1e-12, "P{}.P{} = {}", i, j, d);
            }
        }
    }

    #[test]
    fn zero_seed_is_rejected() {
        let ctx = Context::host().unwrap();
        let mut idr: Idr<LocalMatrix, LocalVector> = Idr::new(
            ConvergenceCriteria::default(),
            IdrConfig {
                seed: 0,
                ..IdrConfig::default()
            },
        );
        idr.set_operator(tridiag(&ctx, 8));
        assert!(matches!(idr.build(), Err(SolverError::InvalidParameter(_))));
        assert_eq!(idr.state(), SolverState::Uninitialized);
    }

    #[test]
    fn shadow_space_change_takes_effect_on_rebuild() {
        let ctx = Context::host().unwrap();
        let a = tridiag(&ctx, 30);
        let mut idr: Idr<LocalMatrix, LocalVector> =
            Idr::new(ConvergenceCriteria::default(), IdrConfig::default());
        idr.set_operator(Arc::clone(&a));
        idr.build().unwrap();
        idr.set_shadow_space(2);
        idr.rebuild_numeric().unwrap();
        assert_eq!(idr.workspace.as_ref().unwrap().p.len(), 2);

        let b = LocalVector::from_slice(&ctx, "b", &vec![1.0; 30]);
        let mut x = LocalVector::allocate(&ctx, "x", 30);
        let report = idr.solve(&b, &mut x).unwrap();
        assert!(report.converged(), "{:?}", report);
    }
}
