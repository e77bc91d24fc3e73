use super::sweep::Reordered;
use super::{applied, Lifecycle};
use crate::error::{Result, SolverError};
use crate::solver::{SolveReport, Solver, SolverState};
use serde::{Deserialize, Serialize};
use sparsolve_core::{LocalMatrix, LocalVector};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaxationConfig {
    /// Relaxation factor; `1.0` gives plain Gauss-Seidel.
    pub omega: f64,
}

impl Default for RelaxationConfig {
    fn default() -> Self {
        Self { omega: 1.0 }
    }
}

/// Gauss-Seidel family: `M = D / omega + L`, or its symmetric SSOR product
/// `omega / (2 - omega) (D / omega + L) (D / omega)^-1 (D / omega + U)`.
///
/// With `COLORED` the matrix is reordered by a greedy multicolouring at
/// build time and every colour is swept in parallel.
#[derive(Debug)]
pub struct Relaxation<const SYMMETRIC: bool, const COLORED: bool> {
    life: Lifecycle<LocalMatrix>,
    config: RelaxationConfig,
    sweep: Option<Reordered>,
    /// `omega / a_ii` in sweep order.
    inv_pivot: Vec<f64>,
}

pub type GaussSeidel = Relaxation<false, false>;
pub type Sgs = Relaxation<true, false>;
pub type MultiColoredGs = Relaxation<false, true>;
pub type MultiColoredSgs = Relaxation<true, true>;

impl<const SYMMETRIC: bool, const COLORED: bool> Relaxation<SYMMETRIC, COLORED> {
    pub fn new(config: RelaxationConfig) -> Self {
        let name = match (SYMMETRIC, COLORED) {
            (false, false) => "GS",
            (true, false) => "SGS",
            (false, true) => "MultiColoredGS",
            (true, true) => "MultiColoredSGS",
        };
        Self {
            life: Lifecycle::new(name),
            config,
            sweep: None,
            inv_pivot: Vec::new(),
        }
    }

    pub fn config(&self) -> &RelaxationConfig {
        &self.config
    }

    /// Number of colours of the build-time ordering, 1 when uncoloured.
    pub fn colors(&self) -> usize {
        self.sweep
            .as_ref()
            .and_then(|s| s.coloring.as_ref())
            .map_or(1, |c| c.colors())
    }

    fn refresh_pivots(&mut self) -> Result<()> {
        let sweep = self
            .sweep
            .as_ref()
            .ok_or_else(|| SolverError::NotBuilt(self.life.name.clone()))?;
        let omega = self.config.omega;
        self.inv_pivot = sweep.diagonal()?.iter().map(|d| omega / d).collect();
        Ok(())
    }
}

impl<const SYMMETRIC: bool, const COLORED: bool> Default for Relaxation<SYMMETRIC, COLORED> {
    fn default() -> Self {
        Self::new(RelaxationConfig::default())
    }
}

impl<const SYMMETRIC: bool, const COLORED: bool> Solver<LocalMatrix, LocalVector>
    for Relaxation<SYMMETRIC, COLORED>
{
    fn name(&self) -> &str {
        &self.life.name
    }

    fn set_operator(&mut self, op: Arc<LocalMatrix>) {
        self.life.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        let omega = self.config.omega;
        if !(omega > 0.0 && omega < 2.0) {
            return Err(SolverError::InvalidParameter(format!(
                "{}: relaxation must lie in (0, 2), got {}",
                self.life.name, omega
            )));
        }
        let op = self.life.begin_build::<LocalVector>()?;
        self.sweep = Some(Reordered::new(op.csr(), COLORED)?);
        if let Err(e) = self.refresh_pivots() {
            self.sweep = None;
            return Err(e);
        }
        log::debug!("{}: {} colour(s)", self.life.name, self.colors());
        self.life.finish_build();
        Ok(())
    }

    fn rebuild_numeric(&mut self) -> Result<()> {
        self.life.ensure_built()?;
        let op = self.life.operator()?;
        if let Some(sweep) = self.sweep.as_mut() {
            sweep.refresh(op.csr())?;
        }
        self.refresh_pivots()
    }

    fn clear(&mut self) {
        self.sweep = None;
        self.inv_pivot.clear();
        self.life.clear();
    }

    fn solve(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        let op = self.life.begin_solve(rhs, &*x)?;
        let sweep = self
            .sweep
            .as_mut()
            .ok_or_else(|| SolverError::NotBuilt(self.life.name.clone()))?;
        let context = op.context();
        let inv_pivot = self.inv_pivot.as_slice();

        sweep.load(rhs)?;
        sweep.forward(context, Some(inv_pivot));
        if SYMMETRIC {
            let omega = self.config.omega;
            sweep.chain();
            // y = (D / omega) y
            sweep.b.iter_mut().zip(inv_pivot).for_each(|(y, p)| *y /= p);
            sweep.backward(context, Some(inv_pivot));
            let scale = (2.0 - omega) / omega;
            sweep.x.iter_mut().for_each(|x| *x *= scale);
        }
        sweep.store(x)?;
        Ok(applied())
    }

    fn solve_zero_sol(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
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
        format!(
            "{} [{:?}] omega={}, colours={}",
            self.life.name,
            self.life.state,
            self.config.omega,
            self.colors()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparsolve_core::{Context, Triplet};

    fn lower_and_full(ctx: &Arc<Context>) -> Arc<LocalMatrix> {
        // [4 -1 0; -1 4 -1; 0 -1 4]
        let mut t = Vec::new();
        for i in 0..3 {
            t.push(Triplet::new(i, i, 4.0));
            if i > 0 {
                t.push(Triplet::new(i, i - 1, -1.0));
                t.push(Triplet::new(i - 1, i, -1.0));
            }
        }
        Arc::new(LocalMatrix::from_triplets(ctx, "A", 3, 3, &t).unwrap())
    }

    #[test]
    fn gauss_seidel_solves_lower_triangle() {
        let ctx = Context::host().unwrap();
        let mut gs = GaussSeidel::default();
        gs.set_operator(lower_and_full(&ctx));
        gs.build().unwrap();
        let rhs = LocalVector::from_slice(&ctx, "b", &[4.0, 3.0, 3.0]);
        let mut x = LocalVector::allocate(&ctx, "x", 3);
        gs.solve(&rhs, &mut x).unwrap();
        // (D + L) x = b
        let x = x.to_vec().unwrap();
        assert!((x[0] - 1.0).abs() < 1e-15);
        assert!((x[1] - 1.0).abs() < 1e-15);
        assert!((x[2] - 1.0).abs() < 1e-15);
    }

    #[test]
    fn symmetric_sweep_applies_ssor_inverse() {
        let ctx = Context::host().unwrap();
        let a = lower_and_full(&ctx);
        let mut sgs = Sgs::default();
        sgs.set_operator(Arc::clone(&a));
        sgs.build().unwrap();
        // M = (D + L) D^-1 (D + U); check M x = b for the result
        let rhs = LocalVector::from_slice(&ctx, "b", &[1.0, 2.0, 3.0]);
        let mut x = LocalVector::allocate(&ctx, "x", 3);
        sgs.solve(&rhs, &mut x).unwrap();
        let x = x.to_vec().unwrap();
        let u = [4.0 * x[0] - x[1], 4.0 * x[1] - x[2], 4.0 * x[2]];
        let d_inv_u = [u[0] / 4.0, u[1] / 4.0, u[2] / 4.0];
        let m_x = [
            4.0 * d_inv_u[0],
            -d_inv_u[0] + 4.0 * d_inv_u[1],
            -d_inv_u[1] + 4.0 * d_inv_u[2],
        ];
        for (got, want) in m_x.iter().zip([1.0, 2.0, 3.0]) {
            assert!((got - want).abs() < 1e-13);
        }
    }

    #[test]
    fn zero_diagonal_is_singular() {
        let ctx = Context::host().unwrap();
        let t = vec![Triplet::new(0, 1, 1.0), Triplet::new(1, 0, 1.0)];
        let a = Arc::new(LocalMatrix::from_triplets(&ctx, "A", 2, 2, &t).unwrap());
        let mut gs = MultiColoredGs::default();
        gs.set_operator(a);
        assert!(matches!(
            gs.build(),
            Err(SolverError::SingularSystem { size: 2, .. })
        ));
        assert_eq!(gs.state(), SolverState::Uninitialized);
    }

    #[test]
    fn relaxation_outside_range_is_rejected() {
        let ctx = Context::host().unwrap();
        let mut sgs = MultiColoredSgs::new(RelaxationConfig { omega: 2.5 });
        sgs.set_operator(lower_and_full(&ctx));
        assert!(matches!(sgs.build(), Err(SolverError::InvalidParameter(_))));
    }
}
