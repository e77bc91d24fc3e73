use super::aggregation::{aggregate, is_strong, Aggregation};
use crate::algorithms::FixedPoint;
use crate::direct::Inversion;
use crate::error::{Result, SolverError};
use crate::preconditioners::MultiColoredGs;
use crate::solver::{
    check_buildable, residual, ConvergenceCriteria, IterationControl, SolveReport, Solver,
    SolverState,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sparsolve_core::{LocalMatrix, LocalVector, Operator, Residency, SparseMatrix, Triplet, Vector};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cycle {
    /// One coarse correction per level.
    V,
    /// Two coarse corrections per level.
    W,
}

impl Cycle {
    fn gamma(self) -> usize {
        match self {
            Cycle::V => 1,
            Cycle::W => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmgConfig {
    /// Strength threshold on the finest level, halved on each coarser one.
    pub coupling_strength: f64,
    /// Prolongation smoothing weight; `0` gives plain aggregation.
    pub interp_relax: f64,
    pub coarsest_size: usize,
    pub max_levels: usize,
    pub cycle: Cycle,
    pub pre_smooth: usize,
    pub post_smooth: usize,
    pub smoother_relax: f64,
}

impl Default for AmgConfig {
    fn default() -> Self {
        Self {
            coupling_strength: 0.01,
            interp_relax: 2.0 / 3.0,
            coarsest_size: 300,
            max_levels: 20,
            cycle: Cycle::V,
            pre_smooth: 1,
            post_smooth: 2,
            smoother_relax: 1.3,
        }
    }
}

impl AmgConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |what: String| Err(SolverError::InvalidParameter(format!("AMG: {}", what)));
        if !(self.coupling_strength > 0.0 && self.coupling_strength < 1.0) {
            return invalid(format!("coupling strength {} not in (0, 1)", self.coupling_strength));
        }
        if !(self.interp_relax >= 0.0 && self.interp_relax.is_finite()) {
            return invalid(format!("interpolation relaxation {}", self.interp_relax));
        }
        if self.max_levels == 0 {
            return invalid("max_levels must be positive".to_string());
        }
        if !(self.smoother_relax > 0.0) {
            return invalid(format!("smoother relaxation {}", self.smoother_relax));
        }
        Ok(())
    }
}

/// Grid transfer from a level to the next coarser one, with the level's
/// smoother and work vectors.
#[derive(Debug)]
struct Transfer {
    aggregation: Aggregation,
    eps: f64,
    prolongation: LocalMatrix,
    restriction: LocalMatrix,
    smoother: FixedPoint<LocalMatrix, LocalVector>,
    r: LocalVector,
    coarse_rhs: LocalVector,
    coarse_sol: LocalVector,
}

/// One level of the hierarchy. The coarsest level has no transfer.
#[derive(Debug)]
pub struct AmgLevel {
    op: Arc<LocalMatrix>,
    transfer: Option<Transfer>,
}

impl AmgLevel {
    pub fn size(&self) -> usize {
        self.op.rows()
    }

    pub fn operator(&self) -> &Arc<LocalMatrix> {
        &self.op
    }

    /// `P`: this level to the next coarser, `size x coarse size`.
    pub fn prolongation(&self) -> Option<&LocalMatrix> {
        self.transfer.as_ref().map(|t| &t.prolongation)
    }

    /// `R = P^T`.
    pub fn restriction(&self) -> Option<&LocalMatrix> {
        self.transfer.as_ref().map(|t| &t.restriction)
    }

    pub fn aggregation(&self) -> Option<&Aggregation> {
        self.transfer.as_ref().map(|t| &t.aggregation)
    }
}

/// `P = (I - relax * D_F^-1 A_F) P0` with `A_F` the filtered operator: weak
/// couplings are dropped and lumped into the diagonal.
pub fn smoothed_prolongation(
    a: &SparseMatrix,
    aggregation: &Aggregation,
    eps: f64,
    relax: f64,
) -> Result<SparseMatrix> {
    let n = a.rows();
    let diag = a.extract_diagonal();
    let mut triplets = Vec::with_capacity(a.nnz());
    for i in 0..n {
        if let Some(agg) = aggregation.map[i] {
            triplets.push(Triplet::new(i, agg, 1.0));
        }
        if relax == 0.0 {
            continue;
        }
        let (cols, vals) = a.row(i);
        let mut filtered_diag = diag[i];
        let mut strong = Vec::with_capacity(cols.len());
        for (&j, &v) in cols.iter().zip(vals) {
            if j == i {
                continue;
            }
            if is_strong(v, diag[i], diag[j], eps) {
                strong.push((j, v));
            } else {
                filtered_diag += v;
            }
        }
        if filtered_diag == 0.0 {
            continue;
        }
        let w = relax / filtered_diag;
        if let Some(agg) = aggregation.map[i] {
            triplets.push(Triplet::new(i, agg, -w * filtered_diag));
        }
        for (j, v) in strong {
            if let Some(agg) = aggregation.map[j] {
                triplets.push(Triplet::new(i, agg, -w * v));
            }
        }
    }
    Ok(SparseMatrix::from_triplets(n, aggregation.count, &triplets)?)
}

/// Smoothed aggregation algebraic multigrid.
///
/// Stand-alone it iterates cycles under its convergence criteria; as a
/// preconditioner it runs one cycle per application (see
/// [`SmoothedAmg::preconditioner`]).
#[derive(Debug)]
pub struct SmoothedAmg {
    name: String,
    config: AmgConfig,
    op: Option<Arc<LocalMatrix>>,
    control: IterationControl,
    levels: Vec<AmgLevel>,
    coarse: Option<Inversion>,
    r: Option<LocalVector>,
    state: SolverState,
}

impl SmoothedAmg {
    pub fn new(config: AmgConfig, criteria: ConvergenceCriteria) -> Self {
        Self {
            name: "SmoothedAMG".to_string(),
            config,
            op: None,
            control: IterationControl::new(criteria),
            levels: Vec::new(),
            coarse: None,
            r: None,
            state: SolverState::Uninitialized,
        }
    }

    /// One cycle per application.
    pub fn preconditioner(config: AmgConfig) -> Self {
        Self::new(config, ConvergenceCriteria::fixed_iterations(1))
    }

    pub fn config(&self) -> &AmgConfig {
        &self.config
    }

    pub fn control(&self) -> &IterationControl {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut IterationControl {
        &mut self.control
    }

    /// Finest level first.
    pub fn levels(&self) -> &[AmgLevel] {
        &self.levels
    }

    fn operator(&self) -> Result<Arc<LocalMatrix>> {
        self.op
            .clone()
            .ok_or_else(|| SolverError::MissingOperator(self.name.clone()))
    }

    /// `P`, `R` and `A_c = R A P` for `a`, placed where `a` lives.
    fn galerkin(
        &self,
        a: &LocalMatrix,
        aggregation: &Aggregation,
        eps: f64,
        level: usize,
    ) -> Result<(LocalMatrix, LocalMatrix, LocalMatrix)> {
        let p = smoothed_prolongation(a.csr(), aggregation, eps, self.config.interp_relax)?;
        let mut prolongation = a.derive(&format!("P{}", level), p);
        let mut restriction = prolongation.transpose(&format!("R{}", level));
        let ap = a.matmul(&prolongation, "AP")?;
        let mut coarse = restriction.matmul(&ap, &format!("A{}", level + 1))?;
        if a.is_accelerator() {
            prolongation.move_to_accelerator()?;
            restriction.move_to_accelerator()?;
            coarse.move_to_accelerator()?;
        }
        Ok((prolongation, restriction, coarse))
    }

    fn smoother(&self, op: &Arc<LocalMatrix>) -> Result<FixedPoint<LocalMatrix, LocalVector>> {
        let mut smoother = FixedPoint::new(
            ConvergenceCriteria::fixed_iterations(self.config.pre_smooth),
            self.config.smoother_relax,
        );
        smoother.set_preconditioner(Box::new(MultiColoredGs::default()))?;
        smoother.set_operator(Arc::clone(op));
        smoother.build()?;
        Ok(smoother)
    }

    fn coarse_solver(op: &Arc<LocalMatrix>) -> Result<Inversion> {
        let mut coarse = Inversion::new();
        coarse.set_operator(Arc::clone(op));
        coarse.build()?;
        Ok(coarse)
    }

    fn make_transfer(
        &self,
        op: &Arc<LocalMatrix>,
        aggregation: Aggregation,
        eps: f64,
        level: usize,
    ) -> Result<(Transfer, Arc<LocalMatrix>)> {
        let (prolongation, restriction, coarse) = self.galerkin(op, &aggregation, eps, level)?;
        let coarse = Arc::new(coarse);
        let transfer = Transfer {
            aggregation,
            eps,
            prolongation,
            restriction,
            smoother: self.smoother(op)?,
            r: op.new_vector("r")?,
            coarse_rhs: coarse.new_vector("coarse rhs")?,
            coarse_sol: coarse.new_vector("coarse x")?,
        };
        Ok((transfer, coarse))
    }

    fn hierarchy_info(&self) -> String {
        self.levels
            .iter()
            .map(|l| format!("{} (nnz {})", l.size(), l.op.nnz()))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// One cycle on `levels[0]`: `x` is improved towards `A x = rhs`.
fn cycle(
    levels: &mut [AmgLevel],
    coarse: &mut Inversion,
    config: &AmgConfig,
    rhs: &LocalVector,
    x: &mut LocalVector,
) -> Result<()> {
    let Some((level, rest)) = levels.split_first_mut() else {
        return Ok(());
    };
    let Some(t) = level.transfer.as_mut() else {
        coarse.solve(rhs, x)?;
        return Ok(());
    };
    let plain = config.interp_relax == 0.0;

    if config.pre_smooth > 0 {
        t.smoother
            .set_criteria(ConvergenceCriteria::fixed_iterations(config.pre_smooth));
        t.smoother.solve(rhs, x)?;
    }

    residual(level.op.as_ref(), rhs, x, &mut t.r)?;
    if plain {
        t.coarse_rhs.restriction(&t.r, &t.aggregation.map)?;
    } else {
        t.restriction.apply(&t.r, &mut t.coarse_rhs)?;
    }
    t.coarse_sol.zeros()?;
    for _ in 0..config.cycle.gamma() {
        cycle(rest, coarse, config, &t.coarse_rhs, &mut t.coarse_sol)?;
    }
    if plain {
        t.r.prolongation(&t.coarse_sol, &t.aggregation.map)?;
        x.add_scale(&t.r, 1.0)?;
    } else {
        t.prolongation.apply_add(&t.coarse_sol, 1.0, x)?;
    }

    if config.post_smooth > 0 {
        t.smoother
            .set_criteria(ConvergenceCriteria::fixed_iterations(config.post_smooth));
        t.smoother.solve(rhs, x)?;
    }
    Ok(())
}

impl Solver<LocalMatrix, LocalVector> for SmoothedAmg {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_operator(&mut self, op: Arc<LocalMatrix>) {
        self.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        check_buildable(self.state, &self.name, self.op.is_some())?;
        self.config.validate()?;
        let fine = self.operator()?;
        if !fine.is_square() {
            return Err(SolverError::InvalidParameter(format!(
                "{} needs a square operator, got {}x{}",
                self.name,
                fine.rows(),
                fine.cols()
            )));
        }
        info!("Building {} for {}", self.name, fine.info());

        let mut levels = Vec::new();
        let mut current = Arc::clone(&fine);
        let mut eps = self.config.coupling_strength;
        loop {
            let rows = current.rows();
            if rows <= self.config.coarsest_size || levels.len() + 1 >= self.config.max_levels {
                break;
            }
            let aggregation = aggregate(current.csr(), eps);
            if aggregation.count == 0 || aggregation.count >= rows {
                warn!(
                    "{}: aggregation on level {} degenerated ({} aggregates for {} rows), coarsening stops",
                    self.name,
                    levels.len(),
                    aggregation.count,
                    rows
                );
                break;
            }
            debug!(
                "{}: level {} eps={:e}, {} rows -> {} aggregates, {} unaggregated",
                self.name,
                levels.len(),
                eps,
                rows,
                aggregation.count,
                aggregation.unaggregated()
            );
            let (transfer, coarse) = self.make_transfer(&current, aggregation, eps, levels.len())?;
            levels.push(AmgLevel {
                op: current,
                transfer: Some(transfer),
            });
            current = coarse;
            eps *= 0.5;
        }

        self.coarse = Some(Self::coarse_solver(&current)?);
        levels.push(AmgLevel {
            op: current,
            transfer: None,
        });
        self.levels = levels;
        self.r = Some(fine.new_vector("r")?);
        info!(
            "{}: {} levels, {}",
            self.name,
            self.levels.len(),
            self.hierarchy_info()
        );
        self.state = SolverState::Built;
        Ok(())
    }

    /// Keeps the aggregates; recomputes `P`, `R`, the coarse operators, the
    /// smoothers and the coarse direct solver.
    fn rebuild_numeric(&mut self) -> Result<()> {
        if self.state != SolverState::Built {
            return Err(SolverError::NotBuilt(self.name.clone()));
        }
        let mut current = self.operator()?;
        let relax = self.config.interp_relax;
        for l in 0..self.levels.len() {
            let level_op = Arc::clone(&current);
            let next = match self.levels[l].transfer.as_ref() {
                Some(t) => {
                    let p = smoothed_prolongation(level_op.csr(), &t.aggregation, t.eps, relax)?;
                    Some(p)
                }
                None => None,
            };
            let level = &mut self.levels[l];
            level.op = Arc::clone(&level_op);
            match (level.transfer.as_mut(), next) {
                (Some(t), Some(p)) => {
                    let mut prolongation = level_op.derive(&format!("P{}", l), p);
                    let mut restriction = prolongation.transpose(&format!("R{}", l));
                    let ap = level_op.matmul(&prolongation, "AP")?;
                    let mut coarse = restriction.matmul(&ap, &format!("A{}", l + 1))?;
                    if level_op.is_accelerator() {
                        prolongation.move_to_accelerator()?;
                        restriction.move_to_accelerator()?;
                        coarse.move_to_accelerator()?;
                    }
                    t.prolongation = prolongation;
                    t.restriction = restriction;
                    t.smoother.set_operator(Arc::clone(&level_op));
                    t.smoother.rebuild_numeric()?;
                    current = Arc::new(coarse);
                }
                _ => {
                    if let Some(coarse) = self.coarse.as_mut() {
                        coarse.set_operator(Arc::clone(&level_op));
                        coarse.rebuild_numeric()?;
                    }
                }
            }
        }
        debug!("{}: numeric rebuild, {}", self.name, self.hierarchy_info());
        Ok(())
    }

    fn clear(&mut self) {
        self.levels.clear();
        if let Some(coarse) = self.coarse.as_mut() {
            coarse.clear();
        }
        self.coarse = None;
        self.r = None;
        if self.state == SolverState::Built {
            self.state = SolverState::Cleared;
        }
    }

    fn solve(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        if self.state != SolverState::Built {
            return Err(SolverError::NotBuilt(self.name.clone()));
        }
        let op = self.operator()?;
        if rhs.size() != op.rows() || x.size() != op.rows() {
            return Err(SolverError::Core(sparsolve_core::CoreError::InvalidDimensions(
                format!(
                    "'{}': operator of size {}, rhs {}, x {}",
                    self.name,
                    op.rows(),
                    rhs.size(),
                    x.size()
                ),
            )));
        }
        let (Some(coarse), Some(r)) = (self.coarse.as_mut(), self.r.as_mut()) else {
            return Err(SolverError::NotBuilt(self.name.clone()));
        };
        let control = &mut self.control;

        let norm = residual(op.as_ref(), rhs, x, r)?;
        if let Some(status) = control.init(norm) {
            return Ok(control.report(status));
        }
        let status = loop {
            cycle(&mut self.levels, coarse, &self.config, rhs, x)?;
            let norm = residual(op.as_ref(), rhs, x, r)?;
            if let Some(status) = control.check(norm) {
                break status;
            }
        };
        debug!(
            "{}: {:?} after {} cycles, residual {:e}",
            self.name,
            status,
            control.iteration(),
            control.current_residual()
        );
        Ok(control.report(status))
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        for level in &mut self.levels {
            if let Some(t) = level.transfer.as_mut() {
                t.prolongation.move_to_host()?;
                t.restriction.move_to_host()?;
                t.r.move_to_host()?;
                t.coarse_rhs.move_to_host()?;
                t.coarse_sol.move_to_host()?;
                t.smoother.move_to_host_local_data()?;
            }
        }
        if let Some(r) = self.r.as_mut() {
            r.move_to_host()?;
        }
        match self.coarse.as_mut() {
            Some(coarse) => coarse.move_to_host_local_data(),
            None => Ok(()),
        }
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        for level in &mut self.levels {
            if let Some(t) = level.transfer.as_mut() {
                t.prolongation.move_to_accelerator()?;
                t.restriction.move_to_accelerator()?;
                t.r.move_to_accelerator()?;
                t.coarse_rhs.move_to_accelerator()?;
                t.coarse_sol.move_to_accelerator()?;
                t.smoother.move_to_accelerator_local_data()?;
            }
        }
        if let Some(r) = self.r.as_mut() {
            r.move_to_accelerator()?;
        }
        match self.coarse.as_mut() {
            Some(coarse) => coarse.move_to_accelerator_local_data(),
            None => Ok(()),
        }
    }

    fn state(&self) -> SolverState {
        self.state
    }

    fn describe(&self) -> String {
        format!(
            "{} [{:?}] {:?}-cycle, eps={}, relax={}, coarsest={}, smoothing {}/{} with omega={}, hierarchy: {}",
            self.name,
            self.state,
            self.config.cycle,
            self.config.coupling_strength,
            self.config.interp_relax,
            self.config.coarsest_size,
            self.config.pre_smooth,
            self.config.post_smooth,
            self.config.smoother_relax,
            self.hierarchy_info()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparsolve_core::Context;

    fn path_laplacian(n: usize) -> SparseMatrix {
        let mut t = Vec::new();
        for i in 0..n {
            t.push(Triplet::new(i, i, 2.0));
            if i > 0 {
                t.push(Triplet::new(i, i - 1, -1.0));
                t.push(Triplet::new(i - 1, i, -1.0));
            }
        }
        SparseMatrix::from_triplets(n, n, &t).unwrap()
    }

    #[test]
    fn unsmoothed_prolongation_is_piecewise_constant() {
        let a = path_laplacian(9);
        let agg = aggregate(&a, 0.01);
        let p = smoothed_prolongation(&a, &agg, 0.01, 0.0).unwrap();
        assert_eq!(p.dims(), (9, 3));
        assert_eq!(p.nnz(), 9);
        for i in 0..9 {
            assert_eq!(p.get(i, agg.map[i].unwrap()), Some(1.0));
        }
    }

    #[test]
    fn smoothed_prolongation_preserves_constants_in_interior() {
        // rows of A sum to zero away from the boundary, so P keeps 1 there
        let a = path_laplacian(9);
        let agg = aggregate(&a, 0.01);
        let p = smoothed_prolongation(&a, &agg, 0.01, 2.0 / 3.0).unwrap();
        for i in 1..8 {
            let (_, vals) = p.row(i);
            let sum: f64 = vals.iter().sum();
            assert!((sum - 1.0).abs() < 1e-14, "row {} sums to {}", i, sum);
        }
    }

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let ctx = Context::host().unwrap();
        let a = Arc::new(LocalMatrix::new(&ctx, "A", path_laplacian(9)));
        let config = AmgConfig {
            coupling_strength: 0.0,
            ..AmgConfig::default()
        };
        let mut amg = SmoothedAmg::new(config, ConvergenceCriteria::default());
        amg.set_operator(a);
        assert!(matches!(amg.build(), Err(SolverError::InvalidParameter(_))));
        assert_eq!(amg.state(), SolverState::Uninitialized);
    }

    #[test]
    fn small_operator_is_a_single_direct_level() {
        let ctx = Context::host().unwrap();
        let a = Arc::new(LocalMatrix::new(&ctx, "A", path_laplacian(9)));
        let mut amg = SmoothedAmg::new(AmgConfig::default(), ConvergenceCriteria::default());
        amg.set_operator(Arc::clone(&a));
        amg.build().unwrap();
        assert_eq!(amg.levels().len(), 1);
        assert!(amg.levels()[0].prolongation().is_none());

        let rhs = LocalVector::from_slice(&ctx, "b", &[1.0; 9]);
        let mut x = LocalVector::allocate(&ctx, "x", 9);
        let report = amg.solve(&rhs, &mut x).unwrap();
        assert!(report.converged());
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn config_loads_from_json() {
        let config: AmgConfig =
            serde_json::from_str(r#"{ "cycle": "W", "coarsest_size": 50 }"#).unwrap();
        assert_eq!(config.cycle, Cycle::W);
        assert_eq!(config.coarsest_size, 50);
        assert_eq!(config.pre_smooth, 1);
        assert_eq!(config.post_smooth, 2);
    }
}
