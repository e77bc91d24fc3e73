use super::sweep::Reordered;
use super::{applied, Lifecycle};
use crate::error::{Result, SolverError};
use crate::solver::{SolveReport, Solver, SolverState};
use serde::{Deserialize, Serialize};
use sparsolve_core::{LocalMatrix, LocalVector, SparseMatrix, Triplet};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IluConfig {
    /// A pivot `|u_ii| <= pivot_tol * max_j |a_ij|` is treated as zero.
    pub pivot_tol: f64,
    /// `p` of ILU(p); `0` keeps the pattern of `A`.
    pub fill_level: usize,
    /// Fill positions from levels of fill. When false the factor takes the
    /// pattern of `A^(p+1)`.
    pub level_based: bool,
}

impl Default for IluConfig {
    fn default() -> Self {
        Self {
            pivot_tol: f64::EPSILON,
            fill_level: 0,
            level_based: true,
        }
    }
}

impl IluConfig {
    pub fn with_fill_level(mut self, p: usize, level_based: bool) -> Self {
        self.fill_level = p;
        self.level_based = level_based;
        self
    }
}

/// Positions `(i, j)` entering the ILU(p) pattern with a fill level `1..=p`.
///
/// `lev(i, j) = min over k of lev(i, k) + lev(k, j) + 1`, entries of `A`
/// having level zero.
fn level_fill(a: &SparseMatrix, p: usize) -> Vec<(usize, usize)> {
    let n = a.rows();
    // upper[k]: (j, lev(k, j)) for j > k
    let mut upper: Vec<Vec<(usize, usize)>> = Vec::with_capacity(n);
    let mut fill = Vec::new();
    for i in 0..n {
        let mut row: BTreeMap<usize, usize> = a.row(i).0.iter().map(|&j| (j, 0)).collect();
        let mut cursor = 0;
        loop {
            let Some((k, lev_ik)) = row.range(cursor..i).next().map(|(&k, &l)| (k, l)) else {
                break;
            };
            for &(j, lev_kj) in &upper[k] {
                let lev = lev_ik + lev_kj + 1;
                if lev <= p {
                    let entry = row.entry(j).or_insert(lev);
                    *entry = (*entry).min(lev);
                }
            }
            cursor = k + 1;
        }
        fill.extend(row.iter().filter(|&(_, &lev)| lev > 0).map(|(&j, _)| (i, j)));
        upper.push(row.range(i + 1..).map(|(&j, &lev)| (j, lev)).collect());
    }
    fill
}

/// Pattern of `|A|^(p+1)`.
fn power_fill(a: &SparseMatrix, p: usize) -> Result<Vec<(usize, usize)>> {
    let mut ones = a.clone();
    ones.values_mut().iter_mut().for_each(|v| *v = 1.0);
    let mut pattern = ones.clone();
    for _ in 0..p {
        pattern = pattern.matmul(&ones)?;
    }
    Ok(pattern.iter().map(|t| (t.row(), t.col())).collect())
}

/// `A` with explicit zeros added at the fill positions of ILU(p).
pub(crate) fn fill_pattern(a: &SparseMatrix, config: &IluConfig) -> Result<SparseMatrix> {
    if config.fill_level == 0 {
        return Ok(a.clone());
    }
    let fill = if config.level_based {
        level_fill(a, config.fill_level)
    } else {
        power_fill(a, config.fill_level)?
    };
    let mut triplets: Vec<Triplet> = a.iter().collect();
    triplets.extend(fill.into_iter().map(|(i, j)| Triplet::new(i, j, 0.0)));
    Ok(SparseMatrix::from_triplets(a.rows(), a.cols(), &triplets)?)
}

/// Incomplete LU factorization `M = L U` on the pattern of `A`, widened by
/// `fill_level` levels of fill-in.
#[derive(Debug)]
pub struct IluFactor<const COLORED: bool> {
    life: Lifecycle<LocalMatrix>,
    config: IluConfig,
    /// `L` (unit, strictly lower) and `U` packed in the matrix values.
    factors: Option<Reordered>,
    inv_pivot: Vec<f64>,
}

pub type Ilu = IluFactor<false>;
pub type MultiColoredIlu = IluFactor<true>;

/// Factorizes `m` in place (IKJ order). Returns `1 / u_ii`.
fn factorize(m: &mut Reordered, pivot_tol: f64) -> Result<Vec<f64>> {
    let n = m.matrix.rows();
    let row_ptr = m.matrix.row_ptr().to_vec();
    let cols = m.matrix.col_indices().to_vec();

    let mut diag_pos = vec![0; n];
    for i in 0..n {
        let row = &cols[row_ptr[i]..row_ptr[i + 1]];
        match row.binary_search(&i) {
            Ok(k) => diag_pos[i] = row_ptr[i] + k,
            Err(_) => {
                return Err(SolverError::SingularSystem {
                    rank: m.original_row(i),
                    size: n,
                })
            }
        }
    }

    let mut singular = None;
    let mut inv_pivot = vec![0.0; n];
    {
        let values = m.matrix.values_mut();
        // marker[j]: position of column j in the current row
        let mut marker: Vec<Option<usize>> = vec![None; n];
        for i in 0..n {
            let row = row_ptr[i]..row_ptr[i + 1];
            let scale = values[row.clone()].iter().fold(0.0f64, |m, v| m.max(v.abs()));
            for k in row.clone() {
                marker[cols[k]] = Some(k);
            }
            for k in row_ptr[i]..diag_pos[i] {
                let c = cols[k];
                values[k] /= values[diag_pos[c]];
                let l = values[k];
                for kk in diag_pos[c] + 1..row_ptr[c + 1] {
                    if let Some(pos) = marker[cols[kk]] {
                        values[pos] -= l * values[kk];
                    }
                }
            }
            for k in row.clone() {
                marker[cols[k]] = None;
            }
            let pivot = values[diag_pos[i]];
            if !(pivot.abs() > pivot_tol * scale) {
                singular = Some(i);
                break;
            }
            inv_pivot[i] = 1.0 / pivot;
        }
    }
    if let Some(i) = singular {
        return Err(SolverError::SingularSystem {
            rank: m.original_row(i),
            size: n,
        });
    }
    Ok(inv_pivot)
}

impl<const COLORED: bool> IluFactor<COLORED> {
    pub fn new(config: IluConfig) -> Self {
        let prefix = if COLORED { "MultiColoredILU" } else { "ILU" };
        Self {
            life: Lifecycle::new(&format!("{}({})", prefix, config.fill_level)),
            config,
            factors: None,
            inv_pivot: Vec::new(),
        }
    }

    pub fn config(&self) -> &IluConfig {
        &self.config
    }
}

impl<const COLORED: bool> Default for IluFactor<COLORED> {
    fn default() -> Self {
        Self::new(IluConfig::default())
    }
}

impl<const COLORED: bool> Solver<LocalMatrix, LocalVector> for IluFactor<COLORED> {
    fn name(&self) -> &str {
        &self.life.name
    }

    fn set_operator(&mut self, op: Arc<LocalMatrix>) {
        self.life.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        let op = self.life.begin_build::<LocalVector>()?;
        let pattern = fill_pattern(op.csr(), &self.config)?;
        let mut factors = Reordered::new(&pattern, COLORED)?;
        self.inv_pivot = factorize(&mut factors, self.config.pivot_tol)?;
        log::debug!(
            "{}: factorized {} rows, nnz={}",
            self.life.name,
            factors.matrix.rows(),
            factors.matrix.nnz()
        );
        self.factors = Some(factors);
        self.life.finish_build();
        Ok(())
    }

    /// Refactorizes with the new values, reusing the ordering.
    fn rebuild_numeric(&mut self) -> Result<()> {
        self.life.ensure_built()?;
        let op = self.life.operator()?;
        let factors = self
            .factors
            .as_mut()
            .ok_or_else(|| SolverError::NotBuilt(self.life.name.clone()))?;
        factors.refresh(&fill_pattern(op.csr(), &self.config)?)?;
        self.inv_pivot = factorize(factors, self.config.pivot_tol)?;
        Ok(())
    }

    fn clear(&mut self) {
        self.factors = None;
        self.inv_pivot.clear();
        self.life.clear();
    }

    fn solve(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        let op = self.life.begin_solve(rhs, &*x)?;
        let factors = self
            .factors
            .as_mut()
            .ok_or_else(|| SolverError::NotBuilt(self.life.name.clone()))?;
        factors.apply_factors(op.context(), &self.inv_pivot, true, rhs, x)?;
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
            "{} [{:?}] pivot_tol={:e}, level_based={}",
            self.life.name, self.life.state, self.config.pivot_tol, self.config.level_based
        )
    }
}
