//! Threshold ILU and incomplete Cholesky. Both pack their factors into one
//! matrix and reuse the triangular sweeps of ILU(p).

use super::sweep::Reordered;
use super::{applied, Lifecycle};
use crate::error::{Result, SolverError};
use crate::solver::{SolveReport, Solver, SolverState};
use serde::{Deserialize, Serialize};
use sparsolve_core::{LocalMatrix, LocalVector, SparseMatrix, Triplet};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug)]
struct Factors {
    packed: Reordered,
    inv_pivot: Vec<f64>,
}

impl Factors {
    fn new(packed: SparseMatrix, inv_pivot: Vec<f64>) -> Result<Self> {
        Ok(Self {
            packed: Reordered::new(&packed, false)?,
            inv_pivot,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IlutConfig {
    /// Entries below `threshold * ||a_i||_2` are dropped from row `i`.
    pub threshold: f64,
    /// Entries kept in each of the L and U parts of a row.
    pub max_row_fill: usize,
    pub pivot_tol: f64,
}

impl Default for IlutConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            max_row_fill: 100,
            pivot_tol: f64::EPSILON,
        }
    }
}

/// Keeps the `max` largest entries in magnitude, sorted by column.
fn keep_largest(entries: &mut Vec<(usize, f64)>, max: usize) {
    if entries.len() > max {
        entries.sort_unstable_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        entries.truncate(max);
    }
    entries.sort_unstable_by_key(|&(j, _)| j);
}

/// Row-wise IKJ factorization with dual dropping. `L` (unit, multipliers
/// only) and `U` come back packed in one matrix, with `1 / u_ii`.
fn ilut(a: &SparseMatrix, config: &IlutConfig) -> Result<(SparseMatrix, Vec<f64>)> {
    let n = a.rows();
    let mut row_ptr = vec![0];
    let mut cols: Vec<usize> = Vec::new();
    let mut vals: Vec<f64> = Vec::new();
    let mut diag_pos = Vec::with_capacity(n);
    let mut inv_pivot: Vec<f64> = Vec::with_capacity(n);

    let mut work = vec![0.0; n];
    let mut filled = vec![false; n];
    let mut nonzeros: Vec<usize> = Vec::new();
    for i in 0..n {
        let (a_cols, a_vals) = a.row(i);
        let tau = config.threshold * a_vals.iter().map(|v| v * v).sum::<f64>().sqrt();
        let scale = a_vals.iter().fold(0.0f64, |m, v| m.max(v.abs()));

        let mut pending = BTreeSet::new();
        for (&j, &v) in a_cols.iter().zip(a_vals) {
            work[j] = v;
            filled[j] = true;
            nonzeros.push(j);
            if j < i {
                pending.insert(j);
            }
        }

        let mut lower = Vec::new();
        while let Some(k) = pending.pop_first() {
            let l = work[k] * inv_pivot[k];
            if l.abs() < tau {
                continue;
            }
            lower.push((k, l));
            for idx in diag_pos[k] + 1..row_ptr[k + 1] {
                let j = cols[idx];
                if !filled[j] {
                    filled[j] = true;
                    work[j] = 0.0;
                    nonzeros.push(j);
                    if j < i {
                        pending.insert(j);
                    }
                }
                work[j] -= l * vals[idx];
            }
        }

        let pivot = if filled[i] { work[i] } else { 0.0 };
        let mut upper: Vec<(usize, f64)> = nonzeros
            .iter()
            .filter(|&&j| j > i && work[j].abs() >= tau)
            .map(|&j| (j, work[j]))
            .collect();
        for &j in &nonzeros {
            work[j] = 0.0;
            filled[j] = false;
        }
        nonzeros.clear();

        if !(pivot.abs() > config.pivot_tol * scale) {
            return Err(SolverError::SingularSystem { rank: i, size: n });
        }
        keep_largest(&mut lower, config.max_row_fill);
        keep_largest(&mut upper, config.max_row_fill);
        for (j, v) in lower {
            cols.push(j);
            vals.push(v);
        }
        diag_pos.push(cols.len());
        cols.push(i);
        vals.push(pivot);
        for (j, v) in upper {
            cols.push(j);
            vals.push(v);
        }
        row_ptr.push(cols.len());
        inv_pivot.push(1.0 / pivot);
    }
    Ok((SparseMatrix::from_csr(n, n, vals, cols, row_ptr)?, inv_pivot))
}

/// Incomplete LU with a drop threshold and a per-row fill limit.
#[derive(Debug)]
pub struct Ilut {
    life: Lifecycle<LocalMatrix>,
    config: IlutConfig,
    factors: Option<Factors>,
}

impl Ilut {
    pub fn new(config: IlutConfig) -> Self {
        Self {
            life: Lifecycle::new("ILUT"),
            config,
            factors: None,
        }
    }

    pub fn config(&self) -> &IlutConfig {
        &self.config
    }

    /// Stored entries of the packed factors.
    pub fn factor_nnz(&self) -> usize {
        self.factors.as_ref().map_or(0, |f| f.packed.matrix.nnz())
    }

    fn factorize(&self, op: &LocalMatrix) -> Result<Factors> {
        if self.config.threshold < 0.0 || self.config.max_row_fill == 0 {
            return Err(SolverError::InvalidParameter(format!(
                "ILUT: threshold {} and max_row_fill {}",
                self.config.threshold, self.config.max_row_fill
            )));
        }
        let (packed, inv_pivot) = ilut(op.csr(), &self.config)?;
        log::debug!(
            "{}: {} rows, nnz {} -> {}",
            self.life.name,
            packed.rows(),
            op.csr().nnz(),
            packed.nnz()
        );
        Factors::new(packed, inv_pivot)
    }
}

impl Default for Ilut {
    fn default() -> Self {
        Self::new(IlutConfig::default())
    }
}

impl Solver<LocalMatrix, LocalVector> for Ilut {
    fn name(&self) -> &str {
        &self.life.name
    }

    fn set_operator(&mut self, op: Arc<LocalMatrix>) {
        self.life.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        let op = self.life.begin_build::<LocalVector>()?;
        self.factors = Some(self.factorize(&op)?);
        self.life.finish_build();
        Ok(())
    }

    /// The dropping depends on the values, so the factors are recomputed.
    fn rebuild_numeric(&mut self) -> Result<()> {
        self.life.ensure_built()?;
        let op = self.life.operator()?;
        self.factors = Some(self.factorize(&op)?);
        Ok(())
    }

    fn clear(&mut self) {
        self.factors = None;
        self.life.clear();
    }

    fn solve(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        let op = self.life.begin_solve(rhs, &*x)?;
        let f = self
            .factors
            .as_mut()
            .ok_or_else(|| SolverError::NotBuilt(self.life.name.clone()))?;
        f.packed
            .apply_factors(op.context(), &f.inv_pivot, true, rhs, x)?;
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
            "{} [{:?}] threshold={:e}, max_row_fill={}",
            self.life.name, self.life.state, self.config.threshold, self.config.max_row_fill
        )
    }
}

/// IC(0) of the lower triangle of `a`, packed as `L + L^T - diag(L)`.
/// Returns the packed matrix and `1 / l_ii`.
fn incomplete_cholesky(a: &SparseMatrix) -> Result<(SparseMatrix, Vec<f64>)> {
    let n = a.rows();
    let mut lower: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
    let mut diag: Vec<f64> = Vec::with_capacity(n);
    // work[j] holds l_ij while marker[j] == i
    let mut work = vec![0.0; n];
    let mut marker = vec![usize::MAX; n];
    for i in 0..n {
        let (a_cols, a_vals) = a.row(i);
        let mut row: Vec<(usize, f64)> = Vec::new();
        let mut a_ii = None;
        for (&j, &v) in a_cols.iter().zip(a_vals) {
            if j < i {
                row.push((j, v));
            } else if j == i {
                a_ii = Some(v);
            }
        }
        for entry in row.iter_mut() {
            let k = entry.0;
            let dot: f64 = lower[k]
                .iter()
                .filter(|&&(j, _)| marker[j] == i)
                .map(|&(j, l_kj)| work[j] * l_kj)
                .sum();
            entry.1 = (entry.1 - dot) / diag[k];
            work[k] = entry.1;
            marker[k] = i;
        }
        let d = a_ii.unwrap_or(0.0) - row.iter().map(|&(_, l)| l * l).sum::<f64>();
        if !(d > 0.0) {
            return Err(SolverError::SingularSystem { rank: i, size: n });
        }
        diag.push(d.sqrt());
        lower.push(row);
    }

    let mut triplets = Vec::new();
    for (i, row) in lower.iter().enumerate() {
        for &(j, l) in row {
            triplets.push(Triplet::new(i, j, l));
            triplets.push(Triplet::new(j, i, l));
        }
        triplets.push(Triplet::new(i, i, diag[i]));
    }
    let packed = SparseMatrix::from_triplets(n, n, &triplets)?;
    Ok((packed, diag.iter().map(|d| 1.0 / d).collect()))
}

/// Incomplete Cholesky without fill-in, `M = L L^T` on the lower pattern of a
/// symmetric positive definite `A`. A non-positive pivot is reported as
/// `SolverError::SingularSystem`.
#[derive(Debug)]
pub struct Ic {
    life: Lifecycle<LocalMatrix>,
    factors: Option<Factors>,
}

impl Ic {
    pub fn new() -> Self {
        Self {
            life: Lifecycle::new("IC(0)"),
            factors: None,
        }
    }

    fn factorize(op: &LocalMatrix) -> Result<Factors> {
        let (packed, inv_pivot) = incomplete_cholesky(op.csr())?;
        Factors::new(packed, inv_pivot)
    }
}

impl Default for Ic {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver<LocalMatrix, LocalVector> for Ic {
    fn name(&self) -> &str {
        &self.life.name
    }

    fn set_operator(&mut self, op: Arc<LocalMatrix>) {
        self.life.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        let op = self.life.begin_build::<LocalVector>()?;
        self.factors = Some(Self::factorize(&op)?);
        self.life.finish_build();
        Ok(())
    }

    fn rebuild_numeric(&mut self) -> Result<()> {
        self.life.ensure_built()?;
        let op = self.life.operator()?;
        self.factors = Some(Self::factorize(&op)?);
        Ok(())
    }

    fn clear(&mut self) {
        self.factors = None;
        self.life.clear();
    }

    fn solve(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        let op = self.life.begin_solve(rhs, &*x)?;
        let f = self
            .factors
            .as_mut()
            .ok_or_else(|| SolverError::NotBuilt(self.life.name.clone()))?;
        f.packed
            .apply_factors(op.context(), &f.inv_pivot, false, rhs, x)?;
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
        format!("{} [{:?}]", self.life.name, self.life.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparsolve_core::Context;

    fn tridiagonal(ctx: &Arc<Context>, n: usize) -> Arc<LocalMatrix> {
        let mut t = Vec::new();
        for i in 0..n {
            t.push(Triplet::new(i, i, 4.0));
            if i > 0 {
                t.push(Triplet::new(i, i - 1, -1.0));
                t.push(Triplet::new(i - 1, i, -1.0));
            }
        }
        Arc::new(LocalMatrix::from_triplets(ctx, "A", n, n, &t).unwrap())
    }

    fn apply(
        precond: &mut dyn Solver<LocalMatrix, LocalVector>,
        a: &Arc<LocalMatrix>,
        expected: &[f64],
    ) -> Vec<f64> {
        let ctx = a.context();
        let solution = LocalVector::from_slice(ctx, "x*", expected);
        let mut rhs = LocalVector::allocate(ctx, "b", expected.len());
        sparsolve_core::Operator::apply(a.as_ref(), &solution, &mut rhs).unwrap();
        let mut x = LocalVector::allocate(ctx, "x", expected.len());
        precond.solve(&rhs, &mut x).unwrap();
        x.to_vec().unwrap()
    }

    #[test]
    fn ilut_without_dropping_is_exact_lu() {
        let ctx = Context::host().unwrap();
        let a = tridiagonal(&ctx, 10);
        let mut ilut = Ilut::new(IlutConfig {
            threshold: 0.0,
            ..IlutConfig::default()
        });
        ilut.set_operator(Arc::clone(&a));
        ilut.build().unwrap();
        assert_eq!(ilut.factor_nnz(), a.csr().nnz());

        let expected: Vec<f64> = (0..10).map(|i| (i as f64).sin()).collect();
        let x = apply(&mut ilut, &a, &expected);
        for (got, want) in x.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn ilut_row_fill_limit_drops_entries() {
        let ctx = Context::host().unwrap();
        let a = tridiagonal(&ctx, 10);
        let mut ilut = Ilut::new(IlutConfig {
            threshold: 0.0,
            max_row_fill: 1,
            ..IlutConfig::default()
        });
        ilut.set_operator(Arc::clone(&a));
        ilut.build().unwrap();
        // tridiagonal rows already hold at most one entry per triangle
        assert_eq!(ilut.factor_nnz(), a.csr().nnz());

        let mut dense = vec![vec![0.0; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                dense[i][j] = if i == j { 10.0 } else { 1.0 };
            }
        }
        let full = Arc::new(a.derive("full", SparseMatrix::from_dense(&dense).unwrap()));
        let mut limited = Ilut::new(IlutConfig {
            threshold: 0.0,
            max_row_fill: 1,
            ..IlutConfig::default()
        });
        limited.set_operator(full);
        limited.build().unwrap();
        // diagonal plus at most one entry on each side of it
        assert!(limited.factor_nnz() <= 4 + 2 * 3);
    }

    #[test]
    fn ilut_zero_pivot_is_singular() {
        let ctx = Context::host().unwrap();
        let t = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 1.0),
        ];
        let a = Arc::new(LocalMatrix::from_triplets(&ctx, "A", 2, 2, &t).unwrap());
        let mut ilut = Ilut::default();
        ilut.set_operator(a);
        assert_eq!(
            ilut.build(),
            Err(SolverError::SingularSystem { rank: 1, size: 2 })
        );
        assert_eq!(ilut.state(), SolverState::Uninitialized);
    }

    #[test]
    fn ic0_is_exact_cholesky_for_tridiagonal() {
        let ctx = Context::host().unwrap();
        let a = tridiagonal(&ctx, 12);
        let mut ic = Ic::new();
        ic.set_operator(Arc::clone(&a));
        ic.build().unwrap();

        let expected: Vec<f64> = (0..12).map(|i| 1.0 + 0.5 * i as f64).collect();
        let x = apply(&mut ic, &a, &expected);
        for (got, want) in x.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn ic0_rejects_indefinite_matrix() {
        let ctx = Context::host().unwrap();
        let t = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(0, 1, 2.0),
            Triplet::new(1, 0, 2.0),
            Triplet::new(1, 1, 1.0),
        ];
        let a = Arc::new(LocalMatrix::from_triplets(&ctx, "A", 2, 2, &t).unwrap());
        let mut ic = Ic::new();
        ic.set_operator(a);
        assert_eq!(
            ic.build(),
            Err(SolverError::SingularSystem { rank: 1, size: 2 })
        );
        let rhs = LocalVector::allocate(&ctx, "b", 2);
        let mut x = LocalVector::allocate(&ctx, "x", 2);
        assert!(matches!(ic.solve(&rhs, &mut x), Err(SolverError::NotBuilt(_))));
    }
}
