//! Host triangular sweeps shared by the relaxation and ILU preconditioners.
//!
//! With a multicolour ordering the rows of one colour are uncoupled, so each
//! colour is swept in parallel on the context's pool.

use crate::error::{Result, SolverError};
use rayon::prelude::*;
use sparsolve_core::{Context, LocalVector, SparseMatrix};
use std::ops::Range;

/// Greedy colouring of the symmetrised pattern and the matching reordering.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Coloring {
    /// `perm[old] = new`; colours are contiguous in the new numbering.
    pub perm: Vec<usize>,
    pub ranges: Vec<Range<usize>>,
}

impl Coloring {
    pub fn greedy(m: &SparseMatrix) -> Self {
        let n = m.rows();
        let transposed = m.transpose();
        let mut color = vec![usize::MAX; n];
        // forbidden[c] == i: colour c is taken by a neighbour of i
        let mut forbidden = vec![usize::MAX; n];
        let mut count = 0;
        for i in 0..n {
            for &j in m.row(i).0.iter().chain(transposed.row(i).0) {
                if j != i && color[j] != usize::MAX {
                    forbidden[color[j]] = i;
                }
            }
            let c = (0..count).find(|&c| forbidden[c] != i).unwrap_or(count);
            color[i] = c;
            count = count.max(c + 1);
        }

        let mut next = vec![0; count + 1];
        for &c in &color {
            next[c + 1] += 1;
        }
        for c in 0..count {
            next[c + 1] += next[c];
        }
        let ranges = (0..count).map(|c| next[c]..next[c + 1]).collect();
        let perm = color
            .iter()
            .map(|&c| {
                let p = next[c];
                next[c] += 1;
                p
            })
            .collect();
        Self { perm, ranges }
    }

    pub fn colors(&self) -> usize {
        self.ranges.len()
    }
}

/// A square matrix in sweep order (natural or multicoloured) plus the
/// right-hand side and solution buffers in that order.
#[derive(Debug)]
pub(crate) struct Reordered {
    pub matrix: SparseMatrix,
    pub coloring: Option<Coloring>,
    pub b: Vec<f64>,
    pub x: Vec<f64>,
}

impl Reordered {
    pub fn new(csr: &SparseMatrix, colored: bool) -> Result<Self> {
        let coloring = colored.then(|| Coloring::greedy(csr));
        let matrix = match &coloring {
            Some(coloring) => csr.permute(&coloring.perm)?,
            None => csr.clone(),
        };
        let n = csr.rows();
        Ok(Self {
            matrix,
            coloring,
            b: vec![0.0; n],
            x: vec![0.0; n],
        })
    }

    /// Reloads the values of a matrix with the pattern seen at construction.
    pub fn refresh(&mut self, csr: &SparseMatrix) -> Result<()> {
        let matrix = match &self.coloring {
            Some(coloring) => csr.permute(&coloring.perm)?,
            None => csr.clone(),
        };
        if matrix.row_ptr() != self.matrix.row_ptr() || matrix.col_indices() != self.matrix.col_indices() {
            return Err(SolverError::InvalidParameter(
                "numeric rebuild requires an unchanged sparsity pattern".to_string(),
            ));
        }
        self.matrix = matrix;
        Ok(())
    }

    /// Row of the caller's numbering stored at sweep position `i`.
    pub fn original_row(&self, i: usize) -> usize {
        match &self.coloring {
            Some(coloring) => coloring.perm.iter().position(|&p| p == i).unwrap_or(i),
            None => i,
        }
    }

    /// Diagonal in sweep order; a zero entry is reported as a singular pivot.
    pub fn diagonal(&self) -> Result<Vec<f64>> {
        let diag = self.matrix.extract_diagonal();
        if let Some(row) = diag.iter().position(|&d| d == 0.0) {
            return Err(SolverError::SingularSystem {
                rank: self.original_row(row),
                size: diag.len(),
            });
        }
        Ok(diag)
    }

    pub fn load(&mut self, rhs: &LocalVector) -> Result<()> {
        let b = &mut self.b;
        let perm = self.coloring.as_ref().map(|c| c.perm.as_slice());
        rhs.with_host(|values| match perm {
            Some(perm) => {
                for (i, &v) in values.iter().enumerate() {
                    b[perm[i]] = v;
                }
            }
            None => b.copy_from_slice(values),
        })?;
        Ok(())
    }

    pub fn store(&self, x: &mut LocalVector) -> Result<()> {
        let perm = self.coloring.as_ref().map(|c| c.perm.as_slice());
        let solution = &self.x;
        x.with_host_mut(|values| match perm {
            Some(perm) => {
                for (i, v) in values.iter_mut().enumerate() {
                    *v = solution[perm[i]];
                }
            }
            None => values.copy_from_slice(solution),
        })?;
        Ok(())
    }

    /// `x = U^-1 L^-1 rhs` with both factors packed in `matrix`. A unit lower
    /// factor skips the pivot scaling of the forward sweep.
    pub fn apply_factors(
        &mut self,
        context: &Context,
        inv_pivot: &[f64],
        unit_lower: bool,
        rhs: &LocalVector,
        x: &mut LocalVector,
    ) -> Result<()> {
        self.load(rhs)?;
        self.forward(context, (!unit_lower).then_some(inv_pivot));
        self.chain();
        self.backward(context, Some(inv_pivot));
        self.store(x)
    }

    /// The solution becomes the next right-hand side.
    pub fn chain(&mut self) {
        std::mem::swap(&mut self.b, &mut self.x);
    }

    /// `x_i = (b_i - sum_{j<i} a_ij x_j) * inv_pivot_i`, unit pivots when `None`.
    pub fn forward(&mut self, context: &Context, inv_pivot: Option<&[f64]>) {
        let Self {
            matrix,
            coloring,
            b,
            x,
        } = self;
        match coloring {
            None => {
                for i in 0..matrix.rows() {
                    let (cols, vals) = matrix.row(i);
                    let mut sum = b[i];
                    for (&j, &v) in cols.iter().zip(vals) {
                        if j < i {
                            sum -= v * x[j];
                        }
                    }
                    x[i] = pivot(inv_pivot, i, sum);
                }
            }
            Some(coloring) => {
                let matrix = &*matrix;
                let b = &*b;
                for range in &coloring.ranges {
                    let (done, rest) = x.split_at_mut(range.start);
                    let done: &[f64] = done;
                    let current = &mut rest[..range.len()];
                    let start = range.start;
                    context.install(|| {
                        current.par_iter_mut().enumerate().for_each(|(k, xi)| {
                            let i = start + k;
                            let (cols, vals) = matrix.row(i);
                            let mut sum = b[i];
                            for (&j, &v) in cols.iter().zip(vals) {
                                if j < start {
                                    sum -= v * done[j];
                                }
                            }
                            *xi = pivot(inv_pivot, i, sum);
                        })
                    });
                }
            }
        }
    }

    /// `x_i = (b_i - sum_{j>i} a_ij x_j) * inv_pivot_i`.
    pub fn backward(&mut self, context: &Context, inv_pivot: Option<&[f64]>) {
        let Self {
            matrix,
            coloring,
            b,
            x,
        } = self;
        match coloring {
            None => {
                for i in (0..matrix.rows()).rev() {
                    let (cols, vals) = matrix.row(i);
                    let mut sum = b[i];
                    for (&j, &v) in cols.iter().zip(vals) {
                        if j > i {
                            sum -= v * x[j];
                        }
                    }
                    x[i] = pivot(inv_pivot, i, sum);
                }
            }
            Some(coloring) => {
                let matrix = &*matrix;
                let b = &*b;
                for range in coloring.ranges.iter().rev() {
                    let (head, after) = x.split_at_mut(range.end);
                    let after: &[f64] = after;
                    let current = &mut head[range.start..];
                    let (start, end) = (range.start, range.end);
                    context.install(|| {
                        current.par_iter_mut().enumerate().for_each(|(k, xi)| {
                            let i = start + k;
                            let (cols, vals) = matrix.row(i);
                            let mut sum = b[i];
                            for (&j, &v) in cols.iter().zip(vals) {
                                if j >= end {
                                    sum -= v * after[j - end];
                                }
                            }
                            *xi = pivot(inv_pivot, i, sum);
                        })
                    });
                }
            }
        }
    }
}

#[inline]
fn pivot(inv_pivot: Option<&[f64]>, i: usize, sum: f64) -> f64 {
    match inv_pivot {
        Some(inv) => sum * inv[i],
        None => sum,
    }
}
