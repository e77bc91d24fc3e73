use sparsolve_core::{CoreError, SparseMatrix};

/// Represents a dense matrix stored in row-major order on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>, // data[row * cols + col]
}

impl DenseMatrix {
    /// Creates a new DenseMatrix from raw row-major data.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, CoreError> {
        if data.len() != rows * cols {
            return Err(CoreError::InvalidDimensions(format!(
                "Data length ({}) does not match dimensions ({}x{})",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_sparse(m: &SparseMatrix) -> Self {
        let mut dense = Self::zeros(m.rows(), m.cols());
        for t in m.iter() {
            dense.data[t.row() * m.cols() + t.col()] = t.value();
        }
        dense
    }

    pub fn to_sparse(&self) -> Result<SparseMatrix, CoreError> {
        if self.cols == 0 {
            return Ok(SparseMatrix::new(self.rows, 0));
        }
        let rows: Vec<Vec<f64>> = self.data.chunks(self.cols).map(<[f64]>::to_vec).collect();
        SparseMatrix::from_dense(&rows)
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Returns None if indices are out of bounds.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            self.data.get(row * self.cols + col).copied()
        } else {
            None
        }
    }

    /// Returns None if indices are out of bounds.
    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut f64> {
        if row < self.rows && col < self.cols {
            self.data.get_mut(row * self.cols + col)
        } else {
            None
        }
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    #[inline]
    fn at_mut(&mut self, row: usize, col: usize) -> &mut f64 {
        &mut self.data[row * self.cols + col]
    }

    fn swap_columns(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for row in 0..self.rows {
            self.data.swap(row * self.cols + a, row * self.cols + b);
        }
    }

    /// Householder QR with column pivoting, `A P = Q R`.
    pub fn qr(&self) -> Result<QrFactorization, CoreError> {
        if self.rows < self.cols {
            return Err(CoreError::InvalidDimensions(format!(
                "QR needs rows >= cols, got {}x{}",
                self.rows, self.cols
            )));
        }
        let (m, n) = (self.rows, self.cols);
        let mut r = self.clone();
        let mut perm: Vec<usize> = (0..n).collect();
        let mut reflectors = Vec::with_capacity(n);

        for k in 0..n {
            let norm2 = |r: &DenseMatrix, j: usize| (k..m).map(|i| r.at(i, j).powi(2)).sum::<f64>();
            let pivot = (k..n)
                .map(|j| (j, norm2(&r, j)))
                .fold((k, -1.0), |best, c| if c.1 > best.1 { c } else { best })
                .0;
            r.swap_columns(k, pivot);
            perm.swap(k, pivot);

            let x_norm = norm2(&r, k).sqrt();
            let mut v: Vec<f64> = (k..m).map(|i| r.at(i, k)).collect();
            if x_norm == 0.0 {
                reflectors.push((v, 0.0));
                continue;
            }
            let alpha = if v[0] > 0.0 { -x_norm } else { x_norm };
            v[0] -= alpha;
            let vv: f64 = v.iter().map(|x| x * x).sum();
            let beta = if vv > 0.0 { 2.0 / vv } else { 0.0 };

            *r.at_mut(k, k) = alpha;
            for i in k + 1..m {
                *r.at_mut(i, k) = 0.0;
            }
            for j in k + 1..n {
                let s: f64 = (k..m).map(|i| v[i - k] * r.at(i, j)).sum();
                for i in k..m {
                    *r.at_mut(i, j) -= beta * s * v[i - k];
                }
            }
            reflectors.push((v, beta));
        }

        Ok(QrFactorization {
            r,
            reflectors,
            perm,
        })
    }
}

/// Result of [`DenseMatrix::qr`].
#[derive(Debug, Clone)]
pub struct QrFactorization {
    /// Upper triangular `R` in the leading `cols x cols` block.
    r: DenseMatrix,
    /// Householder vector (from row `k`) and `2 / (v, v)` for each step.
    reflectors: Vec<(Vec<f64>, f64)>,
    /// Column `k` of `A P` is column `perm[k]` of `A`.
    perm: Vec<usize>,
}

impl QrFactorization {
    /// Diagonal of `R`; magnitudes are non-increasing.
    pub fn r_diagonal(&self) -> Vec<f64> {
        (0..self.r.cols()).map(|k| self.r.at(k, k)).collect()
    }

    pub fn permutation(&self) -> &[usize] {
        &self.perm
    }

    /// Number of pivots with `|R_kk| > tol * |R_00|`.
    pub fn rank(&self, tol: f64) -> usize {
        let diag = self.r_diagonal();
        let Some(first) = diag.first() else {
            return 0;
        };
        let threshold = tol * first.abs();
        diag.iter()
            .take_while(|d| d.abs() > threshold && **d != 0.0)
            .count()
    }

    /// `y = Q^T y`
    fn apply_qt(&self, y: &mut [f64]) {
        for (k, (v, beta)) in self.reflectors.iter().enumerate() {
            let s: f64 = v.iter().zip(&y[k..]).map(|(a, b)| a * b).sum();
            for (yi, vi) in y[k..].iter_mut().zip(v) {
                *yi -= beta * s * vi;
            }
        }
    }

    /// Least-squares solution of `A x = b` for a full-rank factorization.
    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>, CoreError> {
        let (m, n) = self.r.dims();
        if b.len() != m {
            return Err(CoreError::InvalidDimensions(format!(
                "QR solve: rhs of {} for {}x{}",
                b.len(),
                m,
                n
            )));
        }
        let mut y = b.to_vec();
        self.apply_qt(&mut y);
        let mut z = vec![0.0; n];
        for k in (0..n).rev() {
            let pivot = self.r.at(k, k);
            if pivot == 0.0 {
                return Err(CoreError::Unsupported(format!(
                    "QR solve with zero pivot at column {}",
                    k
                )));
            }
            let sum: f64 = (k + 1..n).map(|j| self.r.at(k, j) * z[j]).sum();
            z[k] = (y[k] - sum) / pivot;
        }
        let mut x = vec![0.0; n];
        for (k, &p) in self.perm.iter().enumerate() {
            x[p] = z[k];
        }
        Ok(x)
    }

    /// `A^-1 = P R^-1 Q^T` for a square full-rank factorization.
    pub fn inverse(&self) -> Result<DenseMatrix, CoreError> {
        let (m, n) = self.r.dims();
        if m != n {
            return Err(CoreError::InvalidDimensions(format!(
                "inverse of a {}x{} matrix",
                m, n
            )));
        }
        let mut inverse = DenseMatrix::zeros(n, n);
        let mut e = vec![0.0; n];
        for col in 0..n {
            e.iter_mut().for_each(|v| *v = 0.0);
            e[col] = 1.0;
            let x = self.solve(&e)?;
            for (row, value) in x.into_iter().enumerate() {
                *inverse.at_mut(row, col) = value;
            }
        }
        Ok(inverse)
    }
}
