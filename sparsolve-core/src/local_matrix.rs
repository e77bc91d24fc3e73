use crate::device::Context;
use crate::error::Result;
use crate::local_vector::LocalVector;
use crate::sparse_matrix::{DeviceCsr, SparseMatrix, Triplet};
use crate::traits::{DiagonalOperator, Operator, Residency};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;

/// Single-partition CSR operator.
///
/// The host CSR is always kept; while on the accelerator a device mirror
/// serves `apply`.
#[derive(Debug)]
pub struct LocalMatrix {
    name: String,
    csr: SparseMatrix,
    device: Option<DeviceCsr>,
    context: Arc<Context>,
}

impl LocalMatrix {
    pub fn new(context: &Arc<Context>, name: &str, csr: SparseMatrix) -> Self {
        Self {
            name: name.to_string(),
            csr,
            device: None,
            context: Arc::clone(context),
        }
    }

    pub fn from_triplets(
        context: &Arc<Context>,
        name: &str,
        rows: usize,
        cols: usize,
        triplets: &[Triplet],
    ) -> Result<Self> {
        Ok(Self::new(
            context,
            name,
            SparseMatrix::from_triplets(rows, cols, triplets)?,
        ))
    }

    pub fn from_dense(context: &Arc<Context>, name: &str, dense: &[Vec<f64>]) -> Result<Self> {
        Ok(Self::new(context, name, SparseMatrix::from_dense(dense)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn csr(&self) -> &SparseMatrix {
        &self.csr
    }

    /// A host matrix sharing this matrix's context.
    pub fn derive(&self, name: &str, csr: SparseMatrix) -> LocalMatrix {
        LocalMatrix::new(&self.context, name, csr)
    }

    /// Rewrites the stored values in place, keeping the sparsity pattern.
    /// The accelerator mirror, if any, is refreshed.
    pub fn update_values(&mut self, update: impl FnOnce(&mut [f64])) -> Result<()> {
        update(self.csr.values_mut());
        self.refresh_mirror()
    }

    fn refresh_mirror(&mut self) -> Result<()> {
        if self.device.is_some() {
            self.device = Some(self.context.gpu()?.create_sparse_matrix(&self.csr)?);
        }
        Ok(())
    }

    // --- Structural kernels (host) ---

    pub fn transpose(&self, name: &str) -> LocalMatrix {
        self.derive(name, self.csr.transpose())
    }

    pub fn matmul(&self, other: &LocalMatrix, name: &str) -> Result<LocalMatrix> {
        Ok(self.derive(name, self.csr.matmul(&other.csr)?))
    }

    pub fn extract_submatrix(
        &self,
        rows: Range<usize>,
        cols: Range<usize>,
        name: &str,
    ) -> Result<LocalMatrix> {
        Ok(self.derive(name, self.csr.extract_submatrix(rows, cols)?))
    }

    pub fn permute(&self, perm: &[usize], name: &str) -> Result<LocalMatrix> {
        Ok(self.derive(name, self.csr.permute(perm)?))
    }

    pub fn extract_diagonal(&self) -> Vec<f64> {
        self.csr.extract_diagonal()
    }

    pub fn scale(&mut self, alpha: f64) -> Result<()> {
        self.update_values(|values| values.iter_mut().for_each(|v| *v *= alpha))
    }

    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        self.csr.to_dense()
    }

    /// `y = alpha * A * x + beta * y` on the host pool.
    fn host_spmv(&self, alpha: f64, x: &[f64], beta: f64, y: &mut [f64]) {
        let csr = &self.csr;
        self.context.install(|| {
            y.par_iter_mut().enumerate().for_each(|(row, yi)| {
                let ax = csr.row_dot(row, x);
                *yi = if beta == 0.0 {
                    alpha * ax
                } else {
                    alpha * ax + beta * *yi
                };
            })
        });
    }

    pub(crate) fn spmv(&self, alpha: f64, x: &LocalVector, beta: f64, y: &mut LocalVector) -> Result<()> {
        self.csr.check_spmv(x.len(), y.len())?;
        if let (Some(device), Some(xd)) = (&self.device, x.device_buffer()) {
            if let Some(yd) = y.device_buffer_mut() {
                return self.context.gpu()?.spmv(device, alpha, xd, beta, yd);
            }
        }
        if self.device.is_some() {
            log::debug!("'{}': host fallback for spmv on mixed residency", self.name);
        }
        x.with_host(|xs| y.with_host_mut(|ys| self.host_spmv(alpha, xs, beta, ys)))?
    }
}

impl Residency for LocalMatrix {
    fn is_host(&self) -> bool {
        self.device.is_none()
    }

    fn move_to_host(&mut self) -> Result<()> {
        if self.device.take().is_some() {
            log::debug!("'{}': dropped accelerator mirror", self.name);
        }
        Ok(())
    }

    fn move_to_accelerator(&mut self) -> Result<()> {
        if self.device.is_none() {
            self.device = Some(self.context.gpu()?.create_sparse_matrix(&self.csr)?);
            log::debug!("'{}': uploaded {} nonzeros", self.name, self.csr.nnz());
        }
        Ok(())
    }
}

impl Operator<LocalVector> for LocalMatrix {
    fn rows(&self) -> usize {
        self.csr.rows()
    }

    fn cols(&self) -> usize {
        self.csr.cols()
    }

    fn nnz(&self) -> usize {
        self.csr.nnz()
    }

    fn apply(&self, x: &LocalVector, y: &mut LocalVector) -> Result<()> {
        self.spmv(1.0, x, 0.0, y)
    }

    fn apply_add(&self, x: &LocalVector, alpha: f64, y: &mut LocalVector) -> Result<()> {
        self.spmv(alpha, x, 1.0, y)
    }

    fn new_vector(&self, name: &str) -> Result<LocalVector> {
        let mut v = LocalVector::allocate(&self.context, name, self.csr.rows());
        if self.is_accelerator() {
            v.move_to_accelerator()?;
        }
        Ok(v)
    }

    fn info(&self) -> String {
        format!(
            "LocalMatrix '{}' {}x{}, nnz={}, on {}",
            self.name,
            self.csr.rows(),
            self.csr.cols(),
            self.csr.nnz(),
            if self.is_host() { "host" } else { "accelerator" }
        )
    }
}

impl DiagonalOperator<LocalVector> for LocalMatrix {
    fn extract_inverse_diagonal(&self, name: &str) -> Result<LocalVector> {
        let inverse: Vec<f64> = self
            .csr
            .extract_diagonal()
            .into_iter()
            .map(|d| if d == 0.0 { 1.0 } else { 1.0 / d })
            .collect();
        let mut v = LocalVector::from_slice(&self.context, name, &inverse);
        if self.is_accelerator() {
            v.move_to_accelerator()?;
        }
        Ok(v)
    }
}
