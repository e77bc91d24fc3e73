use super::dense_matrix::DenseMatrix;
use crate::error::{Result, SolverError};
use crate::solver::{check_buildable, SolveReport, SolveStatus, Solver, SolverState};
use log::{debug, info};
use sparsolve_core::{LocalMatrix, LocalVector, Operator, Residency};
use std::sync::Arc;

/// Direct solve through an explicit inverse from a column-pivoted QR.
///
/// Meant for small systems such as the coarsest multigrid level. The inverse
/// is stored sparse, so `solve` is a single SpMV that runs wherever the
/// inverse lives.
#[derive(Debug)]
pub struct Inversion {
    name: String,
    op: Option<Arc<LocalMatrix>>,
    /// Relative pivot threshold; `n * eps` when unset.
    tolerance: Option<f64>,
    inverse: Option<LocalMatrix>,
    state: SolverState,
}

impl Inversion {
    pub fn new() -> Self {
        Self {
            name: "Inversion".to_string(),
            op: None,
            tolerance: None,
            inverse: None,
            state: SolverState::Uninitialized,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn inverse(&self) -> Option<&LocalMatrix> {
        self.inverse.as_ref()
    }

    fn operator(&self) -> Result<Arc<LocalMatrix>> {
        self.op
            .clone()
            .ok_or_else(|| SolverError::MissingOperator(self.name.clone()))
    }

    fn factorize(&self, op: &LocalMatrix) -> Result<LocalMatrix> {
        let n = op.rows();
        if !op.is_square() {
            return Err(SolverError::InvalidParameter(format!(
                "{} needs a square operator, got {}x{}",
                self.name,
                op.rows(),
                op.cols()
            )));
        }
        let qr = DenseMatrix::from_sparse(op.csr()).qr()?;
        let tol = self.tolerance.unwrap_or(n as f64 * f64::EPSILON);
        let rank = qr.rank(tol);
        if rank < n {
            return Err(SolverError::SingularSystem { rank, size: n });
        }
        let inverse = qr.inverse()?.to_sparse()?;
        debug!("{}: inverse of {}x{} has nnz={}", self.name, n, n, inverse.nnz());
        let mut inverse = op.derive(&format!("{}^-1", op.name()), inverse);
        if op.is_accelerator() {
            inverse.move_to_accelerator()?;
        }
        Ok(inverse)
    }
}

impl Default for Inversion {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver<LocalMatrix, LocalVector> for Inversion {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_operator(&mut self, op: Arc<LocalMatrix>) {
        self.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        check_buildable(self.state, &self.name, self.op.is_some())?;
        let op = self.operator()?;
        info!("Building {} for {}", self.name, op.info());
        self.inverse = Some(self.factorize(&op)?);
        self.state = SolverState::Built;
        Ok(())
    }

    fn rebuild_numeric(&mut self) -> Result<()> {
        if self.state != SolverState::Built {
            return Err(SolverError::NotBuilt(self.name.clone()));
        }
        let op = self.operator()?;
        self.inverse = Some(self.factorize(&op)?);
        Ok(())
    }

    fn clear(&mut self) {
        self.inverse = None;
        if self.state == SolverState::Built {
            self.state = SolverState::Cleared;
        }
    }

    fn solve(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        let inverse = match (&self.inverse, self.state) {
            (Some(inverse), SolverState::Built) => inverse,
            _ => return Err(SolverError::NotBuilt(self.name.clone())),
        };
        inverse.apply(rhs, x)?;
        Ok(SolveReport {
            status: SolveStatus::Converged,
            iterations: 1,
            initial_residual: 0.0,
            final_residual: 0.0,
        })
    }

    fn solve_zero_sol(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        self.solve(rhs, x)
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        if let Some(inverse) = self.inverse.as_mut() {
            inverse.move_to_host()?;
        }
        Ok(())
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        if let Some(inverse) = self.inverse.as_mut() {
            inverse.move_to_accelerator()?;
        }
        Ok(())
    }

    fn state(&self) -> SolverState {
        self.state
    }

    fn describe(&self) -> String {
        format!(
            "{} [{:?}] tolerance={}",
            self.name,
            self.state,
            self.tolerance
                .map_or_else(|| "n*eps".to_string(), |t| format!("{:e}", t))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparsolve_core::Context;

    #[test]
    fn solves_with_one_application() {
        let ctx = Context::host().unwrap();
        let dense = vec![
            vec![4.0, -1.0, 0.0],
            vec![-1.0, 4.0, -1.0],
            vec![0.0, -1.0, 4.0],
        ];
        let a = Arc::new(LocalMatrix::from_dense(&ctx, "A", &dense).unwrap());
        let mut inversion = Inversion::new();
        inversion.set_operator(Arc::clone(&a));
        inversion.build().unwrap();

        let rhs = LocalVector::from_slice(&ctx, "b", &[3.0, 2.0, 3.0]);
        let mut x = LocalVector::allocate(&ctx, "x", 3);
        let report = inversion.solve(&rhs, &mut x).unwrap();
        assert!(report.converged());
        for v in x.to_vec().unwrap() {
            assert!((v - 1.0).abs() < 1e-13);
        }
    }

    #[test]
    fn singular_operator_reports_rank() {
        let ctx = Context::host().unwrap();
        let dense = vec![
            vec![1.0, 2.0, 3.0],
            vec![2.0, 4.0, 6.0],
            vec![0.0, 1.0, 1.0],
        ];
        let a = Arc::new(LocalMatrix::from_dense(&ctx, "A", &dense).unwrap());
        let mut inversion = Inversion::new().with_tolerance(1e-10);
        inversion.set_operator(a);
        assert_eq!(
            inversion.build(),
            Err(SolverError::SingularSystem { rank: 2, size: 3 })
        );
        assert_eq!(inversion.state(), SolverState::Uninitialized);
    }
}
