use super::{applied, Lifecycle};
use crate::error::{Result, SolverError};
use crate::solver::{SolveReport, Solver, SolverState};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sparsolve_core::{LocalMatrix, LocalVector, Operator, Residency};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Rows of each contiguous diagonal block.
    pub sizes: Vec<usize>,
    /// Ignore the off-diagonal coupling (block Jacobi).
    pub diagonal: bool,
}

#[derive(Debug)]
struct BlockWorkspace {
    offsets: Vec<usize>,
    /// `lower[i]` holds `(j, A_ij)` for every non-empty block with `j < i`.
    lower: Vec<Vec<(usize, LocalMatrix)>>,
    rhs: Vec<LocalVector>,
    sol: Vec<LocalVector>,
}

/// Block lower-triangular preconditioner with one inner solver per diagonal
/// block, applied as a block Gauss-Seidel sweep:
/// `x_i = M_i^-1 (b_i - sum_{j<i} A_ij x_j)`.
#[derive(Debug)]
pub struct BlockPreconditioner {
    life: Lifecycle<LocalMatrix>,
    config: BlockConfig,
    solvers: Vec<Box<dyn Solver<LocalMatrix, LocalVector>>>,
    workspace: Option<BlockWorkspace>,
}

impl BlockPreconditioner {
    pub fn new(
        config: BlockConfig,
        solvers: Vec<Box<dyn Solver<LocalMatrix, LocalVector>>>,
    ) -> Result<Self> {
        if config.sizes.len() != solvers.len() || solvers.is_empty() {
            return Err(SolverError::InvalidParameter(format!(
                "BlockPreconditioner: {} block sizes for {} inner solvers",
                config.sizes.len(),
                solvers.len()
            )));
        }
        Ok(Self {
            life: Lifecycle::new("BlockPreconditioner"),
            config,
            solvers,
            workspace: None,
        })
    }

    /// Drops the off-diagonal blocks from the sweep.
    pub fn set_diagonal_solver(&mut self) -> Result<()> {
        if self.life.state == SolverState::Built {
            return Err(SolverError::AlreadyBuilt(self.life.name.clone()));
        }
        self.config.diagonal = true;
        Ok(())
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn blocks(&self) -> usize {
        self.solvers.len()
    }

    fn offsets(&self, rows: usize) -> Result<Vec<usize>> {
        let total: usize = self.config.sizes.iter().sum();
        if total != rows {
            return Err(SolverError::BlockSizeMismatch {
                expected: rows,
                actual: total,
            });
        }
        let mut offsets = Vec::with_capacity(self.config.sizes.len() + 1);
        offsets.push(0);
        for size in &self.config.sizes {
            offsets.push(offsets[offsets.len() - 1] + size);
        }
        Ok(offsets)
    }

    /// Diagonal blocks handed to the inner solvers, plus the lower coupling.
    fn split(
        &self,
        op: &LocalMatrix,
        offsets: &[usize],
    ) -> Result<(Vec<Arc<LocalMatrix>>, Vec<Vec<(usize, LocalMatrix)>>)> {
        let blocks = self.config.sizes.len();
        let mut diagonal = Vec::with_capacity(blocks);
        let mut lower = Vec::with_capacity(blocks);
        for i in 0..blocks {
            let rows = offsets[i]..offsets[i + 1];
            let mut a_ii =
                op.extract_submatrix(rows.clone(), rows.clone(), &format!("A_{}{}", i, i))?;
            if op.is_accelerator() {
                a_ii.move_to_accelerator()?;
            }
            diagonal.push(Arc::new(a_ii));

            let mut coupling = Vec::new();
            if !self.config.diagonal {
                for j in 0..i {
                    let cols = offsets[j]..offsets[j + 1];
                    let mut a_ij =
                        op.extract_submatrix(rows.clone(), cols, &format!("A_{}{}", i, j))?;
                    if a_ij.nnz() == 0 {
                        continue;
                    }
                    if op.is_accelerator() {
                        a_ij.move_to_accelerator()?;
                    }
                    coupling.push((j, a_ij));
                }
            }
            lower.push(coupling);
        }
        Ok((diagonal, lower))
    }
}

impl BlockPreconditioner {
    /// Builds inner solver `i` on `a_ii`; returns its rhs and solution vectors.
    fn build_block(
        &mut self,
        i: usize,
        a_ii: Arc<LocalMatrix>,
    ) -> Result<(LocalVector, LocalVector)> {
        let b_i = a_ii.new_vector(&format!("b_{}", i))?;
        let x_i = a_ii.new_vector(&format!("x_{}", i))?;
        self.solvers[i].set_operator(a_ii);
        self.solvers[i].build()?;
        Ok((b_i, x_i))
    }
}

impl Solver<LocalMatrix, LocalVector> for BlockPreconditioner {
    fn name(&self) -> &str {
        &self.life.name
    }

    fn set_operator(&mut self, op: Arc<LocalMatrix>) {
        self.life.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        let op = self.life.begin_build::<LocalVector>()?;
        let offsets = self.offsets(op.rows())?;
        let (diagonal, lower) = self.split(&op, &offsets)?;

        let mut rhs = Vec::with_capacity(diagonal.len());
        let mut sol = Vec::with_capacity(diagonal.len());
        for (i, a_ii) in diagonal.into_iter().enumerate() {
            match self.build_block(i, a_ii) {
                Ok((b_i, x_i)) => {
                    rhs.push(b_i);
                    sol.push(x_i);
                }
                Err(e) => {
                    // roll back the blocks already built
                    for solver in &mut self.solvers[..i] {
                        solver.clear();
                    }
                    return Err(e);
                }
            }
        }
        info!(
            "{}: {} blocks {:?}{}",
            self.life.name,
            self.solvers.len(),
            self.config.sizes,
            if self.config.diagonal { " (diagonal)" } else { "" }
        );
        self.workspace = Some(BlockWorkspace {
            offsets,
            lower,
            rhs,
            sol,
        });
        self.life.finish_build();
        Ok(())
    }

    fn rebuild_numeric(&mut self) -> Result<()> {
        self.life.ensure_built()?;
        let op = self.life.operator()?;
        let offsets = self.offsets(op.rows())?;
        let (diagonal, lower) = self.split(&op, &offsets)?;
        for (solver, a_ii) in self.solvers.iter_mut().zip(diagonal) {
            solver.set_operator(a_ii);
            solver.rebuild_numeric()?;
        }
        if let Some(ws) = self.workspace.as_mut() {
            ws.lower = lower;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.workspace = None;
        for solver in &mut self.solvers {
            solver.clear();
        }
        self.life.clear();
    }

    fn solve(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        self.life.begin_solve(rhs, &*x)?;
        let ws = self
            .workspace
            .as_mut()
            .ok_or_else(|| SolverError::NotBuilt(self.life.name.clone()))?;

        for (i, solver) in self.solvers.iter_mut().enumerate() {
            let (offset, size) = (ws.offsets[i], ws.offsets[i + 1] - ws.offsets[i]);
            let (done, current) = ws.sol.split_at_mut(i);
            let b_i = &mut ws.rhs[i];
            b_i.copy_range_from(rhs, offset, 0, size)?;
            for (j, a_ij) in &ws.lower[i] {
                a_ij.apply_add(&done[*j], -1.0, b_i)?;
            }
            let report = solver.solve_zero_sol(b_i, &mut current[0])?;
            debug!("{} block {}: {:?}", self.life.name, i, report.status);
            x.copy_range_from(&current[0], 0, offset, size)?;
        }
        Ok(applied())
    }

    fn solve_zero_sol(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        self.solve(rhs, x)
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        if let Some(ws) = self.workspace.as_mut() {
            for v in ws.rhs.iter_mut().chain(ws.sol.iter_mut()) {
                v.move_to_host()?;
            }
        }
        for solver in &mut self.solvers {
            solver.move_to_host_local_data()?;
        }
        Ok(())
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        if let Some(ws) = self.workspace.as_mut() {
            for v in ws.rhs.iter_mut().chain(ws.sol.iter_mut()) {
                v.move_to_accelerator()?;
            }
        }
        for solver in &mut self.solvers {
            solver.move_to_accelerator_local_data()?;
        }
        Ok(())
    }

    fn state(&self) -> SolverState {
        self.life.state
    }

    fn describe(&self) -> String {
        let inner: Vec<String> = self.solvers.iter().map(|s| s.describe()).collect();
        format!(
            "{} [{:?}] sizes={:?}, diagonal={}, blocks: [{}]",
            self.life.name,
            self.life.state,
            self.config.sizes,
            self.config.diagonal,
            inner.join("; ")
        )
    }
}
