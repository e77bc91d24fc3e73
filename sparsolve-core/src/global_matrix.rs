use crate::comm::Communicator;
use crate::device::Context;
use crate::error::{check_size, CoreError, Result};
use crate::global_vector::GlobalVector;
use crate::local_matrix::LocalMatrix;
use crate::parallel_manager::ParallelManager;
use crate::sparse_matrix::{SparseMatrix, Triplet};
use crate::traits::{DiagonalOperator, Operator, Residency};
use std::sync::Arc;

/// Row-partitioned operator: `interior` couples owned unknowns, `ghost`
/// couples owned rows to ghost slots of the shared [`ParallelManager`].
#[derive(Debug)]
pub struct GlobalMatrix {
    name: String,
    interior: LocalMatrix,
    ghost: LocalMatrix,
    manager: Arc<ParallelManager>,
    global_nnz: usize,
}

impl GlobalMatrix {
    /// Assembles from blocks already expressed in local numbering. Collective.
    pub fn from_parts(
        name: &str,
        interior: LocalMatrix,
        ghost: LocalMatrix,
        manager: Arc<ParallelManager>,
    ) -> Result<Self> {
        let local = manager.local_size();
        check_size("interior rows", local, interior.rows())?;
        check_size("interior cols", local, interior.cols())?;
        check_size("ghost rows", local, ghost.rows())?;
        check_size("ghost cols", manager.ghost_size(), ghost.cols())?;
        let local_nnz = interior.nnz() + ghost.nnz();
        let global_nnz = manager.comm().allreduce_sum(local_nnz as f64)? as usize;
        Ok(Self {
            name: name.to_string(),
            interior,
            ghost,
            manager,
            global_nnz,
        })
    }

    /// Takes this partition's rows of a full matrix, splits them into interior
    /// and ghost blocks and derives the exchange plans. Collective.
    ///
    /// # Arguments
    /// * `global` - the full square matrix, identical on every partition.
    /// * `offsets` - partition boundaries, `comm.size() + 1` entries.
    pub fn from_global_csr(
        context: &Arc<Context>,
        comm: Arc<dyn Communicator>,
        global: &SparseMatrix,
        offsets: Vec<usize>,
    ) -> Result<Self> {
        if !global.is_square() {
            return Err(CoreError::InvalidDimensions(format!(
                "distributed operator must be square, got {}x{}",
                global.rows(),
                global.cols()
            )));
        }
        if offsets.last() != Some(&global.rows()) {
            return Err(CoreError::InvalidParallelLayout(format!(
                "offsets end at {:?}, matrix has {} rows",
                offsets.last(),
                global.rows()
            )));
        }
        let rank = comm.rank();
        if rank + 1 >= offsets.len() {
            return Err(CoreError::InvalidParallelLayout(format!(
                "no offsets for rank {}",
                rank
            )));
        }
        let owned = offsets[rank]..offsets[rank + 1];

        let ghost_global: Vec<usize> = owned
            .clone()
            .flat_map(|row| global.row(row).0.iter().copied())
            .filter(|c| !owned.contains(c))
            .collect();
        let manager = ParallelManager::from_ghost_indices(comm, offsets, ghost_global)?;

        let mut interior = Vec::new();
        let mut ghost = Vec::new();
        for (local_row, row) in owned.clone().enumerate() {
            let (cols, values) = global.row(row);
            for (&col, &value) in cols.iter().zip(values) {
                if owned.contains(&col) {
                    interior.push(Triplet::new(local_row, col - owned.start, value));
                } else {
                    let slot = manager.ghost_slot(col).ok_or_else(|| {
                        CoreError::Internal(format!("column {} missing from ghost layout", col))
                    })?;
                    ghost.push(Triplet::new(local_row, slot, value));
                }
            }
        }
        let local = manager.local_size();
        let interior = LocalMatrix::from_triplets(context, "interior", local, local, &interior)?;
        let ghost =
            LocalMatrix::from_triplets(context, "ghost", local, manager.ghost_size(), &ghost)?;
        Self::from_parts("A", interior, ghost, manager)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &Arc<ParallelManager> {
        &self.manager
    }

    pub fn interior(&self) -> &LocalMatrix {
        &self.interior
    }

    pub fn ghost(&self) -> &LocalMatrix {
        &self.ghost
    }

    /// `y = alpha * A x + beta * y`. The exchange of `x` overlaps the interior product.
    fn spmv(&self, x: &GlobalVector, alpha: f64, beta: f64, y: &mut GlobalVector) -> Result<()> {
        if !self.manager.same_layout(x.manager()) || !self.manager.same_layout(y.manager()) {
            return Err(CoreError::InvalidParallelLayout(format!(
                "'{}': operand layout differs from operator layout",
                self.name
            )));
        }
        x.update_ghost_values_async(x)?;
        let interior_result = self.interior.spmv(alpha, x.interior(), beta, y.interior_mut());
        x.update_ghost_values_sync()?;
        interior_result?;
        if self.ghost.nnz() > 0 {
            x.with_ghost(|ghost| self.ghost.apply_add(ghost, alpha, y.interior_mut()))??;
        }
        Ok(())
    }
}

impl Residency for GlobalMatrix {
    fn is_host(&self) -> bool {
        self.interior.is_host()
    }

    fn move_to_host(&mut self) -> Result<()> {
        self.interior.move_to_host()?;
        self.ghost.move_to_host()
    }

    fn move_to_accelerator(&mut self) -> Result<()> {
        self.interior.move_to_accelerator()?;
        self.ghost.move_to_accelerator()
    }
}

impl Operator<GlobalVector> for GlobalMatrix {
    fn rows(&self) -> usize {
        self.manager.global_size()
    }

    fn cols(&self) -> usize {
        self.manager.global_size()
    }

    fn nnz(&self) -> usize {
        self.global_nnz
    }

    fn apply(&self, x: &GlobalVector, y: &mut GlobalVector) -> Result<()> {
        self.spmv(x, 1.0, 0.0, y)
    }

    fn apply_add(&self, x: &GlobalVector, alpha: f64, y: &mut GlobalVector) -> Result<()> {
        self.spmv(x, alpha, 1.0, y)
    }

    fn new_vector(&self, name: &str) -> Result<GlobalVector> {
        let mut v = GlobalVector::new(self.interior.context(), name, &self.manager);
        if self.is_accelerator() {
            v.move_to_accelerator()?;
        }
        Ok(v)
    }

    fn info(&self) -> String {
        format!(
            "GlobalMatrix '{}' {}x{}, nnz={}, rank {}/{}: interior nnz={}, ghost {}x{} nnz={}",
            self.name,
            self.rows(),
            self.cols(),
            self.global_nnz,
            self.manager.rank(),
            self.manager.partitions(),
            self.interior.nnz(),
            self.ghost.rows(),
            self.ghost.cols(),
            self.ghost.nnz()
        )
    }
}

impl DiagonalOperator<GlobalVector> for GlobalMatrix {
    fn extract_inverse_diagonal(&self, name: &str) -> Result<GlobalVector> {
        let interior = self
            .interior
            .extract_inverse_diagonal(&format!("{} interior", name))?;
        GlobalVector::from_interior(name, interior, &self.manager)
    }
}
