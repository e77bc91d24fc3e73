use crate::error::Result;
use std::fmt::Debug;

/// Where an operand's storage currently lives.
pub trait Residency {
    fn is_host(&self) -> bool;

    fn is_accelerator(&self) -> bool {
        !self.is_host()
    }

    /// Deep-copies the storage to host memory. No-op when already there.
    fn move_to_host(&mut self) -> Result<()>;

    /// Deep-copies the storage to the context's accelerator.
    ///
    /// # Errors
    /// `CoreError::AcceleratorUnavailable` when the context is host-only.
    fn move_to_accelerator(&mut self) -> Result<()>;
}

/// Capability set shared by local and distributed vectors.
///
/// Arithmetic and reductions act on owned entries only; for distributed
/// vectors the reductions are completed across partitions.
pub trait Vector: Residency + Debug + Send {
    fn name(&self) -> &str;

    /// Global number of entries.
    fn size(&self) -> usize;

    /// Entries owned by this partition.
    fn local_size(&self) -> usize;

    // --- Fills ---

    fn zeros(&mut self) -> Result<()> {
        self.set_values(0.0)
    }

    fn ones(&mut self) -> Result<()> {
        self.set_values(1.0)
    }

    fn set_values(&mut self, value: f64) -> Result<()>;

    /// Uniform samples in `[a, b)` from a generator seeded with `seed`.
    fn set_random_uniform(&mut self, seed: u64, a: f64, b: f64) -> Result<()>;

    /// Normal samples with the given mean and variance.
    fn set_random_normal(&mut self, seed: u64, mean: f64, variance: f64) -> Result<()>;

    fn copy_from(&mut self, x: &Self) -> Result<()>;

    /// Releases the storage; the vector keeps its name and layout metadata.
    fn clear(&mut self) -> Result<()>;

    // --- Arithmetic ---

    /// `self = self + alpha * x`
    fn add_scale(&mut self, x: &Self, alpha: f64) -> Result<()>;

    /// `self = alpha * self + x`
    fn scale_add(&mut self, alpha: f64, x: &Self) -> Result<()>;

    /// `self = alpha * self + beta * x`
    fn scale_add_scale(&mut self, alpha: f64, x: &Self, beta: f64) -> Result<()>;

    /// `self = alpha * self + beta * x + gamma * y`
    fn scale_add2(&mut self, alpha: f64, x: &Self, beta: f64, y: &Self, gamma: f64) -> Result<()>;

    fn scale(&mut self, alpha: f64) -> Result<()>;

    /// `self = self .* x`
    fn point_wise_mult(&mut self, x: &Self) -> Result<()>;

    /// `self = x .* y`
    fn point_wise_mult2(&mut self, x: &Self, y: &Self) -> Result<()>;

    /// `self_i = self_i ^ p`
    fn power(&mut self, p: f64) -> Result<()>;

    // --- Reductions ---

    fn dot(&self, x: &Self) -> Result<f64>;

    /// Identical to [`Vector::dot`] for real values.
    fn dot_non_conj(&self, x: &Self) -> Result<f64> {
        self.dot(x)
    }

    fn norm(&self) -> Result<f64>;

    /// Sum of all entries.
    fn reduce(&self) -> Result<f64>;

    /// Sum of absolute values.
    fn asum(&self) -> Result<f64>;

    /// Global index and absolute value of the largest-magnitude entry.
    /// Ties resolve to the smallest index.
    fn amax(&self) -> Result<(usize, f64)>;

    // --- Grid transfer ---

    /// Coarse-from-fine sum: `self[map[i]] += fine[i]` for every mapped `i`.
    /// `self` is zeroed first.
    fn restriction(&mut self, fine: &Self, map: &[Option<usize>]) -> Result<()>;

    /// Fine-from-coarse injection: `self[i] = coarse[map[i]]`, or 0 when unmapped.
    fn prolongation(&mut self, coarse: &Self, map: &[Option<usize>]) -> Result<()>;
}

/// A linear map that solvers apply but never mutate.
pub trait Operator<V: Vector>: Residency + Debug + Send + Sync {
    fn rows(&self) -> usize;

    fn cols(&self) -> usize;

    fn nnz(&self) -> usize;

    fn is_square(&self) -> bool {
        self.rows() == self.cols()
    }

    /// `y = A x`
    fn apply(&self, x: &V, y: &mut V) -> Result<()>;

    /// `y = y + alpha * A x`
    fn apply_add(&self, x: &V, alpha: f64, y: &mut V) -> Result<()>;

    /// A zeroed vector compatible with the operator's range: same context,
    /// residency and parallel layout.
    fn new_vector(&self, name: &str) -> Result<V>;

    fn info(&self) -> String;
}

/// Operators whose diagonal is available, as needed by Jacobi relaxation.
pub trait DiagonalOperator<V: Vector>: Operator<V> {
    /// `d_i = 1 / a_ii`; rows with a zero diagonal get `1`.
    fn extract_inverse_diagonal(&self, name: &str) -> Result<V>;
}
