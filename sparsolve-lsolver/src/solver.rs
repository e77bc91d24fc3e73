use crate::error::{Result, SolverError};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sparsolve_core::{Operator, Vector};
use std::fmt::Debug;
use std::sync::Arc;

/// Lifecycle of a solver or preconditioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverState {
    Uninitialized,
    Built,
    Cleared,
}

/// A scalar that vanished inside a recurrence and stopped the iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Breakdown {
    pub iteration: usize,
    pub quantity: &'static str,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SolveStatus {
    Converged,
    MaxIterations,
    Diverged,
    Stalled(Breakdown),
}

/// Outcome of one `solve` call. `x` always holds the last iterate.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    pub status: SolveStatus,
    pub iterations: usize,
    pub initial_residual: f64,
    pub final_residual: f64,
}

impl SolveReport {
    pub fn converged(&self) -> bool {
        self.status == SolveStatus::Converged
    }

    /// `final / initial`, or the final residual when the initial one is zero.
    pub fn relative_residual(&self) -> f64 {
        if self.initial_residual > 0.0 {
            self.final_residual / self.initial_residual
        } else {
            self.final_residual
        }
    }
}

/// Stopping rules shared by every iterative method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceCriteria {
    pub abs_tol: f64,
    pub rel_tol: f64,
    /// Relative growth at which the iteration is declared divergent.
    pub div_tol: f64,
    pub max_iter: usize,
    /// Convergence is not declared before this many iterations.
    pub min_iter: usize,
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            abs_tol: 1e-15,
            rel_tol: 1e-6,
            div_tol: 1e8,
            max_iter: 1_000_000,
            min_iter: 0,
        }
    }
}

impl ConvergenceCriteria {
    pub fn new(abs_tol: f64, rel_tol: f64, div_tol: f64, max_iter: usize) -> Self {
        Self {
            abs_tol,
            rel_tol,
            div_tol,
            max_iter,
            min_iter: 0,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_rel_tol(mut self, rel_tol: f64) -> Self {
        self.rel_tol = rel_tol;
        self
    }

    /// A fixed number of sweeps: tolerances never trigger.
    pub fn fixed_iterations(iterations: usize) -> Self {
        Self {
            abs_tol: 0.0,
            rel_tol: 0.0,
            div_tol: f64::INFINITY,
            max_iter: iterations,
            min_iter: 0,
        }
    }
}

/// Iteration counter and residual bookkeeping for one solve.
#[derive(Debug, Clone)]
pub struct IterationControl {
    criteria: ConvergenceCriteria,
    iteration: usize,
    initial_residual: f64,
    current_residual: f64,
    history: Option<Vec<f64>>,
}

impl IterationControl {
    pub fn new(criteria: ConvergenceCriteria) -> Self {
        Self {
            criteria,
            iteration: 0,
            initial_residual: 0.0,
            current_residual: 0.0,
            history: None,
        }
    }

    pub fn criteria(&self) -> &ConvergenceCriteria {
        &self.criteria
    }

    pub fn set_criteria(&mut self, criteria: ConvergenceCriteria) {
        self.criteria = criteria;
    }

    /// Keeps every checked residual, starting with the initial one.
    pub fn record_history(&mut self, enabled: bool) {
        self.history = enabled.then(Vec::new);
    }

    pub fn history(&self) -> Option<&[f64]> {
        self.history.as_deref()
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn initial_residual(&self) -> f64 {
        self.initial_residual
    }

    pub fn current_residual(&self) -> f64 {
        self.current_residual
    }

    /// Starts a solve. Returns a status when no iteration is needed.
    pub fn init(&mut self, residual: f64) -> Option<SolveStatus> {
        self.iteration = 0;
        self.initial_residual = residual;
        self.current_residual = residual;
        if let Some(history) = self.history.as_mut() {
            history.clear();
            history.push(residual);
        }
        if !residual.is_finite() {
            return Some(SolveStatus::Diverged);
        }
        if self.criteria.max_iter == 0 {
            return Some(SolveStatus::MaxIterations);
        }
        if self.criteria.min_iter == 0 && residual <= self.criteria.abs_tol {
            return Some(SolveStatus::Converged);
        }
        None
    }

    /// Whether `residual` meets the tolerances at the current iteration count.
    pub fn is_converged(&self, residual: f64) -> bool {
        if self.iteration < self.criteria.min_iter {
            return false;
        }
        residual <= self.criteria.abs_tol
            || residual <= self.criteria.rel_tol * self.initial_residual
    }

    /// Counts one iteration ending with `residual`. Returns the final status
    /// once the iteration has to stop.
    pub fn check(&mut self, residual: f64) -> Option<SolveStatus> {
        self.iteration += 1;
        self.current_residual = residual;
        if let Some(history) = self.history.as_mut() {
            history.push(residual);
        }
        debug!("iteration {}: residual {:e}", self.iteration, residual);

        if !residual.is_finite() {
            return Some(SolveStatus::Diverged);
        }
        if self.is_converged(residual) {
            return Some(SolveStatus::Converged);
        }
        if self.initial_residual > 0.0
            && residual >= self.criteria.div_tol * self.initial_residual
        {
            return Some(SolveStatus::Diverged);
        }
        if self.iteration >= self.criteria.max_iter {
            return Some(SolveStatus::MaxIterations);
        }
        None
    }

    pub fn report(&self, status: SolveStatus) -> SolveReport {
        SolveReport {
            status,
            iterations: self.iteration,
            initial_residual: self.initial_residual,
            final_residual: self.current_residual,
        }
    }

    /// Report for a breakdown at the current iteration.
    pub fn stalled(&self, quantity: &'static str, value: f64) -> SolveReport {
        log::warn!(
            "breakdown at iteration {}: {} = {:e}",
            self.iteration,
            quantity,
            value
        );
        self.report(SolveStatus::Stalled(Breakdown {
            iteration: self.iteration,
            quantity,
            value,
        }))
    }
}

/// Common contract of solvers and preconditioners.
///
/// A preconditioner is a solver whose `solve` computes `x = M^-1 rhs`.
/// Operators are shared as `Arc<O>` and never mutated.
pub trait Solver<O, V>: Debug + Send
where
    O: Operator<V>,
    V: Vector,
{
    fn name(&self) -> &str;

    /// Attaches the system operator. Takes effect at the next `build` or
    /// `rebuild_numeric`.
    fn set_operator(&mut self, op: Arc<O>);

    /// Allocates workspace, builds attached sub-solvers and moves to `Built`.
    ///
    /// # Errors
    /// `MissingOperator` without an operator, `AlreadyBuilt` when built.
    fn build(&mut self) -> Result<()>;

    /// Refreshes numeric state for an operator with unchanged structure.
    fn rebuild_numeric(&mut self) -> Result<()>;

    /// Releases workspace, recursively clears sub-solvers.
    fn clear(&mut self);

    /// Solves `A x = rhs` starting from the current `x`.
    fn solve(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport>;

    /// Solves ignoring the incoming contents of `x`.
    fn solve_zero_sol(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport> {
        x.zeros()?;
        self.solve(rhs, x)
    }

    /// Moves solver-owned workspace only; the operator keeps its residency.
    fn move_to_host_local_data(&mut self) -> Result<()>;

    fn move_to_accelerator_local_data(&mut self) -> Result<()>;

    fn state(&self) -> SolverState;

    fn describe(&self) -> String;
}

/// Solve path picked once at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SolveMode {
    NonPrecond,
    Precond,
}

/// Shared plumbing of the iterative methods: operator, optional
/// preconditioner, iteration control and lifecycle.
#[derive(Debug)]
pub struct IterativeBase<O, V> {
    pub(crate) name: String,
    pub(crate) op: Option<Arc<O>>,
    pub(crate) precond: Option<Box<dyn Solver<O, V>>>,
    pub(crate) control: IterationControl,
    pub(crate) state: SolverState,
    pub(crate) mode: SolveMode,
}

impl<O, V> IterativeBase<O, V>
where
    O: Operator<V>,
    V: Vector,
{
    pub fn new(name: &str, criteria: ConvergenceCriteria) -> Self {
        Self {
            name: name.to_string(),
            op: None,
            precond: None,
            control: IterationControl::new(criteria),
            state: SolverState::Uninitialized,
            mode: SolveMode::NonPrecond,
        }
    }

    pub fn control(&self) -> &IterationControl {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut IterationControl {
        &mut self.control
    }

    pub(crate) fn set_preconditioner(&mut self, precond: Box<dyn Solver<O, V>>) -> Result<()> {
        if self.state == SolverState::Built {
            return Err(SolverError::AlreadyBuilt(self.name.clone()));
        }
        self.precond = Some(precond);
        Ok(())
    }

    pub(crate) fn operator(&self) -> Result<Arc<O>> {
        self.op
            .clone()
            .ok_or_else(|| SolverError::MissingOperator(self.name.clone()))
    }

    /// Checks the lifecycle, builds the preconditioner and picks the solve
    /// path. The caller allocates its workspace, then calls [`Self::finish_build`].
    pub(crate) fn begin_build(&mut self) -> Result<Arc<O>> {
        if self.state == SolverState::Built {
            return Err(SolverError::AlreadyBuilt(self.name.clone()));
        }
        let op = self.operator()?;
        if !op.is_square() {
            return Err(SolverError::InvalidParameter(format!(
                "'{}' needs a square operator, got {}x{}",
                self.name,
                op.rows(),
                op.cols()
            )));
        }
        info!("Building {} for {}", self.name, op.info());
        self.mode = match self.precond.as_mut() {
            Some(precond) => {
                precond.set_operator(Arc::clone(&op));
                precond.build()?;
                SolveMode::Precond
            }
            None => SolveMode::NonPrecond,
        };
        Ok(op)
    }

    /// Marks the solver built once its workspace exists. A failed allocation
    /// clears the preconditioner built by [`Self::begin_build`].
    pub(crate) fn finish_build<W>(&mut self, workspace: Result<W>) -> Result<W> {
        match workspace {
            Ok(workspace) => {
                self.state = SolverState::Built;
                Ok(workspace)
            }
            Err(e) => {
                if let Some(precond) = self.precond.as_mut() {
                    precond.clear();
                }
                Err(e)
            }
        }
    }

    pub(crate) fn rebuild_numeric(&mut self) -> Result<Arc<O>> {
        self.ensure_built()?;
        let op = self.operator()?;
        if let Some(precond) = self.precond.as_mut() {
            precond.set_operator(Arc::clone(&op));
            precond.rebuild_numeric()?;
        }
        Ok(op)
    }

    pub(crate) fn clear(&mut self) {
        if let Some(precond) = self.precond.as_mut() {
            precond.clear();
        }
        if self.state == SolverState::Built {
            self.state = SolverState::Cleared;
        }
    }

    pub(crate) fn ensure_built(&self) -> Result<()> {
        if self.state != SolverState::Built {
            return Err(SolverError::NotBuilt(self.name.clone()));
        }
        Ok(())
    }

    /// Lifecycle and size checks at the top of every `solve`.
    pub(crate) fn begin_solve(&self, rhs: &V, x: &V) -> Result<Arc<O>> {
        self.ensure_built()?;
        let op = self.operator()?;
        if rhs.size() != op.rows() || x.size() != op.cols() {
            return Err(SolverError::Core(sparsolve_core::CoreError::InvalidDimensions(
                format!(
                    "'{}': operator {}x{}, rhs {}, x {}",
                    self.name,
                    op.rows(),
                    op.cols(),
                    rhs.size(),
                    x.size()
                ),
            )));
        }
        Ok(op)
    }

    pub(crate) fn move_precond_to_host(&mut self) -> Result<()> {
        match self.precond.as_mut() {
            Some(precond) => precond.move_to_host_local_data(),
            None => Ok(()),
        }
    }

    pub(crate) fn move_precond_to_accelerator(&mut self) -> Result<()> {
        match self.precond.as_mut() {
            Some(precond) => precond.move_to_accelerator_local_data(),
            None => Ok(()),
        }
    }

    pub(crate) fn describe(&self) -> String {
        let precond = self
            .precond
            .as_ref()
            .map_or_else(|| "none".to_string(), |p| p.describe());
        format!(
            "{} [{:?}] abs_tol={:e} rel_tol={:e} max_iter={}, preconditioner: {}",
            self.name,
            self.state,
            self.control.criteria.abs_tol,
            self.control.criteria.rel_tol,
            self.control.criteria.max_iter,
            precond
        )
    }
}

/// `z = M^-1 r`, or a copy when no preconditioner is attached.
pub(crate) fn precondition<O, V>(
    precond: &mut Option<Box<dyn Solver<O, V>>>,
    r: &V,
    z: &mut V,
) -> Result<()>
where
    O: Operator<V>,
    V: Vector,
{
    match precond.as_mut() {
        Some(p) => {
            p.solve_zero_sol(r, z)?;
        }
        None => z.copy_from(r)?,
    }
    Ok(())
}

/// `r = rhs - A x`; returns `||r||`.
pub(crate) fn residual<O, V>(op: &O, rhs: &V, x: &V, r: &mut V) -> Result<f64>
where
    O: Operator<V>,
    V: Vector,
{
    op.apply(x, r)?;
    r.scale_add(-1.0, rhs)?;
    Ok(r.norm()?)
}

/// Ensures a structural lifecycle for solvers without iteration control.
pub(crate) fn check_buildable(state: SolverState, name: &str, has_op: bool) -> Result<()> {
    if state == SolverState::Built {
        return Err(SolverError::AlreadyBuilt(name.to_string()));
    }
    if !has_op {
        return Err(SolverError::MissingOperator(name.to_string()));
    }
    Ok(())
}
