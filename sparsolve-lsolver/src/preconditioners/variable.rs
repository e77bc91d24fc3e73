use super::Lifecycle;
use crate::error::{Result, SolverError};
use crate::solver::{SolveReport, Solver, SolverState};
use sparsolve_core::{Operator, Vector};
use std::sync::Arc;

/// Cycles through `k` preconditioners: application `i` uses `i mod k`.
///
/// The operator changes between iterations, so the outer method must be
/// flexible (FGMRES).
#[derive(Debug)]
pub struct VariablePreconditioner<O, V> {
    life: Lifecycle<O>,
    preconds: Vec<Box<dyn Solver<O, V>>>,
    counter: usize,
}

impl<O, V> VariablePreconditioner<O, V>
where
    O: Operator<V>,
    V: Vector,
{
    pub fn new(preconds: Vec<Box<dyn Solver<O, V>>>) -> Self {
        Self {
            life: Lifecycle::new("VariablePreconditioner"),
            preconds,
            counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.preconds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preconds.is_empty()
    }

    /// Index of the preconditioner the next application uses.
    pub fn next_index(&self) -> usize {
        match self.preconds.len() {
            0 => 0,
            k => self.counter % k,
        }
    }
}

impl<O, V> Solver<O, V> for VariablePreconditioner<O, V>
where
    O: Operator<V>,
    V: Vector,
{
    fn name(&self) -> &str {
        &self.life.name
    }

    fn set_operator(&mut self, op: Arc<O>) {
        self.life.op = Some(op);
    }

    fn build(&mut self) -> Result<()> {
        if self.preconds.is_empty() {
            return Err(SolverError::InvalidParameter(
                "VariablePreconditioner needs at least one preconditioner".to_string(),
            ));
        }
        let op = self.life.begin_build::<V>()?;
        for i in 0..self.preconds.len() {
            self.preconds[i].set_operator(Arc::clone(&op));
            if let Err(e) = self.preconds[i].build() {
                for built in &mut self.preconds[..i] {
                    built.clear();
                }
                return Err(e);
            }
        }
        self.counter = 0;
        self.life.finish_build();
        Ok(())
    }

    fn rebuild_numeric(&mut self) -> Result<()> {
        self.life.ensure_built()?;
        let op = self.life.operator()?;
        for precond in &mut self.preconds {
            precond.set_operator(Arc::clone(&op));
            precond.rebuild_numeric()?;
        }
        Ok(())
    }

    fn clear(&mut self) {
        for precond in &mut self.preconds {
            precond.clear();
        }
        self.counter = 0;
        self.life.clear();
    }

    fn solve(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport> {
        self.life.begin_solve(rhs, &*x)?;
        let index = self.next_index();
        self.counter += 1;
        log::trace!("{} applies #{}", self.life.name, index);
        self.preconds[index].solve_zero_sol(rhs, x)
    }

    fn solve_zero_sol(&mut self, rhs: &V, x: &mut V) -> Result<SolveReport> {
        self.solve(rhs, x)
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        for precond in &mut self.preconds {
            precond.move_to_host_local_data()?;
        }
        Ok(())
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        for precond in &mut self.preconds {
            precond.move_to_accelerator_local_data()?;
        }
        Ok(())
    }

    fn state(&self) -> SolverState {
        self.life.state
    }

    fn describe(&self) -> String {
        let inner: Vec<String> = self.preconds.iter().map(|p| p.describe()).collect();
        format!(
            "{} [{:?}] cycling [{}]",
            self.life.name,
            self.life.state,
            inner.join("; ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preconditioners::{Identity, Ilu};
    use sparsolve_core::{Context, LocalMatrix, LocalVector, Triplet};

    #[test]
    fn failed_build_releases_earlier_preconditioners() {
        let ctx = Context::host().unwrap();
        let no_diagonal = vec![Triplet::new(0, 1, 1.0), Triplet::new(1, 0, 1.0)];
        let a = Arc::new(LocalMatrix::from_triplets(&ctx, "A", 2, 2, &no_diagonal).unwrap());
        let preconds: Vec<Box<dyn Solver<LocalMatrix, LocalVector>>> =
            vec![Box::new(Identity::<LocalMatrix>::new()), Box::new(Ilu::default())];
        let mut variable = VariablePreconditioner::new(preconds);
        variable.set_operator(a);
        assert_eq!(
            variable.build(),
            Err(SolverError::SingularSystem { rank: 0, size: 2 })
        );
        assert_eq!(variable.state(), SolverState::Uninitialized);

        let diagonal = vec![Triplet::new(0, 0, 2.0), Triplet::new(1, 1, 4.0)];
        let d = Arc::new(LocalMatrix::from_triplets(&ctx, "D", 2, 2, &diagonal).unwrap());
        variable.set_operator(d);
        variable.build().unwrap();
        assert_eq!(variable.next_index(), 0);

        let rhs = LocalVector::from_slice(&ctx, "b", &[2.0, 4.0]);
        let mut x = LocalVector::allocate(&ctx, "x", 2);
        variable.solve(&rhs, &mut x).unwrap();
        assert_eq!(x.to_vec().unwrap(), vec![2.0, 4.0]);
        variable.solve(&rhs, &mut x).unwrap();
        assert_eq!(x.to_vec().unwrap(), vec![1.0, 1.0]);
    }
}
