use crate::comm::{Payload, Request, Tag};
use crate::device::Context;
use crate::error::{check_size, CoreError, Result};
use crate::local_vector::LocalVector;
use crate::parallel_manager::ParallelManager;
use crate::traits::{Residency, Vector};
use std::cell::RefCell;
use std::ops::Range;
use std::sync::Arc;

/// Observable phase of a vector's ghost exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// Ghost values do not correspond to the current round.
    Idle,
    /// Transfers issued, not yet completed.
    Pending,
    /// Ghost values are valid until the interior changes.
    Ready,
}

#[derive(Debug)]
struct ExchangeSession {
    tag: Tag,
    sends: Vec<Request>,
    recvs: Vec<(Range<usize>, Request)>,
}

#[derive(Debug)]
enum ExchangeState {
    Idle,
    Pending(ExchangeSession),
    Ready,
}

#[derive(Debug)]
struct GhostRegion {
    buffer: LocalVector,
    state: ExchangeState,
}

/// Vector spanning all partitions: owned `interior` entries plus cached
/// `ghost` copies of neighbor entries needed by local operator application.
///
/// The ghost region is written only by the exchange and read only through
/// [`GlobalVector::with_ghost`] after a completed exchange.
#[derive(Debug)]
pub struct GlobalVector {
    name: String,
    interior: LocalVector,
    ghost: RefCell<GhostRegion>,
    manager: Arc<ParallelManager>,
}

/// Per-rank stream so partitions do not repeat each other's samples.
fn rank_seed(seed: u64, rank: usize) -> u64 {
    seed.wrapping_add((rank as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

impl GlobalVector {
    /// Zero vector on the host laid out by `manager`.
    pub fn new(context: &Arc<Context>, name: &str, manager: &Arc<ParallelManager>) -> Self {
        let interior = LocalVector::allocate(context, &format!("{} interior", name), manager.local_size());
        let ghost = LocalVector::allocate(context, &format!("{} ghost", name), manager.ghost_size());
        Self::assemble(name, interior, ghost, manager)
    }

    /// Takes this partition's slice of a full-length vector.
    pub fn from_global_slice(
        context: &Arc<Context>,
        name: &str,
        manager: &Arc<ParallelManager>,
        global: &[f64],
    ) -> Result<Self> {
        check_size("GlobalVector::from_global_slice", manager.global_size(), global.len())?;
        let interior = LocalVector::from_slice(
            context,
            &format!("{} interior", name),
            &global[manager.owned_range()],
        );
        let ghost = LocalVector::allocate(context, &format!("{} ghost", name), manager.ghost_size());
        Ok(Self::assemble(name, interior, ghost, manager))
    }

    /// Wraps an existing interior; the ghost region is allocated alongside it.
    pub fn from_interior(
        name: &str,
        interior: LocalVector,
        manager: &Arc<ParallelManager>,
    ) -> Result<Self> {
        check_size("GlobalVector::from_interior", manager.local_size(), interior.len())?;
        let mut ghost = LocalVector::allocate(
            interior.context(),
            &format!("{} ghost", name),
            manager.ghost_size(),
        );
        if interior.is_accelerator() {
            ghost.move_to_accelerator()?;
        }
        Ok(Self::assemble(name, interior, ghost, manager))
    }

    fn assemble(
        name: &str,
        interior: LocalVector,
        ghost: LocalVector,
        manager: &Arc<ParallelManager>,
    ) -> Self {
        Self {
            name: name.to_string(),
            interior,
            ghost: RefCell::new(GhostRegion {
                buffer: ghost,
                state: ExchangeState::Idle,
            }),
            manager: Arc::clone(manager),
        }
    }

    /// Zero vector with the same layout, context and residency.
    pub fn like(&self, name: &str) -> Result<Self> {
        let interior = self.interior.like(&format!("{} interior", name))?;
        let ghost = self.ghost.borrow().buffer.like(&format!("{} ghost", name))?;
        Ok(Self::assemble(name, interior, ghost, &self.manager))
    }

    pub fn manager(&self) -> &Arc<ParallelManager> {
        &self.manager
    }

    pub fn interior(&self) -> &LocalVector {
        &self.interior
    }

    /// Mutable interior access; the ghost region no longer matches afterwards.
    pub fn interior_mut(&mut self) -> &mut LocalVector {
        self.invalidate_ghost();
        &mut self.interior
    }

    pub fn exchange_status(&self) -> ExchangeStatus {
        match self.ghost.borrow().state {
            ExchangeState::Idle => ExchangeStatus::Idle,
            ExchangeState::Pending(_) => ExchangeStatus::Pending,
            ExchangeState::Ready => ExchangeStatus::Ready,
        }
    }

    fn invalidate_ghost(&mut self) {
        let region = self.ghost.get_mut();
        if matches!(region.state, ExchangeState::Ready) {
            region.state = ExchangeState::Idle;
        }
    }

    fn ensure_no_exchange(&self) -> Result<()> {
        if matches!(self.ghost.borrow().state, ExchangeState::Pending(_)) {
            return Err(CoreError::ExchangeInFlight(self.name.clone()));
        }
        Ok(())
    }

    fn check_layout(&self, other: &GlobalVector) -> Result<()> {
        if !self.manager.same_layout(&other.manager) {
            return Err(CoreError::InvalidParallelLayout(format!(
                "'{}' and '{}' have different layouts",
                self.name, other.name
            )));
        }
        Ok(())
    }

    // --- Ghost exchange ---

    /// Sends the boundary entries of `source`'s interior to the neighbors
    /// that need them and posts receives into this vector's ghost region.
    /// Returns without waiting. Usually `source` is `self`.
    ///
    /// # Errors
    /// `ExchangeInFlight` if the previous exchange has not been synchronized.
    pub fn update_ghost_values_async(&self, source: &GlobalVector) -> Result<()> {
        self.check_layout(source)?;
        let mut region = self.ghost.borrow_mut();
        if matches!(region.state, ExchangeState::Pending(_)) {
            return Err(CoreError::ExchangeInFlight(self.name.clone()));
        }

        let comm = self.manager.comm();
        let tag = comm.next_tag();
        let send_plan = self.manager.send_plan();
        let outgoing: Vec<Vec<f64>> = source.interior.with_host(|values| {
            send_plan
                .iter()
                .map(|segment| segment.interior.iter().map(|&i| values[i]).collect())
                .collect()
        })?;

        let sends = send_plan
            .iter()
            .zip(outgoing)
            .map(|(segment, values)| comm.isend(segment.rank, tag, Payload::Values(values)))
            .collect::<Result<Vec<_>>>()?;
        let recvs = self
            .manager
            .recv_plan()
            .iter()
            .map(|segment| Ok((segment.ghost_range.clone(), comm.irecv(segment.rank, tag)?)))
            .collect::<Result<Vec<_>>>()?;

        log::trace!(
            "'{}': exchange {:#x} issued ({} sends, {} receives)",
            self.name,
            tag,
            sends.len(),
            recvs.len()
        );
        region.state = ExchangeState::Pending(ExchangeSession { tag, sends, recvs });
        Ok(())
    }

    /// Waits for the outstanding exchange and stores the received values.
    /// Does nothing when no exchange is pending.
    pub fn update_ghost_values_sync(&self) -> Result<()> {
        let mut region = self.ghost.borrow_mut();
        let session = match std::mem::replace(&mut region.state, ExchangeState::Idle) {
            ExchangeState::Pending(session) => session,
            other => {
                region.state = other;
                return Ok(());
            }
        };

        let comm = self.manager.comm();
        for request in session.sends {
            comm.wait(request)?;
        }
        let mut received = Vec::with_capacity(session.recvs.len());
        for (range, request) in session.recvs {
            let values = comm
                .wait(request)?
                .ok_or_else(|| CoreError::Communication("receive completed without data".to_string()))?
                .into_values()?;
            check_size(&self.name, range.len(), values.len())?;
            received.push((range, values));
        }
        if !received.is_empty() {
            region.buffer.with_host_mut(|ghost| {
                for (range, values) in &received {
                    ghost[range.clone()].copy_from_slice(values);
                }
            })?;
        }
        log::trace!("'{}': exchange {:#x} complete", self.name, session.tag);
        region.state = ExchangeState::Ready;
        Ok(())
    }

    /// Runs `f` on the ghost region.
    ///
    /// # Errors
    /// `GhostNotSynchronized` unless an exchange completed since the last
    /// interior change.
    pub fn with_ghost<R>(&self, f: impl FnOnce(&LocalVector) -> R) -> Result<R> {
        let region = self.ghost.borrow();
        if !matches!(region.state, ExchangeState::Ready) {
            return Err(CoreError::GhostNotSynchronized(self.name.clone()));
        }
        Ok(f(&region.buffer))
    }

    pub fn ghost_values(&self) -> Result<Vec<f64>> {
        self.with_ghost(|ghost| ghost.to_vec())?
    }

    /// Full-length copy of the vector on every partition. Collective.
    pub fn to_global_vec(&self) -> Result<Vec<f64>> {
        let comm = self.manager.comm();
        let tag = comm.next_tag();
        let mine = self.interior.to_vec()?;
        let sends = (0..comm.size())
            .map(|dest| comm.isend(dest, tag, Payload::Values(mine.clone())))
            .collect::<Result<Vec<_>>>()?;
        let mut global = Vec::with_capacity(self.manager.global_size());
        for source in 0..comm.size() {
            let part = comm
                .wait(comm.irecv(source, tag)?)?
                .ok_or_else(|| CoreError::Communication("receive completed without data".to_string()))?
                .into_values()?;
            global.extend(part);
        }
        for request in sends {
            comm.wait(request)?;
        }
        Ok(global)
    }

    fn both_regions(&mut self, f: impl Fn(&mut LocalVector) -> Result<()>) -> Result<()> {
        self.ensure_no_exchange()?;
        f(&mut self.interior)?;
        let region = self.ghost.get_mut();
        f(&mut region.buffer)?;
        region.state = ExchangeState::Idle;
        Ok(())
    }
}

impl Residency for GlobalVector {
    fn is_host(&self) -> bool {
        self.interior.is_host()
    }

    fn move_to_host(&mut self) -> Result<()> {
        self.both_regions(|v| v.move_to_host())
    }

    fn move_to_accelerator(&mut self) -> Result<()> {
        self.both_regions(|v| v.move_to_accelerator())
    }
}

impl Vector for GlobalVector {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.manager.global_size()
    }

    fn local_size(&self) -> usize {
        self.interior.len()
    }

    fn set_values(&mut self, value: f64) -> Result<()> {
        self.both_regions(|v| v.set_values(value))
    }

    fn set_random_uniform(&mut self, seed: u64, a: f64, b: f64) -> Result<()> {
        let seed = rank_seed(seed, self.manager.rank());
        self.ensure_no_exchange()?;
        self.interior.set_random_uniform(seed, a, b)?;
        let region = self.ghost.get_mut();
        region.buffer.set_random_uniform(seed ^ u64::MAX, a, b)?;
        region.state = ExchangeState::Idle;
        Ok(())
    }

    fn set_random_normal(&mut self, seed: u64, mean: f64, variance: f64) -> Result<()> {
        let seed = rank_seed(seed, self.manager.rank());
        self.ensure_no_exchange()?;
        self.interior.set_random_normal(seed, mean, variance)?;
        let region = self.ghost.get_mut();
        region.buffer.set_random_normal(seed ^ u64::MAX, mean, variance)?;
        region.state = ExchangeState::Idle;
        Ok(())
    }

    fn copy_from(&mut self, x: &Self) -> Result<()> {
        self.check_layout(x)?;
        self.interior_mut().copy_from(&x.interior)
    }

    fn clear(&mut self) -> Result<()> {
        self.both_regions(|v| v.clear())
    }

    fn add_scale(&mut self, x: &Self, alpha: f64) -> Result<()> {
        self.check_layout(x)?;
        self.interior_mut().add_scale(&x.interior, alpha)
    }

    fn scale_add(&mut self, alpha: f64, x: &Self) -> Result<()> {
        self.check_layout(x)?;
        self.interior_mut().scale_add(alpha, &x.interior)
    }

    fn scale_add_scale(&mut self, alpha: f64, x: &Self, beta: f64) -> Result<()> {
        self.check_layout(x)?;
        self.interior_mut().scale_add_scale(alpha, &x.interior, beta)
    }

    fn scale_add2(&mut self, alpha: f64, x: &Self, beta: f64, y: &Self, gamma: f64) -> Result<()> {
        self.check_layout(x)?;
        self.check_layout(y)?;
        self.interior_mut()
            .scale_add2(alpha, &x.interior, beta, &y.interior, gamma)
    }

    fn scale(&mut self, alpha: f64) -> Result<()> {
        self.interior_mut().scale(alpha)
    }

    fn point_wise_mult(&mut self, x: &Self) -> Result<()> {
        self.check_layout(x)?;
        self.interior_mut().point_wise_mult(&x.interior)
    }

    fn point_wise_mult2(&mut self, x: &Self, y: &Self) -> Result<()> {
        self.check_layout(x)?;
        self.check_layout(y)?;
        self.interior_mut().point_wise_mult2(&x.interior, &y.interior)
    }

    fn power(&mut self, p: f64) -> Result<()> {
        self.interior_mut().power(p)
    }

    fn dot(&self, x: &Self) -> Result<f64> {
        self.check_layout(x)?;
        let local = self.interior.dot(&x.interior)?;
        self.manager.comm().allreduce_sum(local)
    }

    fn norm(&self) -> Result<f64> {
        let local = self.interior.dot(&self.interior)?;
        Ok(self.manager.comm().allreduce_sum(local)?.sqrt())
    }

    fn reduce(&self) -> Result<f64> {
        let local = self.interior.reduce()?;
        self.manager.comm().allreduce_sum(local)
    }

    fn asum(&self) -> Result<f64> {
        let local = self.interior.asum()?;
        self.manager.comm().allreduce_sum(local)
    }

    fn amax(&self) -> Result<(usize, f64)> {
        let (index, value) = self.interior.amax()?;
        let (value, index) = self
            .manager
            .comm()
            .allreduce_max_loc(value, self.manager.offset() + index)?;
        Ok((index, value))
    }

    /// Aggregates never cross partitions: `map` holds local coarse indices.
    fn restriction(&mut self, fine: &Self, map: &[Option<usize>]) -> Result<()> {
        self.interior_mut().restriction(&fine.interior, map)
    }

    fn prolongation(&mut self, coarse: &Self, map: &[Option<usize>]) -> Result<()> {
        self.interior_mut().prolongation(&coarse.interior, map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Communicator, ThreadComm};

    fn serial_vector(values: &[f64]) -> GlobalVector {
        let ctx = Context::host().unwrap();
        let world = ThreadComm::world(1);
        let comm: Arc<dyn Communicator> = world[0].clone();
        let pm = ParallelManager::serial(comm, values.len()).unwrap();
        GlobalVector::from_global_slice(&ctx, "v", &pm, values).unwrap()
    }

    #[test]
    fn ghost_is_unreadable_before_exchange() {
        let v = serial_vector(&[1.0, 2.0]);
        assert_eq!(v.exchange_status(), ExchangeStatus::Idle);
        assert_eq!(
            v.ghost_values().unwrap_err(),
            CoreError::GhostNotSynchronized("v".to_string())
        );
    }

    #[test]
    fn second_async_while_pending_is_rejected() {
        let v = serial_vector(&[1.0, 2.0]);
        v.update_ghost_values_async(&v).unwrap();
        assert_eq!(v.exchange_status(), ExchangeStatus::Pending);
        assert_eq!(
            v.update_ghost_values_async(&v).unwrap_err(),
            CoreError::ExchangeInFlight("v".to_string())
        );
        v.update_ghost_values_sync().unwrap();
        assert_eq!(v.exchange_status(), ExchangeStatus::Ready);
        assert!(v.ghost_values().unwrap().is_empty());
    }

    #[test]
    fn moves_are_refused_while_pending() {
        let mut v = serial_vector(&[1.0]);
        v.update_ghost_values_async(&v).unwrap();
        assert!(matches!(v.move_to_host(), Err(CoreError::ExchangeInFlight(_))));
        v.update_ghost_values_sync().unwrap();
        v.move_to_host().unwrap();
    }

    #[test]
    fn interior_mutation_resets_exchange() {
        let mut v = serial_vector(&[1.0, 2.0]);
        v.update_ghost_values_async(&v).unwrap();
        v.update_ghost_values_sync().unwrap();
        v.scale(2.0).unwrap();
        assert_eq!(v.exchange_status(), ExchangeStatus::Idle);
        assert_eq!(v.reduce().unwrap(), 6.0);
        assert_eq!(v.amax().unwrap(), (1, 4.0));
    }
}
