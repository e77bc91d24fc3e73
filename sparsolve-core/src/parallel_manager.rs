use crate::comm::Communicator;
use crate::error::{CoreError, Result};
use std::ops::Range;
use std::sync::Arc;

/// Ghost slots filled from one neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvSegment {
    pub rank: usize,
    pub ghost_range: Range<usize>,
}

/// Interior entries shipped to one neighbor, in the order it stores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSegment {
    pub rank: usize,
    pub interior: Vec<usize>,
}

/// Per-partition layout: owned range, ghost indices and the exchange plans.
///
/// Partitions own contiguous global ranges `offsets[r]..offsets[r + 1]`.
/// Ghost slots are sorted by global index, so each neighbor's slots are contiguous.
#[derive(Debug)]
pub struct ParallelManager {
    comm: Arc<dyn Communicator>,
    offsets: Vec<usize>,
    ghost_global: Vec<usize>,
    recv_plan: Vec<RecvSegment>,
    send_plan: Vec<SendSegment>,
}

fn validate_offsets(comm: &dyn Communicator, offsets: &[usize]) -> Result<()> {
    if offsets.len() != comm.size() + 1 {
        return Err(CoreError::InvalidParallelLayout(format!(
            "{} partition offsets for {} partitions",
            offsets.len(),
            comm.size()
        )));
    }
    if offsets[0] != 0 || offsets.windows(2).any(|w| w[0] > w[1]) {
        return Err(CoreError::InvalidParallelLayout(
            "partition offsets must start at 0 and be non-decreasing".to_string(),
        ));
    }
    Ok(())
}

impl ParallelManager {
    /// Derives both plans from the global indices this partition needs.
    ///
    /// Collective: every partition must call it. The ghost list is sorted and
    /// deduplicated; owned indices in it are rejected.
    pub fn from_ghost_indices(
        comm: Arc<dyn Communicator>,
        offsets: Vec<usize>,
        mut ghost_global: Vec<usize>,
    ) -> Result<Arc<Self>> {
        validate_offsets(comm.as_ref(), &offsets)?;
        let rank = comm.rank();
        let owned = offsets[rank]..offsets[rank + 1];
        let global_size = offsets[comm.size()];

        ghost_global.sort_unstable();
        ghost_global.dedup();
        if let Some(&bad) = ghost_global
            .iter()
            .find(|g| owned.contains(*g) || **g >= global_size)
        {
            return Err(CoreError::InvalidParallelLayout(format!(
                "rank {}: ghost index {} is owned locally or out of range",
                rank, bad
            )));
        }

        let owner = |g: usize| offsets.partition_point(|&o| o <= g) - 1;
        let mut recv_plan: Vec<RecvSegment> = Vec::new();
        let mut requests = vec![Vec::new(); comm.size()];
        for (slot, &g) in ghost_global.iter().enumerate() {
            let r = owner(g);
            requests[r].push(g);
            match recv_plan.last_mut() {
                Some(segment) if segment.rank == r => segment.ghost_range.end = slot + 1,
                _ => recv_plan.push(RecvSegment {
                    rank: r,
                    ghost_range: slot..slot + 1,
                }),
            }
        }

        let wanted = comm.alltoall_indices(requests)?;
        let mut send_plan = Vec::new();
        for (r, globals) in wanted.into_iter().enumerate() {
            if globals.is_empty() {
                continue;
            }
            let interior = globals
                .into_iter()
                .map(|g| {
                    if owned.contains(&g) {
                        Ok(g - owned.start)
                    } else {
                        Err(CoreError::InvalidParallelLayout(format!(
                            "rank {} asked rank {} for index {} it does not own",
                            r, rank, g
                        )))
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            send_plan.push(SendSegment { rank: r, interior });
        }

        log::debug!(
            "rank {}: {} ghosts from {} neighbors, sending to {} neighbors",
            rank,
            ghost_global.len(),
            recv_plan.len(),
            send_plan.len()
        );
        Ok(Arc::new(Self {
            comm,
            offsets,
            ghost_global,
            recv_plan,
            send_plan,
        }))
    }

    /// Uses caller-supplied plans as-is after bounds checks.
    pub fn from_plans(
        comm: Arc<dyn Communicator>,
        offsets: Vec<usize>,
        ghost_global: Vec<usize>,
        recv_plan: Vec<RecvSegment>,
        send_plan: Vec<SendSegment>,
    ) -> Result<Arc<Self>> {
        validate_offsets(comm.as_ref(), &offsets)?;
        let rank = comm.rank();
        let local_size = offsets[rank + 1] - offsets[rank];
        if recv_plan
            .iter()
            .any(|s| s.rank >= comm.size() || s.ghost_range.end > ghost_global.len())
        {
            return Err(CoreError::InvalidParallelLayout(
                "receive plan outside the ghost region".to_string(),
            ));
        }
        if send_plan
            .iter()
            .any(|s| s.rank >= comm.size() || s.interior.iter().any(|&i| i >= local_size))
        {
            return Err(CoreError::InvalidParallelLayout(
                "send plan outside the interior".to_string(),
            ));
        }
        Ok(Arc::new(Self {
            comm,
            offsets,
            ghost_global,
            recv_plan,
            send_plan,
        }))
    }

    /// Single partition owning everything; no ghosts.
    pub fn serial(comm: Arc<dyn Communicator>, global_size: usize) -> Result<Arc<Self>> {
        Self::from_plans(comm, vec![0, global_size], Vec::new(), Vec::new(), Vec::new())
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn partitions(&self) -> usize {
        self.comm.size()
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn global_size(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    /// First global index owned here.
    pub fn offset(&self) -> usize {
        self.offsets[self.rank()]
    }

    pub fn local_size(&self) -> usize {
        self.offsets[self.rank() + 1] - self.offsets[self.rank()]
    }

    pub fn owned_range(&self) -> Range<usize> {
        self.offset()..self.offset() + self.local_size()
    }

    pub fn ghost_size(&self) -> usize {
        self.ghost_global.len()
    }

    pub fn ghost_global(&self) -> &[usize] {
        &self.ghost_global
    }

    /// Ghost slot holding global index `global`.
    pub fn ghost_slot(&self, global: usize) -> Option<usize> {
        self.ghost_global.binary_search(&global).ok()
    }

    pub fn recv_plan(&self) -> &[RecvSegment] {
        &self.recv_plan
    }

    pub fn send_plan(&self) -> &[SendSegment] {
        &self.send_plan
    }

    /// Whether two managers describe the same layout.
    pub fn same_layout(&self, other: &ParallelManager) -> bool {
        self.offsets == other.offsets && self.ghost_global == other.ghost_global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadComm;
    use std::thread;

    #[test]
    fn plans_from_ghost_indices() {
        // 9 unknowns over 3 ranks: [0,3) [3,6) [6,9); 1D stencil neighbors.
        let world = ThreadComm::world(3);
        thread::scope(|s| {
            for comm in world {
                s.spawn(move || {
                    let rank = comm.rank();
                    let ghosts = match rank {
                        0 => vec![3],
                        1 => vec![6, 2, 2],
                        _ => vec![5],
                    };
                    let pm = ParallelManager::from_ghost_indices(comm, vec![0, 3, 6, 9], ghosts)
                        .unwrap();
                    assert_eq!(pm.global_size(), 9);
                    assert_eq!(pm.local_size(), 3);
                    match rank {
                        0 => {
                            assert_eq!(pm.ghost_global(), &[3]);
                            assert_eq!(pm.recv_plan(), &[RecvSegment { rank: 1, ghost_range: 0..1 }]);
                            assert_eq!(pm.send_plan(), &[SendSegment { rank: 1, interior: vec![2] }]);
                        }
                        1 => {
                            assert_eq!(pm.ghost_global(), &[2, 6]);
                            assert_eq!(pm.ghost_slot(6), Some(1));
                            assert_eq!(pm.recv_plan().len(), 2);
                            assert_eq!(
                                pm.send_plan(),
                                &[
                                    SendSegment { rank: 0, interior: vec![0] },
                                    SendSegment { rank: 2, interior: vec![2] },
                                ]
                            );
                        }
                        _ => {
                            assert_eq!(pm.send_plan(), &[SendSegment { rank: 1, interior: vec![0] }]);
                        }
                    }
                });
            }
        });
    }

    #[test]
    fn owned_ghost_is_rejected() {
        let world = ThreadComm::world(1);
        let comm: Arc<dyn Communicator> = world[0].clone();
        let err = ParallelManager::from_ghost_indices(comm, vec![0, 4], vec![1]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidParallelLayout(_)));
    }

    #[test]
    fn offsets_must_match_partition_count() {
        let world = ThreadComm::world(2);
        let comm: Arc<dyn Communicator> = world[0].clone();
        assert!(ParallelManager::from_plans(comm, vec![0, 4], vec![], vec![], vec![]).is_err());
    }
}
