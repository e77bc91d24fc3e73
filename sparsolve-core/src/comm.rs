//! Message passing between partitions.
//!
//! [`Communicator`] is the seam to the process topology. [`ThreadComm`]
//! realises it for partitions living on threads of one process, which is
//! what the tests and single-process drivers use.

use crate::context::block_on;
use crate::error::{CoreError, Result};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Message tag. Point-to-point and collective tags never collide.
pub type Tag = u64;

const COLLECTIVE_TAG_BIT: Tag = 1 << 63;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Values(Vec<f64>),
    Indices(Vec<usize>),
    MaxLoc { value: f64, index: usize },
}

impl Payload {
    pub fn into_values(self) -> Result<Vec<f64>> {
        match self {
            Payload::Values(values) => Ok(values),
            other => Err(unexpected("values", &other)),
        }
    }

    pub fn into_indices(self) -> Result<Vec<usize>> {
        match self {
            Payload::Indices(indices) => Ok(indices),
            other => Err(unexpected("indices", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Payload) -> CoreError {
    CoreError::Communication(format!("expected {} payload, got {:?}", expected, got))
}

#[derive(Debug)]
struct Message {
    source: usize,
    tag: Tag,
    payload: Payload,
}

/// Handle of one outstanding non-blocking operation. Must be passed to
/// [`Communicator::wait`] exactly once.
#[derive(Debug)]
#[must_use = "requests must be waited on"]
pub struct Request {
    kind: RequestKind,
}

#[derive(Debug)]
enum RequestKind {
    Send { dest: usize, tag: Tag },
    Recv { source: usize, tag: Tag },
}

impl Request {
    pub fn is_send(&self) -> bool {
        matches!(self.kind, RequestKind::Send { .. })
    }

    pub fn tag(&self) -> Tag {
        match self.kind {
            RequestKind::Send { tag, .. } | RequestKind::Recv { tag, .. } => tag,
        }
    }
}

/// Point-to-point and collective operations of one partition.
///
/// All partitions must issue collectives and `next_tag` in the same order.
pub trait Communicator: fmt::Debug + Send + Sync {
    fn rank(&self) -> usize;

    /// Number of partitions.
    fn size(&self) -> usize;

    /// Fresh point-to-point tag.
    fn next_tag(&self) -> Tag;

    fn isend(&self, dest: usize, tag: Tag, payload: Payload) -> Result<Request>;

    fn irecv(&self, source: usize, tag: Tag) -> Result<Request>;

    /// Completes a request. Receives yield their payload; sends yield `None`.
    fn wait(&self, request: Request) -> Result<Option<Payload>>;

    /// Sum over all partitions, accumulated in rank order.
    fn allreduce_sum(&self, value: f64) -> Result<f64>;

    /// Largest value over all partitions with its index; ties go to the smaller index.
    fn allreduce_max_loc(&self, value: f64, index: usize) -> Result<(f64, usize)>;

    /// `outgoing[r]` is delivered to rank `r`; returns what every rank sent here.
    fn alltoall_indices(&self, outgoing: Vec<Vec<usize>>) -> Result<Vec<Vec<usize>>>;

    fn barrier(&self) -> Result<()> {
        self.allreduce_sum(0.0).map(|_| ())
    }
}

struct Mailbox {
    receiver: UnboundedReceiver<Message>,
    stash: HashMap<(usize, Tag), VecDeque<Payload>>,
}

/// In-process communicator: one unbounded channel per rank, tag-matched on receipt.
pub struct ThreadComm {
    rank: usize,
    peers: Vec<UnboundedSender<Message>>,
    mailbox: Mutex<Mailbox>,
    p2p_tags: AtomicU64,
    collective_tags: AtomicU64,
}

impl fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.peers.len())
            .finish()
    }
}

impl ThreadComm {
    /// Creates `size` connected communicators; element `r` has rank `r`.
    pub fn world(size: usize) -> Vec<Arc<ThreadComm>> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| {
                Arc::new(ThreadComm {
                    rank,
                    peers: senders.clone(),
                    mailbox: Mutex::new(Mailbox {
                        receiver,
                        stash: HashMap::new(),
                    }),
                    p2p_tags: AtomicU64::new(0),
                    collective_tags: AtomicU64::new(0),
                })
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.peers.len() {
            return Err(CoreError::Communication(format!(
                "rank {} outside communicator of size {}",
                rank,
                self.peers.len()
            )));
        }
        Ok(())
    }

    fn post(&self, dest: usize, tag: Tag, payload: Payload) -> Result<()> {
        self.check_rank(dest)?;
        self.peers[dest]
            .unbounded_send(Message {
                source: self.rank,
                tag,
                payload,
            })
            .map_err(|e| CoreError::Communication(format!("send to rank {} failed: {}", dest, e)))
    }

    /// Blocks until the message `(source, tag)` arrives. Others are stashed.
    fn receive(&self, source: usize, tag: Tag) -> Result<Payload> {
        let mut mailbox = self
            .mailbox
            .lock()
            .map_err(|_| CoreError::Internal("mailbox poisoned".to_string()))?;
        if let Some(payload) = mailbox
            .stash
            .get_mut(&(source, tag))
            .and_then(VecDeque::pop_front)
        {
            return Ok(payload);
        }
        loop {
            let message = block_on(mailbox.receiver.next()).ok_or_else(|| {
                CoreError::Communication(format!("rank {} inbox closed", self.rank))
            })?;
            if message.source == source && message.tag == tag {
                return Ok(message.payload);
            }
            log::trace!(
                "rank {}: stashing message from {} with tag {:#x}",
                self.rank,
                message.source,
                message.tag
            );
            mailbox
                .stash
                .entry((message.source, message.tag))
                .or_default()
                .push_back(message.payload);
        }
    }

    fn collective_tag(&self) -> Tag {
        COLLECTIVE_TAG_BIT | self.collective_tags.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `payload` to every rank (itself included) and returns the
    /// payloads received, indexed by source rank.
    fn all_gather(&self, payload: Payload) -> Result<Vec<Payload>> {
        let tag = self.collective_tag();
        for dest in 0..self.peers.len() {
            self.post(dest, tag, payload.clone())?;
        }
        (0..self.peers.len())
            .map(|source| self.receive(source, tag))
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn next_tag(&self) -> Tag {
        self.p2p_tags.fetch_add(1, Ordering::Relaxed)
    }

    fn isend(&self, dest: usize, tag: Tag, payload: Payload) -> Result<Request> {
        // Channels are unbounded, so the send completes immediately.
        self.post(dest, tag, payload)?;
        Ok(Request {
            kind: RequestKind::Send { dest, tag },
        })
    }

    fn irecv(&self, source: usize, tag: Tag) -> Result<Request> {
        self.check_rank(source)?;
        Ok(Request {
            kind: RequestKind::Recv { source, tag },
        })
    }

    fn wait(&self, request: Request) -> Result<Option<Payload>> {
        match request.kind {
            RequestKind::Send { dest, tag } => {
                log::trace!("rank {}: send to {} tag {:#x} complete", self.rank, dest, tag);
                Ok(None)
            }
            RequestKind::Recv { source, tag } => self.receive(source, tag).map(Some),
        }
    }

    fn allreduce_sum(&self, value: f64) -> Result<f64> {
        let mut sum = 0.0;
        for payload in self.all_gather(Payload::Values(vec![value]))? {
            sum += payload.into_values()?.iter().sum::<f64>();
        }
        Ok(sum)
    }

    fn allreduce_max_loc(&self, value: f64, index: usize) -> Result<(f64, usize)> {
        let mut best: Option<(f64, usize)> = None;
        for payload in self.all_gather(Payload::MaxLoc { value, index })? {
            let (v, i) = match payload {
                Payload::MaxLoc { value, index } => (value, index),
                other => return Err(unexpected("max-loc", &other)),
            };
            best = match best {
                Some((bv, bi)) if bv > v || (bv == v && bi <= i) => Some((bv, bi)),
                _ => Some((v, i)),
            };
        }
        best.ok_or_else(|| CoreError::Communication("empty communicator".to_string()))
    }

    fn alltoall_indices(&self, outgoing: Vec<Vec<usize>>) -> Result<Vec<Vec<usize>>> {
        if outgoing.len() != self.peers.len() {
            return Err(CoreError::Communication(format!(
                "alltoall expects {} buffers, got {}",
                self.peers.len(),
                outgoing.len()
            )));
        }
        let tag = self.collective_tag();
        for (dest, indices) in outgoing.into_iter().enumerate() {
            self.post(dest, tag, Payload::Indices(indices))?;
        }
        (0..self.peers.len())
            .map(|source| self.receive(source, tag)?.into_indices())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run<F>(size: usize, f: F)
    where
        F: Fn(Arc<ThreadComm>) + Sync,
    {
        let world = ThreadComm::world(size);
        thread::scope(|s| {
            for comm in world {
                let f = &f;
                s.spawn(move || f(comm));
            }
        });
    }

    #[test]
    fn point_to_point_matches_tags_out_of_order() {
        run(2, |comm| {
            if comm.rank() == 0 {
                comm.wait(comm.isend(1, 7, Payload::Values(vec![7.0])).unwrap()).unwrap();
                comm.wait(comm.isend(1, 3, Payload::Values(vec![3.0])).unwrap()).unwrap();
            } else {
                let three = comm.irecv(0, 3).unwrap();
                let seven = comm.irecv(0, 7).unwrap();
                assert_eq!(
                    comm.wait(three).unwrap(),
                    Some(Payload::Values(vec![3.0]))
                );
                assert_eq!(
                    comm.wait(seven).unwrap(),
                    Some(Payload::Values(vec![7.0]))
                );
            }
        });
    }

    #[test]
    fn allreduce_is_identical_on_every_rank() {
        let values = [0.1, 1e16, -1e16, 0.2];
        run(4, |comm| {
            let sum = comm.allreduce_sum(values[comm.rank()]).unwrap();
            let expected: f64 = (((0.0 + 0.1) + 1e16) + -1e16) + 0.2;
            assert_eq!(sum.to_bits(), expected.to_bits());
        });
    }

    #[test]
    fn max_loc_prefers_smaller_index_on_ties() {
        run(3, |comm| {
            let (value, index) = match comm.rank() {
                0 => (2.0, 5),
                1 => (3.0, 9),
                _ => (3.0, 4),
            };
            assert_eq!(comm.allreduce_max_loc(value, index).unwrap(), (3.0, 4));
        });
    }

    #[test]
    fn alltoall_delivers_per_destination() {
        run(3, |comm| {
            let me = comm.rank();
            let outgoing = (0..3).map(|dest| vec![me * 10 + dest]).collect();
            let incoming = comm.alltoall_indices(outgoing).unwrap();
            for (source, indices) in incoming.iter().enumerate() {
                assert_eq!(indices, &vec![source * 10 + me]);
            }
        });
    }

    #[test]
    fn invalid_rank_is_an_error() {
        let world = ThreadComm::world(1);
        assert!(matches!(
            world[0].irecv(1, 0),
            Err(CoreError::Communication(_))
        ));
        assert_eq!(world[0].size(), 1);
    }
}
