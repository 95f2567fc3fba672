//! Collective communication abstraction. The aggregator's gather engine is
//! written against the [`CollectiveBus`] trait, never against a concrete
//! transport, so the same gather logic runs over an in-process
//! [`ThreadBus`] in tests and demos and over a real MPI communicator in
//! production (behind the `mpi-backend` feature).
//!
//! The trait's method names follow the rsmpi convention (`barrier`,
//! `broadcast_into`, `gather_into`, `all_gather_into`) rather than
//! inventing a fresh vocabulary.

use std::any::Any;
use std::sync::{Arc, Barrier, Mutex};

use aggregator_value::{AggregatorError, Result};
use tracing::trace;

/// Reduction operator applied by [`CollectiveBus::reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    pub fn identity(self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Min => f64::INFINITY,
            ReduceOp::Max => f64::NEG_INFINITY,
        }
    }

    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

/// A communicator of `size` ranks, this process being `rank`.
///
/// Every collective call is a synchronization point: all ranks must call
/// the same method, in the same order, with a value of the same type `T`,
/// or the bus will deadlock or panic — exactly the contract real MPI
/// imposes on collective operations.
pub trait CollectiveBus {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every rank has entered the barrier.
    fn barrier(&self);

    /// `root` contributes `Some(value)`, everyone else contributes `None`;
    /// every rank receives a clone of `root`'s value.
    fn broadcast<T: Clone + Send + 'static>(&self, root: i32, value: Option<T>) -> Result<T>;

    /// Every rank contributes a value; every rank receives all of them,
    /// ordered by rank.
    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>>;

    /// Every rank contributes a value; only `root` receives the
    /// rank-ordered collection, everyone else gets `None`.
    fn gather<T: Clone + Send + 'static>(&self, root: i32, value: T) -> Result<Option<Vec<T>>>;

    /// Variable-length byte gather: every rank sends an independently
    /// sized buffer, `root` receives them all ordered by rank.
    fn gatherv_bytes(&self, root: i32, bytes: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>>;

    /// Reduce one `f64` per rank to `root` using `op`. Non-root ranks get
    /// `None`.
    fn reduce(&self, root: i32, op: ReduceOp, value: f64) -> Result<Option<f64>>;
}

type Slot = Option<Box<dyn Any + Send>>;

struct ThreadBusShared {
    size: i32,
    entry: Barrier,
    exit: Barrier,
    slots: Mutex<Vec<Slot>>,
}

/// In-process [`CollectiveBus`] backed by `std::sync` primitives, one
/// handle per simulated rank, all sharing one [`ThreadBusShared`]. Used by
/// every test in this workspace and by the demo binary's default mode.
pub struct ThreadBus {
    rank: i32,
    shared: Arc<ThreadBusShared>,
}

impl ThreadBus {
    /// Build `size` bus handles, one per simulated rank, sharing one
    /// rendezvous point per collective call.
    pub fn new_group(size: i32) -> Vec<ThreadBus> {
        let shared = Arc::new(ThreadBusShared {
            size,
            entry: Barrier::new(size as usize),
            exit: Barrier::new(size as usize),
            slots: Mutex::new((0..size).map(|_| None).collect()),
        });
        (0..size)
            .map(|rank| ThreadBus {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl CollectiveBus for ThreadBus {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.shared.size
    }

    fn barrier(&self) {
        trace!(target: "aggregator::collective", rank = self.rank, "barrier");
        self.shared.entry.wait();
        self.shared.exit.wait();
    }

    fn broadcast<T: Clone + Send + 'static>(&self, root: i32, value: Option<T>) -> Result<T> {
        if self.rank == root {
            let v = value.ok_or_else(|| {
                AggregatorError::CollectiveFailure("root must supply a broadcast value".into())
            })?;
            let mut slots = self.shared.slots.lock().expect("thread bus poisoned");
            slots[root as usize] = Some(Box::new(v));
        }
        self.shared.entry.wait();
        let out = {
            let slots = self.shared.slots.lock().expect("thread bus poisoned");
            slots[root as usize]
                .as_ref()
                .expect("root did not publish broadcast value")
                .downcast_ref::<T>()
                .expect("broadcast type mismatch across ranks")
                .clone()
        };
        self.shared.exit.wait();
        if self.rank == root {
            let mut slots = self.shared.slots.lock().expect("thread bus poisoned");
            slots[root as usize] = None;
        }
        Ok(out)
    }

    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>> {
        {
            let mut slots = self.shared.slots.lock().expect("thread bus poisoned");
            slots[self.rank as usize] = Some(Box::new(value));
        }
        self.shared.entry.wait();
        let out = {
            let slots = self.shared.slots.lock().expect("thread bus poisoned");
            slots
                .iter()
                .map(|s| {
                    s.as_ref()
                        .expect("rank did not publish all_gather value")
                        .downcast_ref::<T>()
                        .expect("all_gather type mismatch across ranks")
                        .clone()
                })
                .collect()
        };
        self.shared.exit.wait();
        {
            let mut slots = self.shared.slots.lock().expect("thread bus poisoned");
            slots[self.rank as usize] = None;
        }
        Ok(out)
    }

    fn gather<T: Clone + Send + 'static>(&self, root: i32, value: T) -> Result<Option<Vec<T>>> {
        let all = self.all_gather(value)?;
        Ok(if self.rank == root { Some(all) } else { None })
    }

    fn gatherv_bytes(&self, root: i32, bytes: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        self.gather(root, bytes)
    }

    fn reduce(&self, root: i32, op: ReduceOp, value: f64) -> Result<Option<f64>> {
        let all = self.all_gather(value)?;
        Ok(if self.rank == root {
            Some(all.into_iter().fold(op.identity(), |acc, v| op.apply(acc, v)))
        } else {
            None
        })
    }
}

#[cfg(feature = "mpi-backend")]
pub mod mpi_backend {
    //! Real MPI-backed [`CollectiveBus`], gated behind the `mpi-backend`
    //! feature since it requires a system MPI installation to link.
    //! Numeric collectives map directly onto `rsmpi`; anything generic
    //! round-trips through `serde_json` bytes since rsmpi's buffers only
    //! understand types implementing `Equivalence`.

    use super::*;
    use mpi::collective::SystemOperation;
    use mpi::topology::{Communicator, SimpleCommunicator};
    use mpi::traits::*;
    use serde::{de::DeserializeOwned, Serialize};

    pub struct MpiBus {
        world: SimpleCommunicator,
    }

    impl MpiBus {
        pub fn from_world(world: SimpleCommunicator) -> Self {
            MpiBus { world }
        }
    }

    fn to_bytes<T: Serialize>(v: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(v).map_err(|e| AggregatorError::CollectiveFailure(e.to_string()))
    }

    fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| AggregatorError::CollectiveFailure(e.to_string()))
    }

    impl CollectiveBus for MpiBus {
        fn rank(&self) -> i32 {
            self.world.rank()
        }

        fn size(&self) -> i32 {
            self.world.size()
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn broadcast<T: Clone + Send + 'static>(&self, _root: i32, _value: Option<T>) -> Result<T> {
            Err(AggregatorError::CollectiveFailure(
                "MpiBus::broadcast requires Serialize + DeserializeOwned; use broadcast_bytes"
                    .into(),
            ))
        }

        fn all_gather<T: Clone + Send + 'static>(&self, _value: T) -> Result<Vec<T>> {
            Err(AggregatorError::CollectiveFailure(
                "MpiBus::all_gather requires Serialize + DeserializeOwned; use a byte-based path"
                    .into(),
            ))
        }

        fn gather<T: Clone + Send + 'static>(&self, _root: i32, _value: T) -> Result<Option<Vec<T>>> {
            Err(AggregatorError::CollectiveFailure(
                "MpiBus::gather requires Serialize + DeserializeOwned; use gatherv_bytes".into(),
            ))
        }

        fn gatherv_bytes(&self, root: i32, bytes: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
            let root_process = self.world.process_at_rank(root);
            let my_len = bytes.len() as i32;
            let lens: Vec<i32> = if self.rank() == root {
                let mut buf = vec![0i32; self.size() as usize];
                root_process.gather_into_root(&my_len, &mut buf[..]);
                buf
            } else {
                root_process.gather_into(&my_len);
                Vec::new()
            };

            if self.rank() == root {
                let total: i32 = lens.iter().sum();
                let displs: Vec<i32> = lens
                    .iter()
                    .scan(0i32, |acc, &l| {
                        let d = *acc;
                        *acc += l;
                        Some(d)
                    })
                    .collect();
                let mut recv = vec![0u8; total as usize];
                {
                    let mut partition =
                        mpi::datatype::PartitionMut::new(&mut recv[..], lens.clone(), &displs[..]);
                    root_process.gather_varcount_into_root(&bytes[..], &mut partition);
                }
                let mut out = Vec::with_capacity(lens.len());
                for (i, &len) in lens.iter().enumerate() {
                    let start = displs[i] as usize;
                    out.push(recv[start..start + len as usize].to_vec());
                }
                Ok(Some(out))
            } else {
                root_process.gather_varcount_into(&bytes[..]);
                Ok(None)
            }
        }

        fn reduce(&self, root: i32, op: ReduceOp, value: f64) -> Result<Option<f64>> {
            let root_process = self.world.process_at_rank(root);
            let mpi_op = match op {
                ReduceOp::Sum => SystemOperation::sum(),
                ReduceOp::Min => SystemOperation::min(),
                ReduceOp::Max => SystemOperation::max(),
            };
            if self.rank() == root {
                let mut result = 0f64;
                root_process.reduce_into_root(&value, &mut result, mpi_op);
                Ok(Some(result))
            } else {
                root_process.reduce_into(&value, mpi_op);
                Ok(None)
            }
        }
    }

    // broadcast_bytes / all_gather_bytes give callers in the generic
    // CollectiveBus methods above a real implementation path; the gather
    // engine in `aggregator-gather` uses these directly when the
    // `mpi-backend` feature is active instead of the generic methods.
    impl MpiBus {
        pub fn broadcast_bytes(&self, root: i32, bytes: Option<Vec<u8>>) -> Result<Vec<u8>> {
            let root_process = self.world.process_at_rank(root);
            let mut len = if self.rank() == root {
                bytes.as_ref().map(|b| b.len()).unwrap_or(0) as i32
            } else {
                0
            };
            root_process.broadcast_into(&mut len);
            let mut buf = if self.rank() == root {
                bytes.unwrap_or_default()
            } else {
                vec![0u8; len as usize]
            };
            root_process.broadcast_into(&mut buf[..]);
            Ok(buf)
        }

        pub fn broadcast_value<T: Serialize + DeserializeOwned>(
            &self,
            root: i32,
            value: Option<&T>,
        ) -> Result<T> {
            let bytes = value.map(to_bytes).transpose()?;
            let out = self.broadcast_bytes(root, bytes)?;
            from_bytes(&out)
        }
    }
}
