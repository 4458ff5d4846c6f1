// src/comm/mod.rs
//
// Collective message passing between benchmark ranks
//
// Every collective is blocking and must be called in the same order on every
// rank. Three implementations:
// - SoloComm: a single rank, all collectives are local
// - LocalComm: N ranks as threads of one process (tests, --local-ranks)
// - MpiComm: one rank per MPI process (cargo feature "mpi")

use anyhow::Result;

mod local;
#[cfg(feature = "mpi")]
mod mpi_comm;

pub use local::{LocalComm, LocalGroup};
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

/// Reduction applied across ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Max,
    Min,
    Sum,
}

impl ReduceOp {
    pub fn apply(&self, a: u64, b: u64) -> u64 {
        match self {
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Sum => a.saturating_add(b),
        }
    }
}

/// Collective operations over the group of ranks taking part in a run
pub trait Communicator {
    /// This rank, in `0..size()`
    fn rank(&self) -> usize;

    /// Number of ranks
    fn size(&self) -> usize;

    fn barrier(&self) -> Result<()>;

    /// Reduce `value` over all ranks; every rank receives the result
    fn all_reduce_u64(&self, value: u64, op: ReduceOp) -> Result<u64>;

    /// Reduce `value` over all ranks; only `root` receives the result
    fn reduce_u64(&self, value: u64, op: ReduceOp, root: usize) -> Result<Option<u64>> {
        let reduced = self.all_reduce_u64(value, op)?;
        Ok((self.rank() == root).then_some(reduced))
    }

    /// Concatenate every rank's `values` (all of equal length) in rank order
    /// on `root`
    fn gather_f64(&self, values: &[f64], root: usize) -> Result<Option<Vec<f64>>>;

    /// Every rank receives `root`'s value
    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64>;

    /// Stop the whole group after a fatal error on this rank
    fn abort(&self, reason: &str);
}

/// Single-rank communicator
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloComm;

impl Communicator for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce_u64(&self, value: u64, _op: ReduceOp) -> Result<u64> {
        Ok(value)
    }

    fn gather_f64(&self, values: &[f64], _root: usize) -> Result<Option<Vec<f64>>> {
        Ok(Some(values.to_vec()))
    }

    fn broadcast_u64(&self, value: u64, _root: usize) -> Result<u64> {
        Ok(value)
    }

    fn abort(&self, reason: &str) {
        tracing::error!("aborting: {}", reason);
    }
}
