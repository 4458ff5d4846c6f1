// src/comm/mpi_comm.rs
//
// One benchmark rank per MPI process

use anyhow::{anyhow, Result};
use mpi::collective::SystemOperation;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::{Communicator as _, CommunicatorCollectives as _, Root as _};

use super::{Communicator, ReduceOp};

/// Communicator over MPI_COMM_WORLD
pub struct MpiComm {
    // Finalizes MPI when dropped
    _universe: Universe,
    world: SimpleCommunicator,
}

impl MpiComm {
    /// Initialize MPI; fails when it was already initialized
    pub fn init() -> Result<Self> {
        let universe = mpi::initialize().ok_or_else(|| anyhow!("MPI already initialized"))?;
        let world = universe.world();
        Ok(Self { _universe: universe, world })
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn barrier(&self) -> Result<()> {
        self.world.barrier();
        Ok(())
    }

    fn all_reduce_u64(&self, value: u64, op: ReduceOp) -> Result<u64> {
        let mut reduced = 0u64;
        let operation = match op {
            ReduceOp::Max => SystemOperation::max(),
            ReduceOp::Min => SystemOperation::min(),
            ReduceOp::Sum => SystemOperation::sum(),
        };
        self.world.all_reduce_into(&value, &mut reduced, operation);
        Ok(reduced)
    }

    fn gather_f64(&self, values: &[f64], root: usize) -> Result<Option<Vec<f64>>> {
        let root_process = self.world.process_at_rank(root as i32);
        if self.rank() == root {
            let mut gathered = vec![0.0f64; values.len() * self.size()];
            root_process.gather_into_root(values, &mut gathered[..]);
            Ok(Some(gathered))
        } else {
            root_process.gather_into(values);
            Ok(None)
        }
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64> {
        let mut value = value;
        self.world.process_at_rank(root as i32).broadcast_into(&mut value);
        Ok(value)
    }

    fn abort(&self, reason: &str) {
        tracing::error!(rank = self.rank(), "aborting MPI job: {}", reason);
        self.world.abort(1)
    }
}
