// src/comm/local.rs
//
// Ranks as threads of one process
//
// All ranks of a group share one rendezvous. Each collective is a round:
// every rank deposits its contribution, the last one to arrive publishes the
// full set and bumps the generation, and everyone reads the published set.
// A rank cannot start round g+1 before all ranks have arrived for round g, so
// the published set of round g stays valid until every rank has read it.

use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, Condvar, Mutex};

use super::{Communicator, ReduceOp};

#[derive(Debug, Clone)]
enum Contribution {
    Barrier,
    U64(u64),
    F64s(Vec<f64>),
}

#[derive(Debug)]
struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Contribution>>,
    published: Arc<Vec<Contribution>>,
    aborted: Option<String>,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    round: Mutex<Round>,
    cond: Condvar,
}

/// A group of in-process ranks
#[derive(Debug, Clone)]
pub struct LocalGroup {
    shared: Arc<Shared>,
}

impl LocalGroup {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            shared: Arc::new(Shared {
                size,
                round: Mutex::new(Round {
                    generation: 0,
                    arrived: 0,
                    slots: vec![None; size],
                    published: Arc::new(Vec::new()),
                    aborted: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// One communicator per rank, in rank order
    pub fn comms(&self) -> Vec<LocalComm> {
        (0..self.shared.size)
            .map(|rank| LocalComm { rank, shared: Arc::clone(&self.shared) })
            .collect()
    }
}

/// Communicator of one in-process rank
#[derive(Debug)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalComm {
    /// Deposit this rank's contribution and wait for everyone else's
    fn exchange(&self, contribution: Contribution) -> Result<Arc<Vec<Contribution>>> {
        let poisoned = |_| anyhow!("local group rendezvous poisoned");
        let mut round = self.shared.round.lock().map_err(poisoned)?;
        if let Some(reason) = &round.aborted {
            bail!("group aborted: {}", reason);
        }

        let generation = round.generation;
        round.slots[self.rank] = Some(contribution);
        round.arrived += 1;

        if round.arrived == self.shared.size {
            let published: Vec<Contribution> = round
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or(Contribution::Barrier))
                .collect();
            round.published = Arc::new(published);
            round.arrived = 0;
            round.generation += 1;
            self.shared.cond.notify_all();
            return Ok(Arc::clone(&round.published));
        }

        while round.generation == generation && round.aborted.is_none() {
            round = self.shared.cond.wait(round).map_err(poisoned)?;
        }
        if round.generation == generation {
            let reason = round.aborted.clone().unwrap_or_default();
            bail!("group aborted: {}", reason);
        }
        Ok(Arc::clone(&round.published))
    }

    fn exchange_u64(&self, value: u64) -> Result<Vec<u64>> {
        self.exchange(Contribution::U64(value))?
            .iter()
            .map(|c| match c {
                Contribution::U64(v) => Ok(*v),
                other => Err(anyhow!("mismatched collective: expected u64, got {:?}", other)),
            })
            .collect()
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<()> {
        self.exchange(Contribution::Barrier).map(|_| ())
    }

    fn all_reduce_u64(&self, value: u64, op: ReduceOp) -> Result<u64> {
        let values = self.exchange_u64(value)?;
        values
            .into_iter()
            .reduce(|a, b| op.apply(a, b))
            .ok_or_else(|| anyhow!("empty group"))
    }

    fn gather_f64(&self, values: &[f64], root: usize) -> Result<Option<Vec<f64>>> {
        let all = self.exchange(Contribution::F64s(values.to_vec()))?;
        if self.rank != root {
            return Ok(None);
        }
        let mut gathered = Vec::with_capacity(values.len() * self.shared.size);
        for contribution in all.iter() {
            match contribution {
                Contribution::F64s(v) => gathered.extend_from_slice(v),
                other => bail!("mismatched collective: expected f64 values, got {:?}", other),
            }
        }
        Ok(Some(gathered))
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64> {
        let values = self.exchange_u64(value)?;
        values
            .get(root)
            .copied()
            .ok_or_else(|| anyhow!("broadcast root {} out of range", root))
    }

    fn abort(&self, reason: &str) {
        tracing::error!(rank = self.rank, "aborting group: {}", reason);
        if let Ok(mut round) = self.shared.round.lock() {
            if round.aborted.is_none() {
                round.aborted = Some(format!("rank {}: {}", self.rank, reason));
            }
        }
        self.shared.cond.notify_all();
    }
}
