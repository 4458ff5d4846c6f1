// src/stonewall.rs
//
// Stonewall timer for the create phase
//
// A rank stops creating once its wall-clock budget is spent. The ranks then
// agree on the largest count any of them reached, and every rank that stopped
// short creates the missing items with the timer disarmed, so all later
// phases see the same number of items on every rank.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::comm::{Communicator, ReduceOp};

/// Lifecycle of the timer within one create phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StonewallState {
    Disabled,
    Armed,
    Tripped,
    Reconciled,
}

/// Per-rank progress of one create/remove walk
#[derive(Debug, Clone)]
pub struct StonewallProgress {
    state: StonewallState,
    start: Instant,
    budget: Duration,
    /// First item position of the walk
    pub items_start: u64,
    /// One past the last item position of the walk
    pub target_items: u64,
    /// Items completed (positions `[0, items_done)`)
    pub items_done: u64,
}

impl StonewallProgress {
    /// A disabled controller walking `[0, target_items)`
    pub fn new(target_items: u64) -> Self {
        Self {
            state: StonewallState::Disabled,
            start: Instant::now(),
            budget: Duration::ZERO,
            items_start: 0,
            target_items,
            items_done: 0,
        }
    }

    /// Reset for a new create phase and start the clock; a zero budget
    /// leaves the timer disabled
    pub fn arm(&mut self, budget_secs: u64, target_items: u64) {
        self.start = Instant::now();
        self.budget = Duration::from_secs(budget_secs);
        self.items_start = 0;
        self.items_done = 0;
        self.target_items = target_items;
        self.state = if budget_secs > 0 {
            StonewallState::Armed
        } else {
            StonewallState::Disabled
        };
    }

    /// Stop checking the clock (catch-up pass, later walks)
    pub fn disarm(&mut self) {
        if self.state == StonewallState::Armed {
            self.state = StonewallState::Disabled;
        }
    }

    pub fn state(&self) -> StonewallState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == StonewallState::Armed
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Called after the item at `position` completed. Returns true when the
    /// budget is spent and the walk must stop.
    pub fn check(&mut self, position: u64) -> bool {
        if self.state != StonewallState::Armed {
            return false;
        }
        if self.start.elapsed() > self.budget {
            self.items_done = position + 1;
            self.state = StonewallState::Tripped;
            info!("stonewall hit after {} items", self.items_done);
            return true;
        }
        false
    }

    /// Record a walk that ran to its end
    pub fn finish(&mut self, position_end: u64) {
        if self.state != StonewallState::Tripped {
            self.items_done = position_end;
        }
    }

    /// Walk for the catch-up pass: `[items_done, max)`, timer disarmed
    fn prepare_catch_up(&mut self, max_items: u64) {
        self.items_start = self.items_done;
        self.target_items = max_items;
        self.state = StonewallState::Disabled;
    }
}

/// Cross-rank result of a stonewalled create phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// Seconds from phase start until the ranks agreed
    pub time: f64,
    /// Largest count reached by any rank; the effective item count
    pub max_items: u64,
    /// Smallest count reached by any rank (root only)
    pub min_items: Option<u64>,
    /// Total items created before catch-up
    pub sum_items: u64,
    /// Whether a catch-up pass is needed
    pub catch_up: bool,
}

/// Agree on the item count after a stonewalled walk. On return the progress
/// describes the catch-up walk `[items_done, max_items)` when one is needed.
pub fn reconcile(
    progress: &mut StonewallProgress,
    comm: &dyn Communicator,
    configured_items: u64,
) -> Result<Reconciliation> {
    let done = progress.items_done;
    debug!("stonewall reconcile with {} items done", done);

    let max_items = comm.all_reduce_u64(done, ReduceOp::Max)?;
    let time = progress.elapsed().as_secs_f64();
    let min_items = comm.reduce_u64(done, ReduceOp::Min, 0)?;
    // Every rank needs the sum to take the same catch-up decision
    let sum_items = comm.all_reduce_u64(done, ReduceOp::Sum)?;

    let expected = configured_items.saturating_mul(comm.size() as u64);
    let catch_up = sum_items != expected;
    if catch_up && comm.rank() == 0 {
        info!(
            "Continue stonewall hit min: {} max: {} avg: {:.1}",
            min_items.unwrap_or(0),
            max_items,
            sum_items as f64 / comm.size() as f64
        );
    }

    progress.prepare_catch_up(max_items);
    progress.state = StonewallState::Reconciled;

    Ok(Reconciliation { time, max_items, min_items, sum_items, catch_up })
}

/// File recording the reconciled item count of a stonewalled create, so a
/// later run without the create phase works on the same items
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn store(&self, items: u64) -> Result<()> {
        tokio::fs::write(&self.path, format!("{}\n", items))
            .await
            .with_context(|| format!("unable to write stonewall status file {}", self.path.display()))
    }

    /// Stored count, or `None` when the file is missing or unreadable
    pub async fn load(&self) -> Option<u64> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => match text.trim().parse::<u64>() {
                Ok(items) => Some(items),
                Err(e) => {
                    warn!("Invalid stonewall status file {}: {}", self.path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("Could not read stonewall status file {}: {}", self.path.display(), e);
                None
            }
        }
    }
}
