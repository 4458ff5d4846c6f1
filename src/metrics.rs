//! Per-operation latency histograms
//!
//! One HDR histogram per operation slot, recorded in microseconds. Only
//! allocated when latency collection is requested.

use anyhow::{anyhow, Result};
use hdrhistogram::Histogram;
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::constants::{LATENCY_MAX_MICROS, LATENCY_SIGFIGS};
use crate::summary::{OpSlot, SLOT_COUNT};

/// Latency histograms of one rank
#[derive(Debug, Clone, Default)]
pub struct OpLatency {
    hists: Vec<Histogram<u64>>,
}

impl OpLatency {
    /// Collection switched off: recording is a no-op
    pub fn disabled() -> Self {
        Self::default()
    }

    /// One empty histogram per slot
    pub fn enabled() -> Result<Self> {
        let hists = (0..SLOT_COUNT)
            .map(|_| {
                Histogram::<u64>::new_with_bounds(1, LATENCY_MAX_MICROS, LATENCY_SIGFIGS)
                    .map_err(|e| anyhow!("failed to allocate histogram: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { hists })
    }

    pub fn is_enabled(&self) -> bool {
        !self.hists.is_empty()
    }

    /// Start timing an operation; `None` when disabled
    pub fn start(&self) -> Option<Instant> {
        self.is_enabled().then(Instant::now)
    }

    /// Finish timing an operation started with [`OpLatency::start`]
    pub fn finish(&mut self, slot: OpSlot, started: Option<Instant>) {
        if let Some(t0) = started {
            self.record(slot, t0.elapsed());
        }
    }

    pub fn record(&mut self, slot: OpSlot, duration: Duration) {
        if let Some(hist) = self.hists.get_mut(slot.index()) {
            let micros = (duration.as_micros() as u64).max(1);
            if let Err(e) = hist.record(micros) {
                debug!("{:?} latency of {}µs not recorded: {}", slot, micros, e);
            }
        }
    }

    pub fn count(&self, slot: OpSlot) -> u64 {
        self.hists.get(slot.index()).map_or(0, |h| h.len())
    }

    /// Combine another rank's or iteration's histograms into this one
    pub fn merge(&mut self, other: &OpLatency) {
        if !self.is_enabled() {
            self.hists = other.hists.clone();
            return;
        }
        for (mine, theirs) in self.hists.iter_mut().zip(other.hists.iter()) {
            mine.add(theirs).ok();
        }
    }

    /// Summary lines for every slot with samples
    pub fn render(&self, title: &str) -> String {
        let mut out = String::new();
        if !self.is_enabled() {
            return out;
        }
        let _ = writeln!(out, "\n{} latency (µs):", title);
        for slot in OpSlot::ALL {
            let Some(hist) = self.hists.get(slot.index()) else { continue };
            let count = hist.len();
            if count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "  [{:>18}] count={:<8} mean={:<8.0} p50={:<8} p95={:<8} p99={:<8} max={:<8}",
                slot.label().unwrap_or("unused"),
                count,
                hist.mean(),
                hist.value_at_quantile(0.50),
                hist.value_at_quantile(0.95),
                hist.value_at_quantile(0.99),
                hist.max()
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_is_noop() {
        let mut lat = OpLatency::disabled();
        assert!(lat.start().is_none());
        lat.record(OpSlot::FileStat, Duration::from_micros(10));
        assert_eq!(lat.count(OpSlot::FileStat), 0);
        assert!(lat.render("rank 0").is_empty());
    }

    #[test]
    fn test_record_and_render() {
        let mut lat = OpLatency::enabled().unwrap();
        lat.record(OpSlot::FileStat, Duration::from_micros(100));
        lat.record(OpSlot::FileStat, Duration::from_micros(200));
        let t0 = lat.start();
        assert!(t0.is_some());
        lat.finish(OpSlot::DirCreate, t0);
        assert_eq!(lat.count(OpSlot::FileStat), 2);
        assert_eq!(lat.count(OpSlot::DirCreate), 1);

        let text = lat.render("rank 0");
        assert!(text.contains("File stat"));
        assert!(text.contains("count=2"));
        assert!(!text.contains("File removal"));
    }

    #[test]
    fn test_out_of_range_latency_is_skipped() {
        let mut lat = OpLatency::enabled().unwrap();
        lat.record(OpSlot::FileCreate, Duration::from_secs(10 * 3600));
        assert_eq!(lat.count(OpSlot::FileCreate), 0);
        lat.record(OpSlot::FileCreate, Duration::from_secs(60));
        assert_eq!(lat.count(OpSlot::FileCreate), 1);
    }

    #[test]
    fn test_merge() {
        let mut a = OpLatency::enabled().unwrap();
        let mut b = OpLatency::enabled().unwrap();
        a.record(OpSlot::FileRead, Duration::from_micros(100));
        b.record(OpSlot::FileRead, Duration::from_micros(300));
        a.merge(&b);
        assert_eq!(a.count(OpSlot::FileRead), 2);

        let mut empty = OpLatency::disabled();
        empty.merge(&a);
        assert_eq!(empty.count(OpSlot::FileRead), 2);
    }
}
