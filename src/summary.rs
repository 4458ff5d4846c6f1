// src/summary.rs
//
// Per-iteration result records and their reduction into summary statistics
//
// Every rank keeps one SummaryRecord per iteration. At the end of the run the
// rate (or time) vectors of all ranks are gathered on rank 0 and reduced per
// operation slot over (rank x iteration) samples. Tree creation/removal is
// only timed on rank 0, so those slots use rank 0's own records.

use anyhow::Result;
use std::fmt::Write as _;
use std::ops::Range;

use crate::comm::Communicator;
use crate::config::ReportMode;
use crate::directory_tree::ItemKind;
use crate::phases::Phase;
use crate::stonewall::Reconciliation;

/// Number of operation slots in a record
pub const SLOT_COUNT: usize = 12;

/// Operation slot of a summary record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSlot {
    DirCreate,
    DirStat,
    /// Reserved, never measured
    DirRead,
    DirRename,
    DirRemove,
    FileCreate,
    FileStat,
    FileRead,
    FileRename,
    FileRemove,
    TreeCreate,
    TreeRemove,
}

impl OpSlot {
    pub const ALL: [OpSlot; SLOT_COUNT] = [
        OpSlot::DirCreate,
        OpSlot::DirStat,
        OpSlot::DirRead,
        OpSlot::DirRename,
        OpSlot::DirRemove,
        OpSlot::FileCreate,
        OpSlot::FileStat,
        OpSlot::FileRead,
        OpSlot::FileRename,
        OpSlot::FileRemove,
        OpSlot::TreeCreate,
        OpSlot::TreeRemove,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Slot of an item phase
    pub fn of(kind: ItemKind, phase: Phase) -> OpSlot {
        let base = match kind {
            ItemKind::Dir => 0,
            ItemKind::File => 5,
        };
        OpSlot::ALL[base + phase.index()]
    }

    /// Printed name; `None` for the unused directory-read slot
    pub fn label(self) -> Option<&'static str> {
        match self {
            OpSlot::DirCreate => Some("Directory creation"),
            OpSlot::DirStat => Some("Directory stat"),
            OpSlot::DirRead => None,
            OpSlot::DirRename => Some("Directory rename"),
            OpSlot::DirRemove => Some("Directory removal"),
            OpSlot::FileCreate => Some("File creation"),
            OpSlot::FileStat => Some("File stat"),
            OpSlot::FileRead => Some("File read"),
            OpSlot::FileRename => Some("File rename"),
            OpSlot::FileRemove => Some("File removal"),
            OpSlot::TreeCreate => Some("Tree creation"),
            OpSlot::TreeRemove => Some("Tree removal"),
        }
    }

    pub fn is_rename(self) -> bool {
        matches!(self, OpSlot::DirRename | OpSlot::FileRename)
    }

    pub fn is_tree(self) -> bool {
        matches!(self, OpSlot::TreeCreate | OpSlot::TreeRemove)
    }
}

/// Measurement of one slot in one iteration on one rank
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SlotSample {
    /// Operations per second, aggregated over all ranks
    pub rate: f64,
    /// Seconds
    pub time: f64,
    /// Items the rate is based on
    pub items: u64,
}

/// Stonewall statistics of a create slot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StonewallSample {
    pub time: f64,
    pub item_sum: u64,
    pub item_min: u64,
}

/// Results of one iteration on one rank
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryRecord {
    slots: [SlotSample; SLOT_COUNT],
    stonewall_dir: Option<StonewallSample>,
    stonewall_file: Option<StonewallSample>,
}

impl SummaryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a timed phase. `items` is the number of operations across all
    /// ranks. Rename counts both directions in the rate and reports the time
    /// of one direction.
    pub fn record(&mut self, slot: OpSlot, items: u64, elapsed_secs: f64) {
        let (ops, time) = if slot.is_rename() {
            (2 * items, elapsed_secs / 2.0)
        } else {
            (items, elapsed_secs)
        };
        let rate = if elapsed_secs > 0.0 { ops as f64 / elapsed_secs } else { 0.0 };
        self.slots[slot.index()] = SlotSample { rate, time, items };
    }

    /// Record the reconciliation of a stonewalled create
    pub fn record_stonewall(&mut self, kind: ItemKind, rec: &Reconciliation) {
        let sample = StonewallSample {
            time: rec.time,
            item_sum: rec.sum_items,
            item_min: rec.min_items.unwrap_or(0),
        };
        match kind {
            ItemKind::Dir => self.stonewall_dir = Some(sample),
            ItemKind::File => self.stonewall_file = Some(sample),
        }
    }

    pub fn slot(&self, slot: OpSlot) -> &SlotSample {
        &self.slots[slot.index()]
    }

    pub fn stonewall(&self, kind: ItemKind) -> Option<&StonewallSample> {
        match kind {
            ItemKind::Dir => self.stonewall_dir.as_ref(),
            ItemKind::File => self.stonewall_file.as_ref(),
        }
    }

    fn values(&self, metric: Metric) -> [f64; SLOT_COUNT] {
        let mut out = [0.0; SLOT_COUNT];
        for (value, sample) in out.iter_mut().zip(self.slots.iter()) {
            *value = metric.pick(sample);
        }
        out
    }
}

/// Quantity a summary table reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Rate,
    Time,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::Rate => "rate",
            Metric::Time => "time",
        }
    }

    fn pick(self, sample: &SlotSample) -> f64 {
        match self {
            Metric::Rate => sample.rate,
            Metric::Time => sample.time,
        }
    }

    /// Metrics printed for a report mode
    pub fn for_report(mode: ReportMode) -> Vec<Metric> {
        match mode {
            ReportMode::Rate => vec![Metric::Rate],
            ReportMode::Time => vec![Metric::Time],
            ReportMode::Both => vec![Metric::Rate, Metric::Time],
        }
    }
}

/// max / min / mean / population standard deviation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl Stats {
    /// Two-pass statistics; `None` for an empty sample set
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self { max, min, mean, std_dev: var.sqrt() })
    }
}

/// Item slots that get printed: `start..stop` over the first ten slots
pub fn item_slot_range(run_dirs: bool, run_files: bool) -> Range<usize> {
    match (run_dirs, run_files) {
        (true, true) => 0..10,
        (true, false) => 0..5,
        (false, true) => 5..10,
        (false, false) => 0..0,
    }
}

/// Samples of every rank for every iteration, for one metric
#[derive(Debug, Clone)]
pub struct SampleMatrix {
    iterations: usize,
    ranks: usize,
    /// Layout [rank][iteration][slot]
    values: Vec<f64>,
}

impl SampleMatrix {
    /// Build directly from the records of every rank (`records[rank][iter]`)
    pub fn from_records(records: &[Vec<SummaryRecord>], metric: Metric) -> Self {
        let ranks = records.len();
        let iterations = records.first().map_or(0, |r| r.len());
        let values = records
            .iter()
            .flat_map(|per_rank| per_rank.iter().flat_map(|rec| rec.values(metric)))
            .collect();
        Self { iterations, ranks, values }
    }

    /// Gather the records of all ranks on rank 0. Collective; returns `None`
    /// on every other rank.
    pub fn gather(
        records: &[SummaryRecord],
        metric: Metric,
        comm: &dyn Communicator,
    ) -> Result<Option<Self>> {
        let local: Vec<f64> = records.iter().flat_map(|rec| rec.values(metric)).collect();
        let gathered = comm.gather_f64(&local, 0)?;
        Ok(gathered.map(|values| Self {
            iterations: records.len(),
            ranks: comm.size(),
            values,
        }))
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn ranks(&self) -> usize {
        self.ranks
    }

    pub fn value(&self, iteration: usize, rank: usize, slot: OpSlot) -> f64 {
        self.values[(rank * self.iterations + iteration) * SLOT_COUNT + slot.index()]
    }

    /// All (rank x iteration) samples of a slot
    pub fn slot_samples(&self, slot: OpSlot) -> Vec<f64> {
        (0..self.ranks)
            .flat_map(|rank| (0..self.iterations).map(move |iter| (rank, iter)))
            .map(|(rank, iter)| self.value(iter, rank, slot))
            .collect()
    }
}

/// One printed row of a summary table
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub slot: OpSlot,
    pub stats: Stats,
}

/// Summary of one metric over all iterations
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryTable {
    pub metric: Metric,
    pub iterations: usize,
    pub rows: Vec<SummaryRow>,
    /// (label, value) of stonewall lines
    pub stonewall: Vec<(&'static str, f64)>,
}

impl SummaryTable {
    /// Reduce the gathered samples. `own_records` are rank 0's records, used
    /// for the tree slots and the stonewall lines.
    pub fn build(
        matrix: &SampleMatrix,
        own_records: &[SummaryRecord],
        metric: Metric,
        run_dirs: bool,
        run_files: bool,
    ) -> Self {
        let mut rows = Vec::new();
        for index in item_slot_range(run_dirs, run_files) {
            let slot = OpSlot::ALL[index];
            if slot.label().is_none() {
                continue;
            }
            if let Some(stats) = Stats::from_samples(&matrix.slot_samples(slot)) {
                rows.push(SummaryRow { slot, stats });
            }
        }

        let mut stonewall = Vec::new();
        for (kind, label) in [
            (ItemKind::Dir, "Directory create (stonewall)"),
            (ItemKind::File, "File create (stonewall)"),
        ] {
            let (time, items) = own_records
                .iter()
                .filter_map(|rec| rec.stonewall(kind))
                .filter(|sw| sw.time > 0.0)
                .fold((0.0, 0u64), |(t, n), sw| (t + sw.time, n + sw.item_sum));
            if items != 0 {
                let value = match metric {
                    Metric::Rate => items as f64 / time,
                    Metric::Time => time,
                };
                stonewall.push((label, value));
            }
        }

        for slot in [OpSlot::TreeCreate, OpSlot::TreeRemove] {
            let samples: Vec<f64> = own_records.iter().map(|rec| metric.pick(rec.slot(slot))).collect();
            if let Some(stats) = Stats::from_samples(&samples) {
                rows.push(SummaryRow { slot, stats });
            }
        }

        Self { metric, iterations: matrix.iterations(), rows, stonewall }
    }

    /// Text block in the benchmark's summary layout
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\nSUMMARY {}: (of {} iterations)", self.metric.name(), self.iterations);
        let _ = writeln!(
            out,
            "   Operation                      Max            Min           Mean        Std Dev"
        );
        let _ = writeln!(
            out,
            "   ---------                      ---            ---           ----        -------"
        );
        let mut stonewall_printed = false;
        for row in &self.rows {
            if row.slot.is_tree() && !stonewall_printed {
                self.render_stonewall(&mut out);
                stonewall_printed = true;
            }
            let label = row.slot.label().unwrap_or("");
            let _ = writeln!(
                out,
                "   {:<26}: {:14.3} {:14.3} {:14.3} {:14.3}",
                label, row.stats.max, row.stats.min, row.stats.mean, row.stats.std_dev
            );
        }
        if !stonewall_printed {
            self.render_stonewall(&mut out);
        }
        out
    }

    fn render_stonewall(&self, out: &mut String) {
        for (label, value) in &self.stonewall {
            let _ = writeln!(out, "   {:<26}: {:>14} {:>14} {:14.3} {:>14}", label, "NA", "NA", value, "NA");
        }
    }
}

/// Per-rank sample table, one line per slot and iteration
pub fn render_per_process(matrix: &SampleMatrix, metric: Metric, run_dirs: bool, run_files: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nPer process result ({}):", metric.name());
    let start = item_slot_range(run_dirs, run_files).start;
    for iter in 0..matrix.iterations() {
        let _ = writeln!(out, "iteration: {}", iter);
        for slot in &OpSlot::ALL[start..] {
            let Some(label) = slot.label() else { continue };
            let values: Vec<String> = (0..matrix.ranks())
                .map(|rank| format!("{:e}", matrix.value(iter, rank, *slot)))
                .collect();
            let _ = writeln!(out, "Test {:<26}: {}", label, values.join(","));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;
    use std::thread;

    #[test]
    fn test_stats() {
        let stats = Stats::from_samples(&[10.0, 20.0, 30.0]).unwrap();
        assert_eq!(stats.mean, 20.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert!((stats.std_dev - 8.165).abs() < 1e-3);
        assert!(Stats::from_samples(&[]).is_none());
    }

    #[test]
    fn test_slot_mapping() {
        assert_eq!(OpSlot::of(ItemKind::Dir, Phase::Create), OpSlot::DirCreate);
        assert_eq!(OpSlot::of(ItemKind::Dir, Phase::Read), OpSlot::DirRead);
        assert_eq!(OpSlot::of(ItemKind::File, Phase::Rename), OpSlot::FileRename);
        assert_eq!(OpSlot::of(ItemKind::File, Phase::Remove), OpSlot::FileRemove);
        assert_eq!(OpSlot::TreeRemove.index(), 11);
        assert!(OpSlot::DirRead.label().is_none());
    }

    #[test]
    fn test_rename_rate_counts_both_directions() {
        let mut rec = SummaryRecord::new();
        rec.record(OpSlot::FileRename, 100, 2.0);
        let s = rec.slot(OpSlot::FileRename);
        assert_eq!(s.rate, 100.0);
        assert_eq!(s.time, 1.0);

        rec.record(OpSlot::FileStat, 100, 2.0);
        assert_eq!(rec.slot(OpSlot::FileStat).rate, 50.0);
        assert_eq!(rec.slot(OpSlot::FileStat).time, 2.0);

        rec.record(OpSlot::FileRead, 100, 0.0);
        assert_eq!(rec.slot(OpSlot::FileRead).rate, 0.0);
    }

    #[test]
    fn test_record_sample_fields() {
        let mut rec = SummaryRecord::new();
        rec.record(OpSlot::DirRename, 40, 4.0);
        assert_eq!(
            *rec.slot(OpSlot::DirRename),
            SlotSample { rate: 20.0, time: 2.0, items: 40 }
        );
        assert_eq!(*rec.slot(OpSlot::DirStat), SlotSample::default());
    }

    #[test]
    fn test_slot_ranges() {
        assert_eq!(item_slot_range(false, true), 5..10);
        assert_eq!(item_slot_range(true, false), 0..5);
        assert_eq!(item_slot_range(true, true), 0..10);
        assert!(item_slot_range(false, false).is_empty());
    }

    fn record_with(slot: OpSlot, items: u64, secs: f64) -> SummaryRecord {
        let mut rec = SummaryRecord::new();
        rec.record(slot, items, secs);
        rec
    }

    #[test]
    fn test_table_over_ranks_and_iterations() {
        // 3 ranks, 1 iteration: file create rates 10, 20, 30
        let records: Vec<Vec<SummaryRecord>> = [10.0, 20.0, 30.0]
            .iter()
            .map(|rate| vec![record_with(OpSlot::FileCreate, *rate as u64, 1.0)])
            .collect();
        let matrix = SampleMatrix::from_records(&records, Metric::Rate);
        let table = SummaryTable::build(&matrix, &records[0], Metric::Rate, false, true);

        let create = table.rows.iter().find(|r| r.slot == OpSlot::FileCreate).unwrap();
        assert_eq!(create.stats.mean, 20.0);
        assert!((create.stats.std_dev - 8.165).abs() < 1e-3);
        // Directory slots are not printed when only files ran
        assert!(table.rows.iter().all(|r| r.slot.index() >= 5));
        // Tree slots come from rank 0 only
        assert!(table.rows.iter().any(|r| r.slot == OpSlot::TreeCreate));

        let text = table.render();
        assert!(text.contains("SUMMARY rate: (of 1 iterations)"));
        assert!(text.contains("File creation"));
        assert!(!text.contains("Directory creation"));
    }

    #[test]
    fn test_stonewall_line() {
        let mut rec = SummaryRecord::new();
        rec.record_stonewall(
            ItemKind::File,
            &Reconciliation { time: 2.0, max_items: 150, min_items: Some(100), sum_items: 250, catch_up: true },
        );
        let stored = rec.stonewall(ItemKind::File).unwrap();
        assert_eq!(stored.item_min, 100);
        assert_eq!(stored.item_sum, 250);

        let records = vec![vec![rec]];
        let matrix = SampleMatrix::from_records(&records, Metric::Rate);
        let table = SummaryTable::build(&matrix, &records[0], Metric::Rate, false, true);
        assert_eq!(table.stonewall, vec![("File create (stonewall)", 125.0)]);
        assert!(table.render().contains("File create (stonewall)"));

        let table = SummaryTable::build(&matrix, &records[0], Metric::Time, false, true);
        assert_eq!(table.stonewall, vec![("File create (stonewall)", 2.0)]);
    }

    #[test]
    fn test_gather_matrix_layout() {
        let handles: Vec<_> = LocalGroup::new(2)
            .comms()
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let base = (comm.rank() as u64 + 1) * 100;
                    let records = vec![
                        record_with(OpSlot::DirStat, base, 1.0),
                        record_with(OpSlot::DirStat, base + 1, 1.0),
                    ];
                    SampleMatrix::gather(&records, Metric::Rate, &comm).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let matrix = results[0].as_ref().unwrap();
        assert!(results[1].is_none());
        assert_eq!(matrix.value(0, 0, OpSlot::DirStat), 100.0);
        assert_eq!(matrix.value(1, 0, OpSlot::DirStat), 101.0);
        assert_eq!(matrix.value(0, 1, OpSlot::DirStat), 200.0);
        assert_eq!(matrix.value(1, 1, OpSlot::DirStat), 201.0);
        assert_eq!(matrix.slot_samples(OpSlot::DirStat), vec![100.0, 101.0, 200.0, 201.0]);

        let text = render_per_process(matrix, Metric::Rate, true, false);
        assert!(text.contains("iteration: 1"));
        assert!(text.contains("Test Directory stat"));
    }
}
