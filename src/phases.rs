// src/phases.rs
//
// Phase orchestrator: iterations, tree build/teardown and the timed phases
//
// One iteration:
// 1. make the test directories (`<path>/test-dir.<iter>-<loop>`)
// 2. build the directory tree(s) top-down, timed between barriers
// 3. directory tests, then file tests; each runs create, stat, read, rename
//    and remove, each phase closed by an optional sync and a barrier
// 4. tear the tree(s) down bottom-up, timed between barriers

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::comm::{Communicator, ReduceOp};
use crate::config::RunPlan;
use crate::constants::TEST_DIR_PREFIX;
use crate::directory_tree::{tree_base_name, ItemKind, TreeRoot};
use crate::metadata_ops::{AccessMode, Backend};
use crate::metrics::OpLatency;
use crate::stonewall::{self, StatusFile, StonewallProgress};
use crate::summary::{render_per_process, Metric, OpSlot, SampleMatrix, SummaryRecord, SummaryTable};
use crate::workload::{Engine, FileCreate, ItemTarget};

/// Timed phase of an item test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Create,
    Stat,
    Read,
    Rename,
    Remove,
}

impl Phase {
    pub const ALL: [Phase; 5] = [Phase::Create, Phase::Stat, Phase::Read, Phase::Rename, Phase::Remove];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Create => "create",
            Phase::Stat => "stat",
            Phase::Read => "read",
            Phase::Rename => "rename",
            Phase::Remove => "remove",
        }
    }

    /// Rank whose items `rank` works on during this phase
    pub fn owner(self, rank: usize, stride: usize, size: usize) -> usize {
        phase_owner(rank, self.index(), stride, size)
    }
}

/// `(rank + phase_index * stride) % size`: names and locates the items a
/// rank touches in a phase, so that with a stride the reader of an item is
/// not its writer
pub fn phase_owner(rank: usize, phase_index: usize, stride: usize, size: usize) -> usize {
    (rank + phase_index * stride) % size.max(1)
}

/// Test directory of an iteration and directory loop
pub fn test_dir(path: &Path, iteration: u32, dir_loop: u64) -> PathBuf {
    path.join(format!("{}.{}-{}", TEST_DIR_PREFIX, iteration, dir_loop))
}

/// What a rank brings home from a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// One record per iteration
    pub records: Vec<SummaryRecord>,
    /// Verification errors summed over all ranks
    pub verification_errors: u64,
    /// This rank's latency histograms (empty unless enabled)
    pub latency: OpLatency,
}

/// Reduced results, only present on rank 0
#[derive(Debug, Clone)]
pub struct RunReport {
    pub tables: Vec<SummaryTable>,
    pub per_process: Vec<String>,
}

impl RunOutcome {
    /// Gather and reduce the records of all ranks. Collective.
    pub fn summarize(&self, plan: &RunPlan, comm: &dyn Communicator) -> Result<Option<RunReport>> {
        let cfg = &plan.config;
        comm.barrier()?;
        let mut tables = Vec::new();
        let mut per_process = Vec::new();
        for metric in Metric::for_report(cfg.report) {
            if let Some(matrix) = SampleMatrix::gather(&self.records, metric, comm)? {
                if cfg.print_all_procs {
                    per_process.push(render_per_process(&matrix, metric, cfg.run_dirs(), cfg.run_files()));
                }
                tables.push(SummaryTable::build(&matrix, &self.records, metric, cfg.run_dirs(), cfg.run_files()));
            }
        }
        Ok((comm.rank() == 0).then_some(RunReport { tables, per_process }))
    }
}

/// Drives a whole run on one rank
pub struct Orchestrator<'a> {
    plan: &'a RunPlan,
    backend: &'a dyn Backend,
    comm: &'a dyn Communicator,
    latency: OpLatency,
}

impl<'a> Orchestrator<'a> {
    pub fn new(plan: &'a RunPlan, backend: &'a dyn Backend, comm: &'a dyn Communicator) -> Self {
        Self { plan, backend, comm, latency: OpLatency::disabled() }
    }

    /// Collect per-operation latency
    pub fn with_latency(mut self, latency: OpLatency) -> Self {
        self.latency = latency;
        self
    }

    fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn size(&self) -> usize {
        self.comm.size()
    }

    /// Test path of this rank
    fn my_path(&self) -> &'a Path {
        let paths = &self.plan.config.paths;
        &paths[self.rank() % paths.len()]
    }

    /// Ranks below the path count own the test paths
    fn owns_path(&self) -> bool {
        self.rank() < self.plan.config.paths.len()
    }

    /// Run every iteration. Collective.
    pub async fn run(self) -> Result<RunOutcome> {
        let cfg = &self.plan.config;

        let mut created_root = false;
        if self.owns_path() {
            let root = self.my_path();
            if !self.backend.access(root, AccessMode::Exists).await? {
                debug!("creating test path {}", root.display());
                self.backend
                    .mkdir(root)
                    .await
                    .with_context(|| format!("Unable to create test path {}", root.display()))?;
                created_root = true;
            }
        }
        self.comm.barrier()?;

        let mut engine = Engine::new(self.plan, self.backend, self.comm).with_latency(self.latency.clone());
        if cfg.random {
            let seed = self.random_seed()?;
            engine = engine.with_random_order(seed);
        }

        let mut records = Vec::with_capacity(cfg.iterations as usize);
        for iteration in 0..cfg.iterations {
            info!("* iteration {} *", iteration + 1);
            records.push(self.run_iteration(&mut engine, iteration).await?);
        }

        let verification_errors = self.comm.all_reduce_u64(engine.verification_errors(), ReduceOp::Sum)?;

        if created_root && cfg.phases.remove {
            let root = self.my_path();
            debug!("removing test path {}", root.display());
            self.backend.rmdir(root).await?;
        }

        Ok(RunOutcome { records, verification_errors, latency: engine.latency().clone() })
    }

    /// Seed shared by all ranks, shifted by the rank number
    fn random_seed(&self) -> Result<u64> {
        let mut seed = self.plan.config.random_seed;
        if seed == 0 {
            let local = if self.rank() == 0 {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(1)
            } else {
                0
            };
            seed = self.comm.broadcast_u64(local, 0)?;
            if self.rank() == 0 {
                info!("random seed: {}", seed);
            }
        }
        Ok(seed.wrapping_add(self.rank() as u64))
    }

    /// Test directories of this rank for an iteration
    fn test_dirs(&self, iteration: u32) -> Vec<PathBuf> {
        (0..self.plan.layout.directory_loops())
            .map(|dir_loop| test_dir(self.my_path(), iteration, dir_loop))
            .collect()
    }

    async fn phase_end(&self) -> Result<()> {
        let cfg = &self.plan.config;
        if cfg.call_sync {
            self.backend.sync().await?;
        }
        if cfg.barriers {
            self.comm.barrier()?;
        }
        Ok(())
    }

    async fn run_iteration(&self, engine: &mut Engine<'a>, iteration: u32) -> Result<SummaryRecord> {
        let cfg = &self.plan.config;
        let num_dirs = self.plan.layout.shape().num_dirs();
        let testdirs = self.test_dirs(iteration);
        let mut record = SummaryRecord::new();

        if self.owns_path() {
            for dir in &testdirs {
                if !self.backend.access(dir, AccessMode::Exists).await? {
                    self.backend
                        .mkdir(dir)
                        .await
                        .with_context(|| format!("Unable to create test directory {}", dir.display()))?;
                }
            }
        }

        if cfg.phases.create {
            self.comm.barrier()?;
            let t0 = Instant::now();
            for dir in &testdirs {
                self.build_trees(dir).await?;
            }
            self.comm.barrier()?;
            let dt = t0.elapsed().as_secs_f64();
            record.record(OpSlot::TreeCreate, num_dirs, dt);
            if self.rank() == 0 {
                info!("   Tree creation     : {:14.3} sec, {:14.3} ops/sec", dt, record.slot(OpSlot::TreeCreate).rate);
            }
        }

        if cfg.run_dirs() {
            self.pre_delay().await;
            self.item_tests(engine, ItemKind::Dir, &testdirs, &mut record).await?;
        }
        if cfg.run_files() {
            self.pre_delay().await;
            self.item_tests(engine, ItemKind::File, &testdirs, &mut record).await?;
        }

        self.comm.barrier()?;
        if cfg.phases.remove {
            let t0 = Instant::now();
            for dir in &testdirs {
                self.teardown_trees(dir).await?;
            }
            self.comm.barrier()?;
            let dt = t0.elapsed().as_secs_f64();
            record.record(OpSlot::TreeRemove, num_dirs, dt);
            if self.rank() == 0 {
                info!("   Tree removal      : {:14.3} sec, {:14.3} ops/sec", dt, record.slot(OpSlot::TreeRemove).rate);
            }

            if self.owns_path() {
                for dir in &testdirs {
                    if self.backend.access(dir, AccessMode::Exists).await? {
                        self.backend
                            .rmdir(dir)
                            .await
                            .with_context(|| format!("unable to remove directory {}", dir.display()))?;
                    }
                }
            }
        }

        Ok(record)
    }

    async fn pre_delay(&self) {
        let secs = self.plan.config.pre_delay_secs;
        if secs > 0 {
            debug!("delaying {} seconds", secs);
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
    }

    /// Trees this rank builds and removes under a test directory
    fn owned_trees(&self, testdir: &Path) -> Vec<TreeRoot> {
        let cfg = &self.plan.config;
        match (cfg.unique_dir_per_task, cfg.collective_creates) {
            (true, true) if self.rank() == 0 => (0..self.size())
                .map(|owner| TreeRoot::new(testdir, tree_base_name(true, owner)))
                .collect(),
            (true, true) => Vec::new(),
            (true, false) => {
                let owner = Phase::Create.owner(self.rank(), 0, self.size());
                vec![TreeRoot::new(testdir, tree_base_name(true, owner))]
            }
            (false, _) if self.rank() == 0 => vec![TreeRoot::new(testdir, tree_base_name(false, 0))],
            (false, _) => Vec::new(),
        }
    }

    async fn build_trees(&self, testdir: &Path) -> Result<()> {
        let shape = self.plan.layout.shape();
        for tree in self.owned_trees(testdir) {
            debug!("building tree {}", tree.path().display());
            for ordinal in shape.ordinals() {
                let dir = tree.dir_path(shape, ordinal);
                self.backend
                    .mkdir(&dir)
                    .await
                    .with_context(|| format!("Unable to create tree directory {}", dir.display()))?;
            }
        }
        Ok(())
    }

    async fn teardown_trees(&self, testdir: &Path) -> Result<()> {
        let shape = self.plan.layout.shape();
        for tree in self.owned_trees(testdir) {
            debug!("removing tree {}", tree.path().display());
            for ordinal in shape.ordinals().rev() {
                let dir = tree.dir_path(shape, ordinal);
                self.backend
                    .rmdir(&dir)
                    .await
                    .with_context(|| format!("Unable to remove tree directory {}", dir.display()))?;
            }
        }
        Ok(())
    }

    fn target(&self, testdir: &Path, phase: Phase) -> ItemTarget {
        let owner = phase.owner(self.rank(), self.plan.config.nstride as usize, self.size());
        ItemTarget::for_owner(self.plan, testdir, owner)
    }

    /// Effective item count at the start of an item test: the layout's, or
    /// the stored count of an earlier stonewalled run when files are not
    /// created in this run
    async fn initial_items(&self, kind: ItemKind) -> Result<u64> {
        let cfg = &self.plan.config;
        let items = self.plan.layout.items();
        let status_path = match &cfg.stonewall_status_file {
            Some(path) if kind == ItemKind::File && !cfg.phases.create => path,
            _ => return Ok(items),
        };
        let stored = if self.rank() == 0 {
            StatusFile::new(status_path).load().await.unwrap_or(u64::MAX)
        } else {
            u64::MAX
        };
        match self.comm.broadcast_u64(stored, 0)? {
            u64::MAX => {
                if self.rank() == 0 {
                    warn!("Could not read stonewall status file");
                }
                Ok(items)
            }
            stored => {
                if self.rank() == 0 {
                    info!("Read stonewall status; items: {}", stored);
                }
                Ok(stored)
            }
        }
    }

    async fn item_tests(
        &self,
        engine: &mut Engine<'a>,
        kind: ItemKind,
        testdirs: &[PathBuf],
        record: &mut SummaryRecord,
    ) -> Result<()> {
        let cfg = &self.plan.config;
        let loops = self.plan.layout.directory_loops();
        let mut times = [0.0f64; 5];

        engine.set_effective_items(self.initial_items(kind).await?);

        self.comm.barrier()?;
        let mut t_prev = Instant::now();

        // create
        if cfg.phases.create {
            self.create_phase(engine, kind, testdirs, record).await?;
        }
        self.phase_end().await?;
        times[0] = t_prev.elapsed().as_secs_f64();
        t_prev = Instant::now();

        // stat
        if cfg.phases.stat {
            for dir in testdirs {
                engine.stat(kind, &self.target(dir, Phase::Stat)).await?;
            }
        }
        self.phase_end().await?;
        times[1] = t_prev.elapsed().as_secs_f64();
        t_prev = Instant::now();

        // read: directories have nothing to read
        if cfg.phases.read && kind == ItemKind::File {
            for dir in testdirs {
                engine.read(&self.target(dir, Phase::Read)).await?;
            }
        }
        self.phase_end().await?;
        times[2] = t_prev.elapsed().as_secs_f64();
        t_prev = Instant::now();

        // rename
        if cfg.phases.rename {
            for dir in testdirs {
                engine.rename(kind, &self.target(dir, Phase::Rename)).await?;
            }
        }
        self.phase_end().await?;
        times[3] = t_prev.elapsed().as_secs_f64();
        t_prev = Instant::now();

        // remove
        if cfg.phases.remove {
            // The collective create touches every configured item, also
            // those a stonewall cut from the timed pass
            let collective_items = if cfg.phases.create {
                self.plan.layout.items().max(engine.effective_items())
            } else {
                engine.effective_items()
            };
            for dir in testdirs {
                if cfg.collective_creates {
                    if self.rank() == 0 {
                        engine.collective(kind, false, dir, collective_items).await?;
                    }
                } else {
                    let mut progress = StonewallProgress::new(engine.effective_items());
                    let target = self.target(dir, Phase::Remove);
                    engine
                        .create_remove(kind, false, &target, &mut progress, FileCreate::Create)
                        .await?;
                }
            }
        }
        self.phase_end().await?;
        times[4] = t_prev.elapsed().as_secs_f64();

        let total = engine.effective_items() * loops * self.size() as u64;
        let enabled = [cfg.phases.create, cfg.phases.stat, cfg.phases.read, cfg.phases.rename, cfg.phases.remove];
        for phase in Phase::ALL {
            if !enabled[phase.index()] || (phase == Phase::Read && kind == ItemKind::Dir) {
                continue;
            }
            let slot = OpSlot::of(kind, phase);
            record.record(slot, total, times[phase.index()]);
            if self.rank() == 0 {
                let sample = record.slot(slot);
                info!(
                    "   {:<18}: {:14.3} sec, {:14.3} ops/sec",
                    slot.label().unwrap_or(""),
                    sample.time,
                    sample.rate
                );
            }
        }
        Ok(())
    }

    async fn create_phase(
        &self,
        engine: &mut Engine<'a>,
        kind: ItemKind,
        testdirs: &[PathBuf],
        record: &mut SummaryRecord,
    ) -> Result<()> {
        let cfg = &self.plan.config;
        let items = self.plan.layout.items();
        let mut progress = StonewallProgress::new(items);
        progress.arm(cfg.stonewall_seconds, items);

        // Rank 0 creates everything for directories; for files it only
        // creates them empty and every rank writes its own payload
        let distributed = !(cfg.collective_creates && kind == ItemKind::Dir);
        let file_mode = if cfg.collective_creates { FileCreate::OpenExisting } else { FileCreate::Create };

        let mut last_target = None;
        for dir in testdirs {
            if cfg.collective_creates {
                if self.rank() == 0 {
                    engine.collective(kind, true, dir, items).await?;
                }
                if kind == ItemKind::File {
                    self.comm.barrier()?;
                }
            }
            if !distributed || (kind == ItemKind::File && cfg.collective_creates && cfg.make_node) {
                continue;
            }
            let target = self.target(dir, Phase::Create);
            progress.items_start = 0;
            progress.target_items = items;
            engine.create_remove(kind, true, &target, &mut progress, file_mode).await?;
            last_target = Some(target);
            if progress.state() == stonewall::StonewallState::Tripped {
                break;
            }
        }

        if cfg.stonewall_seconds == 0 {
            return Ok(());
        }
        let Some(target) = last_target else {
            return Ok(());
        };

        let rec = stonewall::reconcile(&mut progress, self.comm, items)?;
        if rec.catch_up {
            debug!("stonewall catch-up: {} of {}", progress.items_start, progress.target_items);
            engine.create_remove(kind, true, &target, &mut progress, file_mode).await?;
        }
        engine.set_effective_items(rec.max_items);
        record.record_stonewall(kind, &rec);
        if self.rank() == 0 {
            info!(
                "   {} creation (stonewall): {:14.3} sec, {} items",
                if kind == ItemKind::Dir { "Directory" } else { "File" },
                rec.time,
                rec.sum_items
            );
            if kind == ItemKind::File {
                if let Some(path) = &cfg.stonewall_status_file {
                    StatusFile::new(path).store(rec.max_items).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SoloComm;
    use crate::config::RunConfig;
    use crate::mem_metadata::MemoryBackend;
    use crate::validation;

    #[test]
    fn test_phase_owner() {
        assert_eq!(phase_owner(0, 0, 1, 4), 0);
        assert_eq!(phase_owner(3, 1, 1, 4), 0);
        assert_eq!(phase_owner(1, 4, 2, 4), 1);
        assert_eq!(Phase::Stat.owner(2, 1, 4), 3);
        assert_eq!(Phase::Remove.owner(2, 0, 4), 2);
    }

    #[test]
    fn test_test_dir_name() {
        assert_eq!(test_dir(Path::new("/mnt/x"), 2, 1), PathBuf::from("/mnt/x/test-dir.2-1"));
    }

    #[tokio::test]
    async fn test_full_run_leaves_namespace_clean() {
        let plan = validation::prepare(RunConfig {
            paths: vec![PathBuf::from("/bench")],
            branch_factor: 2,
            depth: 2,
            items: 40,
            write_bytes: 16,
            read_bytes: 16,
            iterations: 2,
            ..RunConfig::default()
        }, 1)
        .unwrap();
        let backend = MemoryBackend::new();
        let comm = SoloComm;

        let outcome = Orchestrator::new(&plan, &backend, &comm).run().await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.verification_errors, 0);
        assert!(backend.is_empty(), "left behind: {:?}", backend.paths());

        let rec = &outcome.records[0];
        // 40 items over 7 directories: 5 per directory, 35 in total
        assert_eq!(rec.slot(OpSlot::FileCreate).items, 35);
        assert_eq!(rec.slot(OpSlot::DirStat).items, 35);
        assert_eq!(rec.slot(OpSlot::TreeCreate).items, 7);
        assert_eq!(rec.slot(OpSlot::DirRead).items, 0);

        let report = outcome.summarize(&plan, &comm).unwrap().unwrap();
        assert_eq!(report.tables.len(), 1);
        assert!(report.tables[0].render().contains("File read"));
    }

    #[tokio::test]
    async fn test_create_only_keeps_tree() {
        let mut cfg = RunConfig {
            paths: vec![PathBuf::from("keep")],
            items: 3,
            files_only: true,
            ..RunConfig::default()
        };
        cfg.phases.create = true;
        let plan = validation::prepare(cfg, 1).unwrap();
        let backend = MemoryBackend::new();
        Orchestrator::new(&plan, &backend, &SoloComm).run().await.unwrap();
        assert!(backend.exists(Path::new("keep/test-dir.0-0/md_tree.0/file.mdbench.0.2")));
    }
}
