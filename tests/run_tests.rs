// Full benchmark runs over the in-memory backend
// Single rank via SoloComm, multiple ranks as threads via LocalGroup.
//
// Run with: cargo test --test run_tests -- --nocapture

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use sai3_mdbench::comm::{Communicator, LocalGroup, SoloComm};
use sai3_mdbench::config::{PhaseSelection, ReportMode, RunConfig, RunPlan};
use sai3_mdbench::directory_tree::ItemKind;
use sai3_mdbench::mem_metadata::MemoryBackend;
use sai3_mdbench::metadata_ops::{AccessMode, Backend, FileHandle, FsUsage, OpenMode, StatInfo};
use sai3_mdbench::phases::{Orchestrator, RunOutcome};
use sai3_mdbench::summary::OpSlot;
use sai3_mdbench::validation;

/// Operation a `SlowBackend` delays
#[derive(Clone, Copy, PartialEq)]
enum Stall {
    Create,
    OpenWrite,
}

/// In-memory namespace that delays one kind of file operation on matching
/// paths, so a stonewall trips deterministically
#[derive(Clone)]
struct SlowBackend {
    inner: MemoryBackend,
    slow_op: Stall,
    pattern: &'static str,
    delay: Duration,
}

impl SlowBackend {
    fn new(slow_op: Stall, pattern: &'static str, delay: Duration) -> Self {
        Self { inner: MemoryBackend::new(), slow_op, pattern, delay }
    }

    async fn stall(&self, op: Stall, path: &Path) {
        if op == self.slow_op && path.to_string_lossy().contains(self.pattern) {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl Backend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow-memory"
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        self.inner.mkdir(path).await
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        self.inner.rmdir(path).await
    }

    async fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>> {
        self.stall(Stall::Create, path).await;
        self.inner.create(path).await
    }

    async fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        if mode == OpenMode::Write {
            self.stall(Stall::OpenWrite, path).await;
        }
        self.inner.open(path, mode).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to).await
    }

    async fn stat(&self, path: &Path) -> Result<StatInfo> {
        self.inner.stat(path).await
    }

    async fn access(&self, path: &Path, mode: AccessMode) -> Result<bool> {
        self.inner.access(path, mode).await
    }

    async fn mknod(&self, path: &Path) -> Result<()> {
        self.inner.mknod(path).await
    }

    async fn statfs(&self, path: &Path) -> Result<FsUsage> {
        self.inner.statfs(path).await
    }

    async fn sync(&self) -> Result<()> {
        self.inner.sync().await
    }
}

/// Run `plan` on `ranks` threads sharing one namespace
fn run_group<B: Backend + Clone>(plan: &RunPlan, backend: &B, ranks: usize) -> Vec<Result<RunOutcome>> {
    let group = LocalGroup::new(ranks);
    thread::scope(|scope| {
        let handles: Vec<_> = group
            .comms()
            .into_iter()
            .map(|comm| {
                let backend = backend.clone();
                scope.spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
                    let result = rt.block_on(Orchestrator::new(plan, &backend, &comm).run());
                    if let Err(e) = &result {
                        comm.abort(&format!("{:#}", e));
                    }
                    result
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn base_config(path: &str) -> RunConfig {
    RunConfig {
        paths: vec![PathBuf::from(path)],
        ..RunConfig::default()
    }
}

#[tokio::test]
async fn test_single_rank_all_phases() -> Result<()> {
    let plan = validation::prepare(
        RunConfig {
            branch_factor: 3,
            depth: 2,
            items_per_dir: 2,
            write_bytes: 64,
            read_bytes: 64,
            verify_read: true,
            verify_write: true,
            iterations: 3,
            report: ReportMode::Both,
            ..base_config("bench")
        },
        1,
    )?;
    assert_eq!(plan.layout.items(), 26);

    let backend = MemoryBackend::new();
    let comm = SoloComm;
    let outcome = Orchestrator::new(&plan, &backend, &comm).run().await?;

    assert_eq!(outcome.verification_errors, 0);
    assert!(backend.is_empty(), "left behind: {:?}", backend.paths());
    for record in &outcome.records {
        assert_eq!(record.slot(OpSlot::TreeCreate).items, 13);
        assert_eq!(record.slot(OpSlot::TreeRemove).items, 13);
        assert_eq!(record.slot(OpSlot::FileRead).items, 26);
        assert_eq!(record.slot(OpSlot::DirRename).items, 26);
    }

    let report = outcome.summarize(&plan, &comm)?.expect("rank 0 gets the report");
    assert_eq!(report.tables.len(), 2);
    let rate = report.tables[0].render();
    assert!(rate.contains("SUMMARY rate: (of 3 iterations)"));
    assert!(rate.contains("Directory creation"));
    assert!(rate.contains("Tree removal"));
    assert!(report.tables[1].render().contains("SUMMARY time"));
    Ok(())
}

#[test]
fn test_multi_rank_unique_dirs_with_stride() {
    let plan = validation::prepare(
        RunConfig {
            branch_factor: 2,
            depth: 1,
            items_per_dir: 4,
            unique_dir_per_task: true,
            nstride: 1,
            write_bytes: 32,
            read_bytes: 32,
            verify_read: true,
            ..base_config("bench")
        },
        4,
    )
    .unwrap();
    let backend = MemoryBackend::new();

    let outcomes: Vec<RunOutcome> = run_group(&plan, &backend, 4).into_iter().map(|r| r.unwrap()).collect();
    assert!(backend.is_empty(), "left behind: {:?}", backend.paths());
    for outcome in &outcomes {
        assert_eq!(outcome.verification_errors, 0);
        // 12 items per rank, 4 ranks
        assert_eq!(outcome.records[0].slot(OpSlot::FileStat).items, 48);
    }
}

#[test]
fn test_multi_rank_shared_tree_keeps_items() {
    let mut cfg = RunConfig {
        depth: 2,
        branch_factor: 2,
        items: 21,
        files_only: true,
        ..base_config("shared")
    };
    cfg.phases = PhaseSelection { create: true, stat: true, ..PhaseSelection::default() };
    let plan = validation::prepare(cfg, 3).unwrap();
    let backend = MemoryBackend::new();

    for result in run_group(&plan, &backend, 3) {
        result.unwrap();
    }
    // Without the remove phase the tree and every rank's items stay
    for rank in 0..3 {
        let path = format!("shared/test-dir.0-0/md_tree.0/md_tree.2/md_tree.6/file.mdbench.{}.20", rank);
        assert!(backend.exists(Path::new(&path)), "missing {}", path);
    }
}

#[test]
fn test_collective_creates() {
    let plan = validation::prepare(
        RunConfig {
            items: 6,
            collective_creates: true,
            write_bytes: 16,
            read_bytes: 16,
            verify_read: true,
            ..base_config("coll")
        },
        2,
    )
    .unwrap();
    let backend = MemoryBackend::new();

    for result in run_group(&plan, &backend, 2) {
        let outcome = result.unwrap();
        assert_eq!(outcome.verification_errors, 0);
        assert_eq!(outcome.records[0].slot(OpSlot::DirCreate).items, 12);
    }
    assert!(backend.is_empty(), "left behind: {:?}", backend.paths());
}

#[test]
fn test_shared_files() {
    let mut cfg = RunConfig {
        items: 5,
        shared_file: true,
        write_bytes: 8,
        read_bytes: 8,
        ..base_config("sf")
    };
    cfg.phases = PhaseSelection { create: true, stat: true, read: true, remove: true, rename: false };
    let plan = validation::prepare(cfg, 3).unwrap();
    assert!(!plan.config.run_dirs());
    let backend = MemoryBackend::new();

    for result in run_group(&plan, &backend, 3) {
        let outcome = result.unwrap();
        assert_eq!(outcome.verification_errors, 0);
        assert_eq!(outcome.records[0].slot(OpSlot::DirCreate).items, 0);
    }
    assert!(backend.is_empty(), "left behind: {:?}", backend.paths());
}

#[test]
fn test_failure_on_one_rank_stops_the_group() {
    let mut cfg = RunConfig { items: 4, files_only: true, ..base_config("fail") };
    // Stat without create: items do not exist
    cfg.phases = PhaseSelection { stat: true, ..PhaseSelection::default() };
    let plan = validation::prepare(cfg, 2).unwrap();
    let backend = MemoryBackend::new();

    let results = run_group(&plan, &backend, 2);
    assert!(results.iter().all(|r| r.is_err()));
    let messages: Vec<String> = results.iter().map(|r| format!("{:#}", r.as_ref().unwrap_err())).collect();
    assert!(messages.iter().any(|m| m.contains("unable to stat")), "{:?}", messages);
}

#[tokio::test]
async fn test_random_order_run() -> Result<()> {
    let plan = validation::prepare(
        RunConfig {
            items: 30,
            random: true,
            random_seed: 11,
            write_bytes: 8,
            read_bytes: 8,
            ..base_config("rnd")
        },
        1,
    )?;
    let backend = MemoryBackend::new();
    let outcome = Orchestrator::new(&plan, &backend, &SoloComm).run().await?;
    assert_eq!(outcome.verification_errors, 0);
    assert!(backend.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_directory_loops() -> Result<()> {
    let mut cfg = RunConfig { items: 9, items_per_dir: 3, ..base_config("loops") };
    cfg.phases.create = true;
    let plan = validation::prepare(cfg, 1)?;
    let backend = MemoryBackend::new();
    let outcome = Orchestrator::new(&plan, &backend, &SoloComm).run().await?;

    for dir_loop in 0..3 {
        let path = format!("loops/test-dir.0-{}/md_tree.0/dir.mdbench.0.2", dir_loop);
        assert!(backend.exists(Path::new(&path)), "missing {}", path);
    }
    // Reported items include every loop
    assert_eq!(outcome.records[0].slot(OpSlot::FileCreate).items, 9);
    Ok(())
}

#[test]
fn test_stonewall_catch_up_evens_out_ranks() {
    let mut cfg = RunConfig {
        items: 20,
        files_only: true,
        write_bytes: 8,
        read_bytes: 8,
        stonewall_seconds: 1,
        ..base_config("sw")
    };
    cfg.phases = PhaseSelection { create: true, stat: true, ..PhaseSelection::default() };
    let plan = validation::prepare(cfg, 2).unwrap();
    // Only rank 1's items are slow to create
    let backend = SlowBackend::new(Stall::Create, "file.mdbench.1.", Duration::from_millis(100));

    let outcomes: Vec<RunOutcome> = run_group(&plan, &backend, 2).into_iter().map(|r| r.unwrap()).collect();

    // The catch-up pass brings the slow rank up to the fast one
    for rank in 0..2 {
        let tag = format!("file.mdbench.{}.", rank);
        let files = backend.inner.paths().iter().filter(|p| p.to_string_lossy().contains(&tag)).count();
        assert_eq!(files, 20, "rank {} files", rank);
    }
    for outcome in &outcomes {
        assert_eq!(outcome.records[0].slot(OpSlot::FileStat).items, 40);
    }

    // Stonewall figures are taken before the catch-up
    let stonewall = outcomes[0].records[0].stonewall(ItemKind::File).expect("stonewall recorded");
    assert!(stonewall.item_min > 0 && stonewall.item_min < 20, "min {}", stonewall.item_min);
    assert_eq!(stonewall.item_sum, 20 + stonewall.item_min);
}

#[tokio::test]
async fn test_collective_stonewall_removes_every_file() -> Result<()> {
    let plan = validation::prepare(
        RunConfig {
            items: 20,
            files_only: true,
            collective_creates: true,
            write_bytes: 8,
            stonewall_seconds: 1,
            ..base_config("cs")
        },
        1,
    )?;
    // Writing the payload is slow, the empty collective create is not
    let backend = SlowBackend::new(Stall::OpenWrite, "file.mdbench.", Duration::from_millis(150));
    let outcome = Orchestrator::new(&plan, &backend, &SoloComm).run().await?;

    let stonewall = outcome.records[0].stonewall(ItemKind::File).expect("stonewall recorded");
    assert!(stonewall.item_sum < 20, "sum {}", stonewall.item_sum);
    assert!(backend.inner.is_empty(), "left behind: {:?}", backend.inner.paths());
    Ok(())
}
