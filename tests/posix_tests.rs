// POSIX backend integration tests
// Full runs against a temporary directory on the local file system.
//
// These tests always run - no special privileges needed.
// Run with: cargo test --test posix_tests -- --nocapture

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use sai3_mdbench::comm::SoloComm;
use sai3_mdbench::config::{PhaseSelection, RunConfig};
use sai3_mdbench::directory_tree::ItemKind;
use sai3_mdbench::fs_metadata::PosixBackend;
use sai3_mdbench::phases::Orchestrator;
use sai3_mdbench::stonewall::{StatusFile, StonewallProgress};
use sai3_mdbench::summary::OpSlot;
use sai3_mdbench::validation;
use sai3_mdbench::workload::{Engine, FileCreate, ItemTarget};

/// Every path below `root`, relative to it
fn snapshot(root: &Path) -> BTreeSet<PathBuf> {
    fn walk(dir: &Path, root: &Path, out: &mut BTreeSet<PathBuf>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            out.insert(path.strip_prefix(root).unwrap().to_path_buf());
            if path.is_dir() {
                walk(&path, root, out);
            }
        }
    }
    let mut out = BTreeSet::new();
    walk(root, root, &mut out);
    out
}

#[tokio::test]
async fn test_posix_full_run() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let bench = temp_dir.path().join("bench");
    let plan = validation::prepare(
        RunConfig {
            paths: vec![bench.clone()],
            branch_factor: 2,
            depth: 2,
            items_per_dir: 3,
            write_bytes: 4096,
            read_bytes: 4096,
            verify_read: true,
            verify_write: true,
            sync_file: true,
            call_sync: true,
            iterations: 2,
            ..RunConfig::default()
        },
        1,
    )?;

    let outcome = Orchestrator::new(&plan, &PosixBackend::new(), &SoloComm).run().await?;
    assert_eq!(outcome.verification_errors, 0);
    // The run created the test path, so it removes it too
    assert!(!bench.exists());
    assert_eq!(outcome.records[1].slot(OpSlot::FileRemove).items, 21);
    Ok(())
}

#[tokio::test]
async fn test_posix_existing_path_is_kept() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let plan = validation::prepare(
        RunConfig { paths: vec![temp_dir.path().to_path_buf()], items: 10, ..RunConfig::default() },
        1,
    )?;
    Orchestrator::new(&plan, &PosixBackend::new(), &SoloComm).run().await?;
    assert!(temp_dir.path().exists());
    assert!(snapshot(temp_dir.path()).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_posix_rename_leaves_namespace_unchanged() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let testdir = temp_dir.path().join("t");
    std::fs::create_dir(&testdir)?;
    let plan = validation::prepare(
        RunConfig {
            paths: vec![temp_dir.path().to_path_buf()],
            branch_factor: 3,
            depth: 1,
            items_per_dir: 2,
            write_bytes: 10,
            ..RunConfig::default()
        },
        1,
    )?;
    let backend = PosixBackend::new();
    let comm = SoloComm;
    let target = ItemTarget::for_owner(&plan, &testdir, 0);
    let shape = plan.layout.shape();
    for ordinal in shape.ordinals() {
        std::fs::create_dir(target.tree.dir_path(shape, ordinal))?;
    }

    let mut engine = Engine::new(&plan, &backend, &comm);
    for kind in [ItemKind::Dir, ItemKind::File] {
        let mut progress = StonewallProgress::new(plan.layout.items());
        engine.create_remove(kind, true, &target, &mut progress, FileCreate::Create).await?;
    }
    let before = snapshot(&testdir);
    assert_eq!(before.len(), 4 + 8 + 8);

    engine.rename(ItemKind::File, &target).await?;
    engine.rename(ItemKind::Dir, &target).await?;
    assert_eq!(snapshot(&testdir), before);
    Ok(())
}

#[tokio::test]
async fn test_stonewall_status_file_carries_item_count() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let bench = temp_dir.path().join("bench");
    let status = temp_dir.path().join("stonewall.status");

    // First run: create only, with a stonewall that never trips
    let mut cfg = RunConfig {
        paths: vec![bench.clone()],
        items: 12,
        files_only: true,
        write_bytes: 16,
        stonewall_seconds: 600,
        stonewall_status_file: Some(status.clone()),
        ..RunConfig::default()
    };
    cfg.phases = PhaseSelection { create: true, ..PhaseSelection::default() };
    let plan = validation::prepare(cfg.clone(), 1)?;
    let outcome = Orchestrator::new(&plan, &PosixBackend::new(), &SoloComm).run().await?;
    assert_eq!(StatusFile::new(&status).load().await, Some(12));
    let stonewall = outcome.records[0].stonewall(ItemKind::File).expect("stonewall recorded");
    assert_eq!(stonewall.item_sum, 12);

    // Second run: read and remove what the first run left, sized by the status file
    cfg.phases = PhaseSelection { stat: true, read: true, remove: true, ..PhaseSelection::default() };
    cfg.items = 100;
    cfg.read_bytes = 16;
    let plan = validation::prepare(cfg, 1)?;
    let outcome = Orchestrator::new(&plan, &PosixBackend::new(), &SoloComm).run().await?;
    assert_eq!(outcome.verification_errors, 0);
    assert_eq!(outcome.records[0].slot(OpSlot::FileRead).items, 12);
    // The remove phase tears down the tree of the first run; the test path
    // predates this run and stays
    assert!(bench.exists());
    assert!(snapshot(&bench).is_empty());
    Ok(())
}
