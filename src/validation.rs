// src/validation.rs
//
// Configuration normalization, validation and summary display
// Runs once, before any I/O, on every rank with the same inputs, so every
// rank reaches the same verdict.

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::config::{PhaseSelection, RunConfig, RunPlan};
use crate::directory_tree::TreeLayout;

/// Fill in implicit choices: no phase selected means all phases, neither
/// files-only nor dirs-only means both, shared files mean no directory tests
pub fn normalize(cfg: &mut RunConfig) {
    if cfg.phases.none_selected() {
        cfg.phases = PhaseSelection::all();
    }
    if !cfg.dirs_only && !cfg.files_only {
        cfg.dirs_only = true;
        cfg.files_only = true;
    }
    if cfg.shared_file {
        cfg.dirs_only = false;
    }
}

/// Check the rules a normalized configuration must satisfy for `size` ranks
pub fn validate(cfg: &RunConfig, size: usize) -> Result<()> {
    let path_count = cfg.paths.len();
    if path_count == 0 {
        bail!("at least one test directory is required");
    }
    if cfg.stonewall_seconds > 0 && (cfg.branch_factor > 1 || !cfg.barriers) {
        bail!(
            "stonewall timer only works with a branch factor <= 1 (current is {}) and with barriers",
            cfg.branch_factor
        );
    }
    if !cfg.barriers && cfg.nstride != 0 {
        bail!("possible race conditions: disabling barriers is not compatible with a rank stride");
    }
    if cfg.collective_creates {
        if cfg.shared_file {
            bail!("collective creates are not compatible with shared files");
        }
        if path_count > 1 {
            bail!("collective creates are not compatible with multiple test directories");
        }
        if !cfg.barriers {
            bail!("collective creates are not compatible with disabled barriers");
        }
    }
    if cfg.unique_dir_per_task && cfg.shared_file {
        bail!("unique directory per task is not compatible with shared files");
    }
    if path_count > 1 && cfg.nstride > 0 {
        bail!("cannot have multiple directory paths with a stride between neighbor ranks");
    }
    if path_count > 1 && !cfg.unique_dir_per_task {
        bail!("shared directory mode is not compatible with multiple directory paths");
    }
    if path_count > size {
        bail!("cannot have more directory paths ({}) than ranks ({})", path_count, size);
    }
    if cfg.depth < 0 {
        bail!("depth must be greater than or equal to zero");
    }
    if cfg.branch_factor < 1 && cfg.depth > 0 {
        bail!("branch factor must be at least one when depth is greater than zero");
    }
    if cfg.items > 0 && cfg.items_per_dir > 0 {
        if cfg.unique_dir_per_task {
            bail!("only specify the number of items or the number of items per directory");
        }
        if cfg.items % cfg.items_per_dir != 0 {
            bail!("items ({}) must be a multiple of items per directory ({})", cfg.items, cfg.items_per_dir);
        }
        if cfg.stonewall_seconds != 0 {
            bail!("items and items per directory can only both be set without stonewalling");
        }
    }
    if cfg.write_bytes > 0 && cfg.make_node {
        bail!("mknod is not compatible with a non-zero write size");
    }
    if cfg.verify_read && !cfg.phases.read {
        bail!("verify read requires that the read test is used");
    }
    if cfg.verify_read && cfg.read_bytes == 0 {
        bail!("verify read requires that read bytes is > 0");
    }
    if cfg.phases.create && cfg.phases.read && cfg.read_bytes > cfg.write_bytes {
        bail!(
            "when writing and reading files, read bytes ({}) must not exceed write bytes ({})",
            cfg.read_bytes,
            cfg.write_bytes
        );
    }
    Ok(())
}

/// Normalize, validate and derive the layout
pub fn prepare(mut cfg: RunConfig, size: usize) -> Result<RunPlan> {
    normalize(&mut cfg);
    validate(&cfg, size)?;
    if cfg.phases.read && cfg.read_bytes == 0 && cfg.run_files() {
        warn!("Read bytes is 0, thus, a read test will actually just open/close");
    }
    let layout = TreeLayout::derive(&cfg).context("Invalid directory tree layout")?;
    Ok(RunPlan { config: cfg, layout })
}

/// Print the effective configuration; used for `--dry-run`
pub fn display_config_summary(plan: &RunPlan, size: usize) {
    let cfg = &plan.config;
    let layout = &plan.layout;
    let shape = layout.shape();
    let on_off = |b: bool| if b { "✅ YES" } else { "❌ NO" };

    println!("╔═══════════════════════════════════════════════════════════════════════╗");
    println!("║           CONFIGURATION VALIDATION & TEST SUMMARY                    ║");
    println!("╚═══════════════════════════════════════════════════════════════════════╝");
    println!();

    println!("┌─ Test Configuration ─────────────────────────────────────────────────┐");
    let paths: Vec<String> = cfg.paths.iter().map(|p| p.display().to_string()).collect();
    println!("│ Test paths:   {}", paths.join(", "));
    println!("│ Ranks:        {}", size);
    println!("│ Iterations:   {}", cfg.iterations);
    let tests = match (cfg.run_dirs(), cfg.run_files()) {
        (true, true) => "directories and files",
        (true, false) => "directories",
        (false, true) => "files",
        (false, false) => "none",
    };
    println!("│ Tests:        {}", tests);
    let phases: Vec<&str> = [
        (cfg.phases.create, "create"),
        (cfg.phases.stat, "stat"),
        (cfg.phases.read, "read"),
        (cfg.phases.rename, "rename"),
        (cfg.phases.remove, "remove"),
    ]
    .iter()
    .filter(|(on, _)| *on)
    .map(|(_, name)| *name)
    .collect();
    println!("│ Phases:       {}", phases.join(", "));
    println!("└──────────────────────────────────────────────────────────────────────┘");
    println!();

    println!("┌─ Directory Tree ─────────────────────────────────────────────────────┐");
    println!("│ Branch factor:      {}", shape.branch_factor());
    println!("│ Depth:              {}", shape.depth());
    println!("│ Directories:        {} per tree", shape.num_dirs());
    println!("│ Items/dir:          {} ({})", layout.items_per_dir(),
        if layout.leaf_only() { "leaf directories only" } else { "every directory" });
    println!("│ Items/rank:         {} in {} directories", layout.items(), layout.dirs_with_items());
    if layout.directory_loops() > 1 {
        println!("│ Directory loops:    {}", layout.directory_loops());
    }
    println!("│ Unique dir/rank:    {}", on_off(cfg.unique_dir_per_task));
    println!("│ Shared file:        {}", on_off(cfg.shared_file));
    println!("│ Collective creates: {}", on_off(cfg.collective_creates));
    println!("│ Total items:        {}", layout.items() * layout.directory_loops() * size as u64);
    println!("└──────────────────────────────────────────────────────────────────────┘");
    println!();

    println!("┌─ Data & Timing ──────────────────────────────────────────────────────┐");
    println!("│ Write bytes:   {}", cfg.write_bytes);
    println!("│ Read bytes:    {}", cfg.read_bytes);
    println!("│ Verify read:   {}", on_off(cfg.verify_read));
    println!("│ Verify write:  {}", on_off(cfg.verify_write));
    println!("│ fsync/file:    {}", on_off(cfg.sync_file));
    println!("│ Sync/phase:    {}", on_off(cfg.call_sync));
    println!("│ mknod:         {}", on_off(cfg.make_node));
    println!("│ Barriers:      {} (stride {})", on_off(cfg.barriers), cfg.nstride);
    if cfg.stonewall_seconds > 0 {
        println!("│ Stonewall:     {}s", cfg.stonewall_seconds);
    }
    if let Some(path) = &cfg.stonewall_status_file {
        println!("│ Status file:   {}", path.display());
    }
    if cfg.random {
        println!("│ Random order:  seed {}", cfg.random_seed);
    }
    println!("└──────────────────────────────────────────────────────────────────────┘");
    println!();
    println!("✅ Configuration is valid and ready to run");
    println!();
}
