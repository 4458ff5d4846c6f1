// src/config.rs
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{DEFAULT_BRANCH_FACTOR, DEFAULT_ITERATIONS, DEFAULT_TEST_PATH};
use crate::directory_tree::TreeLayout;

/// Complete description of one benchmark run.
///
/// Built once from the CLI or a YAML file, normalized and validated by
/// [`crate::validation::prepare`], and then only ever passed by reference.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Test directories; rank r works under `paths[r % paths.len()]`
    pub paths: Vec<PathBuf>,

    /// Number of child directories per non-leaf directory
    pub branch_factor: u32,

    /// Number of directory levels below the tree root.
    /// Signed so that a negative value coming from YAML can be rejected with
    /// a clear message rather than a parse error.
    pub depth: i32,

    /// Items (files or directories) each process handles; 0 = derive from
    /// `items_per_dir`
    pub items: u64,

    /// Items per directory; 0 = derive from `items`
    pub items_per_dir: u64,

    /// Number of repetitions of tree build, phases and teardown
    pub iterations: u32,

    /// Place items only in directories at maximum depth
    pub leaf_only: bool,

    /// Every process works on the same file names (files only)
    pub shared_file: bool,

    /// Each process gets its own directory tree
    pub unique_dir_per_task: bool,

    /// Rank 0 performs the create/remove operations of every rank
    pub collective_creates: bool,

    /// Barrier between phases
    pub barriers: bool,

    /// Rank shift between phases, so the reader of an item is not its writer
    pub nstride: u32,

    /// Phases to run; all false means all
    pub phases: PhaseSelection,

    /// Only directory tests (combined with `files_only` or neither = both)
    pub dirs_only: bool,

    /// Only file tests
    pub files_only: bool,

    /// Bytes written to each file after create
    pub write_bytes: u64,

    /// Bytes read from each file in the read phase
    pub read_bytes: u64,

    /// Fully verify the data read in the read phase
    pub verify_read: bool,

    /// Read back and verify each file right after writing it
    pub verify_write: bool,

    /// fsync after each payload write
    pub sync_file: bool,

    /// Call the backend sync at the end of each phase
    pub call_sync: bool,

    /// Create files with mknod instead of create
    pub make_node: bool,

    /// Stonewall timer for the create phase in seconds; 0 = disabled
    pub stonewall_seconds: u64,

    /// File holding the reconciled item count of a stonewalled create
    pub stonewall_status_file: Option<PathBuf>,

    /// Random access order for stat/read/rename
    pub random: bool,

    /// Seed for random access; 0 = pick one on rank 0 and broadcast it
    pub random_seed: u64,

    /// Delay before each directory/file test in seconds
    pub pre_delay_secs: u64,

    /// Which metric the summary reports
    pub report: ReportMode,

    /// Print the per-process sample table
    pub print_all_procs: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from(DEFAULT_TEST_PATH)],
            branch_factor: DEFAULT_BRANCH_FACTOR,
            depth: 0,
            items: 0,
            items_per_dir: 0,
            iterations: DEFAULT_ITERATIONS,
            leaf_only: false,
            shared_file: false,
            unique_dir_per_task: false,
            collective_creates: false,
            barriers: true,
            nstride: 0,
            phases: PhaseSelection::default(),
            dirs_only: false,
            files_only: false,
            write_bytes: 0,
            read_bytes: 0,
            verify_read: false,
            verify_write: false,
            sync_file: false,
            call_sync: false,
            make_node: false,
            stonewall_seconds: 0,
            stonewall_status_file: None,
            random: false,
            random_seed: 0,
            pre_delay_secs: 0,
            report: ReportMode::Rate,
            print_all_procs: false,
        }
    }
}

impl RunConfig {
    /// Load a configuration from YAML text
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).map_err(|e| anyhow::anyhow!("Failed to parse run config: {}", e))
    }

    /// Directory tests run after normalization
    pub fn run_dirs(&self) -> bool {
        self.dirs_only
    }

    /// File tests run after normalization
    pub fn run_files(&self) -> bool {
        self.files_only
    }
}

/// Per-phase enable flags
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PhaseSelection {
    pub create: bool,
    pub stat: bool,
    pub read: bool,
    pub rename: bool,
    pub remove: bool,
}

impl PhaseSelection {
    pub fn all() -> Self {
        Self { create: true, stat: true, read: true, rename: true, remove: true }
    }

    pub fn none_selected(&self) -> bool {
        !(self.create || self.stat || self.read || self.rename || self.remove)
    }
}

/// Metric printed in the summary
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    #[default]
    Rate,
    Time,
    Both,
}

/// A normalized, validated configuration together with everything derived
/// from it. Derived values are computed exactly once here.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub config: RunConfig,
    pub layout: TreeLayout,
}
