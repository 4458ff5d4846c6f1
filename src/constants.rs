// src/constants.rs
//
// Central location for all constants used throughout sai3-mdbench
// Naming constants are part of the on-disk layout: changing them changes the
// paths a run generates, so runs split across invocations (stonewall status
// file) must agree on them.

// =============================================================================
// On-disk naming
// =============================================================================

/// Per-iteration test directory prefix: "<path>/test-dir.<iteration>-<loop>"
pub const TEST_DIR_PREFIX: &str = "test-dir";

/// Directory tree base name; ordinal k of the tree is "<base>.k"
pub const TREE_BASE_NAME: &str = "md_tree";

/// Prefix of per-rank item owner tags: "mdbench.<owner>."
pub const OWNER_TAG_PREFIX: &str = "mdbench";

/// Owner tag used by every rank in shared-file mode
pub const SHARED_OWNER_TAG: &str = "mdbench.shared.";

/// Suffix appended during the forward half of a rename
pub const RENAME_SUFFIX: &str = "_new";

/// Item name prefix for directory items
pub const DIR_ITEM_PREFIX: &str = "dir";

/// Item name prefix for file items
pub const FILE_ITEM_PREFIX: &str = "file";

// =============================================================================
// Defaults
// =============================================================================

/// Default test path when none is given
pub const DEFAULT_TEST_PATH: &str = "./out";

/// Default branch factor
pub const DEFAULT_BRANCH_FACTOR: u32 = 1;

/// Default number of iterations
pub const DEFAULT_ITERATIONS: u32 = 1;

/// Progress is logged every this many items (at debug level)
pub const PROGRESS_LOG_INTERVAL: u64 = 25_000;

/// Byte written over the first payload byte before a read so that a short
/// read cannot leave a stale header that passes the identity check
pub const READ_POISON_BYTE: u8 = 42;

/// Separator between multiple test paths on the command line
pub const PATH_SEPARATOR: char = '@';

// =============================================================================
// Histograms
// =============================================================================

/// Upper bound for recorded operation latency (microseconds): one hour
pub const LATENCY_MAX_MICROS: u64 = 3_600_000_000;

/// Significant figures kept by latency histograms
pub const LATENCY_SIGFIGS: u8 = 3;
