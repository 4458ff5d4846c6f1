// src/lib.rs

pub mod comm; // Collective primitives: solo, in-process ranks, MPI
pub mod config;
pub mod constants;
pub mod directory_tree; // Tree addressing and item naming
pub mod fs_metadata; // POSIX backend
pub mod mem_metadata; // In-memory backend
pub mod metadata_ops;
pub mod metrics; // Per-operation latency histograms
pub mod payload;
pub mod phases; // Iteration and phase orchestration
pub mod stonewall;
pub mod summary;
pub mod tsv_export; // TSV export for machine-readable results
pub mod validation;
pub mod workload;

pub use config::{RunConfig, RunPlan};
pub use phases::{Orchestrator, RunOutcome, RunReport};
