// src/main.rs
//
// sai3-mdbench: distributed filesystem metadata benchmark
//
// Every rank builds a directory tree, then times create, stat, read, rename
// and remove over files and directories in it. Ranks run as threads of this
// process (--local-ranks) or as MPI processes (--mpi, cargo feature "mpi").

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tokio::runtime::Builder as RtBuilder;
use tracing::{error, info, warn, Instrument};

use sai3_mdbench::comm::{Communicator, LocalGroup, SoloComm};
use sai3_mdbench::config::{PhaseSelection, ReportMode, RunConfig, RunPlan};
use sai3_mdbench::constants::{DEFAULT_BRANCH_FACTOR, DEFAULT_ITERATIONS, DEFAULT_TEST_PATH, PATH_SEPARATOR};
use sai3_mdbench::fs_metadata::PosixBackend;
use sai3_mdbench::mem_metadata::MemoryBackend;
use sai3_mdbench::metadata_ops::Backend;
use sai3_mdbench::metrics::OpLatency;
use sai3_mdbench::phases::Orchestrator;
use sai3_mdbench::tsv_export::TsvExporter;
use sai3_mdbench::validation;

// -----------------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------------
#[derive(Parser, Debug)]
#[command(
    name = "sai3-mdbench",
    version,
    about = "Metadata benchmark: create/stat/read/rename/remove over a synthetic directory tree"
)]
struct Cli {
    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Load the run configuration from a YAML file; test flags are then ignored
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Storage backend
    #[arg(long, value_enum, default_value_t = Api::Posix)]
    api: Api,

    /// Number of ranks to run as threads of this process
    #[arg(long, default_value_t = 1)]
    local_ranks: usize,

    /// Run one rank per MPI process (needs the "mpi" cargo feature)
    #[arg(long)]
    mpi: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    dry_run: bool,

    /// Collect and print per-operation latency histograms
    #[arg(long)]
    latency: bool,

    /// Export the summary to <PATH>-summary.tsv
    #[arg(long, value_name = "PATH")]
    results_tsv: Option<PathBuf>,

    #[command(flatten)]
    test: TestArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Api {
    Posix,
    Memory,
}

/// Flags describing the test itself
#[derive(clap::Args, Debug)]
struct TestArgs {
    /// Test directories, separated by '@'
    #[arg(short = 'd', long = "dir", default_value = DEFAULT_TEST_PATH)]
    dir: String,

    /// Branch factor of the directory tree
    #[arg(short = 'b', long, default_value_t = DEFAULT_BRANCH_FACTOR)]
    branch_factor: u32,

    /// Depth of the directory tree
    #[arg(short = 'z', long, default_value_t = 0, allow_negative_numbers = true)]
    depth: i32,

    /// Items (files/directories) per rank
    #[arg(short = 'n', long, default_value_t = 0)]
    items: u64,

    /// Items per directory
    #[arg(short = 'I', long, default_value_t = 0)]
    items_per_dir: u64,

    /// Number of iterations
    #[arg(short = 'i', long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: u32,

    /// Place items only in leaf directories
    #[arg(short = 'L', long)]
    leaf_only: bool,

    /// All ranks work on the same files
    #[arg(short = 'S', long)]
    shared_file: bool,

    /// Unique working directory tree per rank
    #[arg(short = 'u', long)]
    unique_dir: bool,

    /// Rank 0 does all creates and removes
    #[arg(short = 'c', long)]
    collective_creates: bool,

    /// No barriers between phases
    #[arg(short = 'B', long)]
    no_barriers: bool,

    /// Rank stride between phases
    #[arg(short = 'N', long, default_value_t = 0)]
    stride: u32,

    /// Run only the create phase (phase flags combine)
    #[arg(short = 'C', long)]
    create: bool,

    /// Run only the stat phase
    #[arg(short = 'T', long)]
    stat: bool,

    /// Run only the read phase
    #[arg(short = 'E', long)]
    read: bool,

    /// Run only the rename phase
    #[arg(long)]
    rename: bool,

    /// Run only the remove phase
    #[arg(short = 'r', long)]
    remove: bool,

    /// Directories only
    #[arg(short = 'D', long)]
    dirs_only: bool,

    /// Files only
    #[arg(short = 'F', long)]
    files_only: bool,

    /// Bytes to write to each file after create
    #[arg(short = 'w', long, default_value_t = 0)]
    write_bytes: u64,

    /// Bytes to read from each file
    #[arg(short = 'e', long, default_value_t = 0)]
    read_bytes: u64,

    /// Verify the data read
    #[arg(short = 'X', long)]
    verify_read: bool,

    /// Read back and verify each file after writing it
    #[arg(long)]
    verify_write: bool,

    /// fsync each file after writing
    #[arg(short = 'y', long)]
    sync_file: bool,

    /// Sync the file system at the end of every phase
    #[arg(short = 'Y', long)]
    call_sync: bool,

    /// Create files with mknod
    #[arg(short = 'k', long)]
    mknod: bool,

    /// Stonewall timer for the create phase, in seconds
    #[arg(short = 'W', long, default_value_t = 0)]
    stonewall: u64,

    /// File storing the item count of a stonewalled create
    #[arg(short = 'x', long, value_name = "PATH")]
    stonewall_status_file: Option<PathBuf>,

    /// Random access order for stat, read and rename
    #[arg(long)]
    random: bool,

    /// Seed for the random access order; 0 picks one
    #[arg(long, default_value_t = 0)]
    random_seed: u64,

    /// Seconds to wait before each directory/file test
    #[arg(short = 'p', long, default_value_t = 0)]
    pre_delay: u64,

    /// Metric(s) printed in the summary
    #[arg(long, value_enum, default_value_t = ReportMode::Rate)]
    report: ReportMode,

    /// Print the per-process sample table
    #[arg(long)]
    print_all_procs: bool,
}

impl TestArgs {
    fn to_run_config(&self) -> RunConfig {
        RunConfig {
            paths: self
                .dir
                .split(PATH_SEPARATOR)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
            branch_factor: self.branch_factor,
            depth: self.depth,
            items: self.items,
            items_per_dir: self.items_per_dir,
            iterations: self.iterations,
            leaf_only: self.leaf_only,
            shared_file: self.shared_file,
            unique_dir_per_task: self.unique_dir,
            collective_creates: self.collective_creates,
            barriers: !self.no_barriers,
            nstride: self.stride,
            phases: PhaseSelection {
                create: self.create,
                stat: self.stat,
                read: self.read,
                rename: self.rename,
                remove: self.remove,
            },
            dirs_only: self.dirs_only,
            files_only: self.files_only,
            write_bytes: self.write_bytes,
            read_bytes: self.read_bytes,
            verify_read: self.verify_read,
            verify_write: self.verify_write,
            sync_file: self.sync_file,
            call_sync: self.call_sync,
            make_node: self.mknod,
            stonewall_seconds: self.stonewall,
            stonewall_status_file: self.stonewall_status_file.clone(),
            random: self.random,
            random_seed: self.random_seed,
            pre_delay_secs: self.pre_delay,
            report: self.report,
            print_all_procs: self.print_all_procs,
        }
    }
}

/// What a rank hands back to main
struct RankResult {
    latency: OpLatency,
}

// -----------------------------------------------------------------------------
// main
// -----------------------------------------------------------------------------
fn main() -> Result<()> {
    let cli = Cli::parse();

    // -v (1): info, -vv (2): debug, -vvv (3+): trace; RUST_LOG wins when set
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sai3_mdbench={}", level)));
    fmt().with_env_filter(filter).init();

    let cfg = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            info!("Loaded run config from {}", path.display());
            RunConfig::from_yaml(&text)?
        }
        None => cli.test.to_run_config(),
    };

    let backend: Arc<dyn Backend> = match cli.api {
        Api::Posix => Arc::new(PosixBackend::new()),
        Api::Memory => Arc::new(MemoryBackend::new()),
    };

    if cli.mpi {
        return run_mpi(&cli, cfg, backend);
    }

    if cli.local_ranks == 0 {
        bail!("--local-ranks must be at least 1");
    }
    let plan = validation::prepare(cfg, cli.local_ranks)?;
    if cli.dry_run {
        validation::display_config_summary(&plan, cli.local_ranks);
        return Ok(());
    }

    let results = if cli.local_ranks == 1 {
        vec![run_rank(&cli, &plan, backend.as_ref(), &SoloComm)?]
    } else {
        run_local_group(&cli, &plan, backend)?
    };

    if cli.latency {
        let mut merged = OpLatency::disabled();
        for result in &results {
            merged.merge(&result.latency);
        }
        println!("{}", merged.render(&format!("{} local rank(s)", results.len())));
    }
    Ok(())
}

#[cfg(feature = "mpi")]
fn run_mpi(cli: &Cli, cfg: RunConfig, backend: Arc<dyn Backend>) -> Result<()> {
    let comm = sai3_mdbench::comm::MpiComm::init()?;
    let plan = validation::prepare(cfg, comm.size())?;
    if cli.dry_run {
        if comm.rank() == 0 {
            validation::display_config_summary(&plan, comm.size());
        }
        return Ok(());
    }
    let result = run_rank(cli, &plan, backend.as_ref(), &comm)?;
    if cli.latency && comm.rank() == 0 {
        println!("{}", result.latency.render("rank 0"));
    }
    Ok(())
}

#[cfg(not(feature = "mpi"))]
fn run_mpi(_cli: &Cli, _cfg: RunConfig, _backend: Arc<dyn Backend>) -> Result<()> {
    bail!("this binary was built without MPI support; rebuild with --features mpi")
}

/// One thread per rank over an in-process communicator
fn run_local_group(cli: &Cli, plan: &RunPlan, backend: Arc<dyn Backend>) -> Result<Vec<RankResult>> {
    let group = LocalGroup::new(cli.local_ranks);
    let outcomes: Vec<Result<RankResult>> = thread::scope(|scope| {
        let handles: Vec<_> = group
            .comms()
            .into_iter()
            .map(|comm| {
                let backend = Arc::clone(&backend);
                scope.spawn(move || run_rank(cli, plan, backend.as_ref(), &comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("rank thread panicked"))))
            .collect()
    });
    outcomes.into_iter().collect()
}

/// Run the benchmark on one rank; aborts the group on failure
fn run_rank(cli: &Cli, plan: &RunPlan, backend: &dyn Backend, comm: &dyn Communicator) -> Result<RankResult> {
    let rt = RtBuilder::new_current_thread().enable_all().build()?;
    let span = tracing::info_span!("rank", rank = comm.rank());
    let result = rt.block_on(run_rank_async(cli, plan, backend, comm).instrument(span));
    if let Err(e) = &result {
        error!("rank {} failed: {:#}", comm.rank(), e);
        comm.abort(&format!("{:#}", e));
    }
    result
}

async fn run_rank_async(
    cli: &Cli,
    plan: &RunPlan,
    backend: &dyn Backend,
    comm: &dyn Communicator,
) -> Result<RankResult> {
    let is_root = comm.rank() == 0;
    if is_root {
        print_banner(plan, backend, comm).await;
    }

    let latency = if cli.latency { OpLatency::enabled()? } else { OpLatency::disabled() };
    let outcome = Orchestrator::new(plan, backend, comm)
        .with_latency(latency)
        .run()
        .await?;

    if let Some(report) = outcome.summarize(plan, comm)? {
        for text in &report.per_process {
            print!("{}", text);
        }
        for table in &report.tables {
            print!("{}", table.render());
        }
        if let Some(base) = &cli.results_tsv {
            TsvExporter::new(base).export_summary(&report.tables)?;
        }
    }

    if is_root {
        if outcome.verification_errors > 0 {
            println!(
                "\nERROR: verifying the data read! Take the performance values with care! ({} errors)",
                outcome.verification_errors
            );
        }
        println!("-- finished at {} --", chrono::Local::now().format("%m/%d/%Y %H:%M:%S"));
    }

    Ok(RankResult { latency: outcome.latency })
}

/// Start banner with the command line and file system usage of the first path
async fn print_banner(plan: &RunPlan, backend: &dyn Backend, comm: &dyn Communicator) {
    let host = gethostname::gethostname().to_string_lossy().to_string();
    println!("-- started at {} --\n", chrono::Local::now().format("%m/%d/%Y %H:%M:%S"));
    println!(
        "sai3-mdbench-{} was launched with {} total task(s) on host {}",
        env!("CARGO_PKG_VERSION"),
        comm.size(),
        host
    );
    println!("Command line used: {}", std::env::args().collect::<Vec<_>>().join(" "));
    info!("backend: {}", backend.name());

    let Some(first) = plan.config.paths.first() else { return };
    // The test path may not exist yet; fall back to its parent
    let probe: &Path = match backend.stat(first).await {
        Ok(_) => first,
        Err(_) => first.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new(".")),
    };
    match backend.statfs(probe).await {
        Ok(usage) => println!(
            "Path: {}\nFS: {:.1} GiB   Used FS: {:.1}%   Inodes: {:.1} Mi   Used Inodes: {:.1}%",
            probe.display(),
            usage.total_bytes as f64 / (1u64 << 30) as f64,
            usage.used_bytes_pct(),
            usage.total_inodes as f64 / (1u64 << 20) as f64,
            usage.used_inodes_pct()
        ),
        Err(e) => warn!("unable to stat file system {}: {:#}", probe.display(), e),
    }
    println!("\n{} tasks, {} items per task", comm.size(), plan.layout.items() * plan.layout.directory_loops());
}
