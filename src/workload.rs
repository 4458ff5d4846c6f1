// src/workload.rs
//
// Workload engine: runs one metadata operation over the items of a tree
//
// Items are addressed by position: position g of a walk is item number
// `g + leaf_offset`, which lives in directory `n / items_per_dir`. Create and
// remove walk positions `[items_start, target_items)` in ascending order and
// consult the stonewall after every item; stat, read and rename walk the
// effective item count, sequentially or in a seeded random order.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use crate::comm::Communicator;
use crate::config::RunPlan;
use crate::constants::{PROGRESS_LOG_INTERVAL, READ_POISON_BYTE, RENAME_SUFFIX};
use crate::directory_tree::{item_name, owner_tag, tree_base_name, ItemKind, TreeRoot};
use crate::metadata_ops::{Backend, FileHandle, OpenMode, Xfer};
use crate::metrics::OpLatency;
use crate::payload;
use crate::phases::Phase;
use crate::stonewall::StonewallProgress;
use crate::summary::OpSlot;

/// Where the items of one walk live and how they are named
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemTarget {
    pub tree: TreeRoot,
    pub tag: String,
}

impl ItemTarget {
    /// Items owned by rank `owner` under the test directory `testdir`
    pub fn for_owner(plan: &RunPlan, testdir: &Path, owner: usize) -> Self {
        let cfg = &plan.config;
        Self {
            tree: TreeRoot::new(testdir, tree_base_name(cfg.unique_dir_per_task, owner)),
            tag: owner_tag(cfg.shared_file, owner),
        }
    }
}

/// How a file item comes into existence during a create walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCreate {
    /// Create (or mknod) and write the payload
    Create,
    /// Create and close without payload (collective pass on rank 0)
    Touch,
    /// Open a file created by the collective pass and write the payload
    OpenExisting,
}

/// Parent directory of the last item, reused while consecutive items share it
#[derive(Debug, Default)]
struct DirCache {
    ordinal: Option<u64>,
    path: PathBuf,
}

/// Per-rank executor of item operations
pub struct Engine<'a> {
    plan: &'a RunPlan,
    backend: &'a dyn Backend,
    comm: &'a dyn Communicator,
    write_buf: Vec<u8>,
    check_buf: Vec<u8>,
    read_buf: Vec<u8>,
    effective_items: u64,
    random_seed: Option<u64>,
    order: Vec<u64>,
    verification_errors: u64,
    latency: OpLatency,
}

impl<'a> Engine<'a> {
    pub fn new(plan: &'a RunPlan, backend: &'a dyn Backend, comm: &'a dyn Communicator) -> Self {
        let cfg = &plan.config;
        let check_len = if cfg.verify_write { cfg.write_bytes as usize } else { 0 };
        Self {
            plan,
            backend,
            comm,
            write_buf: payload::pattern(cfg.write_bytes as usize),
            check_buf: vec![0u8; check_len],
            read_buf: vec![0u8; cfg.read_bytes as usize],
            effective_items: plan.layout.items(),
            random_seed: None,
            order: Vec::new(),
            verification_errors: 0,
            latency: OpLatency::disabled(),
        }
    }

    /// Record per-operation latency into `latency`
    pub fn with_latency(mut self, latency: OpLatency) -> Self {
        self.latency = latency;
        self
    }

    /// Visit stat/read/rename items in a random order seeded with `seed`
    pub fn with_random_order(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn plan(&self) -> &RunPlan {
        self.plan
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm
    }

    /// Items per rank that stat/read/rename/remove work on in one loop
    pub fn effective_items(&self) -> u64 {
        self.effective_items
    }

    pub fn set_effective_items(&mut self, items: u64) {
        self.effective_items = items;
    }

    /// Data verification errors seen by this rank
    pub fn verification_errors(&self) -> u64 {
        self.verification_errors
    }

    pub fn latency(&self) -> &OpLatency {
        &self.latency
    }

    fn item_path(&self, cache: &mut DirCache, target: &ItemTarget, kind: ItemKind, n: u64) -> PathBuf {
        let layout = &self.plan.layout;
        let ordinal = layout.owning_dir(n);
        if cache.ordinal != Some(ordinal) {
            cache.path = target.tree.dir_path(layout.shape(), ordinal);
            cache.ordinal = Some(ordinal);
        }
        cache.path.join(item_name(kind, &target.tag, n))
    }

    /// Positions visited by stat/read/rename
    fn access_order(&mut self) -> Vec<u64> {
        let items = self.effective_items;
        match self.random_seed {
            None => (0..items).collect(),
            Some(seed) => {
                if self.order.len() as u64 != items {
                    let mut order: Vec<u64> = (0..items).collect();
                    let mut rng = StdRng::seed_from_u64(seed);
                    order.shuffle(&mut rng);
                    self.order = order;
                }
                self.order.clone()
            }
        }
    }

    /// Create or remove the items `[progress.items_start, progress.target_items)`.
    /// Stops early when the stonewall trips; `progress.items_done` then holds
    /// the cutoff.
    pub async fn create_remove(
        &mut self,
        kind: ItemKind,
        create: bool,
        target: &ItemTarget,
        progress: &mut StonewallProgress,
        file_mode: FileCreate,
    ) -> Result<()> {
        let phase = if create { Phase::Create } else { Phase::Remove };
        let slot = OpSlot::of(kind, phase);
        let mut cache = DirCache::default();
        debug!(
            "{} {}s [{}, {}) in {}",
            if create { "create" } else { "remove" },
            kind,
            progress.items_start,
            progress.target_items,
            target.tree.path().display()
        );

        for position in progress.items_start..progress.target_items {
            let n = self.plan.layout.item_number(position);
            let path = self.item_path(&mut cache, target, kind, n);
            if position % PROGRESS_LOG_INTERVAL == 0 && position != 0 {
                debug!("{} {}: {}", phase.name(), kind, position);
            }
            trace!("{} {}: {}", phase.name(), kind, path.display());

            let t0 = self.latency.start();
            match (kind, create) {
                (ItemKind::Dir, true) => self.backend.mkdir(&path).await?,
                (ItemKind::Dir, false) => self.backend.rmdir(&path).await?,
                (ItemKind::File, true) => self.create_file(&path, n, file_mode).await?,
                (ItemKind::File, false) => self.remove_file(&path).await?,
            }
            self.latency.finish(slot, t0);

            if progress.check(position) {
                return Ok(());
            }
        }
        progress.finish(progress.target_items);
        Ok(())
    }

    async fn create_file(&mut self, path: &Path, n: u64, mode: FileCreate) -> Result<()> {
        let handle = match mode {
            FileCreate::Create if self.plan.config.make_node => {
                return self.backend.mknod(path).await;
            }
            FileCreate::Create | FileCreate::Touch => self.backend.create(path).await?,
            FileCreate::OpenExisting => self.backend.open(path, OpenMode::Write).await?,
        };
        if mode == FileCreate::Touch {
            return handle.close().await;
        }
        let handle = self.write_payload(handle, path, n).await?;
        handle.close().await
    }

    async fn write_payload(
        &mut self,
        mut handle: Box<dyn FileHandle>,
        path: &Path,
        n: u64,
    ) -> Result<Box<dyn FileHandle>> {
        if self.write_buf.is_empty() {
            return Ok(handle);
        }
        payload::stamp(&mut self.write_buf, n);
        let written = handle.xfer(Xfer::Write(&self.write_buf), 0).await?;
        if written != self.write_buf.len() {
            bail!("unable to write file {}: {} of {} bytes", path.display(), written, self.write_buf.len());
        }
        if self.plan.config.sync_file {
            handle.fsync().await?;
        }
        if self.plan.config.verify_write {
            self.check_buf[0] = READ_POISON_BYTE;
            let read = handle.xfer(Xfer::Read(&mut self.check_buf), 0).await?;
            if read != self.check_buf.len() {
                bail!("unable to verify write (read/back) file {}", path.display());
            }
            let errors = payload::verify(&self.check_buf, n);
            if errors > 0 {
                debug!("write verification of {} found {} errors", path.display(), errors);
            }
            self.verification_errors += errors;
        }
        Ok(handle)
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        if !self.plan.config.shared_file {
            return self.backend.delete(path).await;
        }
        // Shared files: rank 0 removes, a failure is not fatal
        if self.comm.rank() == 0 {
            if let Err(e) = self.backend.delete(path).await {
                warn!("unable to remove shared file {}: {:#}", path.display(), e);
            }
        }
        Ok(())
    }

    /// Rank 0 creates or removes `items` items of every rank. Files are only
    /// created empty here; each rank writes its payload afterwards. Not
    /// subject to the stonewall.
    pub async fn collective(&mut self, kind: ItemKind, create: bool, testdir: &Path, items: u64) -> Result<()> {
        let plan = self.plan;
        let phase = if create { Phase::Create } else { Phase::Remove };
        let size = self.comm.size();
        for rank in 0..size {
            let owner = phase.owner(rank, plan.config.nstride as usize, size);
            let target = ItemTarget::for_owner(plan, testdir, owner);
            let mut progress = StonewallProgress::new(items);
            self.create_remove(kind, create, &target, &mut progress, FileCreate::Touch)
                .await?;
        }
        Ok(())
    }

    /// Stat every item
    pub async fn stat(&mut self, kind: ItemKind, target: &ItemTarget) -> Result<()> {
        let slot = OpSlot::of(kind, Phase::Stat);
        let mut cache = DirCache::default();
        for (i, position) in self.access_order().into_iter().enumerate() {
            let n = self.plan.layout.item_number(position);
            let path = self.item_path(&mut cache, target, kind, n);
            if i as u64 % PROGRESS_LOG_INTERVAL == 0 && i != 0 {
                debug!("stat {}: {}", kind, i);
            }
            trace!("stat {}: {}", kind, path.display());
            let t0 = self.latency.start();
            let info = self.backend.stat(&path).await?;
            self.latency.finish(slot, t0);
            if info.is_dir != (kind == ItemKind::Dir) {
                bail!("unable to stat {} {}: wrong type", kind, path.display());
            }
        }
        Ok(())
    }

    /// Open every file, read its payload and check it
    pub async fn read(&mut self, target: &ItemTarget) -> Result<()> {
        let slot = OpSlot::FileRead;
        let verify = self.plan.config.verify_read;
        let mut cache = DirCache::default();
        for (i, position) in self.access_order().into_iter().enumerate() {
            let n = self.plan.layout.item_number(position);
            let path = self.item_path(&mut cache, target, ItemKind::File, n);
            if i as u64 % PROGRESS_LOG_INTERVAL == 0 && i != 0 {
                debug!("read file: {}", i);
            }
            trace!("read file: {}", path.display());

            let t0 = self.latency.start();
            let mut handle = self.backend.open(&path, OpenMode::Read).await?;
            if !self.read_buf.is_empty() {
                self.read_buf[0] = READ_POISON_BYTE;
                let read = handle.xfer(Xfer::Read(&mut self.read_buf), 0).await?;
                if read != self.read_buf.len() {
                    bail!("unable to read file {}: {} of {} bytes", path.display(), read, self.read_buf.len());
                }
                if verify {
                    self.verification_errors += payload::verify(&self.read_buf, n);
                } else if !payload::header_matches(&self.read_buf, n) {
                    self.verification_errors += 1;
                }
            }
            handle.close().await?;
            self.latency.finish(slot, t0);
        }
        Ok(())
    }

    /// Rename every item to `<name>_new` and straight back
    pub async fn rename(&mut self, kind: ItemKind, target: &ItemTarget) -> Result<()> {
        let slot = OpSlot::of(kind, Phase::Rename);
        let mut cache = DirCache::default();
        for (i, position) in self.access_order().into_iter().enumerate() {
            let n = self.plan.layout.item_number(position);
            let path = self.item_path(&mut cache, target, kind, n);
            let mut renamed = path.clone().into_os_string();
            renamed.push(RENAME_SUFFIX);
            let renamed = PathBuf::from(renamed);
            if i as u64 % PROGRESS_LOG_INTERVAL == 0 && i != 0 {
                debug!("rename {}: {}", kind, i);
            }
            trace!("rename {}: {}", kind, path.display());

            let t0 = self.latency.start();
            self.backend.rename(&path, &renamed).await?;
            self.backend.rename(&renamed, &path).await?;
            self.latency.finish(slot, t0);
        }
        Ok(())
    }
}
