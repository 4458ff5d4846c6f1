// src/directory_tree.rs
//! Directory tree addressing for deterministic metadata workloads.
//!
//! Every directory of the synthetic tree is identified by an ordinal:
//! - ordinal 0 is the tree root, `<base>.0`
//! - the children of ordinal `k` are `k*b+1 ..= k*b+b` (b = branch factor)
//! - directory `k > 0` is named `<base>.k` and nested under its parent chain
//!
//! Items (files or directories) carry a global index `n`; the item lives in
//! directory `n / items_per_dir`. Both tree construction and item lookup go
//! through the same functions, so any path can be rebuilt from its index.

use anyhow::{bail, Context, Result};
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::config::RunConfig;
use crate::constants::{DIR_ITEM_PREFIX, FILE_ITEM_PREFIX, OWNER_TAG_PREFIX, SHARED_OWNER_TAG, TREE_BASE_NAME};

/// Kind of item an operation works on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Dir,
    File,
}

impl ItemKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ItemKind::Dir => DIR_ITEM_PREFIX,
            ItemKind::File => FILE_ITEM_PREFIX,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Dir => write!(f, "directory"),
            ItemKind::File => write!(f, "file"),
        }
    }
}

/// Shape of the directory tree: branch factor and depth plus the directory
/// counts derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    branch_factor: u64,
    depth: u32,
    num_dirs: u64,
    leaf_dirs: u64,
}

impl TreeShape {
    pub fn new(branch_factor: u32, depth: u32) -> Result<Self> {
        let b = branch_factor as u64;
        if b == 0 && depth > 0 {
            bail!("branch factor must be at least 1 when depth is {}", depth);
        }

        let num_dirs = if depth == 0 {
            1
        } else if b == 1 {
            depth as u64 + 1
        } else {
            let full = b
                .checked_pow(depth + 1)
                .with_context(|| format!("tree too large: {}^{} overflows", b, depth + 1))?;
            (full - 1) / (b - 1)
        };

        let leaf_dirs = if depth == 0 {
            1
        } else {
            b.checked_pow(depth)
                .with_context(|| format!("tree too large: {}^{} overflows", b, depth))?
        };

        Ok(Self { branch_factor: b, depth, num_dirs, leaf_dirs })
    }

    pub fn branch_factor(&self) -> u64 {
        self.branch_factor
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Total number of directories including the root
    pub fn num_dirs(&self) -> u64 {
        self.num_dirs
    }

    /// Number of directories at maximum depth
    pub fn leaf_dirs(&self) -> u64 {
        self.leaf_dirs
    }

    /// Ordinal of the first directory at maximum depth
    pub fn first_leaf(&self) -> u64 {
        self.num_dirs - self.leaf_dirs
    }

    /// Parent ordinal; `None` for the root
    pub fn parent(&self, ordinal: u64) -> Option<u64> {
        if ordinal == 0 {
            return None;
        }
        // (k-1)/b reduces to k-1 when b == 1
        Some((ordinal - 1) / self.branch_factor.max(1))
    }

    /// Chain of non-root ancestors from the top level down to `ordinal`
    /// itself. Empty for the root.
    pub fn ancestry(&self, ordinal: u64) -> Vec<u64> {
        let mut chain = Vec::with_capacity(self.depth as usize);
        let mut current = ordinal;
        while current != 0 {
            chain.push(current);
            current = self.parent(current).unwrap_or(0);
        }
        chain.reverse();
        chain
    }

    /// Level of a directory: 0 for the root
    pub fn level_of(&self, ordinal: u64) -> u32 {
        self.ancestry(ordinal).len() as u32
    }

    /// Ordinals of the direct children of `ordinal`
    pub fn children(&self, ordinal: u64) -> Range<u64> {
        if self.level_of(ordinal) >= self.depth {
            return 0..0;
        }
        let first = ordinal * self.branch_factor + 1;
        first..first + self.branch_factor
    }

    /// All directory ordinals in creation order: a parent always precedes
    /// its children. Reverse the range for teardown.
    pub fn ordinals(&self) -> Range<u64> {
        0..self.num_dirs
    }
}

/// A concrete directory tree on disk: the root directory path plus the base
/// name that nested directories share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRoot {
    base: String,
    path: PathBuf,
}

impl TreeRoot {
    /// Tree rooted at `<parent>/<base>.0`
    pub fn new(parent: &Path, base: impl Into<String>) -> Self {
        let base = base.into();
        let path = parent.join(format!("{}.0", base));
        Self { base, path }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Path of the root directory (ordinal 0)
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full path of directory `ordinal`
    pub fn dir_path(&self, shape: &TreeShape, ordinal: u64) -> PathBuf {
        let mut path = self.path.clone();
        for ancestor in shape.ancestry(ordinal) {
            path.push(format!("{}.{}", self.base, ancestor));
        }
        path
    }
}

/// Base name of the tree owned by `owner`
pub fn tree_base_name(unique_dir_per_task: bool, owner: usize) -> String {
    if unique_dir_per_task {
        format!("{}.{}", TREE_BASE_NAME, owner)
    } else {
        TREE_BASE_NAME.to_string()
    }
}

/// Tag embedded in item names so items of different ranks never collide
pub fn owner_tag(shared_file: bool, owner: usize) -> String {
    if shared_file {
        SHARED_OWNER_TAG.to_string()
    } else {
        format!("{}.{}.", OWNER_TAG_PREFIX, owner)
    }
}

/// Name of item `n`: `<kind>.<tag><n>`
pub fn item_name(kind: ItemKind, tag: &str, n: u64) -> String {
    format!("{}.{}{}", kind.prefix(), tag, n)
}

/// How items are distributed over the tree, derived once per run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLayout {
    shape: TreeShape,
    items_per_dir: u64,
    items: u64,
    directory_loops: u64,
    leaf_only: bool,
}

impl TreeLayout {
    /// Derive the layout from a configuration.
    ///
    /// - only `items_per_dir` given: every directory holding items gets that
    ///   many, `items` is the product
    /// - only `items` given: split evenly, remainder dropped
    /// - both given: `items / items_per_dir` separate test directories
    ///   ("directory loops"), each with a full tree
    pub fn derive(cfg: &RunConfig) -> Result<Self> {
        if cfg.depth < 0 {
            bail!("depth must be greater than or equal to zero (got {})", cfg.depth);
        }
        let shape = TreeShape::new(cfg.branch_factor, cfg.depth as u32)?;
        let item_dirs = if cfg.leaf_only { shape.leaf_dirs() } else { shape.num_dirs() };

        let (items_per_dir, directory_loops) = if cfg.items_per_dir > 0 {
            let loops = if cfg.items > 0 && !cfg.unique_dir_per_task {
                cfg.items / cfg.items_per_dir
            } else {
                1
            };
            (cfg.items_per_dir, loops)
        } else {
            (cfg.items / item_dirs, 1)
        };

        let items = items_per_dir
            .checked_mul(item_dirs)
            .context("item count overflows")?;

        Ok(Self {
            shape,
            items_per_dir,
            items,
            directory_loops,
            leaf_only: cfg.leaf_only,
        })
    }

    pub fn shape(&self) -> &TreeShape {
        &self.shape
    }

    pub fn items_per_dir(&self) -> u64 {
        self.items_per_dir
    }

    /// Items per rank in one directory loop
    pub fn items(&self) -> u64 {
        self.items
    }

    pub fn directory_loops(&self) -> u64 {
        self.directory_loops
    }

    pub fn leaf_only(&self) -> bool {
        self.leaf_only
    }

    /// Number of directories that hold items
    pub fn dirs_with_items(&self) -> u64 {
        if self.leaf_only {
            self.shape.leaf_dirs()
        } else {
            self.shape.num_dirs()
        }
    }

    /// Shift applied to item numbers so that leaf-only items land in leaves
    pub fn leaf_offset(&self) -> u64 {
        if self.leaf_only {
            self.items_per_dir * self.shape.first_leaf()
        } else {
            0
        }
    }

    /// Item number of the `position`-th item of a phase
    pub fn item_number(&self, position: u64) -> u64 {
        position + self.leaf_offset()
    }

    /// Directory ordinal that holds item `n`
    pub fn owning_dir(&self, n: u64) -> u64 {
        if self.items_per_dir == 0 {
            0
        } else {
            n / self.items_per_dir
        }
    }

    /// Full path of item `n` in `tree`
    pub fn item_path(&self, tree: &TreeRoot, kind: ItemKind, tag: &str, n: u64) -> PathBuf {
        let mut path = tree.dir_path(&self.shape, self.owning_dir(n));
        path.push(item_name(kind, tag, n));
        path
    }
}
