//! Process-wide caches of kernel libraries and pipelines.
//!
//! Both caches map a key to a value that is expensive to build (loading a
//! library artifact, preparing an entry point). They use papaya's lock-free
//! HashMap, so lookups of existing entries never block.
//!
//! # Construction
//!
//! Each key owns a [`OnceCell`]. The first caller for a key runs the
//! constructor; concurrent callers for the same key wait on the cell and
//! receive the same value, so at most one value is ever built per key. A
//! failed construction leaves the cell empty and the next caller retries.
//!
//! Entries live until [`KernelCache::clear`]: the key space is bounded by the
//! number of distinct libraries and entry points in use.

use std::fmt;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use forge_dtype::DeviceSpec;
use once_cell::sync::OnceCell;
use papaya::HashMap;
use snafu::ensure;

use crate::Result;
use crate::error::LibraryNotFoundSnafu;
use crate::kernel::{KernelLibrary, Pipeline};

/// Identity of a kernel library artifact on one device.
///
/// The path is canonical so that different spellings of one file share a
/// cache entry. Artifacts are immutable for the process lifetime, which makes
/// the path a stable proxy for the content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LibraryId {
    pub device: DeviceSpec,
    pub path: PathBuf,
}

impl LibraryId {
    /// Resolve `path` for `device`; fails if no file exists there.
    pub fn resolve(device: DeviceSpec, path: &Path) -> Result<Self> {
        let canonical = path.canonicalize().map_err(|_| LibraryNotFoundSnafu { path }.build())?;
        ensure!(canonical.is_file(), LibraryNotFoundSnafu { path });
        Ok(Self { device, path: canonical })
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path.display(), self.device)
    }
}

/// Concurrent map whose values are constructed at most once per key.
pub struct KernelCache<K, V> {
    entries: HashMap<K, Arc<OnceCell<V>>>,
    constructions: AtomicUsize,
}

impl<K, V> KernelCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self { entries: HashMap::new(), constructions: AtomicUsize::new(0) }
    }

    /// Get the value for `key`, constructing it with `init` if absent.
    pub fn get_or_try_init<E>(&self, key: K, init: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        let cell = {
            let entries = self.entries.pin();
            if let Some(cell) = entries.get(&key)
                && let Some(value) = cell.get()
            {
                return Ok(value.clone());
            }
            Arc::clone(entries.get_or_insert_with(key, || Arc::new(OnceCell::new())))
        };

        cell.get_or_try_init(|| {
            let value = init()?;
            self.constructions.fetch_add(1, Ordering::Relaxed);
            Ok(value)
        })
        .cloned()
    }

    /// Get the value for `key` if it has been constructed.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.pin().get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of successfully constructed values since creation.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::Relaxed)
    }

    /// Number of constructed entries.
    pub fn len(&self) -> usize {
        self.entries.pin().iter().filter(|(_, cell)| cell.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    ///
    /// Only for test isolation; values already handed out stay valid.
    pub fn clear(&self) {
        self.entries.pin().clear();
    }
}

impl<K, V> Default for KernelCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for KernelCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCache")
            .field("entries", &self.entries.len())
            .field("constructions", &self.constructions.load(Ordering::Relaxed))
            .finish()
    }
}

/// Loaded libraries by identity.
pub type LibraryCache = KernelCache<LibraryId, Arc<dyn KernelLibrary>>;

/// Pipelines by library identity and entry-point name.
pub type PipelineCache = KernelCache<(LibraryId, String), Arc<dyn Pipeline>>;
