//! # famkv
//!
//! An ordered key-value store over a shared, persistent, byte-addressable
//! memory region.
//!
//! ## Features
//!
//! - **Point operations**: put/get/delete on byte-string keys up to 40 bytes
//! - **Range scans**: lexicographic iteration with inclusive/exclusive and
//!   open bounds
//! - **Consistent DRAM caching**: every key lives in a node whose address
//!   never changes and whose value slot carries a version, so clients can
//!   cache `(key pointer, tagged value)` pairs and revalidate them with one
//!   cheap read
//! - **Heap-agnostic**: any allocator over a shared mapping can sit behind
//!   the [`GlobalHeap`] trait; the tree stores only global pointers
//!
//! ## Architecture
//!
//! The engine is a path-compressed radix tree ([`RadixTree`]) whose nodes
//! each occupy one heap allocation. [`FamKv`] is a thin facade that copies
//! fixed 8-byte values in and out of the tree's tagged slots and owns the
//! scan-handle table.
//!
//! ## Example
//!
//! ```rust
//! use famkv::{ArenaHeap, FamKv};
//!
//! let mut kv = FamKv::create(ArenaHeap::new()).unwrap();
//! kv.put(b"user:1001", &42u64.to_ne_bytes()).unwrap();
//! kv.put(b"user:1002", &43u64.to_ne_bytes()).unwrap();
//!
//! assert_eq!(kv.get(b"user:1001").unwrap(), Some(42u64.to_ne_bytes()));
//!
//! // Range scan
//! if let Some((handle, key, value)) = kv.scan(b"user:", true, b"user:\xff", false).unwrap() {
//!     println!("{:?} -> {:?}", key, value);
//!     while let Some((key, value)) = kv.get_next(handle).unwrap() {
//!         println!("{:?} -> {:?}", key, value);
//!     }
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod gptr;
pub mod heap;
mod metrics;
pub mod tree;

#[cfg(test)]
mod proptests;

pub use error::Error;
pub use gptr::{Gptr, TagGptr};
pub use heap::{ArenaHeap, GlobalHeap};
pub use metrics::{Metrics, MetricsSnapshot};
pub use tree::{
    Iter, LevelStats, RadixTree, TreeStructure, UpdateMode, MAX_KEY_LEN, OPEN_BOUNDARY_KEY,
};

use std::sync::Arc;

use parking_lot::Mutex;

/// Values are exactly this many bytes: one global pointer.
pub const VALUE_LEN: usize = 8;

/// Configuration for a [`FamKv`] store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scan handles reserved up front.
    pub scan_handle_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan_handle_capacity: 16,
        }
    }
}

/// Handle to an open range scan, valid until the store is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHandle(usize);

/// Ordered key-value store facade over a [`RadixTree`].
///
/// Values are opaque [`VALUE_LEN`]-byte blobs copied in and out of the
/// tree's 8-byte value slots. Write calls take `&mut self`: the engine is
/// single-writer and callers serialize mutation externally. Iterators are
/// owned by the store and addressed by [`ScanHandle`]; only handle
/// allocation takes the internal lock, advancement does not block other
/// readers.
pub struct FamKv<H: GlobalHeap> {
    tree: RadixTree<H>,
    iters: Mutex<Vec<Iter>>,
    metrics: Arc<Metrics>,
}

impl<H: GlobalHeap> FamKv<H> {
    /// Create a fresh store on `heap`.
    pub fn create(heap: H) -> Result<Self, Error> {
        Self::with_config(heap, Gptr::NULL, Config::default())
    }

    /// Attach to an existing store by the root pointer a previous
    /// [`root`](FamKv::root) call returned.
    pub fn attach(heap: H, root: Gptr) -> Self {
        let metrics = Arc::new(Metrics::default());
        FamKv {
            tree: RadixTree::attach(heap, root).with_metrics(Arc::clone(&metrics)),
            iters: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Create or attach with explicit configuration. A null `root` creates
    /// a new tree.
    pub fn with_config(heap: H, root: Gptr, config: Config) -> Result<Self, Error> {
        let metrics = Arc::new(Metrics::default());
        let tree = if root.is_null() {
            RadixTree::create(heap)?.with_metrics(Arc::clone(&metrics))
        } else {
            RadixTree::attach(heap, root).with_metrics(Arc::clone(&metrics))
        };
        Ok(FamKv {
            tree,
            iters: Mutex::new(Vec::with_capacity(config.scan_handle_capacity)),
            metrics,
        })
    }

    /// Root pointer identifying this store inside its heap.
    pub fn root(&self) -> Gptr {
        self.tree.root()
    }

    /// The underlying tree, for callers that need the full engine surface.
    pub fn tree(&self) -> &RadixTree<H> {
        &self.tree
    }

    /// Store `value` under `key`, overwriting any previous value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let value = value_to_gptr(value)?;
        self.tree.put(key, value, UpdateMode::Update)?;
        Ok(())
    }

    /// Copy out the value under `key`; `None` if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<[u8; VALUE_LEN]>, Error> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLong(key.len()));
        }
        let value = self.tree.get(key);
        Ok(value.is_valid().then(|| value.gptr.raw().to_ne_bytes()))
    }

    /// Delete `key`. Returns whether a value was actually removed.
    pub fn del(&mut self, key: &[u8]) -> Result<bool, Error> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLong(key.len()));
        }
        Ok(self.tree.destroy(key).is_valid())
    }

    /// Open a range scan. Returns the handle plus the first key and value,
    /// or `None` when no key is in range (no handle is consumed then).
    ///
    /// Bound semantics are those of [`RadixTree::scan`]: each side is a key
    /// plus an inclusive flag, and the byte `\0` with the flag cleared makes
    /// that side unbounded.
    #[allow(clippy::type_complexity)]
    pub fn scan(
        &self,
        begin_key: &[u8],
        begin_inclusive: bool,
        end_key: &[u8],
        end_inclusive: bool,
    ) -> Result<Option<(ScanHandle, Vec<u8>, [u8; VALUE_LEN])>, Error> {
        let Some(iter) = self
            .tree
            .scan(begin_key, begin_inclusive, end_key, end_inclusive)?
        else {
            return Ok(None);
        };
        let key = iter.key().to_vec();
        let value = iter.value().gptr.raw().to_ne_bytes();
        let mut iters = self.iters.lock();
        iters.push(iter);
        Ok(Some((ScanHandle(iters.len() - 1), key, value)))
    }

    /// Advance an open scan. Returns the next key and value, or `None` once
    /// the range is exhausted.
    #[allow(clippy::type_complexity)]
    pub fn get_next(
        &self,
        handle: ScanHandle,
    ) -> Result<Option<(Vec<u8>, [u8; VALUE_LEN])>, Error> {
        let mut iters = self.iters.lock();
        let iter = iters.get_mut(handle.0).ok_or(Error::BadHandle(handle.0))?;
        if !self.tree.get_next(iter) {
            return Ok(None);
        }
        Ok(Some((
            iter.key().to_vec(),
            iter.value().gptr.raw().to_ne_bytes(),
        )))
    }

    /// Store `value` under `key` and hand back the cache pair: the key-node
    /// pointer (always valid) and the newly published tagged value.
    pub fn put_cached(&mut self, key: &[u8], value: &[u8]) -> Result<(Gptr, TagGptr), Error> {
        let value = value_to_gptr(value)?;
        let (key_ptr, new, _old) = self.tree.put_cached(key, value)?;
        Ok((key_ptr, new))
    }

    /// Update a key directly by its cached node pointer, skipping descent.
    /// Returns the newly published tagged value.
    pub fn put_at(&mut self, key_ptr: Gptr, value: &[u8]) -> Result<TagGptr, Error> {
        let value = value_to_gptr(value)?;
        let (new, _old) = self.tree.put_at(key_ptr, value);
        Ok(new)
    }

    /// Look up `key` and hand back the cache pair plus the value bytes.
    /// The key pointer is null if no key node exists; the value is `None`
    /// if absent or deleted.
    #[allow(clippy::type_complexity)]
    pub fn get_cached(
        &self,
        key: &[u8],
    ) -> Result<(Gptr, TagGptr, Option<[u8; VALUE_LEN]>), Error> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLong(key.len()));
        }
        let (key_ptr, value) = self.tree.get_cached(key);
        let bytes = value.is_valid().then(|| value.gptr.raw().to_ne_bytes());
        Ok((key_ptr, value, bytes))
    }

    /// Revalidate a cached pair by node address. When the slot still equals
    /// `cached` and `refresh` is false, no value is copied out; otherwise
    /// the current tagged value and bytes come back.
    pub fn get_at(
        &self,
        key_ptr: Gptr,
        cached: TagGptr,
        refresh: bool,
    ) -> (TagGptr, Option<[u8; VALUE_LEN]>) {
        let current = self.tree.get_at(key_ptr);
        if current == cached && !refresh {
            return (current, None);
        }
        (
            current,
            current.is_valid().then(|| current.gptr.raw().to_ne_bytes()),
        )
    }

    /// Delete `key` and hand back the key-node pointer (null if the key
    /// never existed) and the resulting tombstone.
    pub fn del_cached(&mut self, key: &[u8]) -> Result<(Gptr, TagGptr), Error> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLong(key.len()));
        }
        let (key_ptr, new, _old) = self.tree.destroy_cached(key);
        Ok((key_ptr, new))
    }

    /// Delete directly by cached node pointer. Returns the resulting slot
    /// state.
    pub fn del_at(&mut self, key_ptr: Gptr) -> TagGptr {
        let (new, _old) = self.tree.destroy_at(key_ptr);
        new
    }

    /// Run deferred heap reclamation.
    pub fn maintenance(&self) {
        self.tree.heap().offline_free();
    }

    /// Log the operation counters.
    pub fn report_metrics(&self) {
        self.metrics.report();
    }

    /// Operation counters for this store.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

fn value_to_gptr(value: &[u8]) -> Result<Gptr, Error> {
    let bytes: [u8; VALUE_LEN] = value
        .try_into()
        .map_err(|_| Error::ValueSize(value.len()))?;
    Ok(Gptr::from_raw(u64::from_ne_bytes(bytes)))
}
