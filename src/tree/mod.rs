//! Path-compressed radix tree over a global-memory heap.
//!
//! Keys are raw byte strings up to [`MAX_KEY_LEN`] bytes; values are opaque
//! 8-byte global pointers stored in per-node tagged slots. The tree lives
//! entirely in heap allocations linked by [`Gptr`]s, so any process attached
//! to the same heap can reopen it from the root pointer alone.
//!
//! Writers must be externally serialized. Deleting a key tombstones its
//! value slot but never frees the node, so an address handed out by one of
//! the cached operations stays valid for the life of the tree and the slot's
//! version history lets clients detect delete/reinsert cycles.

mod debug;
mod iter;
mod node;

pub use debug::{LevelStats, TreeStructure};
pub use iter::{Iter, OPEN_BOUNDARY_KEY};
pub use node::MAX_KEY_LEN;

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::gptr::{Gptr, TagGptr};
use crate::heap::GlobalHeap;
use crate::metrics::Metrics;
use node::{Node, NODE_SIZE};

/// Heap allocation is retried this many times before an operation fails
/// with [`Error::OutOfSpace`]; the heap may report false negatives under
/// contention.
pub const ALLOC_RETRY_CNT: usize = 1000;

/// Write behavior of [`RadixTree::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Insert if absent; leave an existing valid value untouched.
    FindOrCreate,
    /// Insert or overwrite unconditionally.
    Update,
}

/// Ordered key→value index rooted at a single heap allocation.
pub struct RadixTree<H: GlobalHeap> {
    heap: H,
    root: Gptr,
    metrics: Arc<Metrics>,
}

impl<H: GlobalHeap> RadixTree<H> {
    /// Create a fresh tree: allocates the root node (empty prefix, no value,
    /// no children). The root pointer is the tree's identity.
    pub fn create(heap: H) -> Result<Self, Error> {
        let mut tree = RadixTree {
            heap,
            root: Gptr::NULL,
            metrics: Arc::new(Metrics::default()),
        };
        tree.root = tree.alloc_node(b"")?;
        debug!(root = tree.root.raw(), "created radix tree");
        Ok(tree)
    }

    /// Attach to an existing tree by its root pointer. The structure is not
    /// touched or validated.
    pub fn attach(heap: H, root: Gptr) -> Self {
        debug_assert!(root.is_valid());
        debug!(root = root.raw(), "attached radix tree");
        RadixTree {
            heap,
            root,
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Replace the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Root pointer; the only handle needed to reattach.
    pub fn root(&self) -> Gptr {
        self.root
    }

    /// The heap this tree allocates from.
    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// Counters for this tree.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Current tagged value for `key`. Null with version 0 when no key node
    /// exists; a tombstone when the node exists but the key was deleted.
    pub fn get(&self, key: &[u8]) -> TagGptr {
        Metrics::bump(&self.metrics.gets);
        match self.find_node(key) {
            Some(gptr) => self.node(gptr).value(),
            None => TagGptr::null(),
        }
    }

    /// Insert or update `key`, returning the pre-existing tagged value:
    /// null+0 if the key node did not exist, a tombstone if it existed with
    /// no value, the old value otherwise.
    pub fn put(&mut self, key: &[u8], value: Gptr, mode: UpdateMode) -> Result<TagGptr, Error> {
        let (_, old) = self.put_inner(key, value, mode)?;
        Ok(old)
    }

    /// Tombstone `key`'s value slot, returning the captured value. The slot
    /// version is bumped only when a valid value was actually removed; a
    /// tombstone is returned unchanged and an absent key yields null+0.
    /// Node storage is never freed.
    pub fn destroy(&mut self, key: &[u8]) -> TagGptr {
        let (_, old) = self.destroy_inner(key);
        old
    }

    /// [`put`](RadixTree::put) in Update mode, additionally exposing the
    /// key-node pointer and the newly published tagged value for caching:
    /// `(key_ptr, new_value, old_value)`. The key pointer is always valid.
    pub fn put_cached(&mut self, key: &[u8], value: Gptr) -> Result<(Gptr, TagGptr, TagGptr), Error> {
        let (key_ptr, old) = self.put_inner(key, value, UpdateMode::Update)?;
        let new = self.node(key_ptr).value();
        Ok((key_ptr, new, old))
    }

    /// Update the value slot of a key node directly by address, skipping
    /// descent. Returns `(new_value, old_value)`.
    ///
    /// `key_ptr` must be a key-node pointer previously returned by a cached
    /// operation on a tree over the same heap.
    pub fn put_at(&mut self, key_ptr: Gptr, value: Gptr) -> (TagGptr, TagGptr) {
        let node = self.node(key_ptr);
        let old = node.value();
        let new = TagGptr {
            gptr: value,
            version: old.version + 1,
        };
        node.publish_value(new);
        Metrics::bump(&self.metrics.puts);
        (new, old)
    }

    /// Key-node pointer and current tagged value for `key`. `(null, null+0)`
    /// when no key node exists; `(key_ptr, tombstone)` when the node exists
    /// but holds no value.
    pub fn get_cached(&self, key: &[u8]) -> (Gptr, TagGptr) {
        Metrics::bump(&self.metrics.gets);
        match self.find_node(key) {
            Some(gptr) => (gptr, self.node(gptr).value()),
            None => (Gptr::NULL, TagGptr::null()),
        }
    }

    /// Cheap re-read of a value slot by key-node address; the revalidation
    /// step of the caching protocol. Any difference from the cached tagged
    /// value, pointer or version, means the slot has moved through at least
    /// one transition.
    pub fn get_at(&self, key_ptr: Gptr) -> TagGptr {
        Metrics::bump(&self.metrics.gets);
        self.node(key_ptr).value()
    }

    /// [`destroy`](RadixTree::destroy) additionally exposing the key-node
    /// pointer and the resulting slot state: `(key_ptr, new_value, old_value)`.
    /// The key pointer is null if the key node never existed.
    pub fn destroy_cached(&mut self, key: &[u8]) -> (Gptr, TagGptr, TagGptr) {
        let (key_ptr, old) = self.destroy_inner(key);
        if key_ptr.is_valid() {
            let new = self.node(key_ptr).value();
            (key_ptr, new, old)
        } else {
            (Gptr::NULL, TagGptr::null(), old)
        }
    }

    /// Tombstone a value slot directly by key-node address. Returns
    /// `(new_value, old_value)`.
    pub fn destroy_at(&mut self, key_ptr: Gptr) -> (TagGptr, TagGptr) {
        let node = self.node(key_ptr);
        let old = node.value();
        if old.is_valid() {
            let new = TagGptr {
                gptr: Gptr::NULL,
                version: old.version + 1,
            };
            node.publish_value(new);
            Metrics::bump(&self.metrics.deletes);
            (new, old)
        } else {
            (old, old)
        }
    }

    /// Invoke `f(key, value_gptr)` for every valid key in lexicographic
    /// order. Tombstoned nodes are traversed but not reported.
    pub fn list<F: FnMut(&[u8], Gptr)>(&self, mut f: F) {
        let mut key = Vec::with_capacity(MAX_KEY_LEN);
        self.list_rec(self.root, &mut key, &mut f);
    }

    fn list_rec<F: FnMut(&[u8], Gptr)>(&self, gptr: Gptr, key: &mut Vec<u8>, f: &mut F) {
        let node = self.node(gptr);
        key.extend_from_slice(node.prefix());
        let value = node.value();
        if value.is_valid() {
            f(key, value.gptr);
        }
        for (byte, child) in node.children() {
            key.push(byte);
            self.list_rec(child, key, f);
            key.pop();
        }
        key.truncate(key.len() - node.prefix_len());
    }

    // ------------------------------------------------------------------
    // Descent and mutation internals
    // ------------------------------------------------------------------

    /// Resolve a gptr into a node reference.
    ///
    /// All gptrs reachable from the root stay valid for the life of the
    /// tree (nodes are tombstoned, never freed), so the only way to violate
    /// this is handing in a foreign pointer.
    fn node(&self, gptr: Gptr) -> &Node {
        debug_assert!(gptr.is_valid());
        unsafe { &*(self.heap.to_local(gptr) as *const Node) }
    }

    fn node_ptr(&self, gptr: Gptr) -> *mut Node {
        self.heap.to_local(gptr) as *mut Node
    }

    /// Walk the tree to the key node for `key`, if it exists.
    fn find_node(&self, key: &[u8]) -> Option<Gptr> {
        if key.len() > MAX_KEY_LEN {
            return None;
        }
        let mut cur = self.root;
        let mut consumed = 0;
        loop {
            let node = self.node(cur);
            let prefix = node.prefix();
            let rest = &key[consumed..];
            if rest.len() < prefix.len() || &rest[..prefix.len()] != prefix {
                return None;
            }
            consumed += prefix.len();
            if consumed == key.len() {
                return Some(cur);
            }
            let child = node.child(key[consumed]);
            if child.is_null() {
                return None;
            }
            cur = child;
            consumed += 1;
        }
    }

    fn put_inner(
        &mut self,
        key: &[u8],
        value: Gptr,
        mode: UpdateMode,
    ) -> Result<(Gptr, TagGptr), Error> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLong(key.len()));
        }
        let mut parent = Gptr::NULL;
        let mut parent_byte = 0u8;
        let mut cur = self.root;
        let mut consumed = 0;
        loop {
            let node = self.node(cur);
            let prefix = node.prefix();
            let rest = &key[consumed..];
            let matched = common_len(prefix, rest);

            if matched < prefix.len() {
                // Compressed path diverges from the key inside this node:
                // split it. The root has an empty prefix and never splits,
                // so a parent link exists here.
                return self.split_insert(parent, parent_byte, cur, consumed, matched, key, value);
            }
            consumed += prefix.len();

            if consumed == key.len() {
                let old = node.value();
                let overwrite = match mode {
                    UpdateMode::Update => true,
                    UpdateMode::FindOrCreate => !old.is_valid(),
                };
                if overwrite {
                    node.publish_value(TagGptr {
                        gptr: value,
                        version: old.version + 1,
                    });
                    Metrics::bump(&self.metrics.puts);
                }
                return Ok((cur, old));
            }

            let byte = key[consumed];
            let child = node.child(byte);
            if child.is_null() {
                // Splice a new leaf under this node. The child-entry store
                // is the publication point.
                let leaf = self.alloc_node(&key[consumed + 1..])?;
                self.node(leaf).publish_value(TagGptr {
                    gptr: value,
                    version: 1,
                });
                self.node(cur).set_child(byte, leaf);
                Metrics::bump(&self.metrics.puts);
                return Ok((leaf, TagGptr::null()));
            }
            parent = cur;
            parent_byte = byte;
            cur = child;
            consumed += 1;
        }
    }

    /// Split `cur` at prefix offset `matched` and insert `key`.
    ///
    /// A new parent takes over `prefix[..matched]`; `cur` is reparented
    /// under it with the remainder of its prefix. The new key lands either
    /// in the new parent's own value slot (when it ends at the split point)
    /// or in a fresh leaf beside `cur`. All allocation happens before any
    /// visible mutation, and the old parent's child entry is rewritten last,
    /// so a failed allocation leaves the tree untouched.
    #[allow(clippy::too_many_arguments)]
    fn split_insert(
        &mut self,
        parent: Gptr,
        parent_byte: u8,
        cur: Gptr,
        consumed: usize,
        matched: usize,
        key: &[u8],
        value: Gptr,
    ) -> Result<(Gptr, TagGptr), Error> {
        debug_assert!(parent.is_valid());
        let mut buf = [0u8; MAX_KEY_LEN];
        let old_prefix = {
            let prefix = self.node(cur).prefix();
            buf[..prefix.len()].copy_from_slice(prefix);
            &buf[..prefix.len()]
        };
        let reparent_byte = old_prefix[matched];

        let split = self.alloc_node(&old_prefix[..matched])?;
        let key_ends_here = consumed + matched == key.len();
        let key_node = if key_ends_here {
            self.node(split).publish_value(TagGptr {
                gptr: value,
                version: 1,
            });
            split
        } else {
            let leaf = match self.alloc_node(&key[consumed + matched + 1..]) {
                Ok(leaf) => leaf,
                Err(e) => {
                    // Roll back: the split node is unreachable, release it.
                    self.heap.free(split);
                    return Err(e);
                }
            };
            self.node(leaf).publish_value(TagGptr {
                gptr: value,
                version: 1,
            });
            self.node(split).set_child(key[consumed + matched], leaf);
            leaf
        };

        // Hang the shortened survivor under the split node, then publish
        // the split node in the old parent's child table.
        unsafe { Node::set_prefix(self.node_ptr(cur), &old_prefix[matched + 1..]) };
        self.node(split).set_child(reparent_byte, cur);
        self.node(parent).set_child(parent_byte, split);

        trace!(
            at = consumed + matched,
            key_len = key.len(),
            "split node on prefix mismatch"
        );
        Metrics::bump(&self.metrics.splits);
        Metrics::bump(&self.metrics.puts);
        Ok((key_node, TagGptr::null()))
    }

    fn destroy_inner(&mut self, key: &[u8]) -> (Gptr, TagGptr) {
        match self.find_node(key) {
            Some(gptr) => {
                let node = self.node(gptr);
                let old = node.value();
                if old.is_valid() {
                    node.publish_value(TagGptr {
                        gptr: Gptr::NULL,
                        version: old.version + 1,
                    });
                    Metrics::bump(&self.metrics.deletes);
                }
                (gptr, old)
            }
            None => (Gptr::NULL, TagGptr::null()),
        }
    }

    /// Allocate and initialize one node, retrying transient heap failures.
    fn alloc_node(&self, prefix: &[u8]) -> Result<Gptr, Error> {
        for attempt in 0..ALLOC_RETRY_CNT {
            if let Some(gptr) = self.heap.alloc(NODE_SIZE) {
                if attempt > 0 {
                    Metrics::add(&self.metrics.alloc_retries, attempt as u64);
                }
                unsafe { Node::init(self.node_ptr(gptr), prefix) };
                Metrics::bump(&self.metrics.nodes_allocated);
                return Ok(gptr);
            }
        }
        warn!(size = NODE_SIZE, retries = ALLOC_RETRY_CNT, "node allocation exhausted retries");
        Err(Error::OutOfSpace)
    }
}

#[inline]
fn common_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
