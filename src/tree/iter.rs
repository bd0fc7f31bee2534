//! Resumable in-order iteration and range scans.
//!
//! An [`Iter`] owns no borrow of the tree, so a facade can park it in a
//! handle table and advance it call by call. It carries the original range,
//! the current node, a cursor into that node (`next_pos`), the surfaced key
//! and value, and the root-to-cursor ancestor stack.
//!
//! An *open* boundary (±infinity) is encoded as the single byte `\0` with
//! the inclusive flag cleared; `\0` with the flag set is the literal
//! one-byte key. A scan from open to open therefore visits every key.

use crate::gptr::{Gptr, TagGptr};
use crate::heap::GlobalHeap;
use crate::metrics::Metrics;
use crate::tree::node::FANOUT;
use crate::tree::{RadixTree, MAX_KEY_LEN};
use crate::Error;

/// The open-boundary sentinel key.
pub const OPEN_BOUNDARY_KEY: &[u8] = b"\0";

/// Cursor state of an in-progress range scan.
///
/// Obtained from [`RadixTree::scan`]; advanced with
/// [`RadixTree::get_next`]; read with [`key`](Iter::key) and
/// [`value`](Iter::value).
#[derive(Debug)]
pub struct Iter {
    begin_key: Vec<u8>,
    begin_inclusive: bool,
    begin_open: bool,

    end_key: Vec<u8>,
    end_inclusive: bool,
    end_open: bool,

    /// Current node; null once the scan is exhausted.
    node: Gptr,
    /// 0: visit this node's value next; k > 0: visit child slot k-1 next.
    next_pos: u64,

    key: Vec<u8>,
    value: TagGptr,

    /// Ancestors as (node, resume position) pairs.
    path: Vec<(Gptr, u64)>,
}

impl Iter {
    /// Key most recently surfaced.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Tagged value most recently surfaced.
    pub fn value(&self) -> TagGptr {
        self.value
    }

    /// True once the scan has run past its last key.
    pub fn exhausted(&self) -> bool {
        self.node.is_null()
    }
}

impl<H: GlobalHeap> RadixTree<H> {
    /// Start a range scan and position it on the first key in range.
    ///
    /// Each bound is a key plus an inclusive flag; the byte `\0` with the
    /// flag cleared makes that side unbounded. Returns `Ok(None)` when no
    /// key satisfies the range.
    pub fn scan(
        &self,
        begin_key: &[u8],
        begin_inclusive: bool,
        end_key: &[u8],
        end_inclusive: bool,
    ) -> Result<Option<Iter>, Error> {
        if begin_key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLong(begin_key.len()));
        }
        if end_key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLong(end_key.len()));
        }
        Metrics::bump(&self.metrics().scans);
        let mut iter = Iter {
            begin_key: begin_key.to_vec(),
            begin_inclusive,
            begin_open: begin_key == OPEN_BOUNDARY_KEY && !begin_inclusive,
            end_key: end_key.to_vec(),
            end_inclusive,
            end_open: end_key == OPEN_BOUNDARY_KEY && !end_inclusive,
            node: Gptr::NULL,
            next_pos: 0,
            key: Vec::with_capacity(MAX_KEY_LEN),
            value: TagGptr::null(),
            path: Vec::new(),
        };
        if self.lower_bound(&mut iter) {
            Ok(Some(iter))
        } else {
            Ok(None)
        }
    }

    /// Advance to the in-order successor. Returns false once the range is
    /// exhausted; the iterator then stays exhausted.
    pub fn get_next(&self, iter: &mut Iter) -> bool {
        if iter.exhausted() {
            return false;
        }
        self.next_value(iter)
    }

    /// Position `iter` on the first valid value at or after `begin_key`.
    ///
    /// Descends along the bytes of the bound while the tree matches it
    /// exactly, maintaining the ancestor stack. Wherever the tree diverges,
    /// every key in the subtree at hand is entirely before or entirely
    /// after the bound, and the cursor is parked so that the ordinary
    /// successor walk lands on the lower bound.
    fn lower_bound(&self, iter: &mut Iter) -> bool {
        iter.node = self.root();
        iter.next_pos = 0;
        if iter.begin_open {
            return self.next_value(iter);
        }
        let mut consumed = 0;
        loop {
            let node = self.node(iter.node);
            let prefix = node.prefix();
            iter.key.extend_from_slice(prefix);

            let rest = &iter.begin_key[consumed..];
            let shorter = prefix.len().min(rest.len());
            match prefix[..shorter].cmp(&rest[..shorter]) {
                std::cmp::Ordering::Greater => {
                    // Everything below sorts after the bound: take the
                    // leftmost value here, starting with this node's own.
                    iter.next_pos = 0;
                    return self.next_value(iter);
                }
                std::cmp::Ordering::Less => {
                    // Everything below sorts before the bound: skip the
                    // subtree and resume at the next sibling.
                    iter.next_pos = FANOUT as u64 + 1;
                    return self.next_value(iter);
                }
                std::cmp::Ordering::Equal => {}
            }

            if prefix.len() >= rest.len() {
                if prefix.len() > rest.len() {
                    // Bound exhausted inside the compressed path; this
                    // node's key already exceeds it.
                    iter.next_pos = 0;
                    return self.next_value(iter);
                }
                // This node's key equals the bound exactly.
                iter.next_pos = if iter.begin_inclusive { 0 } else { 1 };
                return self.next_value(iter);
            }
            consumed += prefix.len();

            let byte = iter.begin_key[consumed];
            match node.child_at_or_after(byte as usize) {
                Some((b, child)) if b == byte => {
                    iter.path.push((iter.node, byte as u64 + 2));
                    iter.key.push(byte);
                    iter.node = child;
                    iter.next_pos = 0;
                    consumed += 1;
                }
                Some((b, _)) => {
                    // First branch past the bound; its leftmost value is
                    // the answer.
                    iter.next_pos = b as u64 + 1;
                    return self.next_value(iter);
                }
                None => {
                    // Nothing at or after the bound in this node.
                    iter.next_pos = FANOUT as u64 + 1;
                    return self.next_value(iter);
                }
            }
        }
    }

    /// In-order successor: surface this node's value if due, else descend
    /// into the next child, else pop. Applies the end bound to every
    /// candidate before surfacing; tombstones are skipped but their
    /// subtrees are traversed.
    fn next_value(&self, iter: &mut Iter) -> bool {
        while iter.node.is_valid() {
            let node = self.node(iter.node);
            if iter.next_pos == 0 {
                iter.next_pos = 1;
                let value = node.value();
                if value.is_valid() {
                    if !self.within_end(iter) {
                        iter.node = Gptr::NULL;
                        return false;
                    }
                    iter.value = value;
                    return true;
                }
            }
            let from = (iter.next_pos - 1) as usize;
            match node.child_at_or_after(from) {
                Some((byte, child)) => {
                    iter.path.push((iter.node, byte as u64 + 2));
                    iter.key.push(byte);
                    iter.key.extend_from_slice(self.node(child).prefix());
                    iter.node = child;
                    iter.next_pos = 0;
                }
                None => {
                    let cut = node.prefix_len() + 1;
                    match iter.path.pop() {
                        Some((parent, resume)) => {
                            iter.key.truncate(iter.key.len() - cut);
                            iter.node = parent;
                            iter.next_pos = resume;
                        }
                        None => {
                            iter.node = Gptr::NULL;
                        }
                    }
                }
            }
        }
        false
    }

    fn within_end(&self, iter: &Iter) -> bool {
        if iter.end_open {
            return true;
        }
        match iter.key.as_slice().cmp(&iter.end_key) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => iter.end_inclusive,
            std::cmp::Ordering::Greater => false,
        }
    }
}
