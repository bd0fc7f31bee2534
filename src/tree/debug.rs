//! Whole-tree diagnostics.

use std::fmt;

use crate::gptr::Gptr;
use crate::heap::GlobalHeap;
use crate::tree::{RadixTree, MAX_KEY_LEN};

/// Aggregates for one depth level of the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelStats {
    /// Nodes at this depth.
    pub nodes: u64,
    /// Child links leaving this depth.
    pub children: u64,
    /// Valid value slots at this depth.
    pub values: u64,
}

impl LevelStats {
    /// Average fanout of the level.
    pub fn avg_fanout(&self) -> f64 {
        if self.nodes == 0 {
            0.0
        } else {
            self.children as f64 / self.nodes as f64
        }
    }
}

/// Snapshot of the tree's shape, produced by [`RadixTree::structure`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStructure {
    /// Per-level aggregates, root first.
    pub levels: Vec<LevelStats>,
    /// Total node count.
    pub node_count: u64,
    /// Total valid values (live keys).
    pub value_count: u64,
    /// Depth of the deepest node; the root is depth 0.
    pub max_depth: u64,
}

impl fmt::Display for TreeStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} nodes, {} values, max depth {}",
            self.node_count, self.value_count, self.max_depth
        )?;
        for (depth, level) in self.levels.iter().enumerate() {
            writeln!(
                f,
                "  level {depth}: {} nodes, {} values, avg fanout {:.2}",
                level.nodes,
                level.values,
                level.avg_fanout()
            )?;
        }
        Ok(())
    }
}

impl<H: GlobalHeap> RadixTree<H> {
    /// Walk the whole tree and summarize its shape. Read-only.
    pub fn structure(&self) -> TreeStructure {
        let mut out = TreeStructure::default();
        self.structure_rec(self.root(), 0, &mut out);
        out
    }

    fn structure_rec(&self, gptr: Gptr, depth: usize, out: &mut TreeStructure) {
        if out.levels.len() <= depth {
            out.levels.resize(depth + 1, LevelStats::default());
        }
        let node = self.node(gptr);
        out.levels[depth].nodes += 1;
        out.node_count += 1;
        out.max_depth = out.max_depth.max(depth as u64);
        if node.value().is_valid() {
            out.levels[depth].values += 1;
            out.value_count += 1;
        }
        for (_, child) in node.children() {
            out.levels[depth].children += 1;
            self.structure_rec(child, depth + 1, out);
        }
    }

    /// Check structural invariants, returning a description of each
    /// violation found. Empty means healthy.
    pub fn verify_integrity(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut key = Vec::with_capacity(MAX_KEY_LEN);
        let mut last_key: Option<Vec<u8>> = None;
        self.verify_rec(self.root(), &mut key, &mut last_key, &mut issues);
        issues
    }

    fn verify_rec(
        &self,
        gptr: Gptr,
        key: &mut Vec<u8>,
        last_key: &mut Option<Vec<u8>>,
        issues: &mut Vec<String>,
    ) {
        let node = self.node(gptr);
        key.extend_from_slice(node.prefix());
        if key.len() > MAX_KEY_LEN {
            issues.push(format!(
                "node {gptr:?} sits at key depth {}, past the {MAX_KEY_LEN}-byte limit",
                key.len()
            ));
            key.truncate(key.len() - node.prefix_len());
            return;
        }
        let value = node.value();
        if value.gptr.is_valid() && value.version == 0 {
            issues.push(format!("node {gptr:?} holds a value with version 0"));
        }
        if value.version != 0 {
            // Key node, live or tombstoned: every full key is visited at
            // most once and in ascending order.
            if let Some(prev) = last_key {
                if prev.as_slice() >= key.as_slice() {
                    issues.push(format!(
                        "key order violated: {prev:?} visited before {key:?}"
                    ));
                }
            }
            *last_key = Some(key.clone());
        }
        let mut seen = 0usize;
        for (byte, child) in node.children() {
            seen += 1;
            key.push(byte);
            self.verify_rec(child, key, last_key, issues);
            key.pop();
        }
        if node.child_count() != seen && node.child_count() < 255 {
            issues.push(format!(
                "node {gptr:?} records {} children but has {seen}",
                node.child_count()
            ));
        }
        key.truncate(key.len() - node.prefix_len());
    }
}
