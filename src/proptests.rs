use std::collections::{BTreeMap, HashMap};

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::heap::{ArenaHeap, GlobalHeap};
use crate::tree::{RadixTree, UpdateMode, MAX_KEY_LEN, OPEN_BOUNDARY_KEY};
use crate::{Gptr, TagGptr};

/// Model: the live mapping plus the full per-slot version history the tree
/// is supposed to maintain across delete/reinsert cycles.
#[derive(Default)]
struct Model {
    /// Live keys only.
    map: BTreeMap<Vec<u8>, u64>,
    /// Slot version for every key node ever created.
    versions: HashMap<Vec<u8>, u64>,
}

impl Model {
    fn live(&self, key: &[u8]) -> Option<u64> {
        self.map.get(key).copied()
    }

    fn version(&self, key: &[u8]) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// The tagged value a lookup of `key` must produce.
    fn expected(&self, key: &[u8]) -> TagGptr {
        TagGptr {
            gptr: Gptr::from_raw(self.live(key).unwrap_or(0)),
            version: self.version(key),
        }
    }
}

/// Actions to run against both the tree and the model.
#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Put(Key, Value),
    FindOrCreate(Key, Value),
    Get(Key),
    Del(Key),
    Scan(Key, bool, Key, bool),
}

#[derive(Debug, Clone)]
struct Key(Vec<u8>);

/// Nonzero: a value is a global pointer and null is not a value.
#[derive(Debug, Clone, Copy)]
struct Value(u64);

impl Arbitrary for Key {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            // Empty key (the root's own slot)
            Just(Key(vec![])),
            // The open-boundary byte as a literal key
            Just(Key(vec![0])),
            // Tiny alphabet to force shared paths and splits
            prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'c']), 1..6)
                .prop_map(Key),
            // Arbitrary bytes up to the limit
            prop::collection::vec(any::<u8>(), 1..=MAX_KEY_LEN).prop_map(Key),
            // Keys with natural delimiters to exercise prefix compression
            "[a-c]{2,5}/[a-c]{1,4}".prop_map(|s| Key(s.into_bytes())),
            // Shared-prefix family
            "[a-c]{1,3}".prop_map(|p| {
                let mut key = p.into_bytes();
                key.extend_from_slice(b"/suffix");
                Key(key)
            }),
        ]
        .boxed()
    }
}

impl Arbitrary for Value {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (1..=u64::MAX).prop_map(Value).boxed()
    }
}

/// Executes actions against the tree and the model, checking the full
/// contract after each step.
struct Test<H: GlobalHeap> {
    tree: RadixTree<H>,
    model: Model,
    /// Key-node addresses seen so far; they must never move.
    node_ptrs: HashMap<Vec<u8>, Gptr>,
}

impl<H: GlobalHeap> Test<H> {
    fn new(heap: H) -> Self {
        Test {
            tree: RadixTree::create(heap).unwrap(),
            model: Model::default(),
            node_ptrs: HashMap::new(),
        }
    }

    fn check_node_ptr(&mut self, key: &[u8], key_ptr: Gptr) {
        assert!(key_ptr.is_valid());
        let prev = self.node_ptrs.insert(key.to_vec(), key_ptr);
        if let Some(prev) = prev {
            assert_eq!(prev, key_ptr, "key node moved for {key:?}");
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Put(Key(key), Value(value)) => {
                let expected_old = self.model.expected(&key);
                let (key_ptr, new, old) =
                    self.tree.put_cached(&key, Gptr::from_raw(value)).unwrap();
                assert_eq!(old, expected_old, "stale old value for {key:?}");
                assert_eq!(new.gptr.raw(), value);
                assert_eq!(new.version, expected_old.version + 1);
                self.check_node_ptr(&key, key_ptr);
                self.model.map.insert(key.clone(), value);
                self.model.versions.insert(key, new.version);
            }
            Action::FindOrCreate(Key(key), Value(value)) => {
                let expected_old = self.model.expected(&key);
                let old = self
                    .tree
                    .put(&key, Gptr::from_raw(value), UpdateMode::FindOrCreate)
                    .unwrap();
                assert_eq!(old, expected_old);
                if expected_old.is_valid() {
                    // Existing value wins; nothing changes.
                    assert_eq!(self.tree.get(&key), expected_old);
                } else {
                    self.model.map.insert(key.clone(), value);
                    self.model
                        .versions
                        .insert(key, expected_old.version + 1);
                }
            }
            Action::Get(Key(key)) => {
                let got = self.tree.get(&key);
                assert_eq!(got, self.model.expected(&key), "get mismatch for {key:?}");
                let (key_ptr, cached) = self.tree.get_cached(&key);
                assert_eq!(cached, got);
                if self.model.version(&key) != 0 {
                    self.check_node_ptr(&key, key_ptr);
                } else {
                    assert!(key_ptr.is_null());
                }
            }
            Action::Del(Key(key)) => {
                let expected_old = self.model.expected(&key);
                let old = self.tree.destroy(&key);
                assert_eq!(old, expected_old);
                if expected_old.is_valid() {
                    self.model.map.remove(&key);
                    self.model
                        .versions
                        .insert(key.clone(), expected_old.version + 1);
                }
                let now = self.tree.get(&key);
                assert!(!now.is_valid());
                assert_eq!(now.version, self.model.version(&key));
            }
            Action::Scan(Key(begin), begin_incl, Key(end), end_incl) => {
                let got = self.drain_scan(&begin, begin_incl, &end, end_incl);
                let begin_open = begin == OPEN_BOUNDARY_KEY && !begin_incl;
                let end_open = end == OPEN_BOUNDARY_KEY && !end_incl;
                let want: Vec<(Vec<u8>, u64)> = self
                    .model
                    .map
                    .iter()
                    .filter(|(k, _)| {
                        let after_begin = begin_open
                            || match k.as_slice().cmp(&begin) {
                                std::cmp::Ordering::Greater => true,
                                std::cmp::Ordering::Equal => begin_incl,
                                std::cmp::Ordering::Less => false,
                            };
                        let before_end = end_open
                            || match k.as_slice().cmp(&end) {
                                std::cmp::Ordering::Less => true,
                                std::cmp::Ordering::Equal => end_incl,
                                std::cmp::Ordering::Greater => false,
                            };
                        after_begin && before_end
                    })
                    .map(|(k, v)| (k.clone(), *v))
                    .collect();
                assert_eq!(got, want, "scan [{begin:?},{end:?}] ({begin_incl},{end_incl})");
            }
        }

        // The walk must agree with the model exactly, in order, after every
        // action.
        let mut listed = Vec::new();
        self.tree.list(|k, v| listed.push((k.to_vec(), v.raw())));
        let expected: Vec<(Vec<u8>, u64)> =
            self.model.map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(listed, expected);
        assert!(self.tree.verify_integrity().is_empty());
    }

    fn drain_scan(
        &self,
        begin: &[u8],
        begin_incl: bool,
        end: &[u8],
        end_incl: bool,
    ) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::new();
        if let Some(mut it) = self.tree.scan(begin, begin_incl, end, end_incl).unwrap() {
            out.push((it.key().to_vec(), it.value().gptr.raw()));
            while self.tree.get_next(&mut it) {
                out.push((it.key().to_vec(), it.value().gptr.raw()));
            }
        }
        for pair in out.windows(2) {
            assert!(pair[0].0 < pair[1].0, "scan order violated");
        }
        out
    }
}

/// Heap wrapper that makes a fixed fraction of allocations fail, modelling
/// transient contention. With the retry budget in place every operation
/// must still succeed.
struct FlakyHeap {
    inner: ArenaHeap,
    failures: std::cell::Cell<u32>,
    period: u32,
}

impl FlakyHeap {
    fn failing(period: u32) -> Self {
        FlakyHeap {
            inner: ArenaHeap::new(),
            failures: std::cell::Cell::new(0),
            period,
        }
    }
}

impl GlobalHeap for FlakyHeap {
    fn alloc(&self, size: usize) -> Option<Gptr> {
        let n = self.failures.get().wrapping_add(1);
        self.failures.set(n);
        if n % self.period != 0 {
            return None;
        }
        self.inner.alloc(size)
    }
    fn free(&self, gptr: Gptr) {
        self.inner.free(gptr)
    }
    fn offline_free(&self) {
        self.inner.offline_free()
    }
    fn to_local(&self, gptr: Gptr) -> *mut u8 {
        self.inner.to_local(gptr)
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn proptest_vs_btreemap(actions in prop::collection::vec(any::<Action>(), 1..64)) {
        let mut test = Test::new(ArenaHeap::new());
        for action in actions {
            test.execute(action);
        }
    }

    #[test]
    fn proptest_transient_alloc_failures_are_invisible(
        actions in prop::collection::vec(any::<Action>(), 1..32),
    ) {
        // Three of every four allocations fail; the bounded retry hides it.
        let mut test = Test::new(FlakyHeap::failing(4));
        for action in actions {
            test.execute(action);
        }
    }

    #[test]
    fn proptest_version_never_decreases(
        keys in prop::collection::vec(any::<Key>(), 1..24),
    ) {
        let mut tree = RadixTree::create(ArenaHeap::new()).unwrap();
        let mut high: HashMap<Vec<u8>, u64> = HashMap::new();
        for (i, Key(key)) in keys.iter().enumerate() {
            // Alternate put and destroy over a recurring key population.
            if i % 3 == 2 {
                tree.destroy(key);
            } else {
                tree.put(key, Gptr::from_raw(i as u64 + 1), UpdateMode::Update).unwrap();
            }
            let seen = tree.get(key).version;
            let entry = high.entry(key.clone()).or_insert(0);
            prop_assert!(seen >= *entry, "version regressed for {key:?}");
            *entry = seen;
        }
    }
}

#[test]
fn hard_alloc_failure_is_atomic() {
    // Seed the tree through a working heap handle, then starve it: any
    // insert that needs a node must report out-of-space and leave no trace.
    let heap = std::sync::Arc::new(ArenaHeap::new());
    let mut tree = RadixTree::create(std::sync::Arc::clone(&heap)).unwrap();
    tree.put(b"seed", Gptr::from_raw(1), UpdateMode::Update)
        .unwrap();
    let root = tree.root();
    drop(tree);

    struct StarvedHeap(std::sync::Arc<ArenaHeap>);
    impl GlobalHeap for StarvedHeap {
        fn alloc(&self, _size: usize) -> Option<Gptr> {
            None
        }
        fn free(&self, gptr: Gptr) {
            self.0.free(gptr)
        }
        fn to_local(&self, gptr: Gptr) -> *mut u8 {
            self.0.to_local(gptr)
        }
    }

    let mut tree = RadixTree::attach(StarvedHeap(heap), root);
    let before = {
        let mut v = Vec::new();
        tree.list(|k, val| v.push((k.to_vec(), val.raw())));
        v
    };

    assert_eq!(
        tree.put(b"seedling", Gptr::from_raw(2), UpdateMode::Update),
        Err(crate::Error::OutOfSpace)
    );
    assert_eq!(
        tree.put(b"other", Gptr::from_raw(3), UpdateMode::Update),
        Err(crate::Error::OutOfSpace)
    );

    let mut after = Vec::new();
    tree.list(|k, val| after.push((k.to_vec(), val.raw())));
    assert_eq!(before, after);

    // Updating an existing slot allocates nothing and still works.
    assert!(tree
        .put(b"seed", Gptr::from_raw(9), UpdateMode::Update)
        .is_ok());
    assert_eq!(tree.get(b"seed").gptr.raw(), 9);
}
