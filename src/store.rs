//! The shared element store.
//!
//! Every distinct state explored during a run gets exactly one element, shared
//! by all workers. Elements live in an append-only arena and are never freed
//! before the store itself is dropped, so an element id handed out once stays
//! valid for the whole run, even while other threads keep inserting.
//!
//! ```text
//! SharedStore
//!   ├─ index: DashMap<K, NodeId>     insert-if-absent, sharded
//!   └─ arena: segment 0 │ segment 1 │ segment 2 │ ...
//!             1024 slots  2048 slots  4096 slots
//! ```

use std::hash::{BuildHasherDefault, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxHasher;

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// Slots in the first arena segment. Segment `k` holds `FIRST_SEGMENT << k` slots.
const FIRST_SEGMENT: usize = 1024;
const SEGMENTS: usize = 40;

/// Identifier of an element of a [SharedStore].
///
/// Ids are allocated in creation order; their order is the fixed total order the
/// union-find uses to break symmetry.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(usize);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        NodeId(index)
    }
}

/// Append-only arena whose slots never move once written.
struct Arena<T> {
    segments: Box<[OnceLock<Box<[OnceLock<T>]>>]>,
    next: AtomicUsize,
}

#[inline]
fn locate(index: usize) -> (usize, usize) {
    let j = index / FIRST_SEGMENT + 1;
    let segment = (usize::BITS - 1 - j.leading_zeros()) as usize;
    let offset = index - FIRST_SEGMENT * ((1 << segment) - 1);
    (segment, offset)
}

impl<T> Arena<T> {
    fn new() -> Self {
        let segments = (0..SEGMENTS).map(|_| OnceLock::new()).collect();
        Self {
            segments,
            next: AtomicUsize::new(0),
        }
    }

    fn push_with(&self, make: impl FnOnce(NodeId) -> T) -> NodeId {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        let (segment, offset) = locate(index);
        assert!(segment < SEGMENTS, "element store exhausted");
        let slots = self.segments[segment]
            .get_or_init(|| (0..FIRST_SEGMENT << segment).map(|_| OnceLock::new()).collect());
        let id = NodeId(index);
        if slots[offset].set(make(id)).is_err() {
            unreachable!("arena slot {} written twice", index);
        }
        id
    }

    #[inline]
    fn get(&self, id: NodeId) -> &T {
        let (segment, offset) = locate(id.0);
        self.segments[segment]
            .get()
            .and_then(|slots| slots[offset].get())
            .expect("element ids are published after their slot is written")
    }
}

/// A thread-safe set mapping each key to a single shared element.
///
/// Insertion is idempotent: concurrent insertions of equal keys return the same
/// element to every caller, and only one of them observes the insertion as new.
pub struct SharedStore<K, V> {
    index: DashMap<K, NodeId, FxBuildHasher>,
    arena: Arena<V>,
}

impl<K, V> SharedStore<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            index: DashMap::with_hasher(FxBuildHasher::default()),
            arena: Arena::new(),
        }
    }

    /// Insert `key` if absent, building its element with `make`.
    ///
    /// Returns the element id and whether this call created it. `make` runs at
    /// most once per distinct key, while the key's shard is locked.
    pub fn insert_with(&self, key: K, make: impl FnOnce(NodeId, &K) -> V) -> (NodeId, bool) {
        match self.index.entry(key) {
            Entry::Occupied(e) => (*e.get(), false),
            Entry::Vacant(e) => {
                let id = self.arena.push_with(|id| make(id, e.key()));
                e.insert(id);
                (id, true)
            }
        }
    }

    pub fn find(&self, key: &K) -> Option<NodeId> {
        self.index.get(key).map(|r| *r.value())
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> &V {
        self.arena.get(id)
    }

    /// Number of distinct keys inserted so far.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for SharedStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
