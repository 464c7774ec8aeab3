//! A lock-free, iterable union-find shared by all workers.
//!
//! Each explored state owns one node. A node carries:
//!
//! - a `parent` index (itself for roots); following parents always reaches a root,
//! - a worker mask, meaningful on roots: bit `t` is set once worker `t` claimed a
//!   state of the partition,
//! - a `next` index closing a cycle over the nodes of the partition (the
//!   work-stealing list), where nodes are lazily skipped once `Done`,
//! - a root status (Live, Locked, Dead) and a list status (Busy, Locked, Done),
//! - partition bookkeeping (size, cyclic, to-expand and accepting flags) read on roots,
//! - a forced flag, set on a node reopened for full expansion.
//!
//! Every retry loop below terminates because a failed compare-and-swap means
//! another thread's operation succeeded, and locks are held for O(1) work.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering::SeqCst};

use crate::store::{NodeId, SharedStore};

/// Maximum number of workers sharing one union-find (one bit each in the worker mask).
pub const MAX_WORKERS: usize = 64;

const LIVE: u8 = 0;
const LOCKED: u8 = 1;
const DEAD: u8 = 2;

const BUSY: u8 = 0;
const DONE: u8 = 2;

/// Status of a partition, stored on its root.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UfStatus {
    Live,
    Locked,
    Dead,
}

/// Status of a node in its partition's work-stealing list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListStatus {
    /// Successors not fully explored yet.
    Busy,
    /// Held by a `unite` splicing two lists.
    Locked,
    /// Fully explored; skipped by list walks.
    Done,
}

fn uf_status(raw: u8) -> UfStatus {
    match raw {
        LIVE => UfStatus::Live,
        LOCKED => UfStatus::Locked,
        _ => UfStatus::Dead,
    }
}

fn list_status(raw: u8) -> ListStatus {
    match raw {
        BUSY => ListStatus::Busy,
        LOCKED => ListStatus::Locked,
        _ => ListStatus::Done,
    }
}

/// Outcome of [UnionFind::claim].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClaimStatus {
    /// The calling worker had never visited the state's partition.
    New,
    /// The calling worker already visited the state's partition.
    Found,
    /// The state's partition is a completed SCC.
    Dead,
}

/// Outcome of [UnionFind::pick_from_list].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pick {
    /// A node of the partition whose successors still need exploring.
    Busy(NodeId),
    /// Every node of the partition is done and the partition is dead.
    ///
    /// `scc_found` is true for exactly one caller: the one that marked it dead.
    Dead { scc_found: bool },
}

/// Snapshot of a partition's bookkeeping, read on its root.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub root: NodeId,
    pub size: usize,
    /// The partition contains a cycle (a merge happened, or a self-loop was seen).
    pub cyclic: bool,
    /// No state of the partition is known to be fully expanded.
    pub to_expand: bool,
    /// The partition contains an accepting transition.
    pub accepting: bool,
}

/// A union-find element.
pub struct UfNode<S> {
    state: S,
    parent: AtomicUsize,
    workers: AtomicU64,
    next: AtomicUsize,
    uf_status: AtomicU8,
    list_status: AtomicU8,
    size: AtomicUsize,
    cyclic: AtomicBool,
    to_expand: AtomicBool,
    accepting: AtomicBool,
    forced: AtomicBool,
}

impl<S> UfNode<S> {
    fn new(id: NodeId, state: S) -> Self {
        Self {
            state,
            parent: AtomicUsize::new(id.index()),
            workers: AtomicU64::new(0),
            next: AtomicUsize::new(id.index()),
            uf_status: AtomicU8::new(LIVE),
            list_status: AtomicU8::new(BUSY),
            size: AtomicUsize::new(1),
            cyclic: AtomicBool::new(false),
            to_expand: AtomicBool::new(true),
            accepting: AtomicBool::new(false),
            forced: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn state(&self) -> &S {
        &self.state
    }

    #[inline]
    fn parent(&self) -> NodeId {
        NodeId::from_index(self.parent.load(SeqCst))
    }

    #[inline]
    fn next(&self) -> NodeId {
        NodeId::from_index(self.next.load(SeqCst))
    }
}

/// The shared union-find, keyed by state.
pub struct UnionFind<S> {
    nodes: SharedStore<S, UfNode<S>>,
}

impl<S> UnionFind<S>
where
    S: Clone + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            nodes: SharedStore::new(),
        }
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &UfNode<S> {
        self.nodes.get(id)
    }

    #[inline]
    pub fn state(&self, id: NodeId) -> &S {
        self.node(id).state()
    }

    /// Number of distinct states inserted so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert `state` if absent and claim its partition for worker `tid`.
    pub fn claim(&self, state: S, tid: usize) -> (ClaimStatus, NodeId) {
        let (id, _) = self
            .nodes
            .insert_with(state, |id, s| UfNode::new(id, s.clone()));
        (self.claim_node(id, tid), id)
    }

    /// Claim the partition of an already inserted node for worker `tid`.
    pub fn claim_node(&self, id: NodeId, tid: usize) -> ClaimStatus {
        assert!(tid < MAX_WORKERS, "worker id {} out of range", tid);
        let bit = 1u64 << tid;
        let mut root = self.find(id);
        if self.node(root).uf_status.load(SeqCst) == DEAD {
            return ClaimStatus::Dead;
        }
        if self.node(root).workers.fetch_or(bit, SeqCst) & bit != 0 {
            return ClaimStatus::Found;
        }
        // The root may have been united away while we set our bit.
        while !self.is_root(root) {
            root = self.find(root);
            self.node(root).workers.fetch_or(bit, SeqCst);
        }
        ClaimStatus::New
    }

    #[inline]
    fn is_root(&self, id: NodeId) -> bool {
        self.node(id).parent() == id
    }

    /// Root of `a`'s partition, halving the path on the way.
    pub fn find(&self, a: NodeId) -> NodeId {
        let mut x = a;
        let mut parent = self.node(x).parent();
        while x != parent {
            let y = parent;
            parent = self.node(y).parent();
            if parent == y {
                return y;
            }
            // Only roots get re-parented by unite, so x still points at an ancestor.
            self.node(x).parent.store(parent.index(), SeqCst);
            x = parent;
            parent = self.node(x).parent();
        }
        x
    }

    /// True iff `a` and `b` are in the same partition.
    ///
    /// A negative answer is only returned once `a`'s root was observed to still be
    /// a root after both lookups, so it cannot be an artifact of a concurrent union.
    pub fn same_set(&self, a: NodeId, b: NodeId) -> bool {
        loop {
            let a_root = self.find(a);
            let b_root = self.find(b);
            if a_root == b_root {
                return true;
            }
            if self.is_root(a_root) {
                return false;
            }
        }
    }

    /// Try to take the root lock of `a`; fails if `a` is not a live root.
    fn lock_root(&self, a: NodeId) -> bool {
        let node = self.node(a);
        if node
            .uf_status
            .compare_exchange(LIVE, LOCKED, SeqCst, SeqCst)
            .is_ok()
        {
            if self.is_root(a) {
                return true;
            }
            self.unlock_root(a);
        }
        false
    }

    #[inline]
    fn unlock_root(&self, a: NodeId) {
        self.node(a).uf_status.store(LIVE, SeqCst);
    }

    /// Spin while a concurrent `unite` holds the list lock of `a`.
    fn settled_list_status(&self, a: NodeId) -> ListStatus {
        loop {
            match list_status(self.node(a).list_status.load(SeqCst)) {
                ListStatus::Locked => std::hint::spin_loop(),
                status => return status,
            }
        }
    }

    /// Walk the work-stealing cycle from `u` to a busy node, unlinking done nodes.
    ///
    /// When every node is done, returns a node of the one or two left on the
    /// cycle. Every walk ends on those same nodes.
    fn find_busy(&self, u: NodeId) -> Result<NodeId, NodeId> {
        let mut a = u;
        loop {
            if self.settled_list_status(a) == ListStatus::Busy {
                return Ok(a);
            }
            let b = self.node(a).next();
            if a == b {
                return Err(a);
            }
            if self.settled_list_status(b) == ListStatus::Busy {
                return Ok(b);
            }
            let c = self.node(b).next();
            if c == a {
                // Unlinking either of two done nodes linked to each other could
                // race into two self-loops.
                return Err(a);
            }
            // b is done: skip it for every later walk. Losing this race is harmless.
            let _ = self
                .node(a)
                .next
                .compare_exchange(b.index(), c.index(), SeqCst, SeqCst);
            a = c;
        }
    }

    /// Return a busy node of `u`'s partition, or retire the partition when none is left.
    pub fn pick_from_list(&self, u: NodeId) -> Pick {
        self.pick_or_reopen(u, |_| false)
    }

    /// Like [UnionFind::pick_from_list], but an exhausted partition is shown to
    /// `reopen` under its root lock first. If `reopen` returns true, one node of
    /// the partition is marked forced, made busy again and returned, and the
    /// partition stays live with its to-expand flag cleared.
    ///
    /// `reopen` only runs under the root lock, once no busy node is left, so at
    /// most one caller at a time sees a partition about to retire.
    pub fn pick_or_reopen(&self, u: NodeId, mut reopen: impl FnMut(&Partition) -> bool) -> Pick {
        loop {
            if let Ok(v) = self.find_busy(u) {
                return Pick::Busy(v);
            }
            let root = self.find(u);
            match self.node(root).uf_status.compare_exchange(LIVE, LOCKED, SeqCst, SeqCst) {
                Ok(_) => {}
                Err(DEAD) => return Pick::Dead { scc_found: false },
                Err(_) => {
                    std::hint::spin_loop();
                    continue;
                }
            }
            if !self.is_root(root) {
                self.unlock_root(root);
                continue;
            }
            // No unite can splice nodes in while the root is held, but one may
            // have done so before we took it.
            let last = match self.find_busy(u) {
                Ok(v) => {
                    self.unlock_root(root);
                    return Pick::Busy(v);
                }
                Err(last) => last,
            };
            if reopen(&self.partition(root)) {
                let n = self.node(last);
                n.forced.store(true, SeqCst);
                self.node(root).to_expand.store(false, SeqCst);
                n.list_status.store(BUSY, SeqCst);
                self.unlock_root(root);
                return Pick::Busy(last);
            }
            self.node(root).uf_status.store(DEAD, SeqCst);
            return Pick::Dead { scc_found: true };
        }
    }

    /// Whether `a` was reopened for a full expansion.
    pub fn is_forced(&self, a: NodeId) -> bool {
        self.node(a).forced.load(SeqCst)
    }

    /// Lock a busy node of `a`'s list, or return None if the whole list is done.
    ///
    /// An exhausted list is not retired here: the next [UnionFind::pick_from_list]
    /// on it does that, outside of any lock.
    pub fn lock_list(&self, a: NodeId) -> Option<NodeId> {
        let mut a_list = a;
        loop {
            a_list = self.find_busy(a_list).ok()?;
            if self
                .node(a_list)
                .list_status
                .compare_exchange(BUSY, LOCKED, SeqCst, SeqCst)
                .is_ok()
            {
                return Some(a_list);
            }
        }
    }

    #[inline]
    fn unlock_list(&self, a: NodeId) {
        self.node(a).list_status.store(BUSY, SeqCst);
    }

    /// Mark `a` as fully explored. Never regresses from Done.
    pub fn remove_from_list(&self, a: NodeId) {
        let status = &self.node(a).list_status;
        loop {
            match status.compare_exchange(BUSY, DONE, SeqCst, SeqCst) {
                Ok(_) | Err(DONE) => return,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    pub fn list_status(&self, a: NodeId) -> ListStatus {
        list_status(self.node(a).list_status.load(SeqCst))
    }

    pub fn root_status(&self, a: NodeId) -> UfStatus {
        uf_status(self.node(self.find(a)).uf_status.load(SeqCst))
    }

    pub fn is_dead(&self, a: NodeId) -> bool {
        self.root_status(a) == UfStatus::Dead
    }

    /// Lock both roots of a pending union, smaller id first.
    ///
    /// Returns None when there is nothing to merge: the nodes already share a
    /// root, or one of the partitions is a completed SCC.
    fn lock_roots(&self, a: NodeId, b: NodeId) -> Option<(NodeId, NodeId)> {
        loop {
            let a_root = self.find(a);
            let b_root = self.find(b);
            if a_root == b_root {
                return None;
            }
            if self.node(a_root).uf_status.load(SeqCst) == DEAD
                || self.node(b_root).uf_status.load(SeqCst) == DEAD
            {
                return None;
            }
            let (q, r) = if a_root < b_root {
                (a_root, b_root)
            } else {
                (b_root, a_root)
            };
            if self.lock_root(q) {
                if self.lock_root(r) {
                    return Some((q, r));
                }
                self.unlock_root(q);
            }
            std::hint::spin_loop();
        }
    }

    /// Merge the partitions of `a` and `b`, splicing their work-stealing lists.
    pub fn unite(&self, a: NodeId, b: NodeId) {
        let Some((q, r)) = self.lock_roots(a, b) else {
            return;
        };
        let Some(a_list) = self.lock_list(a) else {
            self.unlock_root(r);
            self.unlock_root(q);
            return;
        };
        let Some(b_list) = self.lock_list(b) else {
            self.unlock_list(a_list);
            self.unlock_root(r);
            self.unlock_root(q);
            return;
        };

        let a_next = self.node(a_list).next.load(SeqCst);
        let b_next = self.node(b_list).next.load(SeqCst);
        self.node(a_list).next.store(b_next, SeqCst);
        self.node(b_list).next.store(a_next, SeqCst);

        let (qn, rn) = (self.node(q), self.node(r));
        qn.parent.store(r.index(), SeqCst);
        // Read q's bookkeeping after re-parenting it: a writer that still saw q
        // as a root wrote before this point, later writers re-find r.
        rn.size.fetch_add(qn.size.load(SeqCst), SeqCst);
        rn.workers.fetch_or(qn.workers.load(SeqCst), SeqCst);
        rn.cyclic.store(true, SeqCst);
        if !qn.to_expand.load(SeqCst) {
            rn.to_expand.store(false, SeqCst);
        }
        if qn.accepting.load(SeqCst) {
            rn.accepting.store(true, SeqCst);
        }

        self.unlock_list(a_list);
        self.unlock_list(b_list);
        self.unlock_root(r);
        self.unlock_root(q);
    }

    /// Apply a monotone update to the root of `a`, following the root if it moves.
    fn update_root(&self, a: NodeId, update: impl Fn(&UfNode<S>)) -> NodeId {
        let mut root = self.find(a);
        update(self.node(root));
        while !self.is_root(root) {
            root = self.find(root);
            update(self.node(root));
        }
        root
    }

    /// Record that `a`'s partition lies on a cycle.
    pub fn mark_cyclic(&self, a: NodeId) {
        self.update_root(a, |n| n.cyclic.store(true, SeqCst));
    }

    /// Record that some state of `a`'s partition is fully expanded.
    pub fn clear_to_expand(&self, a: NodeId) {
        self.update_root(a, |n| n.to_expand.store(false, SeqCst));
    }

    /// Record that `a`'s partition contains an accepting transition.
    pub fn mark_accepting(&self, a: NodeId) {
        self.update_root(a, |n| n.accepting.store(true, SeqCst));
    }

    /// Bookkeeping of `a`'s partition.
    pub fn partition(&self, a: NodeId) -> Partition {
        let root = self.find(a);
        let n = self.node(root);
        Partition {
            root,
            size: n.size.load(SeqCst),
            cyclic: n.cyclic.load(SeqCst),
            to_expand: n.to_expand.load(SeqCst),
            accepting: n.accepting.load(SeqCst),
        }
    }

    /// Id of the node holding `state`, if it was ever inserted.
    pub fn lookup(&self, state: &S) -> Option<NodeId> {
        self.nodes.find(state)
    }
}

impl<S> Default for UnionFind<S>
where
    S: Clone + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_all(uf: &UnionFind<u32>, states: &[u32]) -> Vec<NodeId> {
        states.iter().map(|s| uf.claim(*s, 0).1).collect()
    }

    #[test]
    fn claim_reports_new_then_found() {
        let uf = UnionFind::new();
        let (status, a) = uf.claim(1u32, 0);
        assert_eq!(status, ClaimStatus::New);
        assert_eq!(uf.claim(1, 0), (ClaimStatus::Found, a));
        assert_eq!(uf.claim(1, 1), (ClaimStatus::New, a));
        assert_eq!(uf.len(), 1);
    }

    #[test]
    fn unite_merges_partitions_and_masks() {
        let uf = UnionFind::new();
        let (_, a) = uf.claim(1u32, 0);
        let (_, b) = uf.claim(2u32, 1);
        assert!(!uf.same_set(a, b));
        uf.unite(a, b);
        assert!(uf.same_set(a, b));
        assert_eq!(uf.claim(1, 1).0, ClaimStatus::Found);
        assert_eq!(uf.claim(2, 0).0, ClaimStatus::Found);
        let p = uf.partition(a);
        assert_eq!(p.size, 2);
        assert!(p.cyclic);
        // No-op on already merged nodes.
        uf.unite(b, a);
        assert_eq!(uf.partition(b).size, 2);
    }

    #[test]
    fn pick_walks_every_busy_node_then_retires_once() {
        let uf = UnionFind::new();
        let ids = claim_all(&uf, &[0, 1, 2, 3]);
        for w in ids.windows(2) {
            uf.unite(w[0], w[1]);
        }
        let mut seen = Vec::new();
        loop {
            match uf.pick_from_list(ids[0]) {
                Pick::Busy(v) => {
                    assert!(!seen.contains(&v));
                    seen.push(v);
                    uf.remove_from_list(v);
                }
                Pick::Dead { scc_found } => {
                    assert!(scc_found);
                    break;
                }
            }
        }
        seen.sort();
        assert_eq!(seen, ids);
        assert_eq!(uf.pick_from_list(ids[2]), Pick::Dead { scc_found: false });
        assert_eq!(uf.claim(3, 0).0, ClaimStatus::Dead);
    }

    #[test]
    fn dead_partitions_never_merge() {
        let uf = UnionFind::new();
        let ids = claim_all(&uf, &[0, 1]);
        uf.remove_from_list(ids[0]);
        assert_eq!(uf.pick_from_list(ids[0]), Pick::Dead { scc_found: true });
        uf.unite(ids[0], ids[1]);
        assert!(!uf.same_set(ids[0], ids[1]));
        assert!(uf.is_dead(ids[0]));
        assert!(!uf.is_dead(ids[1]));
    }

    #[test]
    fn reopened_node_keeps_the_partition_live() {
        let uf = UnionFind::new();
        let ids = claim_all(&uf, &[0, 1]);
        uf.unite(ids[0], ids[1]);
        uf.remove_from_list(ids[0]);
        uf.remove_from_list(ids[1]);
        let mut calls = 0;
        let v = match uf.pick_or_reopen(ids[0], |p| {
            calls += 1;
            p.cyclic && p.to_expand
        }) {
            Pick::Busy(v) => v,
            other => panic!("expected a reopened node, got {:?}", other),
        };
        assert!(uf.is_forced(v));
        assert!(!uf.is_dead(ids[0]));
        assert!(!uf.partition(ids[1]).to_expand);
        // Walks from any node of the partition reach it.
        assert_eq!(uf.pick_from_list(ids[1]), Pick::Busy(v));
        uf.remove_from_list(v);
        let pick = uf.pick_or_reopen(ids[1], |p| {
            calls += 1;
            p.cyclic && p.to_expand
        });
        assert_eq!(pick, Pick::Dead { scc_found: true });
        assert_eq!(calls, 2);
        assert!(uf.is_dead(ids[0]));
    }

    #[test]
    fn partition_flags_follow_unions() {
        let uf = UnionFind::new();
        let ids = claim_all(&uf, &[0, 1, 2]);
        uf.clear_to_expand(ids[1]);
        uf.mark_accepting(ids[2]);
        assert!(uf.partition(ids[0]).to_expand);
        uf.unite(ids[0], ids[1]);
        uf.unite(ids[1], ids[2]);
        let p = uf.partition(ids[0]);
        assert!(!p.to_expand);
        assert!(p.accepting);
        assert_eq!(p.size, 3);
    }
}
