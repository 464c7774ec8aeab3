//! Swarmed SCC decomposition over the shared union-find.
//!
//! Every worker runs its own iterative DFS, in its own successor order, over the
//! same union-find. Workers never wait for each other: a worker reaching a state
//! claimed by another simply explores it too, and the union-find merges what both
//! learn. A worker that reaches a partition some other worker already retired
//! skips it.
//!
//! The search keeps two stacks: `todo` (the DFS path) and `roots` (the root of
//! every partition still open on the path). A successor already claimed by this
//! worker closes a cycle, and the partitions on the path from it to the top of
//! `todo` are united. A partition is retired once its work-stealing list runs
//! out of busy states, by whichever worker gets there first. Before it does, the
//! policy may reopen one of its states for a full expansion; the partition then
//! stays live until that expansion is folded in.
//!
//! The variants (plain decomposition, safety, emptiness) share this search and
//! differ only in their [SccPolicy].

use std::fmt::Debug;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::kripke_structure::KripkeStructure;
use crate::mc::{Worker, WorkerStats};
use crate::store::NodeId;
use crate::uf::{ClaimStatus, Partition, Pick, UnionFind};

/// What a policy decides when a state's successor iterator runs dry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exhaustion {
    /// The state is fully explored.
    Done,
    /// The iterator was widened; keep iterating it.
    Widened,
    /// Stop every worker.
    Stop,
}

/// The variant-specific part of a swarmed SCC search.
///
/// Successor iterators yield `(state, accepting)` pairs; variants without an
/// acceptance condition always report `false`.
pub trait SccPolicy {
    type State: Clone + Eq + Hash + Debug;
    type Iter: Iterator<Item = (Self::State, bool)>;

    fn name(&self) -> &'static str;

    fn successors(&mut self, state: &Self::State) -> Self::Iter;

    fn recycle(&mut self, iter: Self::Iter);

    /// Successors of a state reopened for a full expansion.
    fn expand(&mut self, state: &Self::State) -> Self::Iter {
        self.successors(state)
    }

    /// A fresh iterator was created for `node`.
    fn on_iterate(&mut self, _uf: &UnionFind<Self::State>, _node: NodeId, _iter: &Self::Iter) {}

    /// The iterator of `node` is exhausted; `produced` tells whether it yielded anything.
    fn on_exhausted(
        &mut self,
        _uf: &UnionFind<Self::State>,
        _node: NodeId,
        _iter: &mut Self::Iter,
        _produced: bool,
    ) -> Exhaustion {
        Exhaustion::Done
    }

    /// An edge into `w` was found to lie inside a partition.
    fn on_closing(&mut self, _uf: &UnionFind<Self::State>, _w: NodeId, _acc: bool) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// The partition `p` ran out of busy states. Returns true to reopen one of
    /// its states for a full expansion instead of retiring it.
    fn reopen(&self, _p: &Partition) -> bool {
        false
    }
}

/// Maps a state iterator to the `(state, accepting)` edges of an SCC search.
pub struct Edges<I>(pub I);

impl<I: Iterator> Iterator for Edges<I> {
    type Item = (I::Item, bool);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|s| (s, false))
    }
}

/// A state explored through its partition's work-stealing list.
///
/// `accepting_from` is the source of the edge that discovered `node`, when
/// that edge is accepting.
struct Frame {
    node: NodeId,
    accepting_from: Option<NodeId>,
}

/// An iteration interrupted to descend into `child`.
struct Suspended<I> {
    iter: I,
    produced: bool,
    child: NodeId,
    acc: bool,
    /// The iteration covers the full successor set of a reopened state.
    forced: bool,
}

enum Step {
    Descended,
    Exhausted,
    Stopped,
}

/// One worker of a swarmed SCC search.
pub struct SwarmScc<'a, P: SccPolicy> {
    policy: P,
    uf: &'a UnionFind<P::State>,
    stop: &'a AtomicBool,
    initials: Vec<P::State>,
    todo: Vec<Frame>,
    roots: Vec<(NodeId, bool)>,
    /// Suspended iterations, resumed by whichever frame picks their state next.
    suspended: FxHashMap<NodeId, Suspended<P::Iter>>,
    stats: WorkerStats,
}

impl<'a, P: SccPolicy> SwarmScc<'a, P> {
    pub fn new(
        policy: P,
        uf: &'a UnionFind<P::State>,
        tid: usize,
        stop: &'a AtomicBool,
        initials: Vec<P::State>,
    ) -> Self {
        Self {
            policy,
            uf,
            stop,
            initials,
            todo: Vec::new(),
            roots: Vec::new(),
            suspended: FxHashMap::default(),
            stats: WorkerStats::new(tid),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    #[inline]
    fn tid(&self) -> usize {
        self.stats.tid
    }

    #[inline]
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Explore from `init`; false if the search was stopped.
    fn explore(&mut self, init: P::State) -> bool {
        let (status, id) = self.uf.claim(init, self.tid());
        if status == ClaimStatus::New {
            self.stats.states += 1;
            self.push_scc(id, None);
        }
        self.search()
    }

    fn search(&mut self) -> bool {
        loop {
            if self.stopped() {
                return false;
            }
            let Some(node) = self.todo.last().map(|f| f.node) else {
                return true;
            };
            match self.step_scc(node) {
                Step::Descended => {}
                Step::Exhausted => self.pop(),
                Step::Stopped => return false,
            }
        }
    }

    fn push_scc(&mut self, node: NodeId, accepting_from: Option<NodeId>) {
        self.todo.push(Frame {
            node,
            accepting_from,
        });
        self.roots.push((node, accepting_from.is_some()));
        self.stats.max_depth = self.stats.max_depth.max(self.todo.len());
    }

    fn pop(&mut self) {
        let Some(Frame {
            node,
            accepting_from,
        }) = self.todo.pop()
        else {
            return;
        };
        if self.roots.last().map(|r| r.0) == Some(node) {
            self.roots.pop();
        }
        // An accepting tree edge lies on a cycle iff both ends ended up together.
        if let Some(src) = accepting_from {
            if self.uf.same_set(src, node) {
                let _ = self.close(node, node, true);
            }
        }
    }

    fn retire(&mut self, v: NodeId) {
        self.stats.sccs += 1;
        let p = self.uf.partition(v);
        self.stats.largest_scc = self.stats.largest_scc.max(p.size);
    }

    /// Start iterating `v`, fully expanded if its partition reopened it.
    fn iterate(&mut self, v: NodeId, forced: bool) -> P::Iter {
        let uf = self.uf;
        let state = uf.state(v);
        if forced {
            debug!(tid = self.tid(), state = ?state, "fully expanding a reopened state");
            return self.policy.expand(state);
        }
        let iter = self.policy.successors(state);
        self.policy.on_iterate(uf, v, &iter);
        iter
    }

    /// Unite the partitions on the path from `w` up to `anchor`, then let the
    /// policy look at the closing edge.
    fn close(&mut self, anchor: NodeId, w: NodeId, acc: bool) -> ControlFlow<()> {
        let uf = self.uf;
        while !uf.same_set(anchor, w) {
            let Some((r, r_acc)) = self.roots.pop() else {
                break;
            };
            let Some(&(below, _)) = self.roots.last() else {
                self.roots.push((r, r_acc));
                break;
            };
            uf.unite(r, below);
            if r_acc {
                uf.mark_accepting(below);
            }
        }
        uf.mark_cyclic(w);
        let flow = self.policy.on_closing(uf, w, acc);
        if flow.is_break() {
            self.stop.store(true, Ordering::Relaxed);
        }
        flow
    }

    fn step_scc(&mut self, v: NodeId) -> Step {
        let uf = self.uf;
        let tid = self.tid();
        loop {
            if self.stopped() {
                return Step::Stopped;
            }
            let mut reopened = false;
            let policy = &self.policy;
            let pick = uf.pick_or_reopen(v, |p| {
                reopened = policy.reopen(p);
                reopened
            });
            let v_prime = match pick {
                Pick::Busy(u) => u,
                Pick::Dead { scc_found } => {
                    if scc_found {
                        self.retire(v);
                    }
                    return Step::Exhausted;
                }
            };
            if reopened {
                self.stats.expansions += 1;
            }

            let forced = uf.is_forced(v_prime);
            let (mut iter, mut produced) = match self.suspended.remove(&v_prime) {
                Some(s) if s.forced || !forced => {
                    // The descent edge may have closed a cycle since it was taken.
                    if uf.claim_node(s.child, tid) == ClaimStatus::Found
                        && self.close(v, s.child, s.acc).is_break()
                    {
                        self.policy.recycle(s.iter);
                        return Step::Stopped;
                    }
                    (s.iter, s.produced)
                }
                stale => {
                    // A reduced iteration of a reopened state is superseded by the full one.
                    if let Some(s) = stale {
                        self.policy.recycle(s.iter);
                    }
                    (self.iterate(v_prime, forced), false)
                }
            };

            loop {
                if self.stopped() {
                    self.policy.recycle(iter);
                    return Step::Stopped;
                }
                let Some((w, acc)) = iter.next() else {
                    match self.policy.on_exhausted(uf, v_prime, &mut iter, produced) {
                        Exhaustion::Widened => continue,
                        Exhaustion::Done => break,
                        Exhaustion::Stop => {
                            self.stop.store(true, Ordering::Relaxed);
                            self.policy.recycle(iter);
                            return Step::Stopped;
                        }
                    }
                };
                produced = true;
                self.stats.transitions += 1;
                let (status, w_id) = uf.claim(w, tid);
                match status {
                    ClaimStatus::New => {
                        self.stats.states += 1;
                        self.suspended.insert(
                            v_prime,
                            Suspended {
                                iter,
                                produced,
                                child: w_id,
                                acc,
                                forced,
                            },
                        );
                        self.push_scc(w_id, acc.then_some(v_prime));
                        return Step::Descended;
                    }
                    ClaimStatus::Found => {
                        if self.close(v, w_id, acc).is_break() {
                            self.policy.recycle(iter);
                            return Step::Stopped;
                        }
                    }
                    ClaimStatus::Dead => {}
                }
            }
            uf.remove_from_list(v_prime);
            self.policy.recycle(iter);
        }
    }

    fn release_iterators(&mut self) {
        for (_, s) in self.suspended.drain() {
            self.policy.recycle(s.iter);
        }
        self.todo.clear();
        self.roots.clear();
    }
}

impl<P: SccPolicy> Worker for SwarmScc<'_, P> {
    fn run(&mut self) {
        let start = Instant::now();
        let initials = std::mem::take(&mut self.initials);
        let mut complete = true;
        for init in initials {
            if !self.explore(init) {
                complete = false;
                break;
            }
        }
        self.release_iterators();
        self.stats.walltime = start.elapsed();
        self.stats.finished = complete;
        if complete {
            // Every reachable partition is dead: nothing is left for the others.
            self.stop.store(true, Ordering::Relaxed);
        }
        debug!(
            worker = self.policy.name(),
            tid = self.tid(),
            states = self.stats.states,
            transitions = self.stats.transitions,
            sccs = self.stats.sccs,
            finished = complete,
            "worker done"
        );
    }

    fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    fn name(&self) -> &'static str {
        self.policy.name()
    }
}

/// The plain decomposition: no reduction, no acceptance.
pub struct Decomposition<'a, K> {
    kripke: &'a K,
    tid: usize,
}

impl<'a, K: KripkeStructure> Decomposition<'a, K> {
    pub fn new(kripke: &'a K, tid: usize) -> Self {
        Self { kripke, tid }
    }
}

impl<K: KripkeStructure> SccPolicy for Decomposition<'_, K> {
    type State = K::State;
    type Iter = Edges<K::Successors>;

    fn name(&self) -> &'static str {
        "bloemen"
    }

    fn successors(&mut self, state: &K::State) -> Self::Iter {
        Edges(self.kripke.successors(state, self.tid))
    }

    fn recycle(&mut self, iter: Self::Iter) {
        self.kripke.recycle(iter.0, self.tid);
    }
}

/// A worker of the swarmed SCC decomposition.
pub type Bloemen<'a, K> = SwarmScc<'a, Decomposition<'a, K>>;
