//! Swarmed SCC decomposition for safety checking under partial-order reduction.
//!
//! Reduced successor sets can hide states forever when every state of a cycle
//! postpones the same transition. Each partition tracks whether it is cyclic and
//! whether any of its states was fully expanded. When a cyclic partition with no
//! fully expanded state runs out of work, it is not retired: one of its states
//! is reopened and fully expanded first, and whatever that uncovers, including
//! edges back into the partition, is merged before it retires.

use tracing::debug;

use crate::bloemen::{Edges, Exhaustion, SccPolicy, SwarmScc};
use crate::kripke_structure::{KripkeStructure, SuccIter};
use crate::store::NodeId;
use crate::uf::{Partition, UnionFind};

pub struct Safety<'a, K: KripkeStructure> {
    kripke: &'a K,
    tid: usize,
    detect_deadlock: bool,
    deadlock: Option<K::State>,
}

impl<'a, K: KripkeStructure> Safety<'a, K> {
    pub fn new(kripke: &'a K, tid: usize, detect_deadlock: bool) -> Self {
        Self {
            kripke,
            tid,
            detect_deadlock,
            deadlock: None,
        }
    }

    /// The deadlock this worker found, if any.
    pub fn deadlock(&self) -> Option<&K::State> {
        self.deadlock.as_ref()
    }
}

impl<K: KripkeStructure> SccPolicy for Safety<'_, K> {
    type State = K::State;
    type Iter = Edges<K::Successors>;

    fn name(&self) -> &'static str {
        "bloemen_safety"
    }

    fn successors(&mut self, state: &K::State) -> Self::Iter {
        Edges(self.kripke.successors(state, self.tid))
    }

    fn recycle(&mut self, iter: Self::Iter) {
        self.kripke.recycle(iter.0, self.tid);
    }

    fn expand(&mut self, state: &K::State) -> Self::Iter {
        let mut iter = self.successors(state);
        iter.0.fire_all();
        iter
    }

    fn on_iterate(&mut self, uf: &UnionFind<K::State>, node: NodeId, iter: &Self::Iter) {
        if !iter.0.is_reduced() {
            uf.clear_to_expand(node);
        }
    }

    fn on_exhausted(
        &mut self,
        uf: &UnionFind<K::State>,
        node: NodeId,
        iter: &mut Self::Iter,
        produced: bool,
    ) -> Exhaustion {
        if produced {
            return Exhaustion::Done;
        }
        // An empty reduced set says nothing: only the full set tells a deadlock.
        if iter.0.fire_all() {
            uf.clear_to_expand(node);
            return Exhaustion::Widened;
        }
        if self.detect_deadlock {
            let state = uf.state(node).clone();
            debug!(tid = self.tid, state = ?state, "deadlock");
            self.deadlock = Some(state);
            return Exhaustion::Stop;
        }
        Exhaustion::Done
    }

    fn reopen(&self, p: &Partition) -> bool {
        p.cyclic && p.to_expand
    }
}

/// A worker of the swarmed safety decomposition.
pub type BloemenSafety<'a, K> = SwarmScc<'a, Safety<'a, K>>;
