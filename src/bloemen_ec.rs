//! Swarmed emptiness check by SCC decomposition of the product.
//!
//! Partitions carry an accepting flag, merged by `unite`. An accepting edge is
//! recorded on a partition once both of its ends are known to belong to it, so
//! an accepting partition always contains an accepting cycle. No counterexample
//! is reconstructed: the union-find does not keep the edges it merged along.

use std::ops::ControlFlow;

use tracing::debug;

use crate::bloemen::{SccPolicy, SwarmScc};
use crate::kripke_structure::KripkeStructure;
use crate::product::{Product, ProductState, ProductSucc};
use crate::store::NodeId;
use crate::uf::UnionFind;

pub struct Emptiness<'a, K: KripkeStructure> {
    product: Product<'a, K>,
    tid: usize,
    accepting: Option<ProductState<K::State>>,
}

impl<'a, K: KripkeStructure> Emptiness<'a, K> {
    pub fn new(product: Product<'a, K>, tid: usize) -> Self {
        Self {
            product,
            tid,
            accepting: None,
        }
    }

    /// A state of the accepting partition this worker found, if any.
    pub fn accepting(&self) -> Option<&ProductState<K::State>> {
        self.accepting.as_ref()
    }
}

impl<'a, K: KripkeStructure> SccPolicy for Emptiness<'a, K> {
    type State = ProductState<K::State>;
    type Iter = ProductSucc<'a, K>;

    fn name(&self) -> &'static str {
        "bloemen_ec"
    }

    fn successors(&mut self, state: &Self::State) -> Self::Iter {
        self.product.successors(state, self.tid)
    }

    fn recycle(&mut self, iter: Self::Iter) {
        self.product.recycle(iter, self.tid);
    }

    fn on_closing(&mut self, uf: &UnionFind<Self::State>, w: NodeId, acc: bool) -> ControlFlow<()> {
        if acc {
            uf.mark_accepting(w);
        }
        if !uf.partition(w).accepting {
            return ControlFlow::Continue(());
        }
        let state = uf.state(w).clone();
        debug!(tid = self.tid, state = %state, "accepting cycle");
        self.accepting = Some(state);
        ControlFlow::Break(())
    }
}

/// A worker of the swarmed SCC-based emptiness check.
pub type BloemenEc<'a, K> = SwarmScc<'a, Emptiness<'a, K>>;
