//! The synchronous product of a Kripke structure and a property automaton.

use std::fmt;

use crate::automaton::{AutEdge, Automaton, Cube};
use crate::error::ProviderError;
use crate::kripke_structure::{KripkeStructure, SuccIter};

/// A state of the product: a Kripke state paired with an automaton state.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ProductState<S> {
    pub kripke: S,
    pub aut: u32,
}

impl<S: fmt::Debug> fmt::Display for ProductState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} * q{}", self.kripke, self.aut)
    }
}

/// Borrowed view of a product, handing out product successor iterators.
pub struct Product<'a, K> {
    kripke: &'a K,
    aut: &'a Automaton,
}

impl<K> Clone for Product<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Product<'_, K> {}

impl<'a, K: KripkeStructure> Product<'a, K> {
    pub fn new(kripke: &'a K, aut: &'a Automaton) -> Self {
        Self { kripke, aut }
    }

    pub fn kripke(&self) -> &'a K {
        self.kripke
    }

    pub fn automaton(&self) -> &'a Automaton {
        self.aut
    }

    /// Initial product states of worker `tid`.
    pub fn initials(&self, tid: usize) -> Result<Vec<ProductState<K::State>>, ProviderError> {
        let q = self.aut.initial_state();
        Ok(self
            .kripke
            .initials(tid)?
            .into_iter()
            .map(|kripke| ProductState { kripke, aut: q })
            .collect())
    }

    pub fn successors(&self, state: &ProductState<K::State>, tid: usize) -> ProductSucc<'a, K> {
        let kripke = self.kripke.successors(&state.kripke, tid);
        let cond = kripke.condition();
        let edges = self.aut.successors(state.aut);
        // Without a compatible automaton edge the state has no product successor.
        let exhausted = !edges.iter().any(|e| e.cond.intersects(&cond));
        ProductSucc {
            kripke,
            edges,
            cond,
            current: None,
            next_edge: 0,
            exhausted,
        }
    }

    pub fn recycle(&self, succ: ProductSucc<'a, K>, tid: usize) {
        self.kripke.recycle(succ.kripke, tid);
    }
}

/// Iterates the product edges leaving one product state, as
/// `(successor, accepting)` pairs.
///
/// Kripke successors and compatible automaton edges are advanced in lock-step:
/// each Kripke successor is paired with every automaton edge whose condition
/// intersects the source valuation.
pub struct ProductSucc<'a, K: KripkeStructure> {
    kripke: K::Successors,
    edges: &'a [AutEdge],
    cond: Cube,
    current: Option<K::State>,
    next_edge: usize,
    exhausted: bool,
}

impl<K: KripkeStructure> ProductSucc<'_, K> {
    pub fn is_reduced(&self) -> bool {
        self.kripke.is_reduced()
    }

    pub fn fire_all(&mut self) -> bool {
        !self.exhausted && self.kripke.fire_all()
    }

    fn next_compatible_edge(&mut self) -> Option<AutEdge> {
        while self.next_edge < self.edges.len() {
            let e = self.edges[self.next_edge];
            self.next_edge += 1;
            if e.cond.intersects(&self.cond) {
                return Some(e);
            }
        }
        None
    }
}

impl<K: KripkeStructure> Iterator for ProductSucc<'_, K> {
    type Item = (ProductState<K::State>, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        loop {
            if self.current.is_some() {
                if let Some(e) = self.next_compatible_edge() {
                    let kripke = self.current.clone()?;
                    return Some((ProductState { kripke, aut: e.dst }, e.acc));
                }
            }
            self.current = Some(self.kripke.next()?);
            self.next_edge = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explicit::ExplicitKripke;

    #[test]
    fn pairs_compatible_edges_only() {
        let mut ks = ExplicitKripke::from_edges(3, &[(0, 1), (0, 2)]).with_aps(1);
        ks.label(0, 0);
        let mut aut = Automaton::new(["p"]);
        let q = aut.add_states(2);
        aut.add_edge(q, q, Cube::TRUE.with(0, true), true);
        aut.add_edge(q, q + 1, Cube::TRUE, false);
        aut.add_edge(q, q + 1, Cube::TRUE.with(0, false), true);
        let product = Product::new(&ks, &aut);
        let init = ProductState { kripke: 0, aut: q };
        let succ: Vec<_> = product.successors(&init, 0).collect();
        assert_eq!(
            succ,
            vec![
                (ProductState { kripke: 1, aut: q }, true),
                (ProductState { kripke: 1, aut: q + 1 }, false),
                (ProductState { kripke: 2, aut: q }, true),
                (ProductState { kripke: 2, aut: q + 1 }, false),
            ]
        );
    }

    #[test]
    fn short_circuits_without_compatible_edges() {
        let ks = ExplicitKripke::from_edges(2, &[(0, 1)]).with_aps(1);
        let mut aut = Automaton::new(["p"]);
        let q = aut.add_states(1);
        aut.add_edge(q, q, Cube::TRUE.with(0, true), true);
        let product = Product::new(&ks, &aut);
        let mut it = product.successors(&ProductState { kripke: 0, aut: q }, 0);
        assert_eq!(it.next(), None);
        assert!(!it.fire_all());
    }
}
