//! Defines the Kripke structure.

use std::fmt::Debug;
use std::hash::Hash;

use crate::automaton::Cube;
use crate::error::ProviderError;

/// An implicit [Kripke structure](https://en.wikipedia.org/wiki/Kripke_structure)
/// that defines a state space, explored on the fly by several worker threads at once.
///
/// Unlike a traditional Kripke structure, this:
///   1. permits the existence of infinite sets of states (path depth),
///   2. hands every worker its own successor iterators, so that the provider may
///      order successors differently per thread (swarming), and
///   3. may return a reduced successor set (partial-order reduction) that a caller
///      can widen on demand with [SuccIter::fire_all].
///
/// States must be cheap to clone: the shared element store keeps one copy per
/// distinct state for the whole run.
pub trait KripkeStructure: Sync {
    type State: Clone + Eq + Hash + Send + Sync + Debug;
    type Successors: SuccIter + Iterator<Item = Self::State>;

    /// Return the initial state handed to worker `tid`.
    fn initial(&self, tid: usize) -> Result<Self::State, ProviderError>;

    /// Return every initial state worker `tid` must explore, in the order it
    /// should explore them.
    ///
    /// The default is the single state returned by [KripkeStructure::initial].
    fn initials(&self, tid: usize) -> Result<Vec<Self::State>, ProviderError> {
        Ok(vec![self.initial(tid)?])
    }

    /// Return an iterator over the successors of `state`, for use by worker `tid`.
    fn successors(&self, state: &Self::State, tid: usize) -> Self::Successors;

    /// Give an exhausted (or abandoned) iterator back, so that its allocations can
    /// be reused by the same worker.
    #[inline]
    fn recycle(&self, _succ: Self::Successors, _tid: usize) {}

    /// Render a state for counterexample traces.
    fn describe(&self, state: &Self::State) -> String {
        format!("{:?}", state)
    }
}

/// A successor iterator.
///
/// The `done()/advance()/current()` protocol of classic model checkers is
/// [Iterator::next] here: it returns the current successor and advances.
pub trait SuccIter: Iterator {
    /// Valuation of the atomic propositions in the source state.
    ///
    /// The product with a property automaton keeps an automaton edge only when
    /// its condition intersects this cube.
    fn condition(&self) -> Cube {
        Cube::TRUE
    }

    /// True iff the iterator currently yields a strict subset of the successors.
    fn is_reduced(&self) -> bool {
        false
    }

    /// Widen the remaining iteration to the full successor set.
    ///
    /// Successors already produced are never produced again. Returns true iff
    /// successors were added.
    fn fire_all(&mut self) -> bool {
        false
    }
}
