//! A single-threaded depth-first search over reduced successor sets, driven by a
//! [Proviso].

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::kripke_structure::{KripkeStructure, SuccIter};
use crate::proviso::Proviso;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DfsError {
    #[error("depth exceeded max depth {0}")]
    MaxDepthExceeded(usize),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// What a reduced search saw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfsReport<S> {
    pub states: usize,
    pub transitions: usize,
    /// Reduced states the proviso forced to full expansion.
    pub expansions: usize,
    pub max_depth: usize,
    /// Some edge closed onto the DFS stack.
    pub has_cycle: bool,
    /// The first state found with no successor at all.
    pub deadlock: Option<S>,
}

impl<S> Default for DfsReport<S> {
    fn default() -> Self {
        Self {
            states: 0,
            transitions: 0,
            expansions: 0,
            max_depth: 0,
            has_cycle: false,
            deadlock: None,
        }
    }
}

/// Store the stack for DFS state.
///
/// This separates the successor iterators from the state ids, to try to get better cache locality
/// when unwinding.
struct PathState<I> {
    iters: Vec<I>,
    items: Vec<usize>,
    /// Whether the iterator at the same depth produced anything yet.
    produced: Vec<bool>,
}

impl<I> PathState<I> {
    fn new() -> Self {
        Self {
            iters: Vec::new(),
            items: Vec::new(),
            produced: Vec::new(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    fn push(&mut self, id: usize, iter: I) {
        self.iters.push(iter);
        self.items.push(id);
        self.produced.push(false);
    }

    #[inline]
    fn pop(&mut self) -> Option<(usize, I)> {
        self.produced.pop();
        Some((self.items.pop()?, self.iters.pop()?))
    }
}

struct Search<'a, K: KripkeStructure> {
    kripke: &'a K,
    proviso: &'a mut dyn Proviso,
    max_depth: Option<usize>,
    seen: FxHashMap<K::State, usize>,
    states: Vec<K::State>,
    on_stack: Vec<bool>,
    path: PathState<K::Successors>,
    report: DfsReport<K::State>,
}

impl<K: KripkeStructure> Search<'_, K> {
    fn push(&mut self, state: K::State) -> Result<(), DfsError> {
        if let Some(d) = self.max_depth {
            if self.path.len() >= d {
                return Err(DfsError::MaxDepthExceeded(d));
            }
        }
        let id = self.states.len();
        self.seen.insert(state.clone(), id);
        let mut iter = self.kripke.successors(&state, 0);
        self.states.push(state);
        self.on_stack.push(true);
        let degree = iter.size_hint().0;
        if self.proviso.on_push(id, !iter.is_reduced(), degree) && iter.fire_all() {
            trace!(id, "expanded on push");
            self.report.expansions += 1;
        }
        self.path.push(id, iter);
        self.report.states += 1;
        self.report.max_depth = self.report.max_depth.max(self.path.len());
        Ok(())
    }

    fn run(&mut self, init: K::State) -> Result<(), DfsError> {
        if self.seen.contains_key(&init) {
            return Ok(());
        }
        self.push(init)?;
        while let Some(&top) = self.path.items.last() {
            let Some(iter) = self.path.iters.last_mut() else {
                break;
            };
            match iter.next() {
                Some(succ) => {
                    self.report.transitions += 1;
                    if let Some(flag) = self.path.produced.last_mut() {
                        *flag = true;
                    }
                    match self.seen.get(&succ) {
                        Some(&id) => {
                            if self.on_stack[id] {
                                self.report.has_cycle = true;
                            }
                            if self.proviso.on_closing_edge(top, id) && iter.fire_all() {
                                trace!(src = top, dst = id, "expanded on closing edge");
                                self.report.expansions += 1;
                            }
                        }
                        None => self.push(succ)?,
                    }
                }
                None => {
                    let produced = self.path.produced.last().copied().unwrap_or(true);
                    // A reduced set may be empty while the full one is not.
                    if !produced && iter.fire_all() {
                        continue;
                    }
                    if self.proviso.on_pop(top) {
                        if iter.fire_all() {
                            trace!(id = top, "expanded on pop");
                            self.report.expansions += 1;
                        }
                        // The proviso is asked again once the widened set runs out.
                        continue;
                    }
                    if !produced {
                        if self.report.deadlock.is_none() {
                            debug!(state = ?self.states[top], "deadlock");
                            self.report.deadlock = Some(self.states[top].clone());
                        }
                    }
                    if let Some((id, iter)) = self.path.pop() {
                        self.on_stack[id] = false;
                        self.kripke.recycle(iter, 0);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Run a depth-first search over the reduced successor sets of `kripke`,
/// letting `proviso` decide which states to fully expand.
///
/// Explores from every initial state of worker 0.
pub fn dfs<K>(
    kripke: &K,
    proviso: &mut dyn Proviso,
    max_depth: Option<usize>,
) -> Result<DfsReport<K::State>, DfsError>
where
    K: KripkeStructure,
{
    let name = proviso.name();
    let mut search = Search {
        kripke,
        proviso,
        max_depth,
        seen: FxHashMap::default(),
        states: Vec::new(),
        on_stack: Vec::new(),
        path: PathState::new(),
        report: DfsReport::default(),
    };
    for init in kripke.initials(0)? {
        search.run(init)?;
    }
    debug!(
        proviso = name,
        states = search.report.states,
        transitions = search.report.transitions,
        expansions = search.report.expansions,
        "reduced dfs done"
    );
    Ok(search.report)
}
