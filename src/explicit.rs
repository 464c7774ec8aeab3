//! An in-memory state space.
//!
//! [ExplicitKripke] stores a finite graph as adjacency lists over `u32` states.
//! It is the provider used by the tests and benchmarks, and a reference for how
//! a provider can support swarming, reduction and iterator recycling.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::automaton::{Cube, MAX_APS};
use crate::error::ProviderError;
use crate::kripke_structure::{KripkeStructure, SuccIter};
use crate::uf::MAX_WORKERS;

/// Per-thread scratch space: the shuffling generator and spare successor buffers.
#[derive(Default)]
struct ThreadSlot {
    rng: Option<StdRng>,
    spare: Vec<Vec<u32>>,
}

/// A finite, explicitly stored Kripke structure.
pub struct ExplicitKripke {
    succ: Vec<Vec<u32>>,
    /// Reduced successor sets, when partial-order reduction applies to a state.
    reduced: Vec<Option<Vec<u32>>>,
    labels: Vec<u64>,
    aps: usize,
    initials: Vec<u32>,
    seed: Option<u64>,
    slots: Vec<spin::Mutex<ThreadSlot>>,
}

impl ExplicitKripke {
    /// An edgeless structure over states `0..states`, with no initial state.
    pub fn new(states: usize) -> Self {
        Self {
            succ: vec![Vec::new(); states],
            reduced: vec![None; states],
            labels: vec![0; states],
            aps: 0,
            initials: Vec::new(),
            seed: None,
            slots: (0..MAX_WORKERS)
                .map(|_| spin::Mutex::new(ThreadSlot::default()))
                .collect(),
        }
    }

    /// Build a structure from an edge list, with state 0 initial.
    pub fn from_edges(states: usize, edges: &[(u32, u32)]) -> Self {
        let mut ks = Self::new(states);
        for &(src, dst) in edges {
            ks.add_edge(src, dst);
        }
        if states > 0 {
            ks.add_initial(0);
        }
        ks
    }

    pub fn num_states(&self) -> usize {
        self.succ.len()
    }

    pub fn add_edge(&mut self, src: u32, dst: u32) {
        assert!((dst as usize) < self.succ.len(), "unknown state {}", dst);
        self.succ[src as usize].push(dst);
    }

    pub fn add_initial(&mut self, s: u32) {
        assert!((s as usize) < self.succ.len(), "unknown state {}", s);
        self.initials.push(s);
    }

    pub fn edges(&self, s: u32) -> &[u32] {
        &self.succ[s as usize]
    }

    /// Declare `aps` atomic propositions, all false until [ExplicitKripke::label] is called.
    pub fn with_aps(mut self, aps: usize) -> Self {
        assert!(aps <= MAX_APS, "at most {} atomic propositions", MAX_APS);
        self.aps = aps;
        self
    }

    /// Make atomic proposition `ap` true in state `s`.
    pub fn label(&mut self, s: u32, ap: usize) {
        assert!(ap < self.aps, "atomic proposition {} not declared", ap);
        self.labels[s as usize] |= 1 << ap;
    }

    /// Shuffle successors differently for every worker (swarming).
    ///
    /// Worker `tid` draws from a generator seeded with `seed ^ tid`, so a run is
    /// reproducible for a fixed seed and thread count.
    pub fn swarm(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Restrict the default successors of `s` to `subset`, a subset of its edges.
    ///
    /// The remaining successors are only produced after [SuccIter::fire_all].
    pub fn reduce(&mut self, s: u32, subset: Vec<u32>) {
        let full = &self.succ[s as usize];
        assert!(
            subset.iter().all(|d| full.contains(d)),
            "reduced successors of {} must be a subset of its successors",
            s
        );
        self.reduced[s as usize] = Some(subset);
    }

    /// Reduce every state with more than `k` successors to its first `k` ones.
    pub fn reduce_to_first(&mut self, k: usize) {
        for s in 0..self.succ.len() {
            if self.succ[s].len() > k {
                self.reduced[s] = Some(self.succ[s][..k].to_vec());
            }
        }
    }

    fn buffer(&self, tid: usize) -> Vec<u32> {
        self.slots[tid].lock().spare.pop().unwrap_or_default()
    }

    fn shuffle(&self, tid: usize, items: &mut [u32]) {
        let Some(seed) = self.seed else {
            return;
        };
        let mut slot = self.slots[tid].lock();
        let rng = slot
            .rng
            .get_or_insert_with(|| StdRng::seed_from_u64(seed ^ tid as u64));
        items.shuffle(rng);
    }
}

impl KripkeStructure for ExplicitKripke {
    type State = u32;
    type Successors = ExplicitSucc;

    fn initial(&self, tid: usize) -> Result<u32, ProviderError> {
        if self.initials.is_empty() {
            return Err(ProviderError::NoInitialState { tid });
        }
        Ok(self.initials[tid % self.initials.len()])
    }

    fn initials(&self, tid: usize) -> Result<Vec<u32>, ProviderError> {
        if self.initials.is_empty() {
            return Err(ProviderError::NoInitialState { tid });
        }
        let mut all = self.initials.clone();
        let n = all.len();
        all.rotate_left(tid % n);
        Ok(all)
    }

    fn successors(&self, state: &u32, tid: usize) -> ExplicitSucc {
        let s = *state as usize;
        let mut buf = self.buffer(tid);
        buf.clear();
        let full = &self.succ[s];
        let len = match &self.reduced[s] {
            Some(subset) if subset.len() < full.len() => {
                buf.extend_from_slice(subset);
                self.shuffle(tid, &mut buf);
                let mut rest = full.clone();
                for d in subset {
                    if let Some(i) = rest.iter().position(|x| x == d) {
                        rest.swap_remove(i);
                    }
                }
                self.shuffle(tid, &mut rest);
                buf.extend_from_slice(&rest);
                subset.len()
            }
            _ => {
                buf.extend_from_slice(full);
                self.shuffle(tid, &mut buf);
                buf.len()
            }
        };
        ExplicitSucc {
            buf,
            pos: 0,
            len,
            condition: Cube::valuation(self.labels[s], self.aps),
        }
    }

    fn recycle(&self, succ: ExplicitSucc, tid: usize) {
        self.slots[tid].lock().spare.push(succ.buf);
    }
}

/// Successor iterator of [ExplicitKripke].
///
/// The buffer holds the reduced successors first, then the rest; `len` marks the
/// end of what may currently be produced.
#[derive(Debug)]
pub struct ExplicitSucc {
    buf: Vec<u32>,
    pos: usize,
    len: usize,
    condition: Cube,
}

impl Iterator for ExplicitSucc {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        if self.pos < self.len {
            self.pos += 1;
            Some(self.buf[self.pos - 1])
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.len - self.pos;
        (n, Some(n))
    }
}

impl SuccIter for ExplicitSucc {
    fn condition(&self) -> Cube {
        self.condition
    }

    fn is_reduced(&self) -> bool {
        self.len < self.buf.len()
    }

    fn fire_all(&mut self) -> bool {
        let widened = self.len < self.buf.len();
        self.len = self.buf.len();
        widened
    }
}
