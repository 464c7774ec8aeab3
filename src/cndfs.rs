//! Swarmed nested depth-first search (CNDFS) for Büchi emptiness.
//!
//! Every worker runs a blue DFS over the product. When the blue search backtracks
//! over an accepting edge, a red DFS from the edge's target looks for a state on
//! the worker's own blue stack (cyan), which closes an accepting cycle.
//!
//! Workers share one color record per product state:
//!
//! - `blue`: some worker fully explored the state,
//! - `red`: some red search through the state terminated without finding a cycle,
//! - `cyan`: one bit per worker, set while the state is on that worker's blue stack,
//! - `in_rp`: one bit per worker, set while the state is on that worker's current red search.
//!
//! A red search only marks its states red after every accepting target it met
//! was marked red by its own red search, so two workers never disagree on a state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::debug;

use crate::kripke_structure::KripkeStructure;
use crate::mc::{Worker, WorkerStats};
use crate::product::{Product, ProductState, ProductSucc};
use crate::store::{NodeId, SharedStore};
use crate::uf::MAX_WORKERS;

/// Shared colors of one product state.
pub struct ColorRecord<S> {
    state: ProductState<S>,
    blue: AtomicBool,
    red: AtomicBool,
    cyan: AtomicU64,
    in_rp: AtomicU64,
}

impl<S> ColorRecord<S> {
    fn new(state: ProductState<S>) -> Self {
        Self {
            state,
            blue: AtomicBool::new(false),
            red: AtomicBool::new(false),
            cyan: AtomicU64::new(0),
            in_rp: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> &ProductState<S> {
        &self.state
    }

    pub fn is_blue(&self) -> bool {
        self.blue.load(Ordering::SeqCst)
    }

    pub fn is_red(&self) -> bool {
        self.red.load(Ordering::SeqCst)
    }

    #[inline]
    fn is_cyan(&self, tid: usize) -> bool {
        self.cyan.load(Ordering::SeqCst) & (1 << tid) != 0
    }

    #[inline]
    fn in_rp(&self, tid: usize) -> bool {
        self.in_rp.load(Ordering::SeqCst) & (1 << tid) != 0
    }
}

/// The visited set shared by all CNDFS workers.
pub type ColorStore<S> = SharedStore<ProductState<S>, ColorRecord<S>>;

/// A lasso-shaped counterexample: `prefix` leads to `cycle`, whose last state
/// has an edge back to its first one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace<S> {
    pub prefix: Vec<ProductState<S>>,
    pub cycle: Vec<ProductState<S>>,
}

impl<S> Trace<S> {
    /// Render the trace with the provider's state descriptions.
    pub fn render<K>(&self, kripke: &K) -> String
    where
        K: KripkeStructure<State = S>,
    {
        let mut out = String::new();
        let describe = |s: &ProductState<S>| format!("{} * q{}", kripke.describe(&s.kripke), s.aut);
        // Writing to a String never fails.
        let _ = write_lasso(&mut out, &self.prefix, &self.cycle, describe);
        out
    }
}

impl<S: fmt::Debug> fmt::Display for Trace<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_lasso(f, &self.prefix, &self.cycle, |s| s.to_string())
    }
}

fn write_lasso<W, S, D>(out: &mut W, prefix: &[S], cycle: &[S], describe: D) -> fmt::Result
where
    W: fmt::Write,
    D: Fn(&S) -> String,
{
    writeln!(out, "Prefix:")?;
    for s in prefix {
        writeln!(out, "  {}", describe(s))?;
    }
    writeln!(out, "Cycle:")?;
    for s in cycle {
        writeln!(out, "  {}", describe(s))?;
    }
    Ok(())
}

struct BlueFrame<I> {
    id: NodeId,
    from_accepting: bool,
    iter: I,
}

struct RedFrame<I> {
    id: NodeId,
    iter: I,
}

enum Red {
    /// The red search found nothing and its states are now red.
    Exhausted,
    /// The red search reached a cyan state.
    Cycle,
    Stopped,
}

/// One CNDFS worker.
pub struct Cndfs<'a, K: KripkeStructure> {
    product: Product<'a, K>,
    store: &'a ColorStore<K::State>,
    stop: &'a AtomicBool,
    initials: Vec<ProductState<K::State>>,
    blue: Vec<BlueFrame<ProductSucc<'a, K>>>,
    red: Vec<RedFrame<ProductSucc<'a, K>>>,
    /// States visited by the current red search.
    rp: Vec<NodeId>,
    /// Targets of accepting edges met by the current red search.
    rp_acc: Vec<NodeId>,
    trace: Option<Trace<K::State>>,
    stats: WorkerStats,
}

impl<'a, K: KripkeStructure> Cndfs<'a, K> {
    pub fn new(
        product: Product<'a, K>,
        store: &'a ColorStore<K::State>,
        tid: usize,
        stop: &'a AtomicBool,
        initials: Vec<ProductState<K::State>>,
    ) -> Self {
        assert!(tid < MAX_WORKERS, "worker id {} out of range", tid);
        Self {
            product,
            store,
            stop,
            initials,
            blue: Vec::new(),
            red: Vec::new(),
            rp: Vec::new(),
            rp_acc: Vec::new(),
            trace: None,
            stats: WorkerStats::new(tid),
        }
    }

    /// Whether the product language is empty, once the worker finished.
    ///
    /// None if the worker was stopped before it could tell.
    pub fn is_empty(&self) -> Option<bool> {
        if self.trace.is_some() {
            Some(false)
        } else if self.stats.finished {
            Some(true)
        } else {
            None
        }
    }

    pub fn trace(&self) -> Option<&Trace<K::State>> {
        self.trace.as_ref()
    }

    pub fn into_trace(self) -> Option<Trace<K::State>> {
        self.trace
    }

    #[inline]
    fn tid(&self) -> usize {
        self.stats.tid
    }

    #[inline]
    fn bit(&self) -> u64 {
        1 << self.stats.tid
    }

    #[inline]
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn insert(&self, state: ProductState<K::State>) -> NodeId {
        self.store
            .insert_with(state, |_, s| ColorRecord::new(s.clone()))
            .0
    }

    /// Push `id` on the blue stack unless it is blue, red, or already cyan for us.
    fn push_blue(&mut self, id: NodeId, from_accepting: bool) -> bool {
        let c = self.store.get(id);
        if c.is_blue() || c.is_red() || c.is_cyan(self.tid()) {
            return false;
        }
        c.cyan.fetch_or(self.bit(), Ordering::SeqCst);
        let iter = self.product.successors(&c.state, self.tid());
        self.blue.push(BlueFrame {
            id,
            from_accepting,
            iter,
        });
        self.stats.states += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.blue.len());
        true
    }

    fn pop_blue(&mut self) -> Option<BlueFrame<ProductSucc<'a, K>>> {
        let frame = self.blue.pop()?;
        let c = self.store.get(frame.id);
        c.blue.store(true, Ordering::SeqCst);
        c.cyan.fetch_and(!self.bit(), Ordering::SeqCst);
        Some(frame)
    }

    /// Blue search from `init`; false if the worker must stop.
    fn blue_dfs(&mut self, init: ProductState<K::State>) -> bool {
        let id = self.insert(init);
        self.push_blue(id, false);
        loop {
            if self.stopped() {
                return false;
            }
            let Some(top) = self.blue.last_mut() else {
                return true;
            };
            match top.iter.next() {
                Some((succ, acc)) => {
                    self.stats.transitions += 1;
                    let id = self.insert(succ);
                    if self.push_blue(id, acc) || !acc {
                        continue;
                    }
                    let c = self.store.get(id);
                    if c.is_cyan(self.tid()) {
                        self.report_blue_cycle(id);
                        return false;
                    }
                    if !c.is_red() && !self.red_dfs(id) {
                        return false;
                    }
                }
                None => {
                    let Some(frame) = self.pop_blue() else {
                        return true;
                    };
                    self.product.recycle(frame.iter, self.tid());
                    if frame.from_accepting && !self.red_dfs(frame.id) {
                        return false;
                    }
                }
            }
        }
    }

    fn push_red(&mut self, id: NodeId) {
        let c = self.store.get(id);
        c.in_rp.fetch_or(self.bit(), Ordering::SeqCst);
        self.rp.push(id);
        let iter = self.product.successors(&c.state, self.tid());
        self.red.push(RedFrame { id, iter });
    }

    /// Red search from `seed`, the target of an accepting edge leaving the top of
    /// the blue stack. False if the worker must stop.
    fn red_dfs(&mut self, seed: NodeId) -> bool {
        match self.red_search(seed) {
            Red::Exhausted => true,
            Red::Cycle | Red::Stopped => false,
        }
    }

    fn red_search(&mut self, seed: NodeId) -> Red {
        self.rp.clear();
        self.rp_acc.clear();
        self.push_red(seed);
        loop {
            if self.stopped() {
                self.abandon_red();
                return Red::Stopped;
            }
            let Some(top) = self.red.last_mut() else {
                break;
            };
            match top.iter.next() {
                Some((succ, acc)) => {
                    self.stats.transitions += 1;
                    let id = self.insert(succ);
                    let c = self.store.get(id);
                    if c.is_cyan(self.tid()) {
                        self.report_red_cycle(id);
                        self.abandon_red();
                        return Red::Cycle;
                    }
                    if c.is_red() {
                        continue;
                    }
                    if acc && id != seed {
                        self.rp_acc.push(id);
                    }
                    if !c.in_rp(self.tid()) {
                        self.push_red(id);
                    }
                }
                None => {
                    if let Some(frame) = self.red.pop() {
                        self.product.recycle(frame.iter, self.tid());
                    }
                }
            }
        }
        self.post_red()
    }

    /// Wait for the accepting targets of the red search to turn red, then mark
    /// every state of the search red.
    fn post_red(&mut self) -> Red {
        let waiting = std::mem::take(&mut self.rp_acc);
        for id in waiting {
            let c = self.store.get(id);
            while !c.is_red() {
                if self.stop.load(Ordering::Relaxed) {
                    self.clear_in_rp();
                    return Red::Stopped;
                }
                std::hint::spin_loop();
            }
        }
        for &id in &self.rp {
            self.store.get(id).red.store(true, Ordering::SeqCst);
        }
        self.clear_in_rp();
        Red::Exhausted
    }

    fn clear_in_rp(&mut self) {
        let mask = !self.bit();
        for id in self.rp.drain(..) {
            self.store.get(id).in_rp.fetch_and(mask, Ordering::SeqCst);
        }
        self.rp_acc.clear();
    }

    fn abandon_red(&mut self) {
        while let Some(frame) = self.red.pop() {
            self.product.recycle(frame.iter, self.tid());
        }
        self.clear_in_rp();
    }

    fn blue_states(&self) -> Vec<ProductState<K::State>> {
        self.blue
            .iter()
            .map(|f| self.store.get(f.id).state.clone())
            .collect()
    }

    /// The accepting edge from the top of the blue stack reaches `target`, which
    /// is on the blue stack.
    fn report_blue_cycle(&mut self, target: NodeId) {
        let Some(at) = self.blue.iter().position(|f| f.id == target) else {
            return self.report(None);
        };
        let mut prefix = self.blue_states();
        let cycle = prefix.split_off(at);
        self.report(Some(Trace { prefix, cycle }));
    }

    /// The red search reached `cyan` from the top of the red stack.
    fn report_red_cycle(&mut self, cyan: NodeId) {
        let Some(at) = self.blue.iter().position(|f| f.id == cyan) else {
            return self.report(None);
        };
        let mut prefix = self.blue_states();
        let mut cycle = prefix.split_off(at);
        cycle.extend(self.red.iter().map(|f| self.store.get(f.id).state.clone()));
        self.report(Some(Trace { prefix, cycle }));
    }

    fn report(&mut self, trace: Option<Trace<K::State>>) {
        self.stop.store(true, Ordering::Relaxed);
        match trace {
            Some(trace) => {
                debug!(
                    tid = self.tid(),
                    prefix = trace.prefix.len(),
                    cycle = trace.cycle.len(),
                    "accepting cycle"
                );
                self.trace = Some(trace);
            }
            None => debug!(tid = self.tid(), "accepting cycle, no trace"),
        }
    }

    fn release_iterators(&mut self) {
        while let Some(frame) = self.blue.pop() {
            self.store
                .get(frame.id)
                .cyan
                .fetch_and(!self.bit(), Ordering::SeqCst);
            self.product.recycle(frame.iter, self.tid());
        }
        self.abandon_red();
    }
}

impl<K: KripkeStructure> Worker for Cndfs<'_, K> {
    fn run(&mut self) {
        let start = Instant::now();
        let initials = std::mem::take(&mut self.initials);
        let mut complete = true;
        for init in initials {
            if !self.blue_dfs(init) {
                complete = false;
                break;
            }
        }
        self.release_iterators();
        self.stats.walltime = start.elapsed();
        self.stats.finished = complete;
        if complete {
            // Every reachable product state is blue: the language is empty.
            self.stop.store(true, Ordering::Relaxed);
        }
        debug!(
            worker = "cndfs",
            tid = self.tid(),
            states = self.stats.states,
            transitions = self.stats.transitions,
            empty = ?self.is_empty(),
            "worker done"
        );
    }

    fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    fn name(&self) -> &'static str {
        "cndfs"
    }
}
