//! Runs the swarmed algorithms: setup validation, one worker per thread, a
//! shared stop flag, and aggregation of what the workers report.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::automaton::Automaton;
use crate::bloemen::{Bloemen, Decomposition};
use crate::bloemen_ec::{BloemenEc, Emptiness};
use crate::bloemen_safety::{BloemenSafety, Safety};
use crate::cndfs::{Cndfs, ColorStore, Trace};
use crate::dfs::{dfs, DfsError, DfsReport};
use crate::error::{McError, ProviderError};
use crate::kripke_structure::KripkeStructure;
use crate::product::{Product, ProductState};
use crate::proviso::ProvisoKind;
use crate::uf::{UnionFind, MAX_WORKERS};

/// One worker thread of a swarmed algorithm.
pub trait Worker {
    /// Explore until done or until the shared stop flag is raised.
    fn run(&mut self);

    fn stats(&self) -> &WorkerStats;

    fn name(&self) -> &'static str;
}

/// Counters of a single worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub tid: usize,
    /// States this worker claimed first.
    pub states: usize,
    pub transitions: usize,
    /// Partitions this worker retired.
    pub sccs: usize,
    pub largest_scc: usize,
    /// States reopened for a full expansion before their partition retired.
    pub expansions: usize,
    pub max_depth: usize,
    pub walltime: Duration,
    /// The worker ran to completion rather than being stopped.
    pub finished: bool,
}

impl WorkerStats {
    pub fn new(tid: usize) -> Self {
        Self {
            tid,
            ..Self::default()
        }
    }
}

/// Selects the algorithm of [run].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Bloemen,
    BloemenSafety,
    BloemenEc,
    Cndfs,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Bloemen => "bloemen",
            Algorithm::BloemenSafety => "bloemen_safety",
            Algorithm::BloemenEc => "bloemen_ec",
            Algorithm::Cndfs => "cndfs",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McConfig {
    pub threads: usize,
    /// Seeds the randomized provisos.
    pub seed: u64,
    pub proviso: ProvisoKind,
    /// Stop the safety decomposition at the first deadlock.
    pub detect_deadlock: bool,
    /// Depth bound of the reduced DFS.
    pub max_depth: Option<usize>,
}

impl Default for McConfig {
    fn default() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WORKERS);
        Self {
            threads,
            seed: 0,
            proviso: ProvisoKind::default(),
            detect_deadlock: false,
            max_depth: None,
        }
    }
}

impl McConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_proviso(mut self, proviso: ProvisoKind) -> Self {
        self.proviso = proviso;
        self
    }

    pub fn with_deadlock_detection(mut self, detect: bool) -> Self {
        self.detect_deadlock = detect;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    fn validate(&self) -> Result<(), McError> {
        if self.threads == 0 {
            return Err(McError::ZeroThreads);
        }
        if self.threads > MAX_WORKERS {
            return Err(McError::TooManyThreads {
                requested: self.threads,
                max: MAX_WORKERS,
            });
        }
        Ok(())
    }
}

/// The outcome of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict<S> {
    /// The decomposition completed with this many SCCs.
    Sccs(usize),
    /// No accepting cycle.
    Empty,
    /// An accepting cycle exists. CNDFS reports one; the SCC-based check cannot.
    NonEmpty(Option<Trace<S>>),
    /// A reachable state has no successor.
    Deadlock(String),
    /// Stopped from outside before any worker could conclude.
    Interrupted,
}

impl<S> Verdict<S> {
    pub fn is_empty(&self) -> Option<bool> {
        match self {
            Verdict::Empty => Some(true),
            Verdict::NonEmpty(_) => Some(false),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct McResult<S> {
    pub verdict: Verdict<S>,
    pub workers: Vec<WorkerStats>,
    pub walltime: Duration,
    /// Distinct states in the shared store at the end of the run.
    pub unique_states: usize,
}

impl<S> McResult<S> {
    /// States claimed, summed over workers.
    pub fn states(&self) -> usize {
        self.workers.iter().map(|w| w.states).sum()
    }

    pub fn transitions(&self) -> usize {
        self.workers.iter().map(|w| w.transitions).sum()
    }

    /// Partitions retired; each one is retired by exactly one worker.
    pub fn sccs(&self) -> usize {
        self.workers.iter().map(|w| w.sccs).sum()
    }

    pub fn expansions(&self) -> usize {
        self.workers.iter().map(|w| w.expansions).sum()
    }

    pub fn largest_scc(&self) -> usize {
        self.workers.iter().map(|w| w.largest_scc).max().unwrap_or(0)
    }

    pub fn finished(&self) -> bool {
        self.workers.iter().any(|w| w.finished)
    }
}

/// The initial states of every worker, checked before any thread starts.
fn initials_per_worker<S, F>(threads: usize, initials: F) -> Result<Vec<Vec<S>>, McError>
where
    F: Fn(usize) -> Result<Vec<S>, ProviderError>,
{
    (0..threads)
        .map(|tid| {
            let inits = initials(tid)?;
            if inits.is_empty() {
                return Err(McError::Provider(ProviderError::NoInitialState { tid }));
            }
            Ok(inits)
        })
        .collect()
}

/// Run `work(tid)` on `threads` scoped threads and collect the results in
/// thread id order.
///
/// Each worker is built on its own thread, so workers need not be `Send`.
/// Threads are pinned to distinct cores when there are enough of them and the
/// platform supports it.
fn swarm<R, F>(threads: usize, work: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Sync,
{
    let cores = core_affinity::get_core_ids()
        .filter(|cores| cores.len() >= threads)
        .unwrap_or_default();
    thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                let work = &work;
                let core = cores.get(tid).copied();
                scope.spawn(move || {
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            debug!(tid, core = core.id, "could not pin worker");
                        }
                    }
                    work(tid)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(r) => r,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    })
}

fn log_start(algorithm: Algorithm, config: &McConfig) {
    info!(
        algorithm = algorithm.name(),
        threads = config.threads,
        "model checking started"
    );
}

fn log_finish<S>(algorithm: Algorithm, result: &McResult<S>) {
    let verdict = match &result.verdict {
        Verdict::Sccs(_) => "sccs",
        Verdict::Empty => "empty",
        Verdict::NonEmpty(_) => "non-empty",
        Verdict::Deadlock(_) => "deadlock",
        Verdict::Interrupted => "interrupted",
    };
    info!(
        algorithm = algorithm.name(),
        verdict,
        states = result.states(),
        unique_states = result.unique_states,
        transitions = result.transitions(),
        sccs = result.sccs(),
        walltime_ms = result.walltime.as_millis() as u64,
        "model checking finished"
    );
}

/// Swarmed SCC decomposition of the reachable part of `kripke`.
pub fn decompose<K: KripkeStructure>(
    kripke: &K,
    config: &McConfig,
) -> Result<McResult<K::State>, McError> {
    run_decompose(kripke, config, &AtomicBool::new(false))
}

/// Swarmed SCC decomposition under partial-order reduction, fully expanding
/// one state of every cyclic partition none of whose states was.
pub fn decompose_safety<K: KripkeStructure>(
    kripke: &K,
    config: &McConfig,
) -> Result<McResult<K::State>, McError> {
    run_safety(kripke, config, &AtomicBool::new(false))
}

/// Swarmed nested DFS: is the product of `kripke` and `aut` free of accepting
/// cycles? A non-empty verdict carries a counterexample.
pub fn check_emptiness<K: KripkeStructure>(
    kripke: &K,
    aut: &Automaton,
    config: &McConfig,
) -> Result<McResult<K::State>, McError> {
    run_cndfs(kripke, aut, config, &AtomicBool::new(false))
}

/// The SCC-based emptiness check. Non-empty verdicts carry no counterexample.
pub fn check_emptiness_ec<K: KripkeStructure>(
    kripke: &K,
    aut: &Automaton,
    config: &McConfig,
) -> Result<McResult<K::State>, McError> {
    run_ec(kripke, aut, config, &AtomicBool::new(false))
}

/// Run `algorithm` until it concludes or `stop` is raised.
///
/// `aut` is only used by the emptiness checks. The run raises `stop` itself
/// once a worker concludes, which stops the others.
pub fn run<K: KripkeStructure>(
    kripke: &K,
    aut: &Automaton,
    algorithm: Algorithm,
    config: &McConfig,
    stop: &AtomicBool,
) -> Result<McResult<K::State>, McError> {
    match algorithm {
        Algorithm::Bloemen => run_decompose(kripke, config, stop),
        Algorithm::BloemenSafety => run_safety(kripke, config, stop),
        Algorithm::BloemenEc => run_ec(kripke, aut, config, stop),
        Algorithm::Cndfs => run_cndfs(kripke, aut, config, stop),
    }
}

/// Single-threaded reduced exploration of `kripke` with the configured proviso.
pub fn explore_reduced<K: KripkeStructure>(
    kripke: &K,
    config: &McConfig,
) -> Result<DfsReport<K::State>, DfsError> {
    let mut proviso = config.proviso.build(config.seed);
    dfs(kripke, &mut *proviso, config.max_depth)
}

fn run_decompose<K: KripkeStructure>(
    kripke: &K,
    config: &McConfig,
    stop: &AtomicBool,
) -> Result<McResult<K::State>, McError> {
    config.validate()?;
    let initials = initials_per_worker(config.threads, |tid| kripke.initials(tid))?;
    log_start(Algorithm::Bloemen, config);
    let start = Instant::now();
    let uf = UnionFind::new();
    let workers = swarm(config.threads, |tid| {
        let policy = Decomposition::new(kripke, tid);
        let mut w = Bloemen::new(policy, &uf, tid, stop, initials[tid].clone());
        w.run();
        w.stats().clone()
    });
    let mut result = McResult {
        verdict: Verdict::Interrupted,
        workers,
        walltime: start.elapsed(),
        unique_states: uf.len(),
    };
    if result.finished() {
        result.verdict = Verdict::Sccs(result.sccs());
    }
    log_finish(Algorithm::Bloemen, &result);
    Ok(result)
}

fn run_safety<K: KripkeStructure>(
    kripke: &K,
    config: &McConfig,
    stop: &AtomicBool,
) -> Result<McResult<K::State>, McError> {
    config.validate()?;
    let initials = initials_per_worker(config.threads, |tid| kripke.initials(tid))?;
    log_start(Algorithm::BloemenSafety, config);
    let start = Instant::now();
    let uf = UnionFind::new();
    let detect = config.detect_deadlock;
    let outcomes = swarm(config.threads, |tid| {
        let policy = Safety::new(kripke, tid, detect);
        let mut w = BloemenSafety::new(policy, &uf, tid, stop, initials[tid].clone());
        w.run();
        let deadlock = w.policy().deadlock().map(|s| kripke.describe(s));
        (w.stats().clone(), deadlock)
    });
    let (workers, deadlocks): (Vec<_>, Vec<_>) = outcomes.into_iter().unzip();
    let mut result = McResult {
        verdict: Verdict::Interrupted,
        workers,
        walltime: start.elapsed(),
        unique_states: uf.len(),
    };
    if let Some(d) = deadlocks.into_iter().flatten().next() {
        result.verdict = Verdict::Deadlock(d);
    } else if result.finished() {
        result.verdict = Verdict::Sccs(result.sccs());
    }
    log_finish(Algorithm::BloemenSafety, &result);
    Ok(result)
}

fn run_ec<K: KripkeStructure>(
    kripke: &K,
    aut: &Automaton,
    config: &McConfig,
    stop: &AtomicBool,
) -> Result<McResult<K::State>, McError> {
    config.validate()?;
    aut.validate()?;
    let product = Product::new(kripke, aut);
    let initials = initials_per_worker(config.threads, |tid| product.initials(tid))?;
    log_start(Algorithm::BloemenEc, config);
    let start = Instant::now();
    let uf = UnionFind::<ProductState<K::State>>::new();
    let outcomes = swarm(config.threads, |tid| {
        let policy = Emptiness::new(product, tid);
        let mut w = BloemenEc::new(policy, &uf, tid, stop, initials[tid].clone());
        w.run();
        (w.stats().clone(), w.policy().accepting().is_some())
    });
    let (workers, accepting): (Vec<_>, Vec<_>) = outcomes.into_iter().unzip();
    let mut result = McResult {
        verdict: Verdict::Interrupted,
        workers,
        walltime: start.elapsed(),
        unique_states: uf.len(),
    };
    if accepting.into_iter().any(|a| a) {
        result.verdict = Verdict::NonEmpty(None);
    } else if result.finished() {
        result.verdict = Verdict::Empty;
    }
    log_finish(Algorithm::BloemenEc, &result);
    Ok(result)
}

fn run_cndfs<K: KripkeStructure>(
    kripke: &K,
    aut: &Automaton,
    config: &McConfig,
    stop: &AtomicBool,
) -> Result<McResult<K::State>, McError> {
    config.validate()?;
    aut.validate()?;
    let product = Product::new(kripke, aut);
    let initials = initials_per_worker(config.threads, |tid| product.initials(tid))?;
    log_start(Algorithm::Cndfs, config);
    let start = Instant::now();
    let store = ColorStore::<K::State>::new();
    let outcomes = swarm(config.threads, |tid| {
        let mut w = Cndfs::new(product, &store, tid, stop, initials[tid].clone());
        w.run();
        (w.stats().clone(), w.into_trace())
    });
    let (workers, traces): (Vec<_>, Vec<_>) = outcomes.into_iter().unzip();
    let mut result = McResult {
        verdict: Verdict::Interrupted,
        workers,
        walltime: start.elapsed(),
        unique_states: store.len(),
    };
    if let Some(trace) = traces.into_iter().flatten().next() {
        result.verdict = Verdict::NonEmpty(Some(trace));
    } else if result.finished() {
        result.verdict = Verdict::Empty;
    }
    log_finish(Algorithm::Cndfs, &result);
    Ok(result)
}

/// Raise `stop` after `timeout`, unless the run concluded first.
///
/// Intended to run on its own thread next to [run].
pub fn stop_after(stop: &AtomicBool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            stop.store(true, Ordering::Relaxed);
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
}
