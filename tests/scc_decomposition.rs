use std::sync::atomic::AtomicBool;
use std::thread;

use kripke_swarm::bloemen::{Bloemen, Decomposition};
use kripke_swarm::bloemen_safety::{BloemenSafety, Safety};
use kripke_swarm::explicit::{ExplicitKripke, ExplicitSucc};
use kripke_swarm::mc::{self, McConfig, Verdict, Worker};
use kripke_swarm::uf::UnionFind;
use kripke_swarm::{KripkeStructure, ProviderError};
use proptest::prelude::*;
use rand::Rng;

mod common;
use common::{random_graph, tarjan};

/// Run `threads` plain decomposition workers directly over a shared union-find.
fn decompose_into(ks: &ExplicitKripke, threads: usize) -> UnionFind<u32> {
    let uf = UnionFind::new();
    let stop = AtomicBool::new(false);
    thread::scope(|s| {
        for tid in 0..threads {
            let uf = &uf;
            let stop = &stop;
            s.spawn(move || {
                let initials = ks.initials(tid).unwrap();
                let mut w = Bloemen::new(Decomposition::new(ks, tid), uf, tid, stop, initials);
                w.run();
            });
        }
    });
    uf
}

/// Run `threads` safety workers directly over a shared union-find, returning
/// it with the number of partitions they retired.
fn decompose_safety_into(ks: &ExplicitKripke, threads: usize) -> (UnionFind<u32>, usize) {
    let uf = UnionFind::new();
    let stop = AtomicBool::new(false);
    let sccs = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                let uf = &uf;
                let stop = &stop;
                s.spawn(move || {
                    let initials = ks.initials(tid).unwrap();
                    let mut w = BloemenSafety::new(Safety::new(ks, tid, false), uf, tid, stop, initials);
                    w.run();
                    w.stats().sccs
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    (uf, sccs)
}

/// The graph a safety run actually explored: reduced edges, except for the
/// states it fully expanded.
fn explored_graph(ks: &ExplicitKripke, reduced: &[Vec<u32>], uf: &UnionFind<u32>) -> ExplicitKripke {
    let n = ks.num_states();
    let mut explored = ExplicitKripke::new(n);
    explored.add_initial(0);
    for s in 0..n as u32 {
        let forced = uf.lookup(&s).map_or(false, |id| uf.is_forced(id));
        let edges = if forced { ks.edges(s) } else { &reduced[s as usize][..] };
        for &d in edges {
            explored.add_edge(s, d);
        }
    }
    explored
}

#[test]
fn two_state_cycle_is_one_scc() {
    let ks = ExplicitKripke::from_edges(2, &[(0, 1), (1, 0)]);
    let result = mc::decompose(&ks, &McConfig::default().with_threads(1)).unwrap();
    assert_eq!(result.verdict, Verdict::Sccs(1));
    assert_eq!(result.states(), 2);
    assert_eq!(result.transitions(), 2);
    assert_eq!(result.unique_states, 2);
    assert_eq!(result.largest_scc(), 2);
    assert!(result.workers[0].finished);
}

#[test]
fn chain_of_cycles() {
    // {0,1} -> {2} -> {3,4,5} -> 6
    let ks = ExplicitKripke::from_edges(
        7,
        &[(0, 1), (1, 0), (1, 2), (2, 3), (3, 4), (4, 5), (5, 3), (5, 6)],
    );
    for threads in [1, 2, 4] {
        let result = mc::decompose(&ks, &McConfig::default().with_threads(threads)).unwrap();
        assert_eq!(result.verdict, Verdict::Sccs(4));
        assert_eq!(result.unique_states, 7);
        assert_eq!(result.largest_scc(), 3);
    }
}

#[test]
fn rejects_bad_setup() {
    let ks = ExplicitKripke::from_edges(1, &[]);
    assert_eq!(
        mc::decompose(&ks, &McConfig::default().with_threads(0)).unwrap_err(),
        kripke_swarm::McError::ZeroThreads
    );
    assert_eq!(
        mc::decompose(&ks, &McConfig::default().with_threads(65)).unwrap_err(),
        kripke_swarm::McError::TooManyThreads {
            requested: 65,
            max: 64
        }
    );
    let empty = ExplicitKripke::new(1);
    assert_eq!(
        mc::decompose(&empty, &McConfig::default().with_threads(2)).unwrap_err(),
        kripke_swarm::McError::Provider(ProviderError::NoInitialState { tid: 0 })
    );
}

/// Delays every successor step by a random amount, to shake out interleavings.
struct Jittery(ExplicitKripke);

impl KripkeStructure for Jittery {
    type State = u32;
    type Successors = ExplicitSucc;

    fn initial(&self, tid: usize) -> Result<u32, ProviderError> {
        self.0.initial(tid)
    }

    fn initials(&self, tid: usize) -> Result<Vec<u32>, ProviderError> {
        self.0.initials(tid)
    }

    fn successors(&self, state: &u32, tid: usize) -> ExplicitSucc {
        let spins = rand::thread_rng().gen_range(0..2000);
        for _ in 0..spins {
            std::hint::spin_loop();
        }
        if spins % 7 == 0 {
            thread::yield_now();
        }
        self.0.successors(state, tid)
    }

    fn recycle(&self, succ: ExplicitSucc, tid: usize) {
        self.0.recycle(succ, tid)
    }
}

#[test]
fn disjoint_self_loops_under_random_delays() {
    let mut inner = ExplicitKripke::from_edges(3, &[(0, 0), (1, 1), (2, 2)]);
    inner.add_initial(1);
    inner.add_initial(2);
    let ks = Jittery(inner);
    let config = McConfig::default().with_threads(2);
    for _ in 0..100 {
        let result = mc::decompose(&ks, &config).unwrap();
        assert_eq!(result.verdict, Verdict::Sccs(3));
        assert_eq!(result.unique_states, 3);
    }
}

#[test]
fn swarmed_workers_agree_on_a_dense_graph() {
    let n = 200u32;
    let mut edges = Vec::new();
    for s in 0..n {
        edges.push((s, (s + 1) % n));
        edges.push((s, (s * 7 + 3) % n));
        if s % 10 == 0 {
            edges.push((s, (s + 50) % n));
        }
    }
    let ks = ExplicitKripke::from_edges(n as usize, &edges).swarm(99);
    let (count, _) = tarjan(&ks);
    for threads in [1, 3, 8] {
        let result = mc::decompose(&ks, &McConfig::default().with_threads(threads)).unwrap();
        assert_eq!(result.verdict, Verdict::Sccs(count));
        assert_eq!(result.unique_states, n as usize);
    }
}

#[test]
fn safety_variant_finds_hidden_deadlock() {
    // 0 and 1 only follow each other in their reduced sets; 2 has no successor.
    let mut ks = ExplicitKripke::from_edges(3, &[(0, 1), (0, 2), (1, 0), (1, 2)]);
    ks.reduce(0, vec![1]);
    ks.reduce(1, vec![0]);

    let config = McConfig::default().with_threads(1);
    let result = mc::decompose_safety(&ks, &config).unwrap();
    assert_eq!(result.verdict, Verdict::Sccs(2));
    assert_eq!(result.unique_states, 3);
    assert_eq!(result.expansions(), 1);

    let result = mc::decompose_safety(&ks, &config.with_deadlock_detection(true)).unwrap();
    assert_eq!(result.verdict, Verdict::Deadlock("2".to_string()));
}

#[test]
fn safety_expansion_closing_back_into_its_partition_merges() {
    // {0, 1} cycles on reduced sets; expanding either reaches a state leading back.
    let mut ks = ExplicitKripke::from_edges(4, &[(0, 1), (0, 2), (1, 0), (1, 3), (2, 0), (3, 1)]);
    ks.reduce(0, vec![1]);
    ks.reduce(1, vec![0]);
    for threads in [1, 2, 4] {
        let result = mc::decompose_safety(&ks, &McConfig::default().with_threads(threads)).unwrap();
        assert_eq!(result.verdict, Verdict::Sccs(1));
        assert_eq!(result.unique_states, 3);
        assert_eq!(result.expansions(), 1);
        assert_eq!(result.largest_scc(), 3);
    }
}

#[test]
fn safety_variant_widens_empty_reduced_sets() {
    let mut ks = ExplicitKripke::from_edges(3, &[(0, 1), (0, 2), (2, 0)]);
    ks.reduce(0, Vec::new());
    let config = McConfig::default()
        .with_threads(2)
        .with_deadlock_detection(true);
    let result = mc::decompose_safety(&ks, &config).unwrap();
    assert_eq!(result.verdict, Verdict::Deadlock("1".to_string()));

    let mut ks = ExplicitKripke::from_edges(2, &[(0, 1), (1, 0)]);
    ks.reduce(0, Vec::new());
    let result = mc::decompose_safety(&ks, &config).unwrap();
    assert_eq!(result.verdict, Verdict::Sccs(1));
}

#[test]
fn external_stop_interrupts() {
    let ks = ExplicitKripke::from_edges(2, &[(0, 1), (1, 0)]);
    let stop = AtomicBool::new(true);
    let aut = kripke_swarm::Automaton::universal();
    let result = mc::run(
        &ks,
        &aut,
        mc::Algorithm::Bloemen,
        &McConfig::default().with_threads(2),
        &stop,
    )
    .unwrap();
    assert_eq!(result.verdict, Verdict::Interrupted);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn partitions_match_tarjan((n, edges) in random_graph(), threads in 1usize..5, seed in any::<u64>()) {
        let ks = ExplicitKripke::from_edges(n, &edges).swarm(seed);
        let (count, comp) = tarjan(&ks);
        let uf = decompose_into(&ks, threads);

        let reachable: Vec<u32> = (0..n as u32).filter(|&s| comp[s as usize].is_some()).collect();
        prop_assert_eq!(uf.len(), reachable.len());
        for &a in &reachable {
            let ia = uf.lookup(&a).unwrap();
            prop_assert!(uf.is_dead(ia));
            for &b in &reachable {
                let ib = uf.lookup(&b).unwrap();
                prop_assert_eq!(uf.same_set(ia, ib), comp[a as usize] == comp[b as usize]);
            }
        }

        let result = mc::decompose(&ks, &McConfig::default().with_threads(threads)).unwrap();
        prop_assert_eq!(result.verdict, Verdict::Sccs(count));
    }

    #[test]
    fn safety_partitions_match_tarjan_on_explored_graph(
        (n, edges) in random_graph(),
        threads in 1usize..5,
        seed in any::<u64>(),
    ) {
        let mut ks = ExplicitKripke::from_edges(n, &edges).swarm(seed);
        ks.reduce_to_first(1);
        let reduced: Vec<Vec<u32>> = (0..n as u32)
            .map(|s| ks.edges(s).iter().take(1).copied().collect())
            .collect();
        let (uf, sccs) = decompose_safety_into(&ks, threads);
        let explored = explored_graph(&ks, &reduced, &uf);
        let (count, comp) = tarjan(&explored);

        let reachable: Vec<u32> = (0..n as u32).filter(|&s| comp[s as usize].is_some()).collect();
        prop_assert_eq!(uf.len(), reachable.len());
        prop_assert_eq!(sccs, count);
        for &a in &reachable {
            let ia = uf.lookup(&a).unwrap();
            prop_assert!(uf.is_dead(ia));
            for &b in &reachable {
                let ib = uf.lookup(&b).unwrap();
                prop_assert_eq!(uf.same_set(ia, ib), comp[a as usize] == comp[b as usize]);
            }
        }
    }
}
