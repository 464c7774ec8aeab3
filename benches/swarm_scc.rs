#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion};

use kripke_swarm::{
    mc::{self, McConfig, Verdict},
    ExplicitKripke,
};

/// A ring of `n` states with chords, folding everything into a few large SCCs.
fn ring(n: u32) -> ExplicitKripke {
    let mut edges = Vec::with_capacity(3 * n as usize);
    for s in 0..n {
        edges.push((s, (s + 1) % n));
        edges.push((s, (s * 31 + 7) % n));
        if s % 3 == 0 {
            edges.push((s, s / 2));
        }
    }
    ExplicitKripke::from_edges(n as usize, &edges)
}

/// A chain of `n` two-state cycles: many small SCCs.
fn ladder(n: u32) -> ExplicitKripke {
    let mut edges = Vec::with_capacity(3 * n as usize);
    for i in 0..n {
        let (a, b) = (2 * i, 2 * i + 1);
        edges.push((a, b));
        edges.push((b, a));
        if i + 1 < n {
            edges.push((b, a + 2));
        }
    }
    ExplicitKripke::from_edges(2 * n as usize, &edges)
}

fn f(b: &mut criterion::Bencher, ks: &ExplicitKripke, threads: usize) {
    let config = McConfig::default().with_threads(threads);
    b.iter_custom(move |iters| {
        let mut total = Duration::ZERO;
        for _ in 0..iters {
            let start = Instant::now();
            let result = mc::decompose(ks, &config);
            total += start.elapsed();
            match result.map(|r| r.verdict) {
                Ok(Verdict::Sccs(n)) => assert!(n > 0),
                _ => unreachable!(),
            }
        }
        total
    });
}

fn bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("swarm-scc");
    let ring = ring(20_000).swarm(1);
    let ladder = ladder(10_000).swarm(1);
    for threads in [1, 2, 4, 8] {
        group.bench_function(format!("ring-{threads}t"), |b| f(b, &ring, threads));
        group.bench_function(format!("ladder-{threads}t"), |b| f(b, &ladder, threads));
    }
    group.finish();
}

criterion_group!(benches, bench);
criterion_main!(benches);
