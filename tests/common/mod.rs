#![allow(dead_code)]

use kripke_swarm::explicit::ExplicitKripke;
use proptest::prelude::*;

/// Tarjan's algorithm over the part of `ks` reachable from state 0.
///
/// Returns the SCC index of every state, None for unreachable ones.
pub fn tarjan(ks: &ExplicitKripke) -> (usize, Vec<Option<usize>>) {
    struct T<'a> {
        ks: &'a ExplicitKripke,
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<u32>,
        next: usize,
        comp: Vec<Option<usize>>,
        count: usize,
    }

    impl T<'_> {
        fn visit(&mut self, v: u32) {
            let vi = v as usize;
            self.index[vi] = Some(self.next);
            self.low[vi] = self.next;
            self.next += 1;
            self.stack.push(v);
            self.on_stack[vi] = true;
            for &w in self.ks.edges(v) {
                let wi = w as usize;
                match self.index[wi] {
                    None => {
                        self.visit(w);
                        self.low[vi] = self.low[vi].min(self.low[wi]);
                    }
                    Some(i) if self.on_stack[wi] => self.low[vi] = self.low[vi].min(i),
                    Some(_) => {}
                }
            }
            if Some(self.low[vi]) == self.index[vi] {
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w as usize] = false;
                    self.comp[w as usize] = Some(self.count);
                    if w == v {
                        break;
                    }
                }
                self.count += 1;
            }
        }
    }

    let n = ks.num_states();
    let mut t = T {
        ks,
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        comp: vec![None; n],
        count: 0,
    };
    t.visit(0);
    (t.count, t.comp)
}

pub fn random_graph() -> impl Strategy<Value = (usize, Vec<(u32, u32)>)> {
    (1usize..30).prop_flat_map(|n| {
        let edge = (0..n as u32, 0..n as u32);
        (Just(n), prop::collection::vec(edge, 0..(3 * n)))
    })
}

