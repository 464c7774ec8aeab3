//! Provisos keeping partial-order reduction sound on cycles.
//!
//! A reduced DFS only follows a subset of each state's transitions. If every
//! state of a cycle postpones the same transition, that transition is never
//! taken (the ignoring problem). A proviso watches the DFS and decides which
//! states must be fully expanded so that every cycle of the explored graph
//! contains a fully expanded state.
//!
//! All strategies rely on the same fact: every cycle met by a DFS contains an
//! edge closing onto the DFS stack, so it suffices to cover one end of each such
//! edge. They differ in which end they pick and when.
//!
//! Hooks return true when the state in question must be fully expanded now. The
//! DFS then widens that state's iterator and keeps exploring it.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::error::McError;

/// Decides when a reduced state must be fully expanded.
///
/// States are identified by the dense ids of the driving DFS, allocated in
/// discovery order.
pub trait Proviso {
    fn name(&self) -> &'static str;

    /// `id` was pushed. `expanded` tells whether its successor set is already
    /// full, `degree` is the size of the set it will explore.
    fn on_push(&mut self, id: usize, expanded: bool, degree: usize) -> bool;

    /// The top of the stack, `src`, has an edge to the already visited `dst`.
    /// Returns true if `src` must be fully expanded.
    fn on_closing_edge(&mut self, src: usize, dst: usize) -> bool;

    /// `id` ran out of successors. Returns true if it must be fully expanded
    /// before it is popped; the DFS asks again once the widened set runs out.
    fn on_pop(&mut self, id: usize) -> bool;
}

/// Stack membership and expansion state of every visited state.
#[derive(Default)]
struct Marks {
    on_stack: Vec<bool>,
    expanded: Vec<bool>,
    /// Expansion deferred until the state is about to be popped.
    marked: Vec<bool>,
    degree: Vec<usize>,
}

impl Marks {
    fn push(&mut self, id: usize, expanded: bool, degree: usize) {
        if self.on_stack.len() <= id {
            let n = id + 1;
            self.on_stack.resize(n, false);
            self.expanded.resize(n, false);
            self.marked.resize(n, false);
            self.degree.resize(n, 0);
        }
        self.on_stack[id] = true;
        self.expanded[id] = expanded;
        self.degree[id] = degree;
    }

    /// Pop `id`, returning true if a deferred expansion is due.
    fn pop(&mut self, id: usize) -> bool {
        if self.marked[id] && !self.expanded[id] {
            self.expanded[id] = true;
            return true;
        }
        self.on_stack[id] = false;
        false
    }

    #[inline]
    fn on_stack(&self, id: usize) -> bool {
        self.on_stack.get(id).copied().unwrap_or(false)
    }

    /// Expanded, or marked to be.
    #[inline]
    fn covered(&self, id: usize) -> bool {
        self.expanded[id] || self.marked[id]
    }

    fn expand_now(&mut self, id: usize) -> bool {
        self.expanded[id] = true;
        true
    }

    fn defer(&mut self, id: usize) -> bool {
        self.marked[id] = true;
        false
    }
}

/// Never expands: unsound on cycles, kept as a baseline.
#[derive(Default)]
pub struct NoProviso;

impl Proviso for NoProviso {
    fn name(&self) -> &'static str {
        "none"
    }

    fn on_push(&mut self, _id: usize, _expanded: bool, _degree: usize) -> bool {
        false
    }

    fn on_closing_edge(&mut self, _src: usize, _dst: usize) -> bool {
        false
    }

    fn on_pop(&mut self, _id: usize) -> bool {
        false
    }
}

/// Expands every state: no reduction at all.
#[derive(Default)]
pub struct FireAll;

impl Proviso for FireAll {
    fn name(&self) -> &'static str {
        "fire_all"
    }

    fn on_push(&mut self, _id: usize, expanded: bool, _degree: usize) -> bool {
        !expanded
    }

    fn on_closing_edge(&mut self, _src: usize, _dst: usize) -> bool {
        false
    }

    fn on_pop(&mut self, _id: usize) -> bool {
        false
    }
}

/// Expands the source of every edge closing onto the stack.
///
/// The source is the state being iterated, so it can be widened on the spot,
/// and every cycle the edge closes runs through it.
#[derive(Default)]
pub struct Stack {
    marks: Marks,
}

impl Proviso for Stack {
    fn name(&self) -> &'static str {
        "stack"
    }

    fn on_push(&mut self, id: usize, expanded: bool, degree: usize) -> bool {
        self.marks.push(id, expanded, degree);
        false
    }

    fn on_closing_edge(&mut self, src: usize, dst: usize) -> bool {
        if !self.marks.on_stack(dst) || self.marks.expanded[src] {
            return false;
        }
        trace!(src, dst, "stack proviso expands source");
        self.marks.expand_now(src)
    }

    fn on_pop(&mut self, id: usize) -> bool {
        self.marks.pop(id)
    }
}

/// Expands the destination of every edge closing onto the stack, just before
/// that destination is popped.
#[derive(Default)]
pub struct Destination {
    marks: Marks,
}

impl Proviso for Destination {
    fn name(&self) -> &'static str {
        "destination"
    }

    fn on_push(&mut self, id: usize, expanded: bool, degree: usize) -> bool {
        self.marks.push(id, expanded, degree);
        false
    }

    fn on_closing_edge(&mut self, src: usize, dst: usize) -> bool {
        if !self.marks.on_stack(dst) || self.marks.covered(dst) {
            return false;
        }
        trace!(src, dst, "destination proviso marks destination");
        self.marks.defer(dst)
    }

    fn on_pop(&mut self, id: usize) -> bool {
        self.marks.pop(id)
    }
}

/// Covers every edge closing onto the stack by either end, chosen at random.
pub struct RandomSourceDestination {
    marks: Marks,
    rng: StdRng,
}

impl RandomSourceDestination {
    pub fn new(seed: u64) -> Self {
        Self {
            marks: Marks::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Proviso for RandomSourceDestination {
    fn name(&self) -> &'static str {
        "random_source_destination"
    }

    fn on_push(&mut self, id: usize, expanded: bool, degree: usize) -> bool {
        self.marks.push(id, expanded, degree);
        false
    }

    fn on_closing_edge(&mut self, src: usize, dst: usize) -> bool {
        if !self.marks.on_stack(dst) || self.marks.covered(src) || self.marks.covered(dst) {
            return false;
        }
        if self.rng.gen_bool(0.5) {
            trace!(src, dst, "random proviso expands source");
            self.marks.expand_now(src)
        } else {
            trace!(src, dst, "random proviso marks destination");
            self.marks.defer(dst)
        }
    }

    fn on_pop(&mut self, id: usize) -> bool {
        self.marks.pop(id)
    }
}

/// Stack colors of [ColorProviso].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Color {
    /// On the stack with a reduced successor set.
    Orange,
    /// Fully expanded, or marked to be before it leaves the stack.
    Green,
    /// Left the stack without being expanded.
    Red,
}

/// Colors stack states and only covers closing edges whose ends are both
/// uncovered: an edge from a green source closes cycles that already contain
/// a fully expanded state.
#[derive(Default)]
pub struct ColorProviso {
    marks: Marks,
}

impl ColorProviso {
    pub fn color(&self, id: usize) -> Option<Color> {
        if id >= self.marks.on_stack.len() {
            return None;
        }
        Some(if self.marks.covered(id) {
            Color::Green
        } else if self.marks.on_stack[id] {
            Color::Orange
        } else {
            Color::Red
        })
    }
}

impl Proviso for ColorProviso {
    fn name(&self) -> &'static str {
        "color"
    }

    fn on_push(&mut self, id: usize, expanded: bool, degree: usize) -> bool {
        self.marks.push(id, expanded, degree);
        false
    }

    fn on_closing_edge(&mut self, src: usize, dst: usize) -> bool {
        if self.color(dst) != Some(Color::Orange) || self.color(src) == Some(Color::Green) {
            return false;
        }
        trace!(src, dst, "color proviso turns destination green");
        self.marks.defer(dst)
    }

    fn on_pop(&mut self, id: usize) -> bool {
        self.marks.pop(id)
    }
}

/// Covers every edge closing onto the stack by the end with the smaller
/// (or larger) reduced successor set.
pub struct SuccessorCount {
    marks: Marks,
    prefer_larger: bool,
}

impl SuccessorCount {
    pub fn min() -> Self {
        Self {
            marks: Marks::default(),
            prefer_larger: false,
        }
    }

    pub fn max() -> Self {
        Self {
            marks: Marks::default(),
            prefer_larger: true,
        }
    }
}

impl Proviso for SuccessorCount {
    fn name(&self) -> &'static str {
        if self.prefer_larger {
            "max_succ"
        } else {
            "min_succ"
        }
    }

    fn on_push(&mut self, id: usize, expanded: bool, degree: usize) -> bool {
        self.marks.push(id, expanded, degree);
        false
    }

    fn on_closing_edge(&mut self, src: usize, dst: usize) -> bool {
        if !self.marks.on_stack(dst) || self.marks.covered(src) || self.marks.covered(dst) {
            return false;
        }
        let (s, d) = (self.marks.degree[src], self.marks.degree[dst]);
        let source = if self.prefer_larger { s >= d } else { s <= d };
        if source {
            trace!(src, dst, s, d, "successor-count proviso expands source");
            self.marks.expand_now(src)
        } else {
            trace!(src, dst, s, d, "successor-count proviso marks destination");
            self.marks.defer(dst)
        }
    }

    fn on_pop(&mut self, id: usize) -> bool {
        self.marks.pop(id)
    }
}

/// Selects a proviso strategy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProvisoKind {
    NoProviso,
    FireAll,
    #[default]
    Stack,
    Destination,
    RandomSourceDestination,
    Color,
    MinSucc,
    MaxSucc,
}

impl ProvisoKind {
    pub const ALL: [ProvisoKind; 8] = [
        ProvisoKind::NoProviso,
        ProvisoKind::FireAll,
        ProvisoKind::Stack,
        ProvisoKind::Destination,
        ProvisoKind::RandomSourceDestination,
        ProvisoKind::Color,
        ProvisoKind::MinSucc,
        ProvisoKind::MaxSucc,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProvisoKind::NoProviso => "none",
            ProvisoKind::FireAll => "fire_all",
            ProvisoKind::Stack => "stack",
            ProvisoKind::Destination => "destination",
            ProvisoKind::RandomSourceDestination => "random_source_destination",
            ProvisoKind::Color => "color",
            ProvisoKind::MinSucc => "min_succ",
            ProvisoKind::MaxSucc => "max_succ",
        }
    }

    /// Whether the strategy guarantees every cycle has a fully expanded state.
    pub fn is_sound(self) -> bool {
        self != ProvisoKind::NoProviso
    }

    /// Instantiate the strategy; `seed` drives the randomized one.
    pub fn build(self, seed: u64) -> Box<dyn Proviso + Send> {
        match self {
            ProvisoKind::NoProviso => Box::new(NoProviso),
            ProvisoKind::FireAll => Box::new(FireAll),
            ProvisoKind::Stack => Box::<Stack>::default(),
            ProvisoKind::Destination => Box::<Destination>::default(),
            ProvisoKind::RandomSourceDestination => Box::new(RandomSourceDestination::new(seed)),
            ProvisoKind::Color => Box::<ColorProviso>::default(),
            ProvisoKind::MinSucc => Box::new(SuccessorCount::min()),
            ProvisoKind::MaxSucc => Box::new(SuccessorCount::max()),
        }
    }
}

impl fmt::Display for ProvisoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProvisoKind {
    type Err = McError;

    fn from_str(s: &str) -> Result<Self, McError> {
        ProvisoKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| McError::UnknownProviso(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in ProvisoKind::ALL {
            assert_eq!(kind.name().parse::<ProvisoKind>(), Ok(kind));
            assert_eq!(kind.build(0).name(), kind.name());
        }
        assert_eq!(
            "nope".parse::<ProvisoKind>(),
            Err(McError::UnknownProviso("nope".into()))
        );
    }

    #[test]
    fn stack_expands_source_once() {
        let mut p = Stack::default();
        assert!(!p.on_push(0, false, 1));
        assert!(!p.on_push(1, false, 1));
        assert!(p.on_closing_edge(1, 0));
        assert!(!p.on_closing_edge(1, 0));
        assert!(!p.on_pop(1));
        // Edges to popped states close no cycle on the stack.
        assert!(!p.on_push(2, false, 1));
        assert!(!p.on_closing_edge(2, 1));
    }

    #[test]
    fn destination_defers_to_pop() {
        let mut p = Destination::default();
        p.on_push(0, false, 1);
        p.on_push(1, false, 1);
        assert!(!p.on_closing_edge(1, 0));
        assert!(!p.on_pop(1));
        assert!(p.on_pop(0));
        assert!(!p.on_pop(0));
    }

    #[test]
    fn color_skips_green_sources() {
        let mut p = ColorProviso::default();
        p.on_push(0, false, 1);
        p.on_push(1, true, 3);
        assert_eq!(p.color(0), Some(Color::Orange));
        assert_eq!(p.color(1), Some(Color::Green));
        assert!(!p.on_closing_edge(1, 0));
        assert_eq!(p.color(0), Some(Color::Orange));
        p.on_push(2, false, 1);
        assert!(!p.on_closing_edge(2, 0));
        assert_eq!(p.color(0), Some(Color::Green));
        assert!(!p.on_pop(2));
        assert_eq!(p.color(2), Some(Color::Red));
    }

    #[test]
    fn successor_count_picks_by_degree() {
        let mut min = SuccessorCount::min();
        min.on_push(0, false, 1);
        min.on_push(1, false, 2);
        assert!(!min.on_closing_edge(1, 0));
        assert!(!min.on_pop(1));
        assert!(min.on_pop(0));

        let mut max = SuccessorCount::max();
        max.on_push(0, false, 1);
        max.on_push(1, false, 2);
        assert!(max.on_closing_edge(1, 0));
    }
}
