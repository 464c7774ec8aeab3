//! Property automata and the cubes labelling their edges.

use std::fmt;

use crate::error::McError;

/// Maximum number of atomic propositions a [Cube] can talk about.
pub const MAX_APS: usize = 64;

/// A conjunction of literals over at most [MAX_APS] atomic propositions.
///
/// `pos` holds the propositions that must be true, `neg` those that must be
/// false. A full valuation of a Kripke state is a cube mentioning every
/// proposition.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Cube {
    pos: u64,
    neg: u64,
}

impl Cube {
    /// The empty conjunction, satisfied by every valuation.
    pub const TRUE: Cube = Cube { pos: 0, neg: 0 };

    /// Build the full valuation of `aps` propositions whose true ones are the set
    /// bits of `bits`.
    pub fn valuation(bits: u64, aps: usize) -> Self {
        assert!(aps <= MAX_APS, "at most {} atomic propositions", MAX_APS);
        let mask = if aps == MAX_APS { u64::MAX } else { (1u64 << aps) - 1 };
        Cube {
            pos: bits & mask,
            neg: !bits & mask,
        }
    }

    /// Add the literal `ap == value`.
    #[must_use]
    pub fn with(mut self, ap: usize, value: bool) -> Self {
        assert!(ap < MAX_APS, "atomic proposition {} out of range", ap);
        if value {
            self.pos |= 1 << ap;
        } else {
            self.neg |= 1 << ap;
        }
        self
    }

    /// False iff some proposition is required both true and false.
    #[inline]
    pub fn is_satisfiable(&self) -> bool {
        self.pos & self.neg == 0
    }

    /// True iff some valuation satisfies both cubes.
    #[inline]
    pub fn intersects(&self, other: &Cube) -> bool {
        self.is_satisfiable()
            && other.is_satisfiable()
            && self.pos & other.neg == 0
            && self.neg & other.pos == 0
    }
}

impl fmt::Debug for Cube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pos == 0 && self.neg == 0 {
            return write!(f, "1");
        }
        let mut first = true;
        for ap in 0..MAX_APS {
            let bit = 1u64 << ap;
            let lit = if self.pos & bit != 0 {
                ""
            } else if self.neg & bit != 0 {
                "!"
            } else {
                continue;
            };
            if !first {
                write!(f, "&")?;
            }
            write!(f, "{}p{}", lit, ap)?;
            first = false;
        }
        Ok(())
    }
}

/// An edge of a property automaton.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AutEdge {
    pub dst: u32,
    pub cond: Cube,
    /// Whether the edge belongs to the Büchi acceptance set.
    pub acc: bool,
}

/// A transition-based Büchi automaton over atomic propositions.
///
/// Accepting runs are those crossing accepting edges infinitely often.
#[derive(Clone, Debug, Default)]
pub struct Automaton {
    aps: Vec<String>,
    initial: u32,
    edges: Vec<Vec<AutEdge>>,
}

impl Automaton {
    pub fn new<I, S>(aps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let aps: Vec<String> = aps.into_iter().map(Into::into).collect();
        assert!(aps.len() <= MAX_APS, "at most {} atomic propositions", MAX_APS);
        Self {
            aps,
            initial: 0,
            edges: Vec::new(),
        }
    }

    /// Create `n` fresh states and return the index of the first one.
    pub fn add_states(&mut self, n: usize) -> u32 {
        let first = self.edges.len() as u32;
        self.edges.resize_with(self.edges.len() + n, Vec::new);
        first
    }

    pub fn set_initial(&mut self, q: u32) {
        self.initial = q;
    }

    pub fn add_edge(&mut self, src: u32, dst: u32, cond: Cube, acc: bool) {
        assert!((dst as usize) < self.edges.len(), "unknown state {}", dst);
        self.edges[src as usize].push(AutEdge { dst, cond, acc });
    }

    #[inline]
    pub fn initial_state(&self) -> u32 {
        self.initial
    }

    #[inline]
    pub fn successors(&self, q: u32) -> &[AutEdge] {
        &self.edges[q as usize]
    }

    #[inline]
    pub fn num_states(&self) -> usize {
        self.edges.len()
    }

    pub fn aps(&self) -> &[String] {
        &self.aps
    }

    /// Index of the atomic proposition called `name`.
    pub fn ap(&self, name: &str) -> Option<usize> {
        self.aps.iter().position(|a| a == name)
    }

    /// Check that the automaton can drive a product exploration.
    pub fn validate(&self) -> Result<(), McError> {
        if self.edges.is_empty() {
            return Err(McError::EmptyAutomaton);
        }
        if self.initial as usize >= self.edges.len() {
            return Err(McError::BadInitialState(self.initial));
        }
        Ok(())
    }

    /// The one-state automaton accepting every infinite word: products with it
    /// are non-empty iff the Kripke structure has a cycle.
    pub fn universal() -> Self {
        let mut aut = Automaton::new(Vec::<String>::new());
        let q = aut.add_states(1);
        aut.add_edge(q, q, Cube::TRUE, true);
        aut
    }

    /// The two-state automaton for "`ap` holds infinitely often" (`GF ap`).
    pub fn infinitely_often(aps: &[&str], ap: &str) -> Self {
        let mut aut = Automaton::new(aps.iter().copied());
        let i = aut
            .ap(ap)
            .unwrap_or_else(|| panic!("unknown atomic proposition {}", ap));
        let q = aut.add_states(1);
        aut.add_edge(q, q, Cube::TRUE.with(i, true), true);
        aut.add_edge(q, q, Cube::TRUE.with(i, false), false);
        aut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_intersection() {
        let a = Cube::TRUE.with(0, true);
        let b = Cube::TRUE.with(0, false).with(1, true);
        let c = Cube::TRUE.with(1, true);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
        assert!(Cube::TRUE.intersects(&a));
        let unsat = a.with(0, false);
        assert!(!unsat.is_satisfiable());
        assert!(!unsat.intersects(&Cube::TRUE));
    }

    #[test]
    fn valuation_mentions_every_ap() {
        let v = Cube::valuation(0b01, 2);
        assert!(v.intersects(&Cube::TRUE.with(0, true)));
        assert!(!v.intersects(&Cube::TRUE.with(1, true)));
        assert_eq!(format!("{:?}", v), "p0&!p1");
    }

    #[test]
    fn validate_rejects_empty() {
        assert_eq!(
            Automaton::new(["a"]).validate(),
            Err(McError::EmptyAutomaton)
        );
        assert!(Automaton::universal().validate().is_ok());
    }
}
