//! Multi-threaded, on-the-fly explicit-state model checking.
//!
//! Several workers explore the same state space at once, each in its own order,
//! and cooperate only through shared structures: a lock-free union-find for the
//! SCC-based algorithms ([bloemen], [bloemen_safety], [bloemen_ec]) and a shared
//! color store for the nested DFS ([cndfs]). [proviso] keeps partial-order
//! reduction sound for the reduced DFS of [dfs].
//!
//! The [mc] module is the entry point.

pub mod automaton;
pub mod bloemen;
pub mod bloemen_ec;
pub mod bloemen_safety;
pub mod cndfs;
pub mod dfs;
pub mod error;
pub mod explicit;
pub mod mc;
pub mod product;
pub mod proviso;
pub mod store;
pub mod uf;

mod kripke_structure;
pub use kripke_structure::{KripkeStructure, SuccIter};

pub use automaton::{Automaton, Cube};
pub use error::{McError, ProviderError};
pub use explicit::ExplicitKripke;
pub use mc::{Algorithm, McConfig, McResult, Verdict};
pub use proviso::{Proviso, ProvisoKind};
