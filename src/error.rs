//! Error types surfaced by the model-checking core.
//!
//! Exploration itself never fails: outcomes are reported as a
//! [`Verdict`](crate::mc::Verdict). The errors below are setup failures found
//! before any worker thread is spawned.

/// Failure of a state-space provider to produce the data a worker needs.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("no initial state for thread {tid}")]
    NoInitialState { tid: usize },
    #[error("invalid state space: {0}")]
    Invalid(String),
}

/// Failure to set up a model-checking run.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum McError {
    #[error("at least one worker thread is required")]
    ZeroThreads,
    #[error("{requested} worker threads requested, at most {max} are supported")]
    TooManyThreads { requested: usize, max: usize },
    #[error("property automaton has no states")]
    EmptyAutomaton,
    #[error("initial automaton state {0} does not exist")]
    BadInitialState(u32),
    #[error("unknown proviso {0:?}")]
    UnknownProviso(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
