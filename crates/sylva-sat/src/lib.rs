//! SAT plumbing for the planner: variable allocation, at-most-one
//! encodings, and a thin wrapper over an incremental solver backend
//! (add clauses / assume / solve / read model / interrupt).

pub mod amo;
pub mod solver;
pub mod vars;

pub use amo::{at_most_one, BimanderAtMostOne, PAIRWISE_LIMIT};
pub use solver::{SatBackend, SolveOutcome, SolverStats};
pub use vars::VarProvider;

use thiserror::Error;

/// Errors from the SAT layer.
#[derive(Debug, Error)]
pub enum SatError {
    #[error("solver backend error: {0}")]
    Backend(String),

    #[error("formula dump i/o error: {0}")]
    Io(std::io::Error),
}
