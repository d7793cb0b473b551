//! Static analyses over a grounded HTN instance.
//!
//! Everything here runs once, before the deepening loop starts: the per-method
//! ordering closure, the method call graph condensation, the effects
//! inference fixed points, and the ordering-DAG compressor used by
//! partially-ordered PDT expansion.

pub mod compress;
pub mod effects;
pub mod ordering;
pub mod scc;

pub use compress::{compress_dags, remove_transitive_edges, CompressedDag, CompressedNode, DagSpec};
pub use effects::{infer_method_effects, write_back, MethodEffects};
pub use ordering::{analyze_all_methods, MethodOrdering};
pub use scc::{condense, reverse_topological, Tarjan};

use thiserror::Error;

/// Errors raised by the static analyses. These all indicate malformed input;
/// none of them are recoverable by the planner.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("cyclic ordering constraints in method {method} (id {method_id})")]
    CyclicMethodOrdering { method_id: usize, method: String },

    #[error("self-loop ordering constraint on subtask {index} in method {method_id}")]
    SelfLoopConstraint { method_id: usize, index: usize },

    #[error("ordering constraint ({src}, {dst}) out of range in method {method_id} ({count} subtasks)")]
    ConstraintOutOfRange {
        method_id: usize,
        src: usize,
        dst: usize,
        count: usize,
    },
}
