//! SAT-based HTN planner.
//!
//! The planner deepens a plan decomposition tree layer by layer. Every
//! layer commits each open node to a method decomposition or a repeated
//! primitive action, encodes the new frontier into an incremental SAT
//! solver, and solves under assumptions that force all leaves primitive.
//! UNSAT answers drive deepening, optionally through a relaxation ladder
//! over per-layer slack literals.

pub mod encode;
pub mod pdt;
pub mod plan;
pub mod planner;

pub use pdt::{NextKind, NodeId, ParentOp, Pdt, PdtNode};
pub use plan::RawPlan;
pub use planner::{CancelFlag, Planner};

use std::path::PathBuf;

use sylva_analysis::AnalysisError;
use sylva_instance::InputError;
use sylva_sat::SatError;
use thiserror::Error;

/// Recognized planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerOptions {
    /// Expand partially ordered, with "before"/"next" ordering literals.
    pub partial_order: bool,
    /// Emit at-most-one clauses per mutex group and refine inferred
    /// effects against the mutex store.
    pub use_mutexes: bool,
    /// Infer method preconditions/effects and emit the method clauses.
    pub use_effect_inference: bool,
    /// Fold synthetic method-precondition actions into method
    /// preconditions at load time. Recorded here for the loader.
    pub remove_method_precondition_action: bool,
    /// Layer cap of the deepening loop.
    pub max_depth: usize,
    /// Run the external verifier on a found plan (driver concern).
    pub verify_plan: bool,
    /// SAT solver randomness seed. Recorded and logged; the glucose
    /// binding exposes no seeding hook.
    pub seed: u64,
    /// Emit a `PVN: <var> <name>` line for every allocated variable.
    pub print_variable_names: bool,
    /// Allow the leaf-overleaf relaxation ladder on UNSAT.
    pub allow_relaxation: bool,
    /// Mirror the emitted formula into this file.
    pub write_formula: Option<PathBuf>,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        PlannerOptions {
            partial_order: false,
            use_mutexes: false,
            use_effect_inference: false,
            remove_method_precondition_action: false,
            max_depth: 50,
            verify_plan: false,
            seed: 0,
            print_variable_names: false,
            allow_relaxation: true,
            write_formula: None,
        }
    }
}

/// What a planning run produced.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// A primitive plan was found.
    Found(RawPlan),
    /// The depth cap was exhausted without a plan.
    NoPlan,
    /// The run was cancelled before a verdict.
    Cancelled,
}

/// Errors surfaced by the planner.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Sat(#[from] SatError),

    /// An internal consistency check failed; this indicates an encoder
    /// bug, not bad input.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
