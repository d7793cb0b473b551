//! Grounded HTN problem model.
//!
//! This crate holds the immutable problem store the planner works against:
//! predicates, primitive actions, abstract tasks, decomposition methods,
//! mutex groups, and the loader for the grounded exchange format emitted by
//! the external grounder. Parsing HDDL and grounding themselves are external
//! concerns; the planner only ever sees a grounded instance.

pub mod bitset;
pub mod instance;
pub mod model;
pub mod mutex;

pub use bitset::{BitVec, EffectBits};
pub use instance::{GroundedInstance, LoadConfig, MethodStructure, ProblemParts};
pub use model::{
    AbstractTask, Action, Method, OpKind, Predicate, TaskRef, BLANK_ID, GOAL_ID, INIT_ID,
};
pub use mutex::MutexStore;

use thiserror::Error;

/// Errors raised while loading or assembling a grounded problem.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("section {section:?} not found in grounded problem")]
    MissingSection { section: String },

    #[error("unexpected end of file at line {line}")]
    UnexpectedEof { line: usize },

    #[error("malformed grounded problem at line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("conditional effects are not supported (line {line})")]
    ConditionalEffects { line: usize },

    #[error("method {method} has no parent abstract task")]
    NoParentTask { method: String },

    #[error("method {method} decomposes more than one abstract task")]
    MultipleParentTasks { method: String },

    #[error("method {method} references unresolvable task id {task}")]
    UnresolvedTask { method: String, task: i32 },

    #[error("predicate id {pred} out of range (have {count})")]
    PredicateOutOfRange { pred: usize, count: usize },

    #[error("ordering constraint ({src}, {dst}) out of range in method {method}")]
    ConstraintOutOfRange {
        method: String,
        src: usize,
        dst: usize,
    },

    #[error("self-loop ordering constraint on subtask {index} in method {method}")]
    SelfLoopConstraint { method: String, index: usize },

    #[error("cyclic ordering constraints in method {method} (id {method_id})")]
    CyclicMethodOrdering { method_id: usize, method: String },

    #[error("root task {task} has no decomposition method")]
    NoRootMethod { task: String },
}
