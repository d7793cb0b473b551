//! Wrapper around the incremental SAT backend.
//!
//! Clauses stream into the solver as they are produced; assumptions
//! accumulate until the next solve call and are consumed by it. After a
//! satisfiable solve the full model is cached for extraction queries.
//! An optional mirror file records the formula in DIMACS body syntax.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustsat::solvers::{Interrupt, InterruptSolver, Solve, SolveIncremental, SolverResult};
use rustsat::types::{Assignment, Clause, Lit};
use rustsat_glucose::core::Glucose;
use tracing::debug;

use crate::SatError;

/// Result of one solver invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    Sat,
    Unsat,
    /// The solver was interrupted before reaching a verdict.
    Unknown,
}

/// Clause, literal and assumption counters for progress reporting.
#[derive(Debug, Default, Clone, Copy)]
pub struct SolverStats {
    pub num_clauses: usize,
    pub num_literals: usize,
    pub num_assumptions: usize,
    pub num_solves: usize,
}

/// Incremental SAT backend with buffered assumptions and a cached model.
pub struct SatBackend {
    solver: Glucose,
    assumptions: Vec<Lit>,
    model: Option<Assignment>,
    formula_out: Option<BufWriter<File>>,
    pub stats: SolverStats,
    terminate_flag: Option<Arc<AtomicBool>>,
}

impl SatBackend {
    /// Create a backend. With `formula_path` set, every clause is mirrored
    /// to that file as a DIMACS body line.
    pub fn new(formula_path: Option<&Path>) -> Result<Self, SatError> {
        let formula_out = match formula_path {
            Some(path) => Some(BufWriter::new(File::create(path).map_err(SatError::Io)?)),
            None => None,
        };
        Ok(SatBackend {
            solver: Glucose::default(),
            assumptions: Vec::new(),
            model: None,
            formula_out,
            stats: SolverStats::default(),
            terminate_flag: None,
        })
    }

    /// Add one clause.
    pub fn add_clause(&mut self, lits: &[Lit]) -> Result<(), SatError> {
        debug_assert!(!lits.is_empty());
        self.stats.num_clauses += 1;
        self.stats.num_literals += lits.len();
        if let Some(out) = &mut self.formula_out {
            for &lit in lits {
                write!(out, "{} ", dimacs(lit)).map_err(SatError::Io)?;
            }
            writeln!(out, "0").map_err(SatError::Io)?;
        }
        let clause: Clause = lits.iter().copied().collect();
        self.solver
            .add_clause(clause)
            .map_err(|e| SatError::Backend(e.to_string()))
    }

    pub fn add_unit(&mut self, lit: Lit) -> Result<(), SatError> {
        self.add_clause(&[lit])
    }

    pub fn add_binary(&mut self, a: Lit, b: Lit) -> Result<(), SatError> {
        self.add_clause(&[a, b])
    }

    pub fn add_ternary(&mut self, a: Lit, b: Lit, c: Lit) -> Result<(), SatError> {
        self.add_clause(&[a, b, c])
    }

    /// Queue an assumption for the next solve call.
    pub fn assume(&mut self, lit: Lit) {
        self.assumptions.push(lit);
        self.stats.num_assumptions += 1;
    }

    /// Solve under the queued assumptions, consuming them.
    pub fn solve(&mut self) -> Result<SolveOutcome, SatError> {
        let assumptions = std::mem::take(&mut self.assumptions);
        if let Some(out) = &mut self.formula_out {
            if !assumptions.is_empty() {
                write!(out, "c assumptions:").map_err(SatError::Io)?;
                for &lit in &assumptions {
                    write!(out, " {}", dimacs(lit)).map_err(SatError::Io)?;
                }
                writeln!(out).map_err(SatError::Io)?;
            }
            out.flush().map_err(SatError::Io)?;
        }
        debug!(
            clauses = self.stats.num_clauses,
            assumptions = assumptions.len(),
            "invoking SAT solver"
        );
        self.stats.num_solves += 1;
        self.model = None;
        let watcher = self.terminate_flag.clone().map(|flag| {
            let interrupter = self.solver.interrupter();
            let done = Arc::new(AtomicBool::new(false));
            let done_for_thread = Arc::clone(&done);
            let handle = std::thread::spawn(move || {
                while !done_for_thread.load(Ordering::Relaxed) {
                    if flag.load(Ordering::Relaxed) {
                        interrupter.interrupt();
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
            (handle, done)
        });
        let result = self.solver.solve_assumps(&assumptions);
        if let Some((handle, done)) = watcher {
            done.store(true, Ordering::Relaxed);
            let _ = handle.join();
        }
        let result = result.map_err(|e| SatError::Backend(e.to_string()))?;
        match result {
            SolverResult::Sat => {
                let model = self
                    .solver
                    .full_solution()
                    .map_err(|e| SatError::Backend(e.to_string()))?;
                self.model = Some(model);
                Ok(SolveOutcome::Sat)
            }
            SolverResult::Unsat => Ok(SolveOutcome::Unsat),
            SolverResult::Interrupted => Ok(SolveOutcome::Unknown),
        }
    }

    /// Whether the literal holds in the model of the last satisfiable solve.
    pub fn holds(&self, lit: Lit) -> bool {
        let Some(model) = &self.model else {
            return false;
        };
        let positive = model.var_value(lit.var()).to_bool_with_def(false);
        if lit.is_pos() {
            positive
        } else {
            !positive
        }
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Let the solver poll the given flag during search; a set flag makes
    /// the current solve return [`SolveOutcome::Unknown`].
    pub fn attach_terminator(&mut self, flag: Arc<AtomicBool>) {
        self.terminate_flag = Some(flag);
    }
}

fn dimacs(lit: Lit) -> i64 {
    let var = lit.var().idx() as i64 + 1;
    if lit.is_pos() {
        var
    } else {
        -var
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustsat::types::Var;

    #[test]
    fn sat_and_model() {
        let mut sat = SatBackend::new(None).unwrap();
        let a = Var::new(0).pos_lit();
        let b = Var::new(1).pos_lit();
        sat.add_binary(a, b).unwrap();
        sat.add_unit(!a).unwrap();
        assert_eq!(sat.solve().unwrap(), SolveOutcome::Sat);
        assert!(sat.holds(b));
        assert!(!sat.holds(a));
    }

    #[test]
    fn assumptions_are_consumed_per_solve() {
        let mut sat = SatBackend::new(None).unwrap();
        let a = Var::new(0).pos_lit();
        sat.add_unit(a).unwrap();
        sat.assume(!a);
        assert_eq!(sat.solve().unwrap(), SolveOutcome::Unsat);
        // the failed assumption is gone, the formula itself is satisfiable
        assert_eq!(sat.solve().unwrap(), SolveOutcome::Sat);
        assert!(sat.holds(a));
    }

    #[test]
    fn incremental_additions() {
        let mut sat = SatBackend::new(None).unwrap();
        let a = Var::new(0).pos_lit();
        let b = Var::new(1).pos_lit();
        sat.add_binary(a, b).unwrap();
        assert_eq!(sat.solve().unwrap(), SolveOutcome::Sat);
        sat.add_unit(!a).unwrap();
        sat.add_unit(!b).unwrap();
        assert_eq!(sat.solve().unwrap(), SolveOutcome::Unsat);
    }
}
