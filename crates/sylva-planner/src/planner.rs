//! The deepening planner driver.
//!
//! Each iteration expands the current frontier, allocates variables for
//! the new leaves, encodes them, and solves under assumptions forcing all
//! leaves primitive. UNSAT deepens; with relaxation enabled the layer
//! slack literals and frozen next-literals are given up step by step
//! before deepening, and a relaxed model's next-literals are frozen for
//! the following layers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustsat::types::Lit;
use sylva_analysis::effects::{infer_method_effects, write_back};
use sylva_analysis::ordering::analyze_all_methods;
use sylva_instance::GroundedInstance;
use sylva_sat::SolveOutcome;
use tracing::{debug, info, warn};

use crate::encode::Encoder;
use crate::pdt::{NodeId, Pdt};
use crate::plan::emit_raw_plan;
use crate::{PlanOutcome, PlannerError, PlannerOptions};

/// Shared cancellation flag, pollable from a signal handler.
pub type CancelFlag = Arc<AtomicBool>;

/// A planner bound to one grounded instance.
pub struct Planner {
    instance: GroundedInstance,
    options: PlannerOptions,
    cancel: CancelFlag,
}

impl Planner {
    /// Build a planner. Ordering constraints of every method are validated
    /// here; with effect inference enabled the inferred sets are written
    /// back into the instance's methods.
    pub fn new(
        mut instance: GroundedInstance,
        options: PlannerOptions,
    ) -> Result<Self, PlannerError> {
        let orderings = analyze_all_methods(&instance)?;

        if options.use_effect_inference {
            let mutexes = options.use_mutexes.then(|| instance.mutexes.clone());
            let results = infer_method_effects(&instance, &orderings, mutexes.as_ref());
            write_back(&mut instance, &results);
        }
        if options.seed != 0 {
            debug!(
                seed = options.seed,
                "seed recorded; the solver backend has no seeding hook"
            );
        }

        Ok(Planner {
            instance,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that aborts the run between layers.
    pub fn cancel_flag(&self) -> CancelFlag {
        Arc::clone(&self.cancel)
    }

    pub fn instance(&self) -> &GroundedInstance {
        &self.instance
    }

    /// Run the deepening loop to completion.
    pub fn find_plan(&mut self) -> Result<PlanOutcome, PlannerError> {
        let partial_order = self.options.partial_order;
        let relaxation = partial_order && self.options.allow_relaxation;

        let mut encoder = Encoder::new(&self.instance, &self.options)?;
        encoder.sat.attach_terminator(Arc::clone(&self.cancel));
        let mut pdt = Pdt::new();

        let root = pdt.add_root();
        let root_method = *self
            .instance
            .root()
            .decomposition_methods
            .first()
            .ok_or_else(|| {
                PlannerError::InvariantViolation("root task without decomposition method".into())
            })?;
        pdt.node_mut(root).methods.insert(root_method);
        pdt.assign_variables(root, &self.instance, &mut encoder.vars, partial_order);
        encoder.initial_encode(&pdt, root)?;

        let mut leaves: Vec<NodeId> = vec![root];
        let mut overleaf_stack: Vec<Lit> = Vec::new();
        let mut frozen_nexts: Vec<Lit> = Vec::new();
        let mut solved = false;

        for depth in 1..=self.options.max_depth {
            if self.cancel.load(Ordering::Relaxed) {
                info!("cancellation requested, stopping");
                return Ok(PlanOutcome::Cancelled);
            }
            info!(depth, leaves = leaves.len(), "expanding layer");

            let mut new_leaves: Vec<NodeId> = Vec::new();
            let mut pos = 0usize;
            for &leaf in &leaves {
                if partial_order {
                    pdt.expand_po(leaf, &self.instance);
                } else {
                    pdt.expand(leaf, &self.instance);
                }
                for &child in &pdt.node(leaf).children.clone() {
                    pdt.node_mut(child).pos = pos;
                    pos += 1;
                    new_leaves.push(child);
                }
            }

            if partial_order {
                for &leaf in &new_leaves {
                    pdt.make_ordering_no_sibling(leaf);
                }
            }

            debug!(new_leaves = new_leaves.len(), "assigning SAT variables");
            for (i, &leaf) in new_leaves.iter().enumerate() {
                pdt.assign_variables(leaf, &self.instance, &mut encoder.vars, partial_order);
                if partial_order {
                    for &other in &new_leaves[i + 1..] {
                        pdt.assign_before_pair(leaf, other, &mut encoder.vars, depth);
                    }
                }
            }

            if partial_order {
                encoder.encode_partial_order(&pdt, &new_leaves)?;
            } else {
                encoder.encode_total_order(&pdt, &new_leaves)?;
            }

            let prim_assumptions: Vec<Lit> = new_leaves
                .iter()
                .map(|&leaf| pdt.node(leaf).prim_var.expect("prim assigned").pos_lit())
                .collect();
            let mut overleaf_assumptions: Vec<Lit> = Vec::new();
            if relaxation {
                let latest = encoder
                    .last_leaf_overleaf()
                    .expect("overleaf allocated for the layer");
                overleaf_stack.push(latest.pos_lit());
                overleaf_assumptions = overleaf_stack.iter().map(|&l| !l).collect();
            } else if partial_order {
                let latest = encoder
                    .last_leaf_overleaf()
                    .expect("overleaf allocated for the layer");
                overleaf_assumptions.push(!latest.pos_lit());
            }

            for &lit in prim_assumptions
                .iter()
                .chain(&overleaf_assumptions)
                .chain(&frozen_nexts)
            {
                encoder.assume(lit);
            }
            info!(
                prims = prim_assumptions.len(),
                overleafs = overleaf_assumptions.len(),
                frozen_nexts = frozen_nexts.len(),
                "solving"
            );
            match encoder.solve()? {
                SolveOutcome::Sat => {
                    solved = true;
                }
                SolveOutcome::Unknown => return Ok(PlanOutcome::Cancelled),
                SolveOutcome::Unsat if relaxation => {
                    self.relax(
                        &mut encoder,
                        &pdt,
                        &new_leaves,
                        &mut overleaf_stack,
                        &mut frozen_nexts,
                    )?;
                }
                SolveOutcome::Unsat => {}
            }

            leaves = new_leaves;
            if solved {
                info!(depth, "found a solution layer");
                break;
            }
        }

        if !solved {
            warn!(max_depth = self.options.max_depth, "depth exhausted");
            return Ok(PlanOutcome::NoPlan);
        }

        encoder.extract_chosen_ops(&mut pdt, root, partial_order)?;
        let plan = emit_raw_plan(&pdt, &self.instance, root, partial_order)?;
        info!(size = plan.size, "plan extracted");
        Ok(PlanOutcome::Found(plan))
    }

    /// The relaxation ladder after an UNSAT frontier: first drop the
    /// primitive assumptions, then the frozen next-literals, then pop the
    /// overleaf assumptions newest-first. A relaxed model freezes its
    /// chosen next-literals for the following layers.
    fn relax(
        &self,
        encoder: &mut Encoder<'_>,
        pdt: &Pdt,
        new_leaves: &[NodeId],
        overleaf_stack: &mut Vec<Lit>,
        frozen_nexts: &mut Vec<Lit>,
    ) -> Result<(), PlannerError> {
        info!("frontier UNSAT, trying a relaxed decomposition");
        for &lit in overleaf_stack.iter() {
            encoder.assume(!lit);
        }
        for &lit in frozen_nexts.iter() {
            encoder.assume(lit);
        }
        let mut relaxed = matches!(encoder.solve()?, SolveOutcome::Sat);

        if !relaxed && !frozen_nexts.is_empty() {
            debug!("dropping frozen next-literal assumptions");
            frozen_nexts.clear();
            for &lit in overleaf_stack.iter() {
                encoder.assume(!lit);
            }
            relaxed = matches!(encoder.solve()?, SolveOutcome::Sat);
        }

        while !relaxed && !overleaf_stack.is_empty() {
            overleaf_stack.pop();
            debug!(
                remaining = overleaf_stack.len(),
                "relaxing a layer's overleaf assumption"
            );
            for &lit in overleaf_stack.iter() {
                encoder.assume(!lit);
            }
            relaxed = matches!(encoder.solve()?, SolveOutcome::Sat);
        }

        if relaxed {
            let mut frozen = 0usize;
            for &leaf in new_leaves {
                for &var in pdt.node(leaf).next_vars.values() {
                    if encoder.holds(var.pos_lit()) {
                        frozen_nexts.push(var.pos_lit());
                        frozen += 1;
                    }
                }
            }
            info!(frozen, "relaxed decomposition found, freezing next-literals");
        } else {
            warn!("no relaxed decomposition either, deepening blind");
        }
        Ok(())
    }
}
