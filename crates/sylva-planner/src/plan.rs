//! Raw plan reconstruction from a solved decomposition tree.
//!
//! The emitter walks the tree top-down, numbering operations as it goes,
//! and produces the `==> ... <==` exchange format: one line per primitive
//! action (ordered by time step), then one decomposition line per method,
//! root first. Synthetic actions are filtered from the action section but
//! keep their (negated) ids inside decomposition lines.

use sylva_instance::{GroundedInstance, OpKind};
use tracing::debug;

use crate::pdt::{NodeId, Pdt};
use crate::PlannerError;

/// A finished plan in raw exchange text plus its primitive length.
#[derive(Debug, Clone)]
pub struct RawPlan {
    pub text: String,
    pub size: usize,
}

struct Emitter<'a> {
    pdt: &'a Pdt,
    instance: &'a GroundedInstance,
    partial_order: bool,
    counter: i64,
    /// (time step, line) pairs for the action section.
    actions: Vec<(usize, String)>,
    /// Decomposition lines, deepest first.
    decompositions: Vec<String>,
}

/// Rebuild the plan from the chosen operations recorded in the tree.
pub fn emit_raw_plan(
    pdt: &Pdt,
    instance: &GroundedInstance,
    root: NodeId,
    partial_order: bool,
) -> Result<RawPlan, PlannerError> {
    let mut emitter = Emitter {
        pdt,
        instance,
        partial_order,
        counter: 1,
        actions: Vec::new(),
        decompositions: Vec::new(),
    };
    emitter.process(root, Some(instance.root_task))?;

    emitter.actions.sort();
    let size = emitter.actions.len();

    let mut text = String::from("==>\n");
    for (_, line) in &emitter.actions {
        text.push_str(line);
        text.push('\n');
    }
    for line in emitter.decompositions.iter().rev() {
        text.push_str(line);
        text.push('\n');
    }
    text.push_str("<==\n");

    Ok(RawPlan { text, size })
}

impl Emitter<'_> {
    /// Process one node; returns the plan id assigned to its operation, or
    /// `None` when the node carries a sentinel. A negative id marks an
    /// action that is referenced but filtered from the action section.
    fn process(&mut self, id: NodeId, parent_task: Option<i32>) -> Result<Option<i64>, PlannerError> {
        let node = self.pdt.node(id);
        let (op_id, op_kind) = node.chosen_op.ok_or_else(|| {
            PlannerError::InvariantViolation(format!("no operation extracted at {}", node.name))
        })?;

        let plan_id = self.counter;
        self.counter += 1;

        match op_kind {
            OpKind::Action => {
                if op_id < 0 {
                    debug!(node = %node.name, "skipping sentinel action");
                    return Ok(None);
                }

                // The action repeats down to a leaf; the leaf copy carries
                // the time step.
                let mut leaf = id;
                while let Some(&first) = self.pdt.node(leaf).children.first() {
                    leaf = first;
                }
                let time_step = if self.partial_order {
                    self.pdt.node(leaf).time_step.ok_or_else(|| {
                        PlannerError::InvariantViolation(format!(
                            "no time step assigned at {}",
                            self.pdt.node(leaf).name
                        ))
                    })?
                } else {
                    self.actions.len()
                };

                let action = self.instance.action(op_id);
                let filtered =
                    action.name.contains("__method_precondition") || action.name == "__noop";
                if !filtered {
                    self.actions
                        .push((time_step, format!("{plan_id} {}", action.name)));
                }
                Ok(Some(if filtered { -plan_id } else { plan_id }))
            }
            OpKind::Method => {
                let method_id = op_id as usize;
                let method = self.instance.method(method_id);
                let parent_task = parent_task.ok_or_else(|| {
                    PlannerError::InvariantViolation(format!(
                        "method {} chosen at an action position",
                        method.name
                    ))
                })?;

                let mut line = String::new();
                if self.instance.is_root_task(parent_task) {
                    line.push_str(&format!("root {plan_id}\n"));
                }
                line.push_str(&format!(
                    "{plan_id} {} -> {}",
                    self.instance.abstract_task(parent_task).name,
                    method.name
                ));

                let children = self.pdt.node(id).children.clone();
                for (j, child) in children.into_iter().enumerate() {
                    let subtask_idx = if self.partial_order {
                        match self.pdt.node(child).parent_method_subtask.get(&method_id) {
                            Some(&idx) => idx,
                            // this child only holds a blank for this method
                            None => continue,
                        }
                    } else {
                        j
                    };
                    let Some(&subtask) = method.subtasks.get(subtask_idx) else {
                        continue;
                    };
                    let child_parent_task = self.instance.is_abstract(subtask).then_some(subtask);
                    if let Some(sub_id) = self.process(child, child_parent_task)? {
                        line.push_str(&format!(" {sub_id}"));
                    }
                }
                self.decompositions.push(line);
                Ok(Some(plan_id))
            }
        }
    }
}
