//! Clause emission for the plan decomposition tree.
//!
//! One encoder instance lives as long as the planner: clauses accumulate in
//! the incremental solver across layers, assumptions select the current
//! frontier. The totally-ordered and partially-ordered paths share the
//! hierarchy and primitiveness clauses and differ in how facts connect
//! consecutive positions.

use std::collections::{BTreeMap, BTreeSet};

use rustsat::types::{Lit, Var};
use sylva_instance::{GroundedInstance, OpKind};
use sylva_sat::{at_most_one, SatBackend, SolveOutcome, VarProvider};
use tracing::{debug, info};

use crate::pdt::{NodeId, ParentOp, Pdt};
use crate::{PlannerError, PlannerOptions};

pub struct Encoder<'a> {
    instance: &'a GroundedInstance,
    pub sat: SatBackend,
    pub vars: VarProvider,
    /// Fact bank for the state after the last position (totally-ordered
    /// mode reads it as the "next" bank of the final leaf).
    goal_fact_vars: Vec<Var>,
    /// One slack variable per encoded partially-ordered layer.
    leaf_overleaf_vars: Vec<Var>,
    layer_idx: usize,
    encode_mutexes: bool,
    /// Emit method precondition/effect clauses (requires inference).
    method_clauses: bool,
}

impl<'a> Encoder<'a> {
    pub fn new(
        instance: &'a GroundedInstance,
        options: &PlannerOptions,
    ) -> Result<Self, PlannerError> {
        let mut vars = VarProvider::new(options.print_variable_names);
        let goal_fact_vars = (0..instance.num_predicates())
            .map(|p| vars.fresh_named(|| format!("{}__goal", instance.predicates[p].name)))
            .collect();
        let sat = SatBackend::new(options.write_formula.as_deref())?;
        Ok(Encoder {
            instance,
            sat,
            vars,
            goal_fact_vars,
            leaf_overleaf_vars: Vec::new(),
            layer_idx: 0,
            encode_mutexes: options.use_mutexes,
            method_clauses: options.use_effect_inference,
        })
    }

    pub fn last_leaf_overleaf(&self) -> Option<Var> {
        self.leaf_overleaf_vars.last().copied()
    }

    /// The fact bank describing the state after the final position.
    pub fn goal_fact_vars(&self) -> &[Var] {
        &self.goal_fact_vars
    }

    pub fn assume(&mut self, lit: Lit) {
        self.sat.assume(lit);
    }

    pub fn solve(&mut self) -> Result<SolveOutcome, PlannerError> {
        let outcome = self.sat.solve()?;
        info!(
            clauses = self.sat.stats.num_clauses,
            literals = self.sat.stats.num_literals,
            solves = self.sat.stats.num_solves,
            outcome = ?outcome,
            "solver returned"
        );
        Ok(outcome)
    }

    pub fn holds(&self, lit: Lit) -> bool {
        self.sat.holds(lit)
    }

    /// Force the initial state on the root fact bank, the goal on the goal
    /// bank, and the root method variable.
    pub fn initial_encode(&mut self, pdt: &Pdt, root: NodeId) -> Result<(), PlannerError> {
        let node = pdt.node(root);
        for p in 0..self.instance.num_predicates() {
            let lit = node.fact_vars[p].pos_lit();
            if self.instance.init_state.contains(&p) {
                self.sat.add_unit(lit)?;
            } else {
                self.sat.add_unit(!lit)?;
            }
        }
        for &p in &self.instance.goal_state {
            self.sat.add_unit(self.goal_fact_vars[p].pos_lit())?;
        }

        if !node.actions.is_empty() || node.methods.len() != 1 {
            return Err(PlannerError::InvariantViolation(
                "root node must carry exactly one method and no action".into(),
            ));
        }
        let root_method_var = *node.method_vars.values().next().ok_or_else(|| {
            PlannerError::InvariantViolation("root method variable not allocated".into())
        })?;
        self.sat.add_unit(root_method_var.pos_lit())?;
        Ok(())
    }

    /// Encode a totally-ordered frontier: position i+1 is the successor of
    /// position i, the goal bank follows the last position.
    pub fn encode_total_order(
        &mut self,
        pdt: &Pdt,
        leaves: &[NodeId],
    ) -> Result<(), PlannerError> {
        for (i, &id) in leaves.iter().enumerate() {
            let node = pdt.node(id);
            let current = node.fact_vars.clone();
            let next = match leaves.get(i + 1) {
                Some(&n) => pdt.node(n).fact_vars.clone(),
                None => self.goal_fact_vars.clone(),
            };

            let mut adds_by: BTreeMap<usize, Vec<Lit>> = BTreeMap::new();
            let mut deletes_by: BTreeMap<usize, Vec<Lit>> = BTreeMap::new();

            for (&action_id, &var) in &node.action_vars {
                let action = self.instance.action(action_id);
                let lit = var.pos_lit();
                for &p in &action.preconditions {
                    self.sat.add_binary(!lit, current[p].pos_lit())?;
                }
                for &p in &action.add_effects {
                    self.sat.add_binary(!lit, next[p].pos_lit())?;
                    adds_by.entry(p).or_default().push(lit);
                }
                for &p in &action.delete_effects {
                    self.sat.add_binary(!lit, !next[p].pos_lit())?;
                    deletes_by.entry(p).or_default().push(lit);
                }
            }

            self.encode_primitiveness(pdt, id)?;

            // Frame axioms: a fact can only flip if the position is
            // non-primitive or some selected action explains the flip.
            let prim = node.prim_var.expect("prim variable assigned").pos_lit();
            for p in 0..self.instance.num_predicates() {
                let mut clause = vec![!current[p].pos_lit(), next[p].pos_lit(), !prim];
                if let Some(lits) = deletes_by.get(&p) {
                    clause.extend(lits);
                }
                self.sat.add_clause(&clause)?;

                let mut clause = vec![current[p].pos_lit(), !next[p].pos_lit(), !prim];
                if let Some(lits) = adds_by.get(&p) {
                    clause.extend(lits);
                }
                self.sat.add_clause(&clause)?;
            }

            if self.encode_mutexes && i > 0 {
                self.encode_mutex_groups(&current)?;
            }

            self.encode_hierarchy(pdt, id)?;
        }
        self.layer_idx += 1;
        Ok(())
    }

    /// Encode a partially-ordered frontier with explicit "next" and
    /// "before" literals.
    pub fn encode_partial_order(
        &mut self,
        pdt: &Pdt,
        leaves: &[NodeId],
    ) -> Result<(), PlannerError> {
        info!(nodes = leaves.len(), "encoding partially ordered frontier");
        self.encode_ordering_clauses(pdt, leaves)?;
        self.encode_hierarchy_ordering_lift(pdt, leaves)?;
        // The previous layer's slack literal guards the all-pairs lift.
        let parent_overleaf = self.last_leaf_overleaf();
        self.encode_hierarchy_ordering_lift_all_pairs(pdt, leaves, parent_overleaf)?;

        if self.encode_mutexes {
            for &id in leaves {
                let bank = pdt.node(id).fact_vars.clone();
                self.encode_mutex_groups(&bank)?;
            }
        }

        let layer = self.layer_idx;
        let overleaf = self
            .vars
            .fresh_named(|| format!("layer_{layer}__leaf_overleaf"))
            .pos_lit();
        self.leaf_overleaf_vars.push(overleaf.var());

        for &id in leaves {
            self.encode_primitiveness(pdt, id)?;
            self.encode_hierarchy(pdt, id)?;
            self.encode_po_operations(pdt, id, overleaf)?;
        }

        self.layer_idx += 1;
        Ok(())
    }

    /// Predecessor/successor exactly-one, next ⇒ before, transitivity and
    /// hard precedence units for one frontier.
    fn encode_ordering_clauses(
        &mut self,
        pdt: &Pdt,
        leaves: &[NodeId],
    ) -> Result<(), PlannerError> {
        for &id in leaves {
            let node = pdt.node(id);

            let prev_vars: Vec<Lit> = node
                .possible_prev
                .keys()
                .map(|&prev| pdt.node(prev).next_vars[&id].pos_lit())
                .collect();
            if !prev_vars.is_empty() {
                self.sat.add_clause(&prev_vars)?;
            }
            if prev_vars.len() > 1 {
                self.encode_at_most_one(&prev_vars)?;
            }

            let mut succ_vars: Vec<Lit> = Vec::new();
            for (&next_id, _) in &node.possible_next {
                let next_lit = node.next_vars[&next_id].pos_lit();
                succ_vars.push(next_lit);

                let Some(&before) = node.before_lits.get(&next_id) else {
                    debug!(node = %node.name, "next edge without a before literal, skipping");
                    continue;
                };
                // next(i, k) ⇒ before(i, k)
                self.sat.add_binary(!next_lit, before)?;
                // before(i, k) ⇒ ¬next(k, i)
                if let Some(&reverse_next) = pdt.node(next_id).next_vars.get(&id) {
                    self.sat.add_binary(!before, !reverse_next.pos_lit())?;
                }

                // Transitivity against every third node of the layer.
                for &other in leaves {
                    if other == id || other == next_id {
                        continue;
                    }
                    let other_node = pdt.node(other);
                    if other_node.must_before.contains(&id)
                        || other_node.must_before.contains(&next_id)
                    {
                        continue;
                    }
                    let (Some(&a_before_i), Some(&a_before_k)) = (
                        other_node.before_lits.get(&id),
                        other_node.before_lits.get(&next_id),
                    ) else {
                        continue;
                    };
                    // ¬(a before i) ∧ next(i, k) ⇒ ¬(a before k)
                    self.sat.add_ternary(a_before_i, !next_lit, !a_before_k)?;
                    // (a before i) ∧ (i before k) ⇒ (a before k)
                    self.sat.add_ternary(!a_before_i, !before, a_before_k)?;
                }
            }
            if !succ_vars.is_empty() {
                self.sat.add_clause(&succ_vars)?;
            }
            if succ_vars.len() > 1 {
                self.encode_at_most_one(&succ_vars)?;
            }

            // Hard precedence pins the corresponding before literals.
            for &prev in &node.must_before {
                let lit = *pdt.node(prev).before_lits.get(&id).ok_or_else(|| {
                    PlannerError::InvariantViolation(format!(
                        "missing before literal {} -> {}",
                        pdt.node(prev).name,
                        node.name
                    ))
                })?;
                self.sat.add_unit(lit)?;
            }
            for &next in &node.must_after {
                let lit = *node.before_lits.get(&next).ok_or_else(|| {
                    PlannerError::InvariantViolation(format!(
                        "missing before literal {} -> {}",
                        node.name,
                        pdt.node(next).name
                    ))
                })?;
                self.sat.add_unit(lit)?;
            }
        }
        Ok(())
    }

    /// If a parent is ordered before another parent, some first child of
    /// the successor parent must follow some first child of this one.
    fn encode_hierarchy_ordering_lift(
        &mut self,
        pdt: &Pdt,
        leaves: &[NodeId],
    ) -> Result<(), PlannerError> {
        let mut first_children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for &id in leaves {
            let node = pdt.node(id);
            if node.can_be_first_child {
                if let Some(parent) = node.parent {
                    first_children.entry(parent).or_default().push(id);
                }
            }
        }

        for (&parent, firsts) in &first_children {
            let parent_node = pdt.node(parent);
            for &next_parent in parent_node.possible_next.keys() {
                let Some(&parent_before) = parent_node.before_lits.get(&next_parent) else {
                    continue;
                };
                let empty = Vec::new();
                let next_firsts = first_children.get(&next_parent).unwrap_or(&empty);
                let mut clause = vec![!parent_before];
                for &fc in firsts {
                    for &nfc in next_firsts {
                        if let Some(&before) = pdt.node(fc).before_lits.get(&nfc) {
                            clause.push(before);
                        }
                    }
                }
                if clause.len() > 1 {
                    self.sat.add_clause(&clause)?;
                }
            }
        }
        Ok(())
    }

    /// Stronger lift, guarded by the previous layer's slack literal: with
    /// no overleaf, parent ordering forces every child pair's ordering.
    fn encode_hierarchy_ordering_lift_all_pairs(
        &mut self,
        pdt: &Pdt,
        leaves: &[NodeId],
        parent_overleaf: Option<Var>,
    ) -> Result<(), PlannerError> {
        let mut children_of: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for &id in leaves {
            if let Some(parent) = pdt.node(id).parent {
                children_of.entry(parent).or_default().push(id);
            }
        }

        for (&parent, children) in &children_of {
            let parent_node = pdt.node(parent);
            for &next_parent in parent_node.possible_next.keys() {
                let Some(&parent_before) = parent_node.before_lits.get(&next_parent) else {
                    continue;
                };
                let empty = Vec::new();
                let next_children = children_of.get(&next_parent).unwrap_or(&empty);
                for &child in children {
                    for &next_child in next_children {
                        if let Some(&before) = pdt.node(child).before_lits.get(&next_child) {
                            let mut clause = vec![!parent_before];
                            if let Some(overleaf) = parent_overleaf {
                                clause.push(overleaf.pos_lit());
                            }
                            clause.push(before);
                            self.sat.add_clause(&clause)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Preconditions, effects and frame axioms of one partially-ordered
    /// node, routed through its possible-next edges and weakened by the
    /// layer's slack literal.
    fn encode_po_operations(
        &mut self,
        pdt: &Pdt,
        id: NodeId,
        overleaf: Lit,
    ) -> Result<(), PlannerError> {
        let node = pdt.node(id);
        let current = &node.fact_vars;

        // Action preconditions hold at the node's own bank, unguarded.
        for (&action_id, &var) in &node.action_vars {
            let lit = var.pos_lit();
            for &p in &self.instance.action(action_id).preconditions {
                self.sat.add_binary(!lit, current[p].pos_lit())?;
            }
        }
        // Method preconditions are relaxable.
        if self.method_clauses {
            for (&method_id, &var) in &node.method_vars {
                let lit = var.pos_lit();
                for &p in &self.instance.method(method_id).preconditions {
                    self.sat.add_ternary(!lit, overleaf, current[p].pos_lit())?;
                }
            }
        }

        // Effects propagate along each chosen next edge.
        for (&next_id, &next_var) in &node.next_vars {
            let next_lit = next_var.pos_lit();
            let next_bank = &pdt.node(next_id).fact_vars;
            for (&action_id, &var) in &node.action_vars {
                let lit = var.pos_lit();
                let action = self.instance.action(action_id);
                for &p in &action.add_effects {
                    self.sat
                        .add_clause(&[!lit, !next_lit, overleaf, next_bank[p].pos_lit()])?;
                }
                for &p in &action.delete_effects {
                    self.sat
                        .add_clause(&[!lit, !next_lit, overleaf, !next_bank[p].pos_lit()])?;
                }
            }
            if self.method_clauses {
                for (&method_id, &var) in &node.method_vars {
                    let lit = var.pos_lit();
                    let method = self.instance.method(method_id);
                    for &p in &method.certified_pos {
                        self.sat
                            .add_clause(&[!lit, !next_lit, overleaf, next_bank[p].pos_lit()])?;
                    }
                    for &p in &method.certified_neg {
                        self.sat
                            .add_clause(&[!lit, !next_lit, overleaf, !next_bank[p].pos_lit()])?;
                    }
                }
            }
        }

        // Which selected operations can explain a fact flip.
        let mut adds_by: BTreeMap<usize, Vec<Lit>> = BTreeMap::new();
        let mut deletes_by: BTreeMap<usize, Vec<Lit>> = BTreeMap::new();
        for (&action_id, &var) in &node.action_vars {
            let action = self.instance.action(action_id);
            for &p in &action.add_effects {
                adds_by.entry(p).or_default().push(var.pos_lit());
            }
            for &p in &action.delete_effects {
                deletes_by.entry(p).or_default().push(var.pos_lit());
            }
        }
        if self.method_clauses {
            for (&method_id, &var) in &node.method_vars {
                let method = self.instance.method(method_id);
                for &p in &method.possible_pos {
                    adds_by.entry(p).or_default().push(var.pos_lit());
                }
                for &p in &method.possible_neg {
                    deletes_by.entry(p).or_default().push(var.pos_lit());
                }
            }
        }

        let prim = node.prim_var.expect("prim variable assigned").pos_lit();
        for (&next_id, &next_var) in &node.next_vars {
            let next_lit = next_var.pos_lit();
            let next_bank = &pdt.node(next_id).fact_vars;
            for p in 0..self.instance.num_predicates() {
                let mut clause = vec![!current[p].pos_lit(), next_bank[p].pos_lit(), !next_lit];
                if !self.method_clauses {
                    clause.push(!prim);
                }
                clause.push(overleaf);
                if let Some(lits) = deletes_by.get(&p) {
                    clause.extend(lits);
                }
                self.sat.add_clause(&clause)?;

                let mut clause = vec![current[p].pos_lit(), !next_bank[p].pos_lit(), !next_lit];
                if !self.method_clauses {
                    clause.push(!prim);
                }
                clause.push(overleaf);
                if let Some(lits) = adds_by.get(&p) {
                    clause.extend(lits);
                }
                self.sat.add_clause(&clause)?;
            }
        }
        Ok(())
    }

    fn encode_primitiveness(&mut self, pdt: &Pdt, id: NodeId) -> Result<(), PlannerError> {
        let node = pdt.node(id);
        let prim = node.prim_var.expect("prim variable assigned").pos_lit();
        for &var in node.action_vars.values() {
            self.sat.add_binary(!var.pos_lit(), prim)?;
        }
        for &var in node.method_vars.values() {
            self.sat.add_binary(!var.pos_lit(), !prim)?;
        }
        Ok(())
    }

    /// Child ⇒ some parent; parent ⇒ some child; at-most-one over either
    /// the children of each parent or all candidates, whichever is smaller.
    fn encode_hierarchy(&mut self, pdt: &Pdt, id: NodeId) -> Result<(), PlannerError> {
        let node = pdt.node(id);
        let Some(parent_id) = node.parent else {
            return Ok(());
        };
        let parent = pdt.node(parent_id);

        let mut children_of_parent_var: BTreeMap<Var, BTreeSet<Var>> = BTreeMap::new();

        for (&child_method, parents) in &node.parents_of_method {
            let child_var = node.method_vars[&child_method];
            let mut clause = vec![!child_var.pos_lit()];
            for &parent_method in parents {
                let parent_var = *parent.method_vars.get(&parent_method).ok_or_else(|| {
                    PlannerError::InvariantViolation(format!(
                        "parent method {parent_method} of child method {child_method} missing at {}",
                        parent.name
                    ))
                })?;
                children_of_parent_var
                    .entry(parent_var)
                    .or_default()
                    .insert(child_var);
                clause.push(parent_var.pos_lit());
            }
            self.sat.add_clause(&clause)?;
        }

        for (&child_action, parents) in &node.parents_of_action {
            let child_var = node.action_vars[&child_action];
            let mut clause = vec![!child_var.pos_lit()];
            for &parent_op in parents {
                let parent_var = match parent_op {
                    ParentOp::Action(a) => parent.action_vars.get(&a).copied(),
                    ParentOp::Method(m) => parent.method_vars.get(&m).copied(),
                };
                let parent_var = parent_var.ok_or_else(|| {
                    PlannerError::InvariantViolation(format!(
                        "parent {parent_op:?} of child action {child_action} missing at {}",
                        parent.name
                    ))
                })?;
                children_of_parent_var
                    .entry(parent_var)
                    .or_default()
                    .insert(child_var);
                clause.push(parent_var.pos_lit());
            }
            self.sat.add_clause(&clause)?;
        }

        // At-most-one either per parent's child set or over all candidate
        // operations, whichever stays below half the candidate count.
        let num_ops = node.method_vars.len() + node.action_vars.len();
        let half = num_ops / 2;
        let amo_on_children = children_of_parent_var
            .values()
            .all(|children| children.len() <= half);

        for (parent_var, children) in &children_of_parent_var {
            let mut clause = vec![!parent_var.pos_lit()];
            clause.extend(children.iter().map(|v| v.pos_lit()));
            self.sat.add_clause(&clause)?;
            if amo_on_children {
                let lits: Vec<Lit> = children.iter().map(|v| v.pos_lit()).collect();
                self.encode_at_most_one(&lits)?;
            }
        }

        if !amo_on_children {
            let lits: Vec<Lit> = node
                .method_vars
                .values()
                .chain(node.action_vars.values())
                .map(|v| v.pos_lit())
                .collect();
            self.encode_at_most_one(&lits)?;
        }
        Ok(())
    }

    fn encode_mutex_groups(&mut self, bank: &[Var]) -> Result<(), PlannerError> {
        let groups: Vec<Vec<usize>> = self.instance.mutexes.groups().to_vec();
        for group in groups {
            let lits: Vec<Lit> = group.iter().map(|&p| bank[p].pos_lit()).collect();
            self.encode_at_most_one(&lits)?;
        }
        Ok(())
    }

    fn encode_at_most_one(&mut self, lits: &[Lit]) -> Result<(), PlannerError> {
        let mut clauses = Vec::new();
        at_most_one(lits, &mut self.vars, &mut clauses);
        for clause in clauses {
            self.sat.add_clause(&clause)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Model extraction
    // -----------------------------------------------------------------

    /// Record the selected operation of every node from the SAT model.
    /// Exactly one candidate per node must hold.
    pub fn extract_chosen_ops(
        &self,
        pdt: &mut Pdt,
        root: NodeId,
        partial_order: bool,
    ) -> Result<(), PlannerError> {
        let mut stack = vec![root];
        let mut leaves_to_time = Vec::new();
        while let Some(id) = stack.pop() {
            let node = pdt.node(id);
            let is_leaf = node.children.is_empty();
            let mut chosen: Vec<(i32, OpKind)> = Vec::new();
            for (&method, &var) in &node.method_vars {
                if self.sat.holds(var.pos_lit()) {
                    if is_leaf {
                        return Err(PlannerError::InvariantViolation(format!(
                            "method selected at leaf {}",
                            node.name
                        )));
                    }
                    chosen.push((method as i32, OpKind::Method));
                }
            }
            for (&action, &var) in &node.action_vars {
                if self.sat.holds(var.pos_lit()) {
                    chosen.push((action, OpKind::Action));
                }
            }
            let [op] = chosen.as_slice() else {
                return Err(PlannerError::InvariantViolation(format!(
                    "{} operations selected at {}",
                    chosen.len(),
                    node.name
                )));
            };
            let op = *op;
            if partial_order && is_leaf && op.1 == OpKind::Action {
                leaves_to_time.push(id);
            }
            stack.extend(pdt.node(id).children.iter().copied());
            pdt.node_mut(id).chosen_op = Some(op);
        }

        for id in leaves_to_time {
            self.assign_time_step(pdt, id)?;
        }
        Ok(())
    }

    /// Walk the chosen-next predecessor chain back to the node with no
    /// possible predecessor and number the chain forward from zero.
    fn assign_time_step(&self, pdt: &mut Pdt, leaf: NodeId) -> Result<(), PlannerError> {
        let mut chain = Vec::new();
        let mut cursor = leaf;
        let mut visited = BTreeSet::new();

        // Either an already-numbered node or the chain head stops the walk.
        let start = loop {
            if let Some(ts) = pdt.node(cursor).time_step {
                break ts + 1;
            }
            if !visited.insert(cursor) {
                return Err(PlannerError::InvariantViolation(
                    "cycle in chosen next-literals".into(),
                ));
            }
            let node = pdt.node(cursor);
            chain.push(cursor);
            if node.possible_prev.is_empty() {
                break 0;
            }
            let prev = node
                .possible_prev
                .keys()
                .find(|&&prev| self.sat.holds(pdt.node(prev).next_vars[&cursor].pos_lit()))
                .copied()
                .ok_or_else(|| {
                    PlannerError::InvariantViolation(format!(
                        "no chosen predecessor for {}",
                        node.name
                    ))
                })?;
            cursor = prev;
        };

        let mut ts = start;
        for &id in chain.iter().rev() {
            pdt.node_mut(id).time_step = Some(ts);
            ts += 1;
        }
        Ok(())
    }
}
