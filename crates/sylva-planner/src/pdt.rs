//! The plan decomposition tree.
//!
//! Nodes live in an arena and refer to each other by index; the tree is
//! strictly downward-owned and all sibling/ancestor links are plain
//! indices. Candidate sets and variable maps are ordered so variable
//! allocation and clause emission are deterministic.

use std::collections::{BTreeMap, BTreeSet};

use rustsat::types::{Lit, Var};
use sylva_analysis::compress::{compress_dags, remove_transitive_edges, DagSpec};
use sylva_instance::{GroundedInstance, OpKind, TaskRef, BLANK_ID};
use sylva_sat::VarProvider;

/// Arena index of a PDT node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// A candidate's parent operation in the layer above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParentOp {
    Method(usize),
    /// An action parent arises when a primitive repeats into the next
    /// layer because it has nothing left to decompose.
    Action(i32),
}

/// Relation between a node and one of its possible immediate successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextKind {
    /// Same parent, with a precedence edge between the positions.
    SiblingOrdered,
    /// Same parent, positions incomparable.
    SiblingUnordered,
    /// Different parents, precedence inherited from the parents.
    NonSiblingOrdered,
    /// Different parents, no precedence between the parents.
    NonSiblingUnordered,
}

/// One node of the plan decomposition tree.
#[derive(Debug, Default)]
pub struct PdtNode {
    pub layer: usize,
    pub pos: usize,
    pub offset: usize,
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,

    /// Candidate decomposition methods at this position.
    pub methods: BTreeSet<usize>,
    /// Candidate actions (including sentinels) at this position.
    pub actions: BTreeSet<i32>,
    /// Which parent methods can select each candidate method.
    pub parents_of_method: BTreeMap<usize, BTreeSet<usize>>,
    /// Which parent operations can select each candidate action.
    pub parents_of_action: BTreeMap<i32, BTreeSet<ParentOp>>,
    /// For each candidate parent method, the subtask position this child
    /// realizes.
    pub parent_method_subtask: BTreeMap<usize, usize>,

    /// Hard precedence: nodes that must execute before / after this one.
    pub must_before: BTreeSet<NodeId>,
    pub must_after: BTreeSet<NodeId>,
    /// Possible immediate successors / predecessors with their relation.
    pub possible_next: BTreeMap<NodeId, NextKind>,
    pub possible_prev: BTreeMap<NodeId, NextKind>,
    pub can_be_first_child: bool,
    pub can_be_last_child: bool,
    pub must_be_first_child: bool,

    // SAT variables, filled by `assign_variables`.
    pub method_vars: BTreeMap<usize, Var>,
    pub action_vars: BTreeMap<i32, Var>,
    pub fact_vars: Vec<Var>,
    pub prim_var: Option<Var>,
    pub leaf_overleaf_var: Option<Var>,
    pub next_vars: BTreeMap<NodeId, Var>,
    /// Asymmetric "executes before" literals towards other leaves of the
    /// same layer. The reverse direction holds the negated literal of the
    /// same variable.
    pub before_lits: BTreeMap<NodeId, Lit>,

    // Solution slots, filled after a satisfiable solve.
    pub chosen_op: Option<(i32, OpKind)>,
    pub time_step: Option<usize>,
}

/// The arena-backed tree.
#[derive(Debug, Default)]
pub struct Pdt {
    pub nodes: Vec<PdtNode>,
}

impl Pdt {
    pub fn new() -> Self {
        Pdt::default()
    }

    pub fn add_root(&mut self) -> NodeId {
        debug_assert!(self.nodes.is_empty());
        self.nodes.push(PdtNode {
            name: "root".to_string(),
            can_be_first_child: true,
            can_be_last_child: true,
            ..PdtNode::default()
        });
        NodeId(0)
    }

    fn add_child(&mut self, parent: NodeId) -> NodeId {
        let id = NodeId(self.nodes.len());
        let p = &self.nodes[parent.0];
        let offset = p.children.len();
        let child = PdtNode {
            layer: p.layer + 1,
            pos: p.pos + offset,
            offset,
            name: format!("{}->{}", p.name, offset),
            parent: Some(parent),
            can_be_first_child: true,
            can_be_last_child: true,
            ..PdtNode::default()
        };
        self.nodes.push(child);
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &PdtNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut PdtNode {
        &mut self.nodes[id.0]
    }

    fn add_method(&mut self, node: NodeId, method: usize, parent_method: usize) {
        let n = self.node_mut(node);
        n.methods.insert(method);
        n.parents_of_method
            .entry(method)
            .or_default()
            .insert(parent_method);
    }

    fn add_action(&mut self, node: NodeId, action: i32, parent: ParentOp) {
        let n = self.node_mut(node);
        n.actions.insert(action);
        n.parents_of_action.entry(action).or_default().insert(parent);
    }

    fn add_must_before(&mut self, node: NodeId, before: NodeId) {
        self.node_mut(node).must_before.insert(before);
        self.node_mut(before).must_after.insert(node);
    }

    pub fn add_possible_next(&mut self, node: NodeId, next: NodeId, kind: NextKind) {
        self.node_mut(node).possible_next.insert(next, kind);
        self.node_mut(next).possible_prev.insert(node, kind);
    }

    /// Leaves of the subtree rooted at `id`.
    pub fn collect_leaves(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut leaves = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let node = self.node(n);
            if node.children.is_empty() {
                leaves.insert(n);
            } else {
                stack.extend(node.children.iter().copied());
            }
        }
        leaves
    }

    /// Totally-ordered expansion: child count is the maximum subtask count
    /// over the candidate methods, trailing slots are padded with the
    /// blank action, and candidate actions repeat into the first slot.
    pub fn expand(&mut self, id: NodeId, instance: &GroundedInstance) {
        let methods: Vec<usize> = self.node(id).methods.iter().copied().collect();
        let actions: Vec<i32> = self.node(id).actions.iter().copied().collect();

        let num_children = methods
            .iter()
            .map(|&m| instance.method(m).subtasks.len())
            .max()
            .unwrap_or(1)
            .max(1);

        let children: Vec<NodeId> = (0..num_children).map(|_| self.add_child(id)).collect();

        for &action in &actions {
            self.add_action(children[0], action, ParentOp::Action(action));
            for &slot in &children[1..] {
                self.add_action(slot, BLANK_ID, ParentOp::Action(action));
            }
        }

        for &method_id in &methods {
            let subtasks = instance.method(method_id).subtasks.clone();
            for (j, &subtask) in subtasks.iter().enumerate() {
                match instance.task_ref(subtask) {
                    TaskRef::Abstract(task) => {
                        let decompositions =
                            instance.abstract_task(task).decomposition_methods.clone();
                        for sub_method in decompositions {
                            self.add_method(children[j], sub_method, method_id);
                        }
                    }
                    TaskRef::Action(action) => {
                        self.add_action(children[j], action, ParentOp::Method(method_id));
                    }
                }
            }
            for &slot in &children[subtasks.len()..] {
                self.add_action(slot, BLANK_ID, ParentOp::Method(method_id));
            }
        }
    }

    /// Partially-ordered expansion over the compressed DAG of the method
    /// structures present at this position.
    pub fn expand_po(&mut self, id: NodeId, instance: &GroundedInstance) {
        let methods: Vec<usize> = self.node(id).methods.iter().copied().collect();
        let actions: Vec<i32> = self.node(id).actions.iter().copied().collect();

        // Hard predecessors of every child: the current leaves under each
        // node this one must follow.
        let mut hard_before: BTreeSet<NodeId> = BTreeSet::new();
        for before in self.node(id).must_before.clone() {
            hard_before.extend(self.collect_leaves(before));
        }

        let mut dags: BTreeMap<usize, DagSpec> = BTreeMap::new();
        for &method_id in &methods {
            let sid = instance.structure_of_method(method_id);
            dags.entry(sid).or_insert_with(|| {
                let structure = instance.structure(sid);
                DagSpec {
                    num_nodes: structure.num_subtasks,
                    edges: structure.ordering_constraints.clone(),
                }
            });
        }
        let compressed = compress_dags(&dags);
        let direct_edges = remove_transitive_edges(&compressed.edges);
        let num_children = compressed.nodes.len();

        let children: Vec<NodeId> = (0..num_children).map(|_| self.add_child(id)).collect();
        let child_of_dag_id: BTreeMap<usize, usize> = compressed
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, i))
            .collect();
        let ordering: Vec<(usize, usize)> = compressed
            .edges
            .iter()
            .map(|&(u, v)| (child_of_dag_id[&u], child_of_dag_id[&v]))
            .collect();
        let direct_ordering: Vec<(usize, usize)> = direct_edges
            .iter()
            .map(|&(u, v)| (child_of_dag_id[&u], child_of_dag_id[&v]))
            .collect();

        for (idx, &child) in children.iter().enumerate() {
            let mut unrelated: BTreeSet<usize> = (0..num_children).filter(|&i| i != idx).collect();
            let mut can_be_first = true;
            let mut can_be_last = true;
            let mut must_be_first = true;

            for &before in &hard_before {
                self.add_must_before(child, before);
            }
            for &(a, b) in &ordering {
                if b == idx {
                    self.add_must_before(child, children[a]);
                    unrelated.remove(&a);
                    can_be_first = false;
                    must_be_first = false;
                }
                if a == idx {
                    unrelated.remove(&b);
                    can_be_last = false;
                }
            }

            for &(a, b) in &direct_ordering {
                if a == idx {
                    self.add_possible_next(child, children[b], NextKind::SiblingOrdered);
                }
            }
            for &other in &unrelated {
                self.add_possible_next(child, children[other], NextKind::SiblingUnordered);
                must_be_first = false;
            }

            let node = self.node_mut(child);
            node.can_be_first_child = can_be_first;
            node.can_be_last_child = can_be_last;
            node.must_be_first_child = must_be_first;
        }

        if num_children == 0 {
            // Only actions at this position: one child carries them.
            let child = self.add_child(id);
            for &before in &hard_before {
                self.add_must_before(child, before);
            }
            for &action in &actions {
                self.add_action(child, action, ParentOp::Action(action));
            }
            return;
        }

        for (idx, &child) in children.iter().enumerate() {
            let members = compressed.nodes[idx].members.clone();
            for &method_id in &methods {
                let sid = instance.structure_of_method(method_id);
                match members.get(&sid) {
                    Some(&subtask_idx) => {
                        self.node_mut(child)
                            .parent_method_subtask
                            .insert(method_id, subtask_idx);
                        let op = instance.method(method_id).subtasks[subtask_idx];
                        match instance.task_ref(op) {
                            TaskRef::Abstract(task) => {
                                let decompositions =
                                    instance.abstract_task(task).decomposition_methods.clone();
                                for sub_method in decompositions {
                                    self.add_method(child, sub_method, method_id);
                                }
                            }
                            TaskRef::Action(action) => {
                                self.add_action(child, action, ParentOp::Method(method_id));
                            }
                        }
                    }
                    None => {
                        // This method's structure is absent from the
                        // compressed position.
                        self.add_action(child, BLANK_ID, ParentOp::Method(method_id));
                    }
                }
            }

            // Action repetitions only enter first children.
            if idx == 0 {
                for &action in &actions {
                    self.add_action(child, action, ParentOp::Action(action));
                }
            } else {
                for &action in &actions {
                    self.add_action(child, BLANK_ID, ParentOp::Action(action));
                }
            }
        }
    }

    /// Wire possible-next edges across parents. An ordered parent pair only
    /// lets last children precede first children of the successor parent;
    /// an unordered pair admits every child pair.
    pub fn make_ordering_no_sibling(&mut self, id: NodeId) {
        let Some(parent) = self.node(id).parent else {
            return;
        };
        let parent_nexts: Vec<(NodeId, NextKind)> = self
            .node(parent)
            .possible_next
            .iter()
            .map(|(&n, &k)| (n, k))
            .collect();

        for (next_parent, kind) in parent_nexts {
            if kind == NextKind::SiblingOrdered || kind == NextKind::NonSiblingOrdered {
                if !self.node(id).can_be_last_child {
                    continue;
                }
                let candidates: Vec<NodeId> = self
                    .node(next_parent)
                    .children
                    .iter()
                    .copied()
                    .filter(|&c| self.node(c).can_be_first_child)
                    .collect();
                for child in candidates {
                    self.add_possible_next(id, child, NextKind::SiblingOrdered);
                }
            } else {
                let candidates: Vec<NodeId> = self.node(next_parent).children.clone();
                for child in candidates {
                    self.add_possible_next(id, child, NextKind::NonSiblingUnordered);
                }
            }
        }
    }

    /// Allocate SAT variables for a node, reusing parent variables where
    /// the encoding allows it.
    pub fn assign_variables(
        &mut self,
        id: NodeId,
        instance: &GroundedInstance,
        vars: &mut VarProvider,
        partial_order: bool,
    ) {
        let node = self.node(id);
        let parent = node.parent;
        let name = node.name.clone();
        let position = format!("{}_{}", node.layer, node.pos);
        let methods: Vec<usize> = node.methods.iter().copied().collect();
        let actions: Vec<i32> = node.actions.iter().copied().collect();
        let nexts: Vec<NodeId> = node.possible_next.keys().copied().collect();
        let offset = node.offset;

        let parent_action_vars: BTreeMap<i32, Var> = parent
            .map(|p| self.node(p).action_vars.clone())
            .unwrap_or_default();
        let parent_fact_vars: Vec<Var> = parent
            .map(|p| self.node(p).fact_vars.clone())
            .unwrap_or_default();

        for &method in &methods {
            let var = vars
                .fresh_named(|| format!("{}__{}", instance.method(method).name, name));
            self.node_mut(id).method_vars.insert(method, var);
        }

        for &action in &actions {
            // A first child whose only way to carry this action is the
            // action repeating itself shares the parent's variable.
            let parents = self.node(id).parents_of_action.get(&action);
            let reuse = offset == 0
                && parents.is_some_and(|ps| {
                    ps.len() == 1 && matches!(ps.iter().next(), Some(ParentOp::Action(_)))
                })
                && parent_action_vars.contains_key(&action);
            let var = if reuse {
                parent_action_vars[&action]
            } else {
                vars.fresh_named(|| format!("{}__{}", instance.action(action).name, name))
            };
            self.node_mut(id).action_vars.insert(action, var);
        }

        // A first child inherits its parent's fact bank in totally-ordered
        // mode; everyone else gets a fresh bank.
        let first_child = parent.is_some() && offset == 0;
        let fact_vars: Vec<Var> = if first_child && !partial_order {
            parent_fact_vars
        } else {
            (0..instance.num_predicates())
                .map(|p| {
                    vars.fresh_named(|| format!("{}__{}", instance.predicates[p].name, position))
                })
                .collect()
        };
        self.node_mut(id).fact_vars = fact_vars;

        let prim = vars.fresh_named(|| format!("prim__{name}"));
        self.node_mut(id).prim_var = Some(prim);

        for next in nexts {
            let next_name = self.node(next).name.clone();
            let var = vars.fresh_named(|| format!("{name}--->{next_name}"));
            self.node_mut(id).next_vars.insert(next, var);
        }

        if partial_order {
            let var = vars.fresh_named(|| format!("leaf_overleaf__{name}"));
            self.node_mut(id).leaf_overleaf_var = Some(var);
        }
    }

    /// Allocate the shared "before" literal bank between two leaves of the
    /// same layer. One variable covers both directions; a direction ruled
    /// out by hard precedence gets no literal at all.
    pub fn assign_before_pair(
        &mut self,
        a: NodeId,
        b: NodeId,
        vars: &mut VarProvider,
        layer: usize,
    ) {
        let a_name = self.node(a).name.clone();
        let b_name = self.node(b).name.clone();
        let var =
            vars.fresh_named(|| format!("layer_{layer}__node_{a_name}__before__node_{b_name}"));

        let a_cannot_precede = self.node(b).must_after.contains(&a);
        let b_cannot_precede = self.node(a).must_after.contains(&b);
        if !a_cannot_precede {
            self.node_mut(a).before_lits.insert(b, var.pos_lit());
        }
        if !b_cannot_precede {
            self.node_mut(b).before_lits.insert(a, var.neg_lit());
        }
    }
}
