//! End-to-end planning scenarios over hand-built grounded instances.
//!
//! Each test assembles a small instance, runs the planner (or drives the
//! encoder manually where the scenario constrains intermediate solver
//! answers), and checks the produced plan.

use std::collections::BTreeSet;

use sylva_instance::{
    AbstractTask, Action, GroundedInstance, LoadConfig, Method, Predicate, ProblemParts,
};
use sylva_planner::encode::Encoder;
use sylva_planner::plan::emit_raw_plan;
use sylva_planner::{PlanOutcome, Planner, PlannerOptions, Pdt};
use sylva_sat::SolveOutcome;

fn predicates(names: &[&str]) -> Vec<Predicate> {
    names
        .iter()
        .enumerate()
        .map(|(id, name)| Predicate {
            id,
            name: (*name).to_string(),
            positive_polarity: true,
        })
        .collect()
}

fn assemble(parts: ProblemParts, partial_order: bool) -> GroundedInstance {
    GroundedInstance::assemble(
        parts,
        &LoadConfig {
            partial_order,
            parse_mutexes: true,
            fold_method_preconditions: false,
        },
    )
    .unwrap()
}

fn options(partial_order: bool) -> PlannerOptions {
    PlannerOptions {
        partial_order,
        use_mutexes: true,
        use_effect_inference: partial_order,
        ..PlannerOptions::default()
    }
}

/// Plan lines of the action section, in order.
fn action_lines(text: &str) -> Vec<&str> {
    text.lines()
        .skip(1) // ==>
        .take_while(|l| {
            !l.starts_with("root") && *l != "<==" && !l.contains("->")
        })
        .collect()
}

/// Root task decomposed by one method over two ordered primitives:
/// a1 adds p, a2 requires p and adds q; goal is q.
fn flat_problem() -> ProblemParts {
    ProblemParts {
        predicates: predicates(&["p", "q"]),
        actions: vec![
            Action::new(0, "a1", vec![], vec![0], vec![]),
            Action::new(1, "a2", vec![0], vec![1], vec![]),
        ],
        abstract_tasks: vec![AbstractTask {
            id: 2,
            name: "t_root".into(),
            decomposition_methods: vec![0],
        }],
        methods: vec![Method::new(0, "m_root", 2, vec![0, 1], vec![(0, 1)])],
        init_state: BTreeSet::new(),
        goal_state: [1].into_iter().collect(),
        mutex_groups: vec![],
        root_task: 2,
    }
}

#[test]
fn flat_primitive_plan_total_order() {
    let instance = assemble(flat_problem(), false);
    let mut planner = Planner::new(instance, options(false)).unwrap();
    let PlanOutcome::Found(plan) = planner.find_plan().unwrap() else {
        panic!("expected a plan");
    };
    let actions = action_lines(&plan.text);
    assert_eq!(plan.size, 2);
    assert_eq!(actions.len(), 2);
    assert!(actions[0].ends_with("a1"));
    assert!(actions[1].ends_with("a2"));
    assert!(plan.text.contains("t_root -> m_root"));
    assert!(plan.text.starts_with("==>\n"));
    assert!(plan.text.ends_with("<==\n"));
}

#[test]
fn flat_primitive_plan_partial_order() {
    let instance = assemble(flat_problem(), true);
    let mut planner = Planner::new(instance, options(true)).unwrap();
    let PlanOutcome::Found(plan) = planner.find_plan().unwrap() else {
        panic!("expected a plan");
    };
    let actions = action_lines(&plan.text);
    assert_eq!(actions.len(), 2, "plan: {}", plan.text);
    // a1 must be sequenced before a2
    let pos_a1 = actions.iter().position(|l| l.ends_with("a1")).unwrap();
    let pos_a2 = actions.iter().position(|l| l.ends_with("a2")).unwrap();
    assert!(pos_a1 < pos_a2);
}

/// Two mutually exclusive table positions; the choice task must commit to
/// exactly one of them.
#[test]
fn mutex_choice_commits_to_one_action() {
    let parts = ProblemParts {
        predicates: predicates(&["on_table_a", "on_table_b"]),
        actions: vec![
            Action::new(0, "put_a", vec![], vec![0], vec![]),
            Action::new(1, "put_b", vec![], vec![1], vec![]),
        ],
        abstract_tasks: vec![
            AbstractTask {
                id: 2,
                name: "t_choice".into(),
                decomposition_methods: vec![1, 2],
            },
            AbstractTask {
                id: 3,
                name: "t_root".into(),
                decomposition_methods: vec![0],
            },
        ],
        methods: vec![
            Method::new(0, "m_root", 3, vec![2], vec![]),
            Method::new(1, "m_a", 2, vec![0], vec![]),
            Method::new(2, "m_b", 2, vec![1], vec![]),
        ],
        init_state: BTreeSet::new(),
        goal_state: BTreeSet::new(),
        mutex_groups: vec![vec![0, 1]],
        root_task: 3,
    };
    let instance = assemble(parts, true);
    let mut planner = Planner::new(instance, options(true)).unwrap();
    let PlanOutcome::Found(plan) = planner.find_plan().unwrap() else {
        panic!("expected a plan");
    };
    let actions = action_lines(&plan.text);
    assert_eq!(actions.len(), 1, "plan: {}", plan.text);
    assert!(actions[0].ends_with("put_a") || actions[0].ends_with("put_b"));
}

/// Two parallel subtasks achieving disjoint goal parts: both linear orders
/// must be models, probed by assuming each direction of the before literal.
#[test]
fn partial_order_admits_both_orderings() {
    let parts = ProblemParts {
        predicates: predicates(&["pa", "pb"]),
        actions: vec![
            Action::new(0, "do_a", vec![], vec![0], vec![]),
            Action::new(1, "do_b", vec![], vec![1], vec![]),
        ],
        abstract_tasks: vec![AbstractTask {
            id: 2,
            name: "t_root".into(),
            decomposition_methods: vec![0],
        }],
        methods: vec![Method::new(0, "m_par", 2, vec![0, 1], vec![])],
        init_state: BTreeSet::new(),
        goal_state: [0, 1].into_iter().collect(),
        mutex_groups: vec![],
        root_task: 2,
    };
    let instance = assemble(parts, true);
    let opts = options(true);

    let mut encoder = Encoder::new(&instance, &opts).unwrap();
    let mut pdt = Pdt::new();
    let root = pdt.add_root();
    pdt.node_mut(root).methods.insert(0);
    pdt.assign_variables(root, &instance, &mut encoder.vars, true);
    encoder.initial_encode(&pdt, root).unwrap();

    pdt.expand_po(root, &instance);
    let leaves = pdt.node(root).children.clone();
    for &leaf in &leaves {
        pdt.make_ordering_no_sibling(leaf);
    }
    for (i, &leaf) in leaves.iter().enumerate() {
        pdt.assign_variables(leaf, &instance, &mut encoder.vars, true);
        for &other in &leaves[i + 1..] {
            pdt.assign_before_pair(leaf, other, &mut encoder.vars, 1);
        }
    }
    encoder.encode_partial_order(&pdt, &leaves).unwrap();

    let node_with_action = |action: i32| {
        *leaves
            .iter()
            .find(|&&l| pdt.node(l).actions.contains(&action))
            .unwrap()
    };
    let leaf_a = node_with_action(0);
    let leaf_b = node_with_action(1);
    let a_before_b = pdt.node(leaf_a).before_lits[&leaf_b];

    for forced in [a_before_b, !a_before_b] {
        for &leaf in &leaves {
            encoder.assume(pdt.node(leaf).prim_var.unwrap().pos_lit());
        }
        encoder.assume(!encoder.last_leaf_overleaf().unwrap().pos_lit());
        encoder.assume(forced);
        assert_eq!(
            encoder.solve().unwrap(),
            SolveOutcome::Sat,
            "ordering {forced:?} should be satisfiable"
        );
    }
}

/// Method sets are inferred through the recursive component; planning still
/// terminates through the base case.
#[test]
fn recursive_task_plans_through_base_case() {
    // t -> m_rec = [a_step, t] or m_base = [a_goal]; goal needs a_goal
    let parts = ProblemParts {
        predicates: predicates(&["step", "done"]),
        actions: vec![
            Action::new(0, "a_step", vec![], vec![0], vec![]),
            Action::new(1, "a_goal", vec![], vec![1], vec![]),
        ],
        abstract_tasks: vec![
            AbstractTask {
                id: 2,
                name: "t".into(),
                decomposition_methods: vec![1, 2],
            },
            AbstractTask {
                id: 3,
                name: "t_root".into(),
                decomposition_methods: vec![0],
            },
        ],
        methods: vec![
            Method::new(0, "m_root", 3, vec![2], vec![]),
            Method::new(1, "m_rec", 2, vec![0, 2], vec![(0, 1)]),
            Method::new(2, "m_base", 2, vec![1], vec![]),
        ],
        init_state: BTreeSet::new(),
        goal_state: [1].into_iter().collect(),
        mutex_groups: vec![],
        root_task: 3,
    };
    let instance = assemble(parts, true);
    let mut planner = Planner::new(instance, options(true)).unwrap();

    // the recursive method certifies its own primitive's effect and sees
    // the whole component's effects as possible
    let m_rec = planner.instance().method(1);
    assert!(m_rec.certified_pos.contains(&0));
    assert!(m_rec.possible_pos.contains(&0));
    assert!(m_rec.possible_pos.contains(&1));
    let m_base = planner.instance().method(2);
    assert!(m_base.certified_pos.contains(&1));

    let PlanOutcome::Found(plan) = planner.find_plan().unwrap() else {
        panic!("expected a plan");
    };
    assert!(plan.text.contains("a_goal"), "plan: {}", plan.text);
}

/// The shortest plan needs two layers: the first frontier is UNSAT under
/// the primitive assumptions, satisfiable once they are relaxed, and the
/// second frontier closes without relaxation.
#[test]
fn relaxation_bridges_to_the_second_layer() {
    // root -> t -> [a1, a2]: the first frontier still holds the abstract t
    let parts = ProblemParts {
        predicates: predicates(&["p", "q"]),
        actions: vec![
            Action::new(0, "a1", vec![], vec![0], vec![]),
            Action::new(1, "a2", vec![0], vec![1], vec![]),
        ],
        abstract_tasks: vec![
            AbstractTask {
                id: 2,
                name: "t".into(),
                decomposition_methods: vec![1],
            },
            AbstractTask {
                id: 3,
                name: "t_root".into(),
                decomposition_methods: vec![0],
            },
        ],
        methods: vec![
            Method::new(0, "m_root", 3, vec![2], vec![]),
            Method::new(1, "m_steps", 2, vec![0, 1], vec![(0, 1)]),
        ],
        init_state: BTreeSet::new(),
        goal_state: [1].into_iter().collect(),
        mutex_groups: vec![],
        root_task: 3,
    };
    let mut instance = assemble(parts, true);
    // the method clauses need the inferred precondition/effect sets
    let orderings = sylva_analysis::ordering::analyze_all_methods(&instance).unwrap();
    let inferred = sylva_analysis::effects::infer_method_effects(&instance, &orderings, None);
    sylva_analysis::effects::write_back(&mut instance, &inferred);
    let opts = options(true);

    let mut encoder = Encoder::new(&instance, &opts).unwrap();
    let mut pdt = Pdt::new();
    let root = pdt.add_root();
    pdt.node_mut(root).methods.insert(0);
    pdt.assign_variables(root, &instance, &mut encoder.vars, true);
    encoder.initial_encode(&pdt, root).unwrap();

    let mut expand_layer = |pdt: &mut Pdt, encoder: &mut Encoder, leaves: &[_], depth| {
        let mut new_leaves = Vec::new();
        for &leaf in leaves {
            pdt.expand_po(leaf, &instance);
            new_leaves.extend(pdt.node(leaf).children.clone());
        }
        for &leaf in &new_leaves {
            pdt.make_ordering_no_sibling(leaf);
        }
        for (i, &leaf) in new_leaves.iter().enumerate() {
            pdt.assign_variables(leaf, &instance, &mut encoder.vars, true);
            for &other in &new_leaves[i + 1..] {
                pdt.assign_before_pair(leaf, other, &mut encoder.vars, depth);
            }
        }
        encoder.encode_partial_order(pdt, &new_leaves).unwrap();
        new_leaves
    };

    let layer1 = expand_layer(&mut pdt, &mut encoder, &[root], 1);
    let overleaf1 = encoder.last_leaf_overleaf().unwrap().pos_lit();

    // all-leaves-primitive is impossible at depth 1
    for &leaf in &layer1 {
        encoder.assume(pdt.node(leaf).prim_var.unwrap().pos_lit());
    }
    encoder.assume(!overleaf1);
    assert_eq!(encoder.solve().unwrap(), SolveOutcome::Unsat);

    // dropping the primitive assumptions admits a relaxed decomposition
    encoder.assume(!overleaf1);
    assert_eq!(encoder.solve().unwrap(), SolveOutcome::Sat);

    // the second layer closes without any relaxation
    let layer2 = expand_layer(&mut pdt, &mut encoder, &layer1, 2);
    let overleaf2 = encoder.last_leaf_overleaf().unwrap().pos_lit();
    for &leaf in &layer2 {
        encoder.assume(pdt.node(leaf).prim_var.unwrap().pos_lit());
    }
    encoder.assume(!overleaf1);
    encoder.assume(!overleaf2);
    assert_eq!(encoder.solve().unwrap(), SolveOutcome::Sat);

    encoder.extract_chosen_ops(&mut pdt, root, true).unwrap();
    let plan = emit_raw_plan(&pdt, &instance, root, true).unwrap();
    let actions = action_lines(&plan.text);
    assert_eq!(actions.len(), 2, "plan: {}", plan.text);
    let pos_a1 = actions.iter().position(|l| l.ends_with("a1")).unwrap();
    let pos_a2 = actions.iter().position(|l| l.ends_with("a2")).unwrap();
    assert!(pos_a1 < pos_a2);
}

/// Initial state {a}, goal {b}, one action swapping them: depth-1 plan with
/// b true and a false at the goal position of the model.
#[test]
fn goal_state_is_imposed() {
    let parts = ProblemParts {
        predicates: predicates(&["a", "b"]),
        actions: vec![Action::new(0, "swap", vec![0], vec![1], vec![0])],
        abstract_tasks: vec![AbstractTask {
            id: 1,
            name: "t_root".into(),
            decomposition_methods: vec![0],
        }],
        methods: vec![Method::new(0, "m_swap", 1, vec![0], vec![])],
        init_state: [0].into_iter().collect(),
        goal_state: [1].into_iter().collect(),
        mutex_groups: vec![],
        root_task: 1,
    };
    let instance = assemble(parts, false);
    let opts = options(false);

    let mut encoder = Encoder::new(&instance, &opts).unwrap();
    let mut pdt = Pdt::new();
    let root = pdt.add_root();
    pdt.node_mut(root).methods.insert(0);
    pdt.assign_variables(root, &instance, &mut encoder.vars, false);
    encoder.initial_encode(&pdt, root).unwrap();

    pdt.expand(root, &instance);
    let leaves = pdt.node(root).children.clone();
    for &leaf in &leaves {
        pdt.assign_variables(leaf, &instance, &mut encoder.vars, false);
    }
    encoder.encode_total_order(&pdt, &leaves).unwrap();
    for &leaf in &leaves {
        encoder.assume(pdt.node(leaf).prim_var.unwrap().pos_lit());
    }
    assert_eq!(encoder.solve().unwrap(), SolveOutcome::Sat);

    let goal_bank = encoder.goal_fact_vars();
    assert!(encoder.holds(goal_bank[1].pos_lit()), "b holds at the goal");
    assert!(!encoder.holds(goal_bank[0].pos_lit()), "a was deleted");

    encoder.extract_chosen_ops(&mut pdt, root, false).unwrap();
    let plan = emit_raw_plan(&pdt, &instance, root, false).unwrap();
    assert_eq!(action_lines(&plan.text), vec!["2 swap"]);
}

/// An unreachable goal exhausts the depth bound.
#[test]
fn unreachable_goal_reports_no_plan() {
    let mut parts = flat_problem();
    parts.goal_state = [0, 1].into_iter().collect();
    // a2 now destroys p, so the goal {p, q} is unreachable
    parts.actions[1] = Action::new(1, "a2", vec![0], vec![1], vec![0]);
    let instance = assemble(parts, false);
    let mut planner = Planner::new(
        instance,
        PlannerOptions {
            max_depth: 3,
            ..options(false)
        },
    )
    .unwrap();
    assert!(matches!(planner.find_plan().unwrap(), PlanOutcome::NoPlan));
}

/// Encoding the same frontier twice produces the same clause and literal
/// counts.
#[test]
fn encoding_is_deterministic() {
    let instance = assemble(flat_problem(), false);
    let opts = options(false);

    let stats = |instance: &GroundedInstance| {
        let mut encoder = Encoder::new(instance, &opts).unwrap();
        let mut pdt = Pdt::new();
        let root = pdt.add_root();
        pdt.node_mut(root).methods.insert(0);
        pdt.assign_variables(root, instance, &mut encoder.vars, false);
        encoder.initial_encode(&pdt, root).unwrap();
        pdt.expand(root, instance);
        let leaves = pdt.node(root).children.clone();
        for &leaf in &leaves {
            pdt.assign_variables(leaf, instance, &mut encoder.vars, false);
        }
        encoder.encode_total_order(&pdt, &leaves).unwrap();
        (encoder.sat.stats.num_clauses, encoder.sat.stats.num_literals)
    };

    assert_eq!(stats(&instance), stats(&instance));
}
