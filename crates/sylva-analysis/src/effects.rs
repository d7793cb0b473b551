//! Effects inference over the method call graph.
//!
//! For every method three fluent sets are derived: *possible* effects (may
//! occur in some execution of the method's subtree), *certified* effects
//! (occur in every execution) and *certified preconditions*. Recursion
//! between methods is handled by collapsing the caller→callee graph into
//! strongly connected components and running a bottom-up fixed point per
//! component, callees first.

use sylva_instance::{BitVec, EffectBits, GroundedInstance, MutexStore};
use tracing::{debug, info};

use crate::ordering::MethodOrdering;
use crate::scc::{condense, reverse_topological, Tarjan};

/// Inference result for one method.
#[derive(Debug, Clone)]
pub struct MethodEffects {
    pub preconditions: BitVec,
    pub certified: EffectBits,
    pub possible: EffectBits,
}

/// Per-method graph and ordering material shared by all passes.
struct MethodInfo {
    /// Subtask ids with their abstract flag, in method-local order.
    subtasks: Vec<(i32, bool)>,
    /// For each subtask index, the indices that may execute after it
    /// (transitive successors plus parallels).
    later: Vec<Vec<usize>>,
    /// For each subtask index, the indices that may execute before it.
    earlier: Vec<Vec<usize>>,
    /// Subtask indices in topological order.
    topological: Vec<usize>,
    /// Deduplicated caller→callee method edges.
    callees: Vec<usize>,
}

/// Per-primitive-action bit caches.
struct ActionBits {
    /// Raw add/delete effect bits per action.
    effects: Vec<EffectBits>,
    /// Certified-positive base per action: adds plus preconditions the
    /// action does not delete (a required fact it leaves alone stays true).
    certified_pos: Vec<BitVec>,
    /// Precondition bits per action.
    preconditions: Vec<BitVec>,
}

/// Run the full inference pipeline. `orderings` must cover every method.
/// With a mutex store, the possible sets are additionally refined.
pub fn infer_method_effects(
    instance: &GroundedInstance,
    orderings: &[MethodOrdering],
    mutexes: Option<&MutexStore>,
) -> Vec<MethodEffects> {
    let num_methods = instance.num_methods();
    let num_predicates = instance.num_predicates();
    if num_methods == 0 {
        return Vec::new();
    }

    let infos = build_method_infos(instance, orderings);
    let action_bits = build_action_bits(instance);

    let adjacency: Vec<Vec<usize>> = infos.iter().map(|i| i.callees.clone()).collect();
    let tarjan = Tarjan::new(&adjacency);
    let dag = condense(&adjacency, &tarjan);
    let order = reverse_topological(&dag);
    info!(
        methods = num_methods,
        components = tarjan.components.len(),
        "collapsed method call graph"
    );

    let possible = compute_possible(instance, &infos, &tarjan, &dag, &order, num_predicates);
    let mut results: Vec<MethodEffects> = possible
        .into_iter()
        .map(|possible| MethodEffects {
            preconditions: BitVec::new(num_predicates),
            certified: EffectBits::new(num_predicates),
            possible,
        })
        .collect();

    compute_certified(instance, &infos, &action_bits, &tarjan, &order, &mut results);

    // A certified delete rules the matching possible add out, and vice versa.
    for r in &mut results {
        r.possible.pos.minus_with(&r.certified.neg);
        r.possible.neg.minus_with(&r.certified.pos);
    }

    if let Some(mutexes) = mutexes {
        refine_possible_with_certified(mutexes, &mut results);
    }

    compute_preconditions(instance, &infos, &action_bits, &tarjan, &order, &mut results);

    if let Some(mutexes) = mutexes {
        refine_possible_with_preconditions(mutexes, num_predicates, &mut results);
    }

    results
}

/// Write inferred sets back into the instance's methods.
pub fn write_back(instance: &mut GroundedInstance, results: &[MethodEffects]) {
    for (method_id, r) in results.iter().enumerate() {
        instance.set_method_effect_sets(
            method_id,
            r.preconditions.ones().collect::<Vec<_>>(),
            r.certified.pos.ones().collect::<Vec<_>>(),
            r.certified.neg.ones().collect::<Vec<_>>(),
            r.possible.pos.ones().collect::<Vec<_>>(),
            r.possible.neg.ones().collect::<Vec<_>>(),
        );
    }
}

fn build_method_infos(
    instance: &GroundedInstance,
    orderings: &[MethodOrdering],
) -> Vec<MethodInfo> {
    let mut seen = vec![false; instance.num_methods()];
    instance
        .methods
        .iter()
        .map(|method| {
            let n = method.subtasks.len();
            let subtasks: Vec<(i32, bool)> = method
                .subtasks
                .iter()
                .map(|&t| (t, instance.is_abstract(t)))
                .collect();

            let ordering = &orderings[method.id];
            let later: Vec<Vec<usize>> = (0..n)
                .map(|i| {
                    let mut v: Vec<usize> = ordering.later(i).collect();
                    v.sort_unstable();
                    v.dedup();
                    v
                })
                .collect();
            let earlier: Vec<Vec<usize>> = (0..n)
                .map(|i| {
                    let mut v: Vec<usize> = ordering.earlier(i).collect();
                    v.sort_unstable();
                    v.dedup();
                    v
                })
                .collect();

            let mut callees = Vec::new();
            for &(task, is_abstract) in &subtasks {
                if !is_abstract {
                    continue;
                }
                for &d in &instance.abstract_task(task).decomposition_methods {
                    if !seen[d] {
                        seen[d] = true;
                        callees.push(d);
                    }
                }
            }
            for &d in &callees {
                seen[d] = false;
            }

            MethodInfo {
                subtasks,
                later,
                earlier,
                topological: ordering.topological.clone(),
                callees,
            }
        })
        .collect()
}

fn build_action_bits(instance: &GroundedInstance) -> ActionBits {
    let num_predicates = instance.num_predicates();
    let mut effects = Vec::with_capacity(instance.num_actions());
    let mut certified_pos = Vec::with_capacity(instance.num_actions());
    let mut preconditions = Vec::with_capacity(instance.num_actions());

    for action in &instance.actions {
        let mut eb = EffectBits::new(num_predicates);
        for &p in &action.add_effects {
            eb.pos.set(p);
        }
        for &p in &action.delete_effects {
            eb.neg.set(p);
        }

        let mut cert = BitVec::new(num_predicates);
        for &p in &action.add_effects {
            cert.set(p);
        }
        for &p in &action.preconditions {
            if !eb.neg.test(p) {
                cert.set(p);
            }
        }

        let mut prec = BitVec::new(num_predicates);
        for &p in &action.preconditions {
            prec.set(p);
        }

        effects.push(eb);
        certified_pos.push(cert);
        preconditions.push(prec);
    }

    ActionBits {
        effects,
        certified_pos,
        preconditions,
    }
}

/// Possible effects: union of all add/delete effects reachable under the
/// method, with no cancellation. One OR-fold per component, then one
/// bottom-up pass over the condensation DAG.
fn compute_possible(
    instance: &GroundedInstance,
    infos: &[MethodInfo],
    tarjan: &Tarjan,
    dag: &[Vec<usize>],
    order: &[usize],
    num_predicates: usize,
) -> Vec<EffectBits> {
    let mut local: Vec<EffectBits> = infos
        .iter()
        .map(|_| EffectBits::new(num_predicates))
        .collect();
    for (m, info) in infos.iter().enumerate() {
        for &(task, is_abstract) in &info.subtasks {
            if is_abstract {
                continue;
            }
            let action = instance.action(task);
            for &p in &action.add_effects {
                local[m].pos.set(p);
            }
            for &p in &action.delete_effects {
                local[m].neg.set(p);
            }
        }
    }

    let mut component_bits: Vec<EffectBits> = tarjan
        .components
        .iter()
        .map(|members| {
            let mut bits = EffectBits::new(num_predicates);
            for &m in members {
                bits.or_with(&local[m]);
            }
            bits
        })
        .collect();

    for &c in order {
        for i in 0..dag[c].len() {
            let succ = dag[c][i];
            let (a, b) = borrow_two(&mut component_bits, c, succ);
            a.or_with(b);
        }
    }

    (0..infos.len())
        .map(|m| component_bits[tarjan.component_of[m]].clone())
        .collect()
}

/// Certified effects: per-component fixed point in callee-first order.
fn compute_certified(
    instance: &GroundedInstance,
    infos: &[MethodInfo],
    action_bits: &ActionBits,
    tarjan: &Tarjan,
    order: &[usize],
    results: &mut [MethodEffects],
) {
    let num_predicates = instance.num_predicates();
    debug!("bottom-up certified effects fixed point");

    for &component in order {
        loop {
            let mut changed = false;
            for &m in &tarjan.components[component] {
                let info = &infos[m];
                let n = info.subtasks.len();

                // Union of possible effects of everything that may follow
                // each subtask.
                let mut later_effects: Vec<EffectBits> =
                    (0..n).map(|_| EffectBits::new(num_predicates)).collect();
                for &i in info.topological.iter().rev() {
                    let (id, _) = info.subtasks[i];
                    if id < 0 {
                        continue;
                    }
                    let mut acc = EffectBits::new(num_predicates);
                    for &j in &info.later[i] {
                        let (jid, j_abstract) = info.subtasks[j];
                        if jid < 0 {
                            continue;
                        }
                        if j_abstract {
                            for &d in &instance.abstract_task(jid).decomposition_methods {
                                acc.or_with(&results[d].possible);
                            }
                        } else {
                            acc.or_with(&action_bits.effects[jid as usize]);
                        }
                    }
                    later_effects[i] = acc;
                }

                let mut new_certified = EffectBits::new(num_predicates);
                for (idx, &(id, is_abstract)) in info.subtasks.iter().enumerate() {
                    if id < 0 {
                        continue;
                    }

                    let mut base = if is_abstract {
                        // Intersection across all expansions of the subtask.
                        let decompositions = &instance.abstract_task(id).decomposition_methods;
                        let Some((&first, rest)) = decompositions.split_first() else {
                            continue;
                        };
                        let mut base = results[first].certified.clone();
                        for &d in rest {
                            base.and_with(&results[d].certified);
                            if base.is_empty() {
                                break;
                            }
                        }
                        base
                    } else {
                        let mut base = EffectBits::new(num_predicates);
                        base.pos.or_with(&action_bits.effects[id as usize].pos);
                        base.neg.or_with(&action_bits.effects[id as usize].neg);
                        base.pos.or_with(&action_bits.certified_pos[id as usize]);
                        base
                    };

                    base.minus_with(&later_effects[idx]);
                    new_certified.or_with(&base);
                }

                if results[m].certified.or_with(&new_certified) {
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

/// Certified preconditions: the mirror fixed point against the positive
/// possible effects of everything that may execute earlier.
fn compute_preconditions(
    instance: &GroundedInstance,
    infos: &[MethodInfo],
    action_bits: &ActionBits,
    tarjan: &Tarjan,
    order: &[usize],
    results: &mut [MethodEffects],
) {
    let num_predicates = instance.num_predicates();
    debug!("bottom-up precondition fixed point");

    for &component in order {
        loop {
            let mut changed = false;
            for &m in &tarjan.components[component] {
                let info = &infos[m];
                let n = info.subtasks.len();

                let mut earlier_adds: Vec<BitVec> =
                    (0..n).map(|_| BitVec::new(num_predicates)).collect();
                for &i in info.topological.iter().rev() {
                    let (id, _) = info.subtasks[i];
                    if id < 0 {
                        continue;
                    }
                    let mut acc = BitVec::new(num_predicates);
                    for &j in &info.earlier[i] {
                        let (jid, j_abstract) = info.subtasks[j];
                        if jid < 0 {
                            continue;
                        }
                        if j_abstract {
                            for &d in &instance.abstract_task(jid).decomposition_methods {
                                acc.or_with(&results[d].possible.pos);
                            }
                        } else {
                            acc.or_with(&action_bits.effects[jid as usize].pos);
                        }
                    }
                    earlier_adds[i] = acc;
                }

                let mut new_preconditions = BitVec::new(num_predicates);
                for (idx, &(id, is_abstract)) in info.subtasks.iter().enumerate() {
                    if id < 0 {
                        continue;
                    }

                    let mut base = if is_abstract {
                        let decompositions = &instance.abstract_task(id).decomposition_methods;
                        let Some((&first, rest)) = decompositions.split_first() else {
                            continue;
                        };
                        let mut base = results[first].preconditions.clone();
                        for &d in rest {
                            base.and_with(&results[d].preconditions);
                            if base.is_empty() {
                                break;
                            }
                        }
                        base
                    } else {
                        action_bits.preconditions[id as usize].clone()
                    };

                    // A fact some earlier subtask may provide is not a
                    // precondition of the method as a whole.
                    base.minus_with(&earlier_adds[idx]);
                    new_preconditions.or_with(&base);
                }

                if results[m].preconditions.or_with(&new_preconditions) {
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

/// Drop from every method's possible adds all mutex partners of its
/// certified adds: the certified fact holds afterwards, so the partner
/// cannot.
fn refine_possible_with_certified(mutexes: &MutexStore, results: &mut [MethodEffects]) {
    let mut total_removed = 0usize;
    for r in results.iter_mut() {
        let certified: Vec<usize> = r.certified.pos.ones().collect();
        for p in certified {
            for &gid in mutexes.groups_of_pred(p) {
                for &q in mutexes.group(gid) {
                    if q != p && r.possible.pos.test(q) {
                        r.possible.pos.clear(q);
                        total_removed += 1;
                    }
                }
            }
        }
    }
    info!(removed = total_removed, "mutex refinement on possible adds");
}

/// Drop from every method's possible deletes all mutex partners of its
/// preconditions: the precondition holds on entry, so the partner is
/// already false and cannot be deleted here.
fn refine_possible_with_preconditions(
    mutexes: &MutexStore,
    num_predicates: usize,
    results: &mut [MethodEffects],
) {
    let mut total_removed = 0usize;
    for r in results.iter_mut() {
        let mut drop_mask = BitVec::new(num_predicates);
        r.preconditions.for_each_set(|p| {
            for &gid in mutexes.groups_of_pred(p) {
                for &q in mutexes.group(gid) {
                    if q != p {
                        drop_mask.set(q);
                    }
                }
            }
        });
        let before = r.possible.neg.popcount();
        r.possible.neg.minus_with(&drop_mask);
        total_removed += before - r.possible.neg.popcount();
    }
    info!(
        removed = total_removed,
        "mutex refinement on possible deletes"
    );
}

fn borrow_two<T>(v: &mut [T], a: usize, b: usize) -> (&mut T, &T) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = v.split_at_mut(b);
        (&mut lo[a], &hi[0])
    } else {
        let (lo, hi) = v.split_at_mut(a);
        (&mut hi[0], &lo[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordering::analyze_all_methods;
    use std::collections::BTreeSet;
    use sylva_instance::{AbstractTask, Action, LoadConfig, Method, Predicate, ProblemParts};

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

    fn infer(
        parts: ProblemParts,
        mutex_groups: Vec<Vec<usize>>,
    ) -> (GroundedInstance, Vec<MethodEffects>) {
        let mut parts = parts;
        parts.mutex_groups = mutex_groups;
        let instance = GroundedInstance::assemble(
            parts,
            &LoadConfig {
                partial_order: true,
                ..LoadConfig::default()
            },
        )
        .unwrap();
        let orderings = analyze_all_methods(&instance).unwrap();
        let mutexes = instance.mutexes.clone();
        let store = if mutexes.is_empty() {
            None
        } else {
            Some(&mutexes)
        };
        let results = infer_method_effects(&instance, &orderings, store);
        (instance, results)
    }

    /// One root method over two ordered primitives: a0 adds p, a1 needs p
    /// and adds q.
    fn flat_parts() -> ProblemParts {
        ProblemParts {
            predicates: predicates(&["+p", "+q"]),
            actions: vec![
                Action::new(0, "a0", vec![], vec![0], vec![]),
                Action::new(1, "a1", vec![0], vec![1], vec![]),
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
    fn flat_method_possible_and_certified() {
        let (_, results) = infer(flat_parts(), vec![]);
        let root = &results[0];
        assert!(root.possible.pos.test(0) && root.possible.pos.test(1));
        assert!(root.certified.pos.test(1));
        // a0's add of p is not deleted later, so it is certified too
        assert!(root.certified.pos.test(0));
        // precondition p of a1 is provided by the earlier a0
        assert!(!root.preconditions.test(0));
    }

    #[test]
    fn certified_sets_are_disjoint_and_within_possible() {
        let mut parts = flat_parts();
        // a2 deletes p after it was added
        parts
            .actions
            .push(Action::new(2, "a2", vec![], vec![], vec![0]));
        parts.methods[0].subtasks = vec![0, 1, 2];
        parts.methods[0].ordering_constraints = vec![(0, 1), (1, 2)];
        let (instance, results) = infer(parts, vec![]);
        for (m, r) in results.iter().enumerate() {
            let mut overlap = r.certified.pos.clone();
            overlap.and_with(&r.certified.neg);
            assert!(overlap.is_empty(), "method {m} certifies p and not-p");
            for p in r.certified.pos.ones() {
                assert!(r.possible.pos.test(p));
            }
            for p in r.certified.neg.ones() {
                assert!(r.possible.neg.test(p));
            }
            // every primitive subtask's effects are possible
            for &t in &instance.method(m).subtasks {
                if t >= 0 && !instance.is_abstract(t) {
                    let action = instance.action(t);
                    for &p in &action.add_effects {
                        assert!(
                            r.possible.pos.test(p) || r.certified.neg.test(p),
                            "add of {t} missing from possible"
                        );
                    }
                }
            }
        }
        // p is added then deleted: certified delete, not a certified add
        let root = &results[0];
        assert!(root.certified.neg.test(0));
        assert!(!root.certified.pos.test(0));
    }

    #[test]
    fn recursive_methods_share_a_component_fixed_point() {
        // t1 -> m1 = [t2, add_p], t2 -> m2 = [t1, add_p], recursion closed
        // over one strongly connected component.
        let parts = ProblemParts {
            predicates: predicates(&["+p"]),
            actions: vec![Action::new(0, "add_p", vec![], vec![0], vec![])],
            abstract_tasks: vec![
                AbstractTask {
                    id: 1,
                    name: "t1".into(),
                    decomposition_methods: vec![0],
                },
                AbstractTask {
                    id: 2,
                    name: "t2".into(),
                    decomposition_methods: vec![1],
                },
            ],
            methods: vec![
                Method::new(0, "m1", 1, vec![2, 0], vec![(0, 1)]),
                Method::new(1, "m2", 2, vec![1, 0], vec![(0, 1)]),
            ],
            init_state: BTreeSet::new(),
            goal_state: BTreeSet::new(),
            mutex_groups: vec![],
            root_task: 1,
        };
        let instance = GroundedInstance::assemble(parts, &LoadConfig::default()).unwrap();
        let orderings = analyze_all_methods(&instance).unwrap();

        let adjacency = vec![vec![1], vec![0]];
        let tarjan = Tarjan::new(&adjacency);
        assert_eq!(tarjan.components.len(), 1);

        let results = infer_method_effects(&instance, &orderings, None);
        assert!(results[0].possible.pos.test(0));
        assert!(results[1].possible.pos.test(0));
        assert!(results[0].certified.pos.test(0));
        assert!(results[1].certified.pos.test(0));
    }

    #[test]
    fn mutex_refinement_prunes_partners_of_certified_adds() {
        // on_a and on_b are mutex; the method certifies on_a but a sibling
        // branch could add on_b.
        let parts = ProblemParts {
            predicates: predicates(&["on_a", "on_b"]),
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
                Method::new(0, "m_root", 3, vec![2, 0], vec![(0, 1)]),
                Method::new(1, "m_a", 2, vec![0], vec![]),
                Method::new(2, "m_b", 2, vec![1], vec![]),
            ],
            init_state: BTreeSet::new(),
            goal_state: BTreeSet::new(),
            mutex_groups: vec![],
            root_task: 3,
        };
        let (_, results) = infer(parts, vec![vec![0, 1]]);
        let root = &results[0];
        // m_root always ends with put_a
        assert!(root.certified.pos.test(0));
        // so on_b cannot be a surviving possible add
        assert!(!root.possible.pos.test(1));
    }

    #[test]
    fn preconditions_intersect_across_decompositions() {
        // t has two methods whose single subtasks share precondition p but
        // differ on q: only p is certified for callers of t.
        let parts = ProblemParts {
            predicates: predicates(&["p", "q", "r"]),
            actions: vec![
                Action::new(0, "a_pq", vec![0, 1], vec![2], vec![]),
                Action::new(1, "a_p", vec![0], vec![2], vec![]),
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
                Method::new(1, "m_pq", 2, vec![0], vec![]),
                Method::new(2, "m_p", 2, vec![1], vec![]),
            ],
            init_state: BTreeSet::new(),
            goal_state: BTreeSet::new(),
            mutex_groups: vec![],
            root_task: 3,
        };
        let (_, results) = infer(parts, vec![]);
        assert!(results[0].preconditions.test(0));
        assert!(!results[0].preconditions.test(1));
    }

    #[test]
    fn write_back_fills_method_sets() {
        let (mut instance, results) = infer(flat_parts(), vec![]);
        write_back(&mut instance, &results);
        let method = instance.method(0);
        assert!(method.certified_pos.contains(&1));
        assert!(method.possible_pos.contains(&0));
    }
}
