//! Per-method subtask precedence analysis.
//!
//! For every method the transitive closure of its precedence DAG is
//! computed once: successors, predecessors, the parallel (incomparable)
//! sets, and a method-local topological order of subtask indices.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use sylva_instance::GroundedInstance;

use crate::AnalysisError;

/// Closure of one method's subtask precedence relation.
#[derive(Debug, Clone)]
pub struct MethodOrdering {
    /// Transitive successors per subtask index.
    pub successors: Vec<BTreeSet<usize>>,
    /// Transitive predecessors per subtask index.
    pub predecessors: Vec<BTreeSet<usize>>,
    /// Indices incomparable with the subtask index.
    pub parallel: Vec<BTreeSet<usize>>,
    /// Subtask indices in a topological order of the precedence DAG.
    pub topological: Vec<usize>,
}

impl MethodOrdering {
    /// Indices that may execute after `i`: successors plus parallels.
    pub fn later(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.successors[i].iter().chain(&self.parallel[i]).copied()
    }

    /// Indices that may execute before `i`: predecessors plus parallels.
    pub fn earlier(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.predecessors[i]
            .iter()
            .chain(&self.parallel[i])
            .copied()
    }
}

/// Analyze one precedence DAG over `n` subtask indices.
///
/// Self-loops and cycles are input errors; duplicate constraints are
/// idempotent.
pub fn analyze_method(
    method_id: usize,
    n: usize,
    constraints: &[(usize, usize)],
) -> Result<MethodOrdering, AnalysisError> {
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];

    for &(u, v) in constraints {
        if u >= n || v >= n {
            return Err(AnalysisError::ConstraintOutOfRange {
                method_id,
                src: u,
                dst: v,
                count: n,
            });
        }
        if u == v {
            return Err(AnalysisError::SelfLoopConstraint {
                method_id,
                index: u,
            });
        }
        if adjacency[u].contains(&v) {
            continue;
        }
        adjacency[u].push(v);
        reverse[v].push(u);
        indegree[v] += 1;
    }

    // Kahn's algorithm: if the queue does not drain every index, the
    // constraints are cyclic.
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut topological = Vec::with_capacity(n);
    let mut remaining = indegree.clone();
    while let Some(u) = queue.pop_front() {
        topological.push(u);
        for &v in &adjacency[u] {
            remaining[v] -= 1;
            if remaining[v] == 0 {
                queue.push_back(v);
            }
        }
    }
    if topological.len() != n {
        return Err(AnalysisError::CyclicMethodOrdering {
            method_id,
            method: String::new(),
        });
    }

    let successors: Vec<BTreeSet<usize>> = (0..n).map(|i| reachable_from(i, &adjacency)).collect();
    let predecessors: Vec<BTreeSet<usize>> = (0..n).map(|i| reachable_from(i, &reverse)).collect();

    let mut parallel: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for i in 0..n {
        for j in i + 1..n {
            if !successors[i].contains(&j) && !successors[j].contains(&i) {
                parallel[i].insert(j);
                parallel[j].insert(i);
            }
        }
    }

    Ok(MethodOrdering {
        successors,
        predecessors,
        parallel,
        topological,
    })
}

/// Compute the ordering closure for every method of the instance.
pub fn analyze_all_methods(
    instance: &GroundedInstance,
) -> Result<Vec<MethodOrdering>, AnalysisError> {
    instance
        .methods
        .iter()
        .map(|method| {
            analyze_method(method.id, method.subtasks.len(), &method.ordering_constraints).map_err(
                |e| match e {
                    AnalysisError::CyclicMethodOrdering { method_id, .. } => {
                        AnalysisError::CyclicMethodOrdering {
                            method_id,
                            method: method.name.clone(),
                        }
                    }
                    other => other,
                },
            )
        })
        .collect()
}

/// Iterative DFS reachability; the start index itself is excluded.
fn reachable_from(start: usize, adjacency: &[Vec<usize>]) -> BTreeSet<usize> {
    let mut visited = vec![false; adjacency.len()];
    let mut reachable = BTreeSet::new();
    let mut stack = vec![start];
    visited[start] = true;
    while let Some(u) = stack.pop() {
        for &v in &adjacency[u] {
            if !visited[v] {
                visited[v] = true;
                reachable.insert(v);
                stack.push(v);
            }
        }
    }
    reachable
}
