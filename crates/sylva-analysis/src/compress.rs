//! Compression of per-structure ordering DAGs into one shared DAG.
//!
//! At a partially-ordered PDT position every candidate method brings the
//! ordering skeleton of its structure. Rather than one child per
//! (structure, subtask) pair, isomorphic positions across structures are
//! merged greedily, subject to two rules:
//!
//! (a) every original intra-structure ordering survives as a compressed
//!     edge, and
//! (b) no compressed edge introduces an intra-structure ordering that was
//!     not originally present.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// One structure's ordering DAG: `num_nodes` subtask positions plus
/// precedence edges between them.
#[derive(Debug, Clone, Default)]
pub struct DagSpec {
    pub num_nodes: usize,
    pub edges: Vec<(usize, usize)>,
}

/// A node of the compressed DAG: for each participating structure, the
/// original subtask index it stands for.
#[derive(Debug, Clone)]
pub struct CompressedNode {
    pub id: usize,
    /// structure id → original subtask index
    pub members: BTreeMap<usize, usize>,
}

/// The compressed DAG over all structures of one PDT position.
#[derive(Debug, Clone)]
pub struct CompressedDag {
    /// Live nodes in a deterministic topological order.
    pub nodes: Vec<CompressedNode>,
    /// Edges between compressed node ids, sorted.
    pub edges: Vec<(usize, usize)>,
    /// (structure id, subtask index) → compressed node id.
    pub id_of: BTreeMap<(usize, usize), usize>,
}

struct Workspace {
    members: Vec<BTreeMap<usize, usize>>,
    alive: Vec<bool>,
}

/// Compress the given structure DAGs. Input and output are deterministic:
/// the same map always yields the same graph.
pub fn compress_dags(dags: &BTreeMap<usize, DagSpec>) -> CompressedDag {
    let reach = per_structure_reachability(dags);

    // Identity compression: one node per (structure, index) pair.
    let mut id_of: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut ws = Workspace {
        members: Vec::new(),
        alive: Vec::new(),
    };
    for (&sid, spec) in dags {
        for idx in 0..spec.num_nodes {
            let id = ws.members.len();
            ws.members.push([(sid, idx)].into_iter().collect());
            ws.alive.push(true);
            id_of.insert((sid, idx), id);
        }
    }

    let mut edges = build_edges(dags, &id_of);

    // Greedy merging, largest merged support first, with rollback whenever
    // a merge would violate an intra-structure ordering.
    loop {
        let mut candidates: Vec<(usize, usize, usize)> = Vec::new();
        for i in 0..ws.members.len() {
            if !ws.alive[i] {
                continue;
            }
            for j in i + 1..ws.members.len() {
                if !ws.alive[j] {
                    continue;
                }
                let disjoint = ws.members[i].keys().all(|sid| !ws.members[j].contains_key(sid));
                if disjoint {
                    candidates.push((ws.members[i].len() + ws.members[j].len(), i, j));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut merged = false;
        for (_, a, b) in candidates {
            if !ws.alive[a] || !ws.alive[b] {
                continue;
            }

            let backup = ws.members[a].clone();
            let moved_pairs: Vec<(usize, usize)> = ws.members[b]
                .iter()
                .map(|(&sid, &idx)| (sid, idx))
                .collect();
            for &(sid, idx) in &moved_pairs {
                ws.members[a].insert(sid, idx);
            }
            ws.alive[b] = false;
            for key in &moved_pairs {
                id_of.insert(*key, a);
            }

            edges = build_edges(dags, &id_of);
            if respects_intra_order(&ws, &edges, &reach) {
                merged = true;
                break;
            }

            // Roll back the tentative merge.
            ws.members[a] = backup;
            ws.alive[b] = true;
            for key in &moved_pairs {
                id_of.insert(*key, b);
            }
        }

        if !merged {
            break;
        }
    }
    edges = build_edges(dags, &id_of);

    add_sound_transitive_edges(&ws, &mut edges, &reach);

    // Finalize: keep live nodes, toposorted with a min-heap for
    // deterministic output.
    let live: Vec<CompressedNode> = ws
        .members
        .iter()
        .enumerate()
        .filter(|&(id, _)| ws.alive[id])
        .map(|(id, members)| CompressedNode {
            id,
            members: members.clone(),
        })
        .collect();
    let nodes = toposort_nodes(live, &edges);

    CompressedDag {
        nodes,
        edges: edges.into_iter().collect(),
        id_of,
    }
}

/// Remove edges implied by a longer path through some intermediate node.
pub fn remove_transitive_edges(edges: &[(usize, usize)]) -> Vec<(usize, usize)> {
    if edges.is_empty() {
        return Vec::new();
    }
    let mut adjacency: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    let mut nodes: BTreeSet<usize> = BTreeSet::new();
    for &(u, v) in edges {
        adjacency.entry(u).or_default().insert(v);
        nodes.insert(u);
        nodes.insert(v);
    }

    let reachable_from = |start: usize| -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(u) = queue.pop_front() {
            if let Some(out) = adjacency.get(&u) {
                for &v in out {
                    if seen.insert(v) {
                        queue.push_back(v);
                    }
                }
            }
        }
        seen
    };
    let reach: BTreeMap<usize, BTreeSet<usize>> =
        nodes.iter().map(|&n| (n, reachable_from(n))).collect();

    edges
        .iter()
        .filter(|&&(u, v)| {
            let Some(out) = adjacency.get(&u) else {
                return true;
            };
            !out.iter()
                .any(|&w| w != v && reach.get(&w).is_some_and(|r| r.contains(&v)))
        })
        .copied()
        .collect()
}

/// `reach[sid][u][v]` ⇔ subtask `u` precedes `v` in structure `sid`.
fn per_structure_reachability(
    dags: &BTreeMap<usize, DagSpec>,
) -> BTreeMap<usize, Vec<Vec<bool>>> {
    dags.iter()
        .map(|(&sid, spec)| {
            let n = spec.num_nodes;
            let mut reach = vec![vec![false; n]; n];
            for &(u, v) in &spec.edges {
                reach[u][v] = true;
            }
            for k in 0..n {
                for i in 0..n {
                    if reach[i][k] {
                        for j in 0..n {
                            if reach[k][j] {
                                reach[i][j] = true;
                            }
                        }
                    }
                }
            }
            (sid, reach)
        })
        .collect()
}

fn build_edges(
    dags: &BTreeMap<usize, DagSpec>,
    id_of: &BTreeMap<(usize, usize), usize>,
) -> BTreeSet<(usize, usize)> {
    let mut edges = BTreeSet::new();
    for (&sid, spec) in dags {
        for &(u, v) in &spec.edges {
            let cu = id_of[&(sid, u)];
            let cv = id_of[&(sid, v)];
            if cu != cv {
                edges.insert((cu, cv));
            }
        }
    }
    edges
}

/// Rule (b): every compressed edge must agree with each structure's own
/// reachability wherever the structure appears on both endpoints.
fn respects_intra_order(
    ws: &Workspace,
    edges: &BTreeSet<(usize, usize)>,
    reach: &BTreeMap<usize, Vec<Vec<bool>>>,
) -> bool {
    for &(cu, cv) in edges {
        if !ws.alive[cu] || !ws.alive[cv] {
            continue;
        }
        for (&sid, &idx_u) in &ws.members[cu] {
            if let Some(&idx_v) = ws.members[cv].get(&sid) {
                if !reach[&sid][idx_u][idx_v] {
                    return false;
                }
            }
        }
    }
    true
}

/// Add every transitive edge of the compressed graph that also satisfies
/// rule (b), so downstream consumers see the full precedence relation.
fn add_sound_transitive_edges(
    ws: &Workspace,
    edges: &mut BTreeSet<(usize, usize)>,
    reach: &BTreeMap<usize, Vec<Vec<bool>>>,
) {
    let mut adjacency: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(u, v) in edges.iter() {
        adjacency.entry(u).or_default().push(v);
    }

    let sources: Vec<usize> = (0..ws.members.len()).filter(|&id| ws.alive[id]).collect();
    for src in sources {
        let mut seen: BTreeSet<usize> = BTreeSet::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        if let Some(out) = adjacency.get(&src) {
            for &next in out {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        while let Some(cur) = queue.pop_front() {
            let ok = ws.members[src].iter().all(|(&sid, &idx_u)| {
                ws.members[cur]
                    .get(&sid)
                    .map_or(true, |&idx_v| reach[&sid][idx_u][idx_v])
            });
            if ok && edges.insert((src, cur)) {
                adjacency.entry(src).or_default().push(cur);
            }

            let onward = adjacency.get(&cur).cloned().unwrap_or_default();
            for next in onward {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
}

fn toposort_nodes(
    live: Vec<CompressedNode>,
    edges: &BTreeSet<(usize, usize)>,
) -> Vec<CompressedNode> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    let mut indegree: BTreeMap<usize, usize> = live.iter().map(|n| (n.id, 0)).collect();
    let mut adjacency: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(u, v) in edges {
        if indegree.contains_key(&u) && indegree.contains_key(&v) {
            adjacency.entry(u).or_default().push(v);
            *indegree.get_mut(&v).unwrap() += 1;
        }
    }

    let by_id: BTreeMap<usize, &CompressedNode> = live.iter().map(|n| (n.id, n)).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&id, _)| Reverse(id))
        .collect();

    let mut out = Vec::with_capacity(live.len());
    while let Some(Reverse(id)) = ready.pop() {
        out.push(by_id[&id].clone());
        if let Some(next) = adjacency.get(&id) {
            for &v in next {
                let d = indegree.get_mut(&v).unwrap();
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(v));
                }
            }
        }
    }
    debug_assert_eq!(out.len(), live.len());
    out
}
