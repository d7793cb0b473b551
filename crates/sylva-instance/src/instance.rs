//! The grounded problem store and the loader for the line-oriented grounded
//! format produced by the external grounder.
//!
//! The store is immutable after [`GroundedInstance::assemble`] apart from the
//! inferred method effect sets, which the effects inferencer writes back
//! through [`GroundedInstance::set_method_effect_sets`].

use std::collections::{BTreeSet, HashMap};
use std::io::BufRead;
use std::path::Path;

use tracing::{debug, info};

use crate::model::{
    AbstractTask, Action, Method, OpKind, Predicate, TaskRef, BLANK_ID, GOAL_ID, INIT_ID,
};
use crate::mutex::MutexStore;
use crate::InputError;

/// How a problem is assembled from its raw parts.
#[derive(Debug, Clone, Default)]
pub struct LoadConfig {
    /// Keep subtask order partial; attach init/goal actions to the root
    /// method. When false, subtasks are sorted into a total order at load.
    pub partial_order: bool,
    /// Parse the mutex group sections of the grounded file.
    pub parse_mutexes: bool,
    /// Fold synthetic `__method_precondition_*` first subtasks into their
    /// method's precondition set.
    pub fold_method_preconditions: bool,
}

/// Raw parts of a grounded problem before cross-referencing and synthesis.
#[derive(Debug, Default)]
pub struct ProblemParts {
    pub predicates: Vec<Predicate>,
    pub actions: Vec<Action>,
    pub abstract_tasks: Vec<AbstractTask>,
    pub methods: Vec<Method>,
    pub init_state: BTreeSet<usize>,
    pub goal_state: BTreeSet<usize>,
    pub mutex_groups: Vec<Vec<usize>>,
    pub root_task: i32,
}

/// A canonical method shape: subtask count plus sorted ordering constraints.
/// Methods sharing a structure can share PDT child positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodStructure {
    pub num_subtasks: usize,
    pub ordering_constraints: Vec<(usize, usize)>,
}

/// Immutable store of a grounded HTN problem.
#[derive(Debug)]
pub struct GroundedInstance {
    pub predicates: Vec<Predicate>,
    pub actions: Vec<Action>,
    pub abstract_tasks: Vec<AbstractTask>,
    pub methods: Vec<Method>,
    pub init_state: BTreeSet<usize>,
    pub goal_state: BTreeSet<usize>,
    pub mutexes: MutexStore,
    pub root_task: i32,

    blank_action: Action,
    init_action: Action,
    goal_action: Action,

    method_structure: Vec<usize>,
    structures: Vec<MethodStructure>,
    precondition_action_of_method: HashMap<usize, i32>,
}

impl GroundedInstance {
    /// Load a grounded problem file.
    pub fn load(path: &Path, config: &LoadConfig) -> Result<Self, InputError> {
        let file = std::fs::File::open(path).map_err(|source| InputError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let parts = parse_grounded(std::io::BufReader::new(file), config)?;
        Self::assemble(parts, config)
    }

    /// Cross-reference raw parts, synthesize the sentinel actions and build
    /// the derived tables.
    pub fn assemble(mut parts: ProblemParts, config: &LoadConfig) -> Result<Self, InputError> {
        let num_predicates = parts.predicates.len();
        let num_actions = parts.actions.len();
        let num_tasks = num_actions + parts.abstract_tasks.len();

        validate_parts(&parts, num_predicates, num_tasks)?;

        if !config.partial_order {
            for method in &mut parts.methods {
                sort_subtasks(method)?;
            }
        }

        let blank_action = Action::new(BLANK_ID, "blank", vec![], vec![], vec![]);
        let init_action = Action::new(
            INIT_ID,
            "__init__",
            vec![],
            parts.init_state.iter().copied().collect(),
            (0..num_predicates)
                .filter(|p| !parts.init_state.contains(p))
                .collect(),
        );
        let goal_action = Action::new(
            GOAL_ID,
            "__goal__",
            parts.goal_state.iter().copied().collect(),
            vec![],
            vec![],
        );

        let mut precondition_action_of_method = HashMap::new();
        if config.fold_method_preconditions {
            for method in &mut parts.methods {
                let Some(&first) = method.subtasks.first() else {
                    continue;
                };
                if first < 0 || first as usize >= num_actions {
                    continue;
                }
                let action = &parts.actions[first as usize];
                if !action.name.starts_with("__method_precondition_") {
                    continue;
                }
                debug!(method = %method.name, action = %action.name, "folding method precondition action");
                method.preconditions.extend(action.preconditions.iter());
                precondition_action_of_method.insert(method.id, first);
                method.remove_first_subtask();
            }
        }

        if config.partial_order {
            attach_init_goal_to_root(&mut parts, num_actions)?;
        }

        let (method_structure, structures) = group_method_structures(&parts.methods);
        info!(
            methods = parts.methods.len(),
            structures = structures.len(),
            "grouped methods by subtask-count and ordering skeleton"
        );

        let mut mutexes = MutexStore::new(num_predicates);
        for group in parts.mutex_groups.drain(..) {
            mutexes.add_group(group);
        }

        Ok(GroundedInstance {
            predicates: parts.predicates,
            actions: parts.actions,
            abstract_tasks: parts.abstract_tasks,
            methods: parts.methods,
            init_state: parts.init_state,
            goal_state: parts.goal_state,
            mutexes,
            root_task: parts.root_task,
            blank_action,
            init_action,
            goal_action,
            method_structure,
            structures,
            precondition_action_of_method,
        })
    }

    pub fn num_predicates(&self) -> usize {
        self.predicates.len()
    }

    pub fn num_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }

    /// A task id is abstract iff it lies past the primitive id range.
    /// Sentinel ids are primitive.
    pub fn is_abstract(&self, task_id: i32) -> bool {
        task_id >= self.actions.len() as i32
    }

    pub fn task_ref(&self, task_id: i32) -> TaskRef {
        if self.is_abstract(task_id) {
            TaskRef::Abstract(task_id)
        } else {
            TaskRef::Action(task_id)
        }
    }

    pub fn action(&self, action_id: i32) -> &Action {
        match action_id {
            BLANK_ID => &self.blank_action,
            INIT_ID => &self.init_action,
            GOAL_ID => &self.goal_action,
            id => &self.actions[id as usize],
        }
    }

    pub fn abstract_task(&self, task_id: i32) -> &AbstractTask {
        &self.abstract_tasks[task_id as usize - self.actions.len()]
    }

    pub fn method(&self, method_id: usize) -> &Method {
        &self.methods[method_id]
    }

    pub fn root(&self) -> &AbstractTask {
        self.abstract_task(self.root_task)
    }

    pub fn is_root_task(&self, task_id: i32) -> bool {
        task_id == self.root_task
    }

    /// Human-readable name of an operation, for diagnostics and plan output.
    pub fn op_name(&self, id: i32, kind: OpKind) -> &str {
        match kind {
            OpKind::Action => &self.action(id).name,
            OpKind::Method => &self.methods[id as usize].name,
        }
    }

    pub fn structure_of_method(&self, method_id: usize) -> usize {
        self.method_structure[method_id]
    }

    pub fn structure(&self, structure_id: usize) -> &MethodStructure {
        &self.structures[structure_id]
    }

    pub fn num_structures(&self) -> usize {
        self.structures.len()
    }

    pub fn precondition_action_of_method(&self, method_id: usize) -> Option<i32> {
        self.precondition_action_of_method.get(&method_id).copied()
    }

    /// Write the inferred precondition and effect sets back into a method.
    pub fn set_method_effect_sets(
        &mut self,
        method_id: usize,
        preconditions: impl IntoIterator<Item = usize>,
        certified_pos: impl IntoIterator<Item = usize>,
        certified_neg: impl IntoIterator<Item = usize>,
        possible_pos: impl IntoIterator<Item = usize>,
        possible_neg: impl IntoIterator<Item = usize>,
    ) {
        let method = &mut self.methods[method_id];
        method.preconditions.extend(preconditions);
        method.certified_pos = certified_pos.into_iter().collect();
        method.certified_neg = certified_neg.into_iter().collect();
        method.possible_pos = possible_pos.into_iter().collect();
        method.possible_neg = possible_neg.into_iter().collect();
    }
}

fn validate_parts(
    parts: &ProblemParts,
    num_predicates: usize,
    num_tasks: usize,
) -> Result<(), InputError> {
    let num_actions = parts.actions.len();
    let check_pred = |p: usize| -> Result<(), InputError> {
        if p >= num_predicates {
            return Err(InputError::PredicateOutOfRange {
                pred: p,
                count: num_predicates,
            });
        }
        Ok(())
    };
    for action in &parts.actions {
        for &p in action
            .preconditions
            .iter()
            .chain(&action.add_effects)
            .chain(&action.delete_effects)
        {
            check_pred(p)?;
        }
    }
    for &p in parts.init_state.iter().chain(&parts.goal_state) {
        check_pred(p)?;
    }
    for group in &parts.mutex_groups {
        for &p in group {
            check_pred(p)?;
        }
    }
    for method in &parts.methods {
        if method.parent_task < num_actions as i32 || method.parent_task >= num_tasks as i32 {
            return Err(InputError::UnresolvedTask {
                method: method.name.clone(),
                task: method.parent_task,
            });
        }
        let n = method.subtasks.len();
        for &t in &method.subtasks {
            if t < 0 || t >= num_tasks as i32 {
                return Err(InputError::UnresolvedTask {
                    method: method.name.clone(),
                    task: t,
                });
            }
        }
        for &(u, v) in &method.ordering_constraints {
            if u >= n || v >= n {
                return Err(InputError::ConstraintOutOfRange {
                    method: method.name.clone(),
                    src: u,
                    dst: v,
                });
            }
            if u == v {
                return Err(InputError::SelfLoopConstraint {
                    method: method.name.clone(),
                    index: u,
                });
            }
        }
    }
    if parts.root_task < num_actions as i32 || parts.root_task >= num_tasks as i32 {
        return Err(InputError::UnresolvedTask {
            method: "<root>".into(),
            task: parts.root_task,
        });
    }
    Ok(())
}

/// Topologically sort a method's subtasks so totally-ordered expansion can
/// use list order directly. Fails on cyclic ordering constraints.
fn sort_subtasks(method: &mut Method) -> Result<(), InputError> {
    let n = method.subtasks.len();
    let mut adjacency = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for &(u, v) in &method.ordering_constraints {
        adjacency[u].push(v);
        indegree[v] += 1;
    }

    let mut queue: std::collections::VecDeque<usize> =
        (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(u) = queue.pop_front() {
        order.push(u);
        for &v in &adjacency[u] {
            indegree[v] -= 1;
            if indegree[v] == 0 {
                queue.push_back(v);
            }
        }
    }
    if order.len() != n {
        return Err(InputError::CyclicMethodOrdering {
            method_id: method.id,
            method: method.name.clone(),
        });
    }
    method.subtasks = order.iter().map(|&i| method.subtasks[i]).collect();
    Ok(())
}

/// Attach the synthetic init action (before everything) and goal action
/// (after everything) to the root decomposition method.
fn attach_init_goal_to_root(parts: &mut ProblemParts, num_actions: usize) -> Result<(), InputError> {
    let root = &parts.abstract_tasks[parts.root_task as usize - num_actions];
    let root_method_id = *root
        .decomposition_methods
        .first()
        .ok_or_else(|| InputError::NoRootMethod {
            task: root.name.clone(),
        })?;
    let method = &mut parts.methods[root_method_id];
    let n = method.subtasks.len();

    method.subtasks.push(INIT_ID);
    for i in 0..n {
        method.ordering_constraints.push((n, i));
    }
    method.subtasks.push(GOAL_ID);
    for i in 0..n {
        method.ordering_constraints.push((i, n + 1));
    }
    Ok(())
}

/// Group methods by `(subtask count, sorted ordering constraints)` and assign
/// dense structure ids in first-seen order.
fn group_method_structures(methods: &[Method]) -> (Vec<usize>, Vec<MethodStructure>) {
    let mut key_to_id: HashMap<(usize, Vec<(usize, usize)>), usize> = HashMap::new();
    let mut structures = Vec::new();
    let mut method_structure = Vec::with_capacity(methods.len());
    for method in methods {
        let mut canonical = method.ordering_constraints.clone();
        canonical.sort_unstable();
        canonical.dedup();
        let key = (method.subtasks.len(), canonical);
        let id = *key_to_id.entry(key.clone()).or_insert_with(|| {
            structures.push(MethodStructure {
                num_subtasks: key.0,
                ordering_constraints: key.1,
            });
            structures.len() - 1
        });
        method_structure.push(id);
    }
    (method_structure, structures)
}

// ---------------------------------------------------------------------------
// Grounded file parsing
// ---------------------------------------------------------------------------

struct LineReader<R> {
    inner: R,
    line_no: usize,
}

impl<R: BufRead> LineReader<R> {
    fn new(inner: R) -> Self {
        LineReader { inner, line_no: 0 }
    }

    fn next_line(&mut self) -> Result<Option<String>, InputError> {
        let mut buf = String::new();
        let n = self
            .inner
            .read_line(&mut buf)
            .map_err(|source| InputError::Io {
                path: "<grounded problem>".into(),
                source,
            })?;
        if n == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn expect_line(&mut self) -> Result<String, InputError> {
        self.next_line()?.ok_or(InputError::UnexpectedEof {
            line: self.line_no,
        })
    }

    fn skip_until(&mut self, marker: &str) -> Result<(), InputError> {
        while let Some(line) = self.next_line()? {
            if line == marker {
                return Ok(());
            }
        }
        Err(InputError::MissingSection {
            section: marker.to_string(),
        })
    }

    fn parse_count(&mut self) -> Result<usize, InputError> {
        let line = self.expect_line()?;
        line.trim().parse().map_err(|_| InputError::Malformed {
            line: self.line_no,
            message: format!("expected a count, got {line:?}"),
        })
    }

    /// Parse a whitespace-separated integer list terminated by `-1`.
    fn parse_int_list(&mut self) -> Result<Vec<i64>, InputError> {
        let line = self.expect_line()?;
        let mut out = Vec::new();
        for token in line.split_whitespace() {
            let value: i64 = token.parse().map_err(|_| InputError::Malformed {
                line: self.line_no,
                message: format!("expected an integer, got {token:?}"),
            })?;
            if value == -1 {
                break;
            }
            out.push(value);
        }
        Ok(out)
    }

    fn parse_pred_list(&mut self) -> Result<Vec<usize>, InputError> {
        Ok(self
            .parse_int_list()?
            .into_iter()
            .map(|v| v as usize)
            .collect())
    }
}

/// Parse the grounded problem format into raw parts.
pub fn parse_grounded<R: BufRead>(
    reader: R,
    config: &LoadConfig,
) -> Result<ProblemParts, InputError> {
    let mut r = LineReader::new(reader);
    let mut parts = ProblemParts::default();

    // State features
    r.skip_until(";; #state features")?;
    let num_predicates = r.parse_count()?;
    for id in 0..num_predicates {
        let line = r.expect_line()?;
        let positive_polarity = line.starts_with('+');
        parts.predicates.push(Predicate {
            id,
            name: line,
            positive_polarity,
        });
    }

    if config.parse_mutexes {
        parse_mutex_sections(&mut r, &mut parts)?;
    }

    // Actions: blocks of cost / preconditions / add blocks / delete blocks
    r.skip_until(";; Actions")?;
    let num_actions = r.parse_count()?;
    for id in 0..num_actions {
        let _cost = r.parse_count()?;
        let preconditions = r.parse_pred_list()?;
        let add_effects = parse_effect_blocks(&mut r)?;
        let delete_effects = parse_effect_blocks(&mut r)?;
        parts.actions.push(Action::new(
            id as i32,
            String::new(),
            preconditions,
            add_effects,
            delete_effects,
        ));
    }

    // Initial and goal state
    r.skip_until(";; initial state")?;
    parts.init_state = r.parse_pred_list()?.into_iter().collect();
    r.skip_until(";; goal")?;
    parts.goal_state = r.parse_pred_list()?.into_iter().collect();

    // Task names; primitive tasks name the actions, abstract tasks are new
    r.skip_until(";; tasks (primitive and abstract)")?;
    let num_tasks = r.parse_count()?;
    for task_id in 0..num_tasks {
        let line = r.expect_line()?;
        let (flag, name) = line.split_once(' ').ok_or(InputError::Malformed {
            line: r.line_no,
            message: format!("expected \"<0|1> <name>\", got {line:?}"),
        })?;
        let is_abstract = flag == "1";
        if is_abstract {
            parts.abstract_tasks.push(AbstractTask {
                id: task_id as i32,
                name: name.to_string(),
                decomposition_methods: Vec::new(),
            });
        } else {
            if task_id >= num_actions {
                return Err(InputError::Malformed {
                    line: r.line_no,
                    message: format!("primitive task id {task_id} past the action range"),
                });
            }
            parts.actions[task_id].name = name.to_string();
        }
    }

    r.skip_until(";; initial abstract task")?;
    parts.root_task = r.parse_count()? as i32;

    // Methods: blocks of name / parent task / subtasks / ordering pairs
    r.skip_until(";; methods")?;
    let num_methods = r.parse_count()?;
    for method_id in 0..num_methods {
        let name = r.expect_line()?;
        let parent_tasks = r.parse_int_list()?;
        let parent_task = match parent_tasks.as_slice() {
            [task] => *task as i32,
            [] => {
                return Err(InputError::NoParentTask {
                    method: name.clone(),
                })
            }
            _ => {
                return Err(InputError::MultipleParentTasks {
                    method: name.clone(),
                })
            }
        };
        let subtasks: Vec<i32> = r.parse_int_list()?.into_iter().map(|v| v as i32).collect();
        let flat = r.parse_int_list()?;
        if flat.len() % 2 != 0 {
            return Err(InputError::Malformed {
                line: r.line_no,
                message: "odd number of ordering constraint endpoints".into(),
            });
        }
        let ordering_constraints = flat
            .chunks_exact(2)
            .map(|pair| (pair[0] as usize, pair[1] as usize))
            .collect();
        parts
            .methods
            .push(Method::new(method_id, name, parent_task, subtasks, ordering_constraints));

        let task_index = parent_task as usize - num_actions;
        if let Some(task) = parts.abstract_tasks.get_mut(task_index) {
            task.decomposition_methods.push(method_id);
        }
    }

    Ok(parts)
}

/// Parse one conditional-effect line. Only unconditional blocks (`ℓ = 0`)
/// are supported.
fn parse_effect_blocks<R: BufRead>(r: &mut LineReader<R>) -> Result<Vec<usize>, InputError> {
    let values = r.parse_int_list()?;
    let mut effects = Vec::new();
    let mut iter = values.into_iter();
    while let Some(num_conditions) = iter.next() {
        if num_conditions != 0 {
            return Err(InputError::ConditionalEffects { line: r.line_no });
        }
        let effect = iter.next().ok_or(InputError::Malformed {
            line: r.line_no,
            message: "effect block without an effect".into(),
        })?;
        effects.push(effect as usize);
    }
    Ok(effects)
}

fn parse_mutex_sections<R: BufRead>(
    r: &mut LineReader<R>,
    parts: &mut ProblemParts,
) -> Result<(), InputError> {
    // Range groups: "first last name" lines up to the next blank line
    r.skip_until(";; Mutex Groups")?;
    let _count = r.expect_line()?;
    loop {
        let Some(line) = r.next_line()? else { break };
        if line.is_empty() {
            break;
        }
        let mut tokens = line.split_whitespace();
        let (Some(first), Some(last)) = (tokens.next(), tokens.next()) else {
            return Err(InputError::Malformed {
                line: r.line_no,
                message: format!("expected \"first last name\", got {line:?}"),
            });
        };
        let first: usize = first.parse().map_err(|_| InputError::Malformed {
            line: r.line_no,
            message: format!("bad mutex bound {first:?}"),
        })?;
        let last: usize = last.parse().map_err(|_| InputError::Malformed {
            line: r.line_no,
            message: format!("bad mutex bound {last:?}"),
        })?;
        if first == last {
            continue;
        }
        parts.mutex_groups.push((first..=last).collect());
    }

    // Explicit groups: -1-terminated id lists, ended by a short list
    for marker in [
        ";; further strict Mutex Groups",
        ";; further non strict Mutex Groups",
    ] {
        r.skip_until(marker)?;
        let _count = r.expect_line()?;
        loop {
            let group = r.parse_pred_list()?;
            if group.len() <= 1 {
                break;
            }
            parts.mutex_groups.push(group);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(id: usize, name: &str) -> Predicate {
        Predicate {
            id,
            name: name.to_string(),
            positive_polarity: true,
        }
    }

    /// Two-action domain: a0 adds p, a1 requires p and adds q.
    fn simple_parts() -> ProblemParts {
        ProblemParts {
            predicates: vec![pred(0, "+p"), pred(1, "+q")],
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
    fn assemble_builds_sentinels() {
        let inst = GroundedInstance::assemble(simple_parts(), &LoadConfig::default()).unwrap();
        assert_eq!(inst.action(BLANK_ID).name, "blank");
        assert_eq!(inst.action(INIT_ID).add_effects, Vec::<usize>::new());
        assert_eq!(inst.action(INIT_ID).delete_effects, vec![0, 1]);
        assert_eq!(inst.action(GOAL_ID).preconditions, vec![1]);
        assert!(inst.is_abstract(2));
        assert!(!inst.is_abstract(1));
        assert!(!inst.is_abstract(BLANK_ID));
    }

    #[test]
    fn partial_order_wires_init_and_goal_into_root_method() {
        let config = LoadConfig {
            partial_order: true,
            ..LoadConfig::default()
        };
        let inst = GroundedInstance::assemble(simple_parts(), &config).unwrap();
        let method = inst.method(0);
        assert_eq!(method.subtasks, vec![0, 1, INIT_ID, GOAL_ID]);
        // init before both original subtasks, goal after both
        assert!(method.ordering_constraints.contains(&(2, 0)));
        assert!(method.ordering_constraints.contains(&(2, 1)));
        assert!(method.ordering_constraints.contains(&(0, 3)));
        assert!(method.ordering_constraints.contains(&(1, 3)));
    }

    #[test]
    fn structures_group_by_count_and_ordering() {
        let mut parts = simple_parts();
        parts.methods.push(Method::new(1, "m_same", 2, vec![1, 0], vec![(0, 1)]));
        parts.methods.push(Method::new(2, "m_other", 2, vec![0, 1], vec![]));
        parts.methods.push(Method::new(3, "m_twin", 2, vec![0, 0], vec![(0, 1)]));
        parts.abstract_tasks[0].decomposition_methods = vec![0, 1, 2, 3];
        let config = LoadConfig {
            partial_order: true,
            ..LoadConfig::default()
        };
        let inst = GroundedInstance::assemble(parts, &config).unwrap();
        // same count and ordering skeleton, regardless of which tasks fill it
        assert_eq!(inst.structure_of_method(1), inst.structure_of_method(3));
        assert_ne!(inst.structure_of_method(1), inst.structure_of_method(2));
        // init/goal attachment rewrote the root method's skeleton
        assert_ne!(inst.structure_of_method(0), inst.structure_of_method(1));
    }

    #[test]
    fn total_order_sorts_subtasks() {
        let mut parts = simple_parts();
        // reversed list order, constraint forces a0 before a1
        parts.methods[0].subtasks = vec![1, 0];
        parts.methods[0].ordering_constraints = vec![(1, 0)];
        let inst = GroundedInstance::assemble(parts, &LoadConfig::default()).unwrap();
        assert_eq!(inst.method(0).subtasks, vec![0, 1]);
    }

    #[test]
    fn cyclic_total_order_is_rejected() {
        let mut parts = simple_parts();
        parts.methods[0].ordering_constraints = vec![(0, 1), (1, 0)];
        let err = GroundedInstance::assemble(parts, &LoadConfig::default()).unwrap_err();
        assert!(matches!(err, InputError::CyclicMethodOrdering { .. }));
    }

    #[test]
    fn self_loop_constraint_is_rejected() {
        let mut parts = simple_parts();
        parts.methods[0].ordering_constraints = vec![(1, 1)];
        let err = GroundedInstance::assemble(parts, &LoadConfig::default()).unwrap_err();
        assert!(matches!(err, InputError::SelfLoopConstraint { .. }));
    }

    #[test]
    fn method_precondition_folding() {
        let mut parts = simple_parts();
        parts.actions.push(Action::new(
            2,
            "__method_precondition_m_root",
            vec![0],
            vec![],
            vec![],
        ));
        parts.methods[0].subtasks = vec![2, 0, 1];
        parts.methods[0].ordering_constraints = vec![(0, 1), (1, 2)];
        let config = LoadConfig {
            partial_order: true,
            fold_method_preconditions: true,
            ..LoadConfig::default()
        };
        let inst = GroundedInstance::assemble(parts, &config).unwrap();
        let method = inst.method(0);
        assert!(method.preconditions.contains(&0));
        assert_eq!(inst.precondition_action_of_method(0), Some(2));
        // first subtask removed, remaining constraint renumbered, then
        // init/goal appended
        assert_eq!(&method.subtasks[..2], &[0, 1]);
        assert!(method.ordering_constraints.contains(&(0, 1)));
    }

    const GROUNDED: &str = "\
junk
;; #state features
2
+p
+q

;; Actions
2
0
-1
0 0 -1
-1
0
0 -1
0 1 -1
-1
;; initial state
0 -1
;; goal
1 -1
;; tasks (primitive and abstract)
3
0 a0
0 a1
1 t_root
;; initial abstract task
2
;; methods
1
m_root
2 -1
0 1 -1
0 1 -1
";

    #[test]
    fn parses_grounded_format() {
        let parts =
            parse_grounded(std::io::Cursor::new(GROUNDED), &LoadConfig::default()).unwrap();
        assert_eq!(parts.predicates.len(), 2);
        assert_eq!(parts.actions.len(), 2);
        assert_eq!(parts.actions[0].name, "a0");
        assert_eq!(parts.actions[1].preconditions, vec![0]);
        assert_eq!(parts.actions[1].add_effects, vec![1]);
        assert_eq!(parts.abstract_tasks.len(), 1);
        assert_eq!(parts.root_task, 2);
        assert_eq!(parts.methods.len(), 1);
        assert_eq!(parts.methods[0].subtasks, vec![0, 1]);
        assert_eq!(parts.methods[0].ordering_constraints, vec![(0, 1)]);
        assert!(parts.init_state.contains(&0));
        assert!(parts.goal_state.contains(&1));
    }

    #[test]
    fn conditional_effects_are_rejected() {
        let text = GROUNDED.replace("0 0 -1", "1 1 0 -1");
        let err = parse_grounded(std::io::Cursor::new(text), &LoadConfig::default()).unwrap_err();
        assert!(matches!(err, InputError::ConditionalEffects { .. }));
    }

    #[test]
    fn missing_section_is_reported() {
        let err = parse_grounded(std::io::Cursor::new("nothing here"), &LoadConfig::default())
            .unwrap_err();
        assert!(matches!(err, InputError::MissingSection { .. }));
    }
}
