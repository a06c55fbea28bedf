//! Definition loading: run this before starting any run.
//!
//! Rules enforced (every violation is collected, not just the first):
//! 1. Task IDs must be unique; variable names must be unique and initial
//!    values must fit their declared type.
//! 2. Each task's configuration must have the shape its kind requires.
//! 3. Every successor reference must name an existing task.
//! 4. The graph must be acyclic, except for loops closed by returning to an
//!    Iteration task from inside its body. Such a loop may only be entered
//!    through its Iteration task.
//!
//! On success the result is a [`ResolvedGraph`]: per task its kind, typed
//! control flow and ordered successor list, plus entry tasks and a
//! topological order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, ValidationError, Violation};
use crate::models::{
    TaskDefinition, TaskKind, TriggerContext, TriggerDefinition, WorkflowDefinition,
};

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// The control-flow shape of a task, parsed from its configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// HttpCallout, ScriptExecution, DataTransformation, StoragePush, Batch,
    /// Notification.
    Linear { next: Option<String> },
    Conditional {
        condition: String,
        on_true: Option<String>,
        on_false: Option<String>,
    },
    Iteration {
        count: u32,
        body: Option<String>,
        next: Option<String>,
    },
    /// `next` is the join successor.
    Parallel {
        branches: Vec<String>,
        next: Option<String>,
    },
    Delay {
        duration: Duration,
        next: Option<String>,
    },
}

#[derive(Deserialize)]
struct LinearShape {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct ConditionalShape {
    condition: String,
    #[serde(default)]
    on_true: Option<String>,
    #[serde(default)]
    on_false: Option<String>,
}

#[derive(Deserialize)]
struct IterationShape {
    count: u32,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct ParallelShape {
    branches: Vec<String>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct DelayShape {
    duration_ms: u64,
    #[serde(default)]
    next: Option<String>,
}

fn shape<T: serde::de::DeserializeOwned>(config: &Value) -> Result<T, String> {
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(config).map_err(|e| e.to_string())
}

impl Flow {
    /// Interpret a task configuration according to its kind.
    pub fn parse(kind: TaskKind, config: &Value) -> Result<Self, String> {
        Ok(match kind {
            TaskKind::HttpCallout
            | TaskKind::ScriptExecution
            | TaskKind::DataTransformation
            | TaskKind::StoragePush
            | TaskKind::Batch
            | TaskKind::Notification => {
                let s: LinearShape = shape(config)?;
                Flow::Linear { next: s.next }
            }
            TaskKind::Conditional => {
                let s: ConditionalShape = shape(config)?;
                if s.condition.trim().is_empty() {
                    return Err("condition is empty".into());
                }
                Flow::Conditional { condition: s.condition, on_true: s.on_true, on_false: s.on_false }
            }
            TaskKind::Iteration => {
                let s: IterationShape = shape(config)?;
                Flow::Iteration { count: s.count, body: s.body, next: s.next }
            }
            TaskKind::Parallel => {
                let s: ParallelShape = shape(config)?;
                Flow::Parallel { branches: s.branches, next: s.next }
            }
            TaskKind::Delay => {
                let s: DelayShape = shape(config)?;
                Flow::Delay { duration: Duration::from_millis(s.duration_ms), next: s.next }
            }
        })
    }

    /// Successors in resolution order: linear `[next]`, Conditional
    /// `[on_true, on_false]`, Iteration `[body, next]`, Parallel
    /// `[branches.., next]`, Delay `[next]`. Absent references are skipped.
    pub fn successors(&self) -> Vec<&str> {
        match self {
            Flow::Linear { next } | Flow::Delay { next, .. } => next.iter().map(String::as_str).collect(),
            Flow::Conditional { on_true, on_false, .. } => {
                on_true.iter().chain(on_false.iter()).map(String::as_str).collect()
            }
            Flow::Iteration { body, next, .. } => body.iter().chain(next.iter()).map(String::as_str).collect(),
            Flow::Parallel { branches, next } => branches.iter().chain(next.iter()).map(String::as_str).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// ResolvedGraph
// ---------------------------------------------------------------------------

/// A validated task with its navigation data.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub definition: TaskDefinition,
    pub flow: Flow,
    /// Flow successors followed by the failure successor, if any.
    pub successors: Vec<String>,
}

impl ResolvedTask {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn kind(&self) -> TaskKind {
        self.definition.kind
    }
}

/// The executable form of a workflow definition.
#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    pub workflow_id: Uuid,
    pub name: String,
    tasks: HashMap<String, ResolvedTask>,
    entries: Vec<String>,
    order: Vec<String>,
    initial_variables: HashMap<String, Value>,
    triggers: Vec<TriggerDefinition>,
}

impl ResolvedGraph {
    pub fn task(&self, id: &str) -> Option<&ResolvedTask> {
        self.tasks.get(id)
    }

    /// Tasks with no incoming reference, in definition order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Topological order, ignoring Iteration loop-back edges.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn successors(&self, id: &str) -> &[String] {
        self.tasks.get(id).map(|t| t.successors.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn initial_variables(&self) -> &HashMap<String, Value> {
        &self.initial_variables
    }

    /// Manual starts are always eligible; a named trigger must exist and be active.
    pub fn check_trigger(&self, trigger: &TriggerContext) -> Result<(), EngineError> {
        let Some(id) = &trigger.trigger_id else {
            return Ok(());
        };
        match self.triggers.iter().find(|t| &t.id == id) {
            None => Err(EngineError::UnknownTrigger(id.clone())),
            Some(t) if !t.active => Err(EngineError::TriggerInactive(id.clone())),
            Some(_) => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition and resolve its task graph.
///
/// # Errors
/// [`ValidationError`] listing every [`Violation`] found.
pub fn validate(definition: &WorkflowDefinition) -> Result<ResolvedGraph, ValidationError> {
    let mut violations = Vec::new();

    // -----------------------------------------------------------------------
    // 1. Unique task IDs (first occurrence wins) and variables
    // -----------------------------------------------------------------------
    let mut index: HashMap<&str, &TaskDefinition> = HashMap::new();
    let mut unique: Vec<&TaskDefinition> = Vec::with_capacity(definition.tasks.len());
    let mut reported: HashSet<&str> = HashSet::new();
    for task in &definition.tasks {
        if index.contains_key(task.id.as_str()) {
            if reported.insert(task.id.as_str()) {
                violations.push(Violation::DuplicateTaskId(task.id.clone()));
            }
        } else {
            index.insert(task.id.as_str(), task);
            unique.push(task);
        }
    }

    let mut names: HashSet<&str> = HashSet::new();
    let mut reported_names: HashSet<&str> = HashSet::new();
    for var in &definition.variables {
        if !names.insert(var.name.as_str()) && reported_names.insert(var.name.as_str()) {
            violations.push(Violation::DuplicateVariableName(var.name.clone()));
        }
        if !var.var_type.accepts(&var.initial) {
            violations.push(Violation::VariableTypeMismatch {
                name: var.name.clone(),
                expected: var.var_type,
            });
        }
    }

    // -----------------------------------------------------------------------
    // 2. Parse control flow per task
    // -----------------------------------------------------------------------
    let mut flows: HashMap<&str, Flow> = HashMap::new();
    for task in &unique {
        match Flow::parse(task.kind, &task.config) {
            Ok(flow) => {
                flows.insert(task.id.as_str(), flow);
            }
            Err(message) => violations.push(Violation::InvalidTaskConfig {
                task_id: task.id.clone(),
                message,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // 3. Resolve successors
    // -----------------------------------------------------------------------
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut successor_lists: HashMap<&str, Vec<String>> = HashMap::new();

    for task in &unique {
        let id = task.id.as_str();
        adjacency.entry(id).or_default();
        let Some(flow) = flows.get(id) else {
            continue;
        };

        check_control_flow(task, flow, &mut violations);

        let failure_next = task.on_failure.as_ref().and_then(|p| p.next.as_deref());
        let mut resolved = Vec::new();
        for successor in flow.successors().into_iter().chain(failure_next) {
            match index.get_key_value(successor) {
                Some((&key, _)) => {
                    adjacency.entry(id).or_default().push(key);
                    resolved.push(successor.to_string());
                }
                None => violations.push(Violation::UnknownSuccessor {
                    task_id: task.id.clone(),
                    successor: successor.to_string(),
                }),
            }
        }
        successor_lists.insert(id, resolved);
    }

    // -----------------------------------------------------------------------
    // 4. Separate Iteration loop-back edges, then look for cycles
    // -----------------------------------------------------------------------
    let loop_backs = loop_back_edges(&unique, &flows, &adjacency, &mut violations);

    let forward: HashMap<&str, Vec<&str>> = adjacency
        .iter()
        .map(|(&from, tos)| {
            let kept = tos
                .iter()
                .copied()
                .filter(|&to| !loop_backs.contains(&(from, to)))
                .collect();
            (from, kept)
        })
        .collect();

    let position: HashMap<&str, usize> = unique.iter().enumerate().map(|(i, t)| (t.id.as_str(), i)).collect();
    for mut component in strongly_connected(&unique, &forward) {
        let cyclic = component.len() > 1
            || forward.get(component[0]).is_some_and(|tos| tos.contains(&component[0]));
        if cyclic {
            component.sort_by_key(|id| position[id]);
            violations.push(Violation::UnboundedCycle {
                tasks: component.into_iter().map(str::to_owned).collect(),
            });
        }
    }

    if !violations.is_empty() {
        return Err(ValidationError { violations });
    }

    // -----------------------------------------------------------------------
    // 5. Entries and topological order (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let mut in_degree: HashMap<&str, usize> = unique.iter().map(|t| (t.id.as_str(), 0)).collect();
    for tos in forward.values() {
        for &to in tos {
            *in_degree.entry(to).or_insert(0) += 1;
        }
    }

    let entries: Vec<String> = unique
        .iter()
        .filter(|t| in_degree[t.id.as_str()] == 0)
        .map(|t| t.id.clone())
        .collect();

    let mut queue: VecDeque<&str> = entries.iter().map(String::as_str).collect();
    let mut order: Vec<String> = Vec::with_capacity(unique.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_owned());
        for &next in forward.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    let tasks = unique
        .iter()
        .filter_map(|task| {
            let id = task.id.as_str();
            let flow = flows.remove(id)?;
            let successors = successor_lists.remove(id).unwrap_or_default();
            Some((
                task.id.clone(),
                ResolvedTask { definition: (*task).clone(), flow, successors },
            ))
        })
        .collect();

    Ok(ResolvedGraph {
        workflow_id: definition.id,
        name: definition.name.clone(),
        tasks,
        entries,
        order,
        initial_variables: definition.initial_variables(),
        triggers: definition.triggers.clone(),
    })
}

fn check_control_flow(task: &TaskDefinition, flow: &Flow, violations: &mut Vec<Violation>) {
    let mut flag = |reason: &str| {
        violations.push(Violation::InvalidControlFlow {
            task_id: task.id.clone(),
            reason: reason.to_string(),
        })
    };

    match flow {
        Flow::Parallel { branches, next } => {
            if branches.iter().any(|b| b == &task.id) {
                flag("parallel branch refers to its own task");
            }
            if next.as_ref().is_some_and(|n| branches.contains(n)) {
                flag("parallel branch is also the join successor");
            }
            let distinct: HashSet<&String> = branches.iter().collect();
            if distinct.len() != branches.len() {
                flag("parallel branch listed more than once");
            }
        }
        Flow::Iteration { body, .. } => {
            if body.as_deref() == Some(task.id.as_str()) {
                flag("iteration body refers to its own task");
            }
        }
        _ => {}
    }
}

/// Edges `u -> v` where `v` is an Iteration and `u` is reachable from `v`'s
/// body without passing through `v`.
///
/// The loop core (body tasks that lead back to `v`) must only be entered
/// through `v`. A core task with a predecessor outside the loop is flagged.
fn loop_back_edges<'a>(
    tasks: &[&'a TaskDefinition],
    flows: &HashMap<&'a str, Flow>,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    violations: &mut Vec<Violation>,
) -> HashSet<(&'a str, &'a str)> {
    let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        let from = task.id.as_str();
        for &to in adjacency.get(from).into_iter().flatten() {
            predecessors.entry(to).or_default().push(from);
        }
    }

    let mut edges = HashSet::new();
    for task in tasks {
        let head = task.id.as_str();
        let Some(Flow::Iteration { body: Some(body), .. }) = flows.get(head) else {
            continue;
        };
        let Some((&body, _)) = adjacency.get_key_value(body.as_str()) else {
            continue;
        };

        let mut reached: HashSet<&str> = HashSet::new();
        let mut stack = vec![body];
        while let Some(u) = stack.pop() {
            if u == head || !reached.insert(u) {
                continue;
            }
            stack.extend(adjacency.get(u).into_iter().flatten().copied());
        }

        let sources: Vec<&str> = tasks
            .iter()
            .map(|t| t.id.as_str())
            .filter(|u| reached.contains(u) && adjacency.get(u).is_some_and(|tos| tos.contains(&head)))
            .collect();

        let mut core: HashSet<&str> = HashSet::new();
        let mut stack = sources.clone();
        while let Some(u) = stack.pop() {
            if !reached.contains(u) || !core.insert(u) {
                continue;
            }
            stack.extend(predecessors.get(u).into_iter().flatten().copied());
        }

        let entered_from_outside = tasks
            .iter()
            .map(|t| t.id.as_str())
            .filter(|id| core.contains(id))
            .find_map(|id| {
                predecessors
                    .get(id)
                    .into_iter()
                    .flatten()
                    .find(|&&p| p != head && !core.contains(p))
                    .map(|&p| (id, p))
            });
        if let Some((inner, outside)) = entered_from_outside {
            violations.push(Violation::InvalidControlFlow {
                task_id: head.to_string(),
                reason: format!("loop body task '{inner}' is also entered from '{outside}' outside the loop"),
            });
        }

        edges.extend(sources.into_iter().map(|u| (u, head)));
    }

    edges
}

/// Strongly connected components of `graph`, via petgraph's iterative Tarjan.
fn strongly_connected<'a>(
    tasks: &[&'a TaskDefinition],
    graph: &HashMap<&'a str, Vec<&'a str>>,
) -> Vec<Vec<&'a str>> {
    let mut digraph = DiGraph::<&'a str, ()>::with_capacity(tasks.len(), tasks.len());
    let nodes: HashMap<&str, NodeIndex> = tasks
        .iter()
        .map(|t| (t.id.as_str(), digraph.add_node(t.id.as_str())))
        .collect();

    for (from, tos) in graph {
        for to in tos {
            if let (Some(&a), Some(&b)) = (nodes.get(from), nodes.get(to)) {
                digraph.add_edge(a, b, ());
            }
        }
    }

    tarjan_scc(&digraph)
        .into_iter()
        .map(|component| component.into_iter().map(|n| digraph[n]).collect())
        .collect()
}
