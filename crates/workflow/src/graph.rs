//! Validation and successor indexes.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;

use crate::WorkflowError;
use crate::model::{Connection, Step, Workflow};

/// Validated, indexed view of a workflow graph.
///
/// Construction performs every load-time check; an engine holding a
/// `FlowGraph` can schedule without re-validating.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    steps: IndexMap<String, Step>,
    outgoing: HashMap<String, Vec<Connection>>,
    incoming: HashMap<String, Vec<Connection>>,
    entry: String,
}

impl FlowGraph {
    /// Validate a workflow and build its indexes.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::Invalid`] — duplicate step ids, missing entry,
    ///   duplicate (source, target, error-path) connections, or steps
    ///   unreachable from the entry
    /// - [`WorkflowError::BrokenGraph`] — a connection endpoint names a step
    ///   that does not exist
    pub fn build(workflow: &Workflow) -> Result<Self, WorkflowError> {
        if workflow.steps.is_empty() {
            return Err(WorkflowError::Invalid("workflow has no steps".into()));
        }

        let mut steps = IndexMap::new();
        for step in &workflow.steps {
            if steps.insert(step.id.clone(), step.clone()).is_some() {
                return Err(WorkflowError::Invalid(format!(
                    "duplicate step id {:?}",
                    step.id
                )));
            }
        }

        if !steps.contains_key(&workflow.entry) {
            return Err(WorkflowError::Invalid(format!(
                "entry step {:?} does not exist",
                workflow.entry
            )));
        }

        let mut outgoing: HashMap<String, Vec<Connection>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<Connection>> = HashMap::new();
        let mut seen_edges = HashSet::new();
        for connection in &workflow.connections {
            for endpoint in [&connection.source, &connection.target] {
                if !steps.contains_key(endpoint) {
                    return Err(WorkflowError::BrokenGraph(format!(
                        "connection {} -> {} references missing step {:?}",
                        connection.source, connection.target, endpoint
                    )));
                }
            }
            let key = (
                connection.source.clone(),
                connection.target.clone(),
                connection.is_error_path,
            );
            if !seen_edges.insert(key) {
                return Err(WorkflowError::Invalid(format!(
                    "duplicate connection {} -> {} (error_path = {})",
                    connection.source, connection.target, connection.is_error_path
                )));
            }
            outgoing
                .entry(connection.source.clone())
                .or_default()
                .push(connection.clone());
            incoming
                .entry(connection.target.clone())
                .or_default()
                .push(connection.clone());
        }

        let graph = Self {
            steps,
            outgoing,
            incoming,
            entry: workflow.entry.clone(),
        };
        graph.check_reachability()?;
        Ok(graph)
    }

    fn check_reachability(&self) -> Result<(), WorkflowError> {
        let mut reached = HashSet::new();
        let mut queue = VecDeque::from([self.entry.clone()]);
        while let Some(id) = queue.pop_front() {
            if !reached.insert(id.clone()) {
                continue;
            }
            for connection in self.outgoing(&id) {
                queue.push_back(connection.target.clone());
            }
        }
        for id in self.steps.keys() {
            if !reached.contains(id) {
                return Err(WorkflowError::Invalid(format!(
                    "step {id:?} is not reachable from entry {:?}",
                    self.entry
                )));
            }
        }
        Ok(())
    }

    /// The entry step id.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Look up a step.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Step ids in declaration order.
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    /// All edges leaving a step, declaration order.
    #[must_use]
    pub fn outgoing(&self, id: &str) -> &[Connection] {
        self.outgoing.get(id).map_or(&[], Vec::as_slice)
    }

    /// All edges arriving at a step, error paths included.
    ///
    /// Join readiness is judged over every inbound edge: error edges get a
    /// no-fire verdict when their source succeeds, so a join downstream of
    /// both a main line and an error handler can always resolve.
    #[must_use]
    pub fn incoming(&self, id: &str) -> &[Connection] {
        self.incoming.get(id).map_or(&[], Vec::as_slice)
    }
}
