//! Workflow graphs.
//!
//! A workflow is a directed graph of `Node`s connected by `Edge`s, described
//! by a serializable `GraphDefinition`. A `Graph` binds a definition to the
//! handlers and parallel tasks that implement its nodes, plus the routing
//! predicate that picks successors.
//!
//! The `GraphExecutor` walks the graph from the entry node, committing a
//! checkpoint after every node and routing between conditional edges.

pub mod edge;
pub mod executor;
pub mod node;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{NodeHandler, ParallelTask, RoutePredicate};

pub use edge::{evaluate_condition, Confidence, Edge, EdgeCondition, EdgeRouter};
pub use executor::{EngineServices, GraphExecutor, StepOutcome};
pub use node::{Node, NodeKind};

/// Serializable shape of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub name: String,
    /// Id of the first node.
    pub entry: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphDefinition {
    pub fn new(name: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: entry.into(),
            nodes: vec![],
            edges: vec![],
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Load a definition from a TOML or JSON file, by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let definition = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => Self::from_toml(&content)?,
        };
        Ok(definition)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WeftError::Graph(e.to_string()))
    }

    /// Structural checks that do not need handlers.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(WeftError::Graph(format!("duplicate node id '{}'", node.id)));
            }
        }
        if !ids.contains(self.entry.as_str()) {
            return Err(WeftError::Graph(format!(
                "entry node '{}' is not defined",
                self.entry
            )));
        }
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !ids.contains(end.as_str()) {
                    return Err(WeftError::Graph(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.from, edge.to, end
                    )));
                }
            }
        }
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Review {
                    on_reject: Some(target),
                    ..
                } if !ids.contains(target.as_str()) => {
                    return Err(WeftError::Graph(format!(
                        "review node '{}' rejects to unknown node '{}'",
                        node.id, target
                    )));
                }
                NodeKind::Parallel { tasks } if tasks.is_empty() => {
                    return Err(WeftError::Graph(format!(
                        "parallel node '{}' has no tasks",
                        node.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// A definition bound to its implementations.
pub struct Graph {
    definition: GraphDefinition,
    nodes: HashMap<String, Node>,
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
    tasks: HashMap<String, Arc<dyn ParallelTask>>,
    router: Arc<dyn RoutePredicate>,
}

impl Graph {
    /// Bind a definition. Routing defaults to an `EdgeRouter` over its edges.
    pub fn new(definition: GraphDefinition) -> Self {
        let nodes = definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        let router = Arc::new(EdgeRouter::new(definition.edges.clone()));
        Self {
            definition,
            nodes,
            handlers: HashMap::new(),
            tasks: HashMap::new(),
            router,
        }
    }

    /// Register the handler for a task node.
    pub fn with_handler(mut self, node: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        self.handlers.insert(node.into(), handler);
        self
    }

    /// Register a task that parallel nodes can fan out to.
    pub fn with_task(mut self, name: impl Into<String>, task: Arc<dyn ParallelTask>) -> Self {
        self.tasks.insert(name.into(), task);
        self
    }

    /// Replace the routing predicate.
    pub fn with_router(mut self, router: Arc<dyn RoutePredicate>) -> Self {
        self.router = router;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn entry(&self) -> &str {
        &self.definition.entry
    }

    pub fn definition(&self) -> &GraphDefinition {
        &self.definition
    }

    pub fn router(&self) -> &dyn RoutePredicate {
        self.router.as_ref()
    }

    /// Structural checks plus a handler for every task node and a
    /// registration for every parallel task.
    pub fn validate(&self) -> Result<()> {
        self.definition.validate()?;
        for node in &self.definition.nodes {
            match &node.kind {
                NodeKind::Task if !self.handlers.contains_key(&node.id) => {
                    return Err(WeftError::HandlerNotFound(node.id.clone()));
                }
                NodeKind::Parallel { tasks } => {
                    if let Some(missing) = tasks.iter().find(|t| !self.tasks.contains_key(*t)) {
                        return Err(WeftError::HandlerNotFound(format!(
                            "{} (parallel task of '{}')",
                            missing, node.id
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| WeftError::NodeNotFound(id.to_string()))
    }

    pub fn handler(&self, id: &str) -> Result<Arc<dyn NodeHandler>> {
        self.handlers
            .get(id)
            .cloned()
            .ok_or_else(|| WeftError::HandlerNotFound(id.to_string()))
    }

    /// The tasks a parallel node fans out to, keyed by name.
    pub fn tasks_for(&self, names: &[String]) -> Result<BTreeMap<String, Arc<dyn ParallelTask>>> {
        names
            .iter()
            .map(|name| {
                self.tasks
                    .get(name)
                    .cloned()
                    .map(|task| (name.clone(), task))
                    .ok_or_else(|| WeftError::HandlerNotFound(name.clone()))
            })
            .collect()
    }
}
