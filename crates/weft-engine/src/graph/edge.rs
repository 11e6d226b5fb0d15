use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use weft_core::state::WorkflowState;
use weft_core::traits::RoutePredicate;

/// An edge connecting two nodes in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must be true to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Confidence reported to the router when several edges match.
    #[serde(default)]
    pub confidence: Confidence,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse if a simple expression matches the workflow context.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Fixed(f64),
    /// Read a number from the context; missing or non-numeric reads as 0.
    FromContext(String),
}

impl Default for Confidence {
    fn default() -> Self {
        Confidence::Fixed(1.0)
    }
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
            confidence: Confidence::default(),
        }
    }

    /// Create a conditional edge.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Conditional { expr: expr.into() },
            confidence: Confidence::default(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Confidence::Fixed(confidence);
        self
    }

    pub fn with_confidence_key(mut self, key: impl Into<String>) -> Self {
        self.confidence = Confidence::FromContext(key.into());
        self
    }

    /// Whether this edge can be taken given `state`.
    pub fn matches(&self, state: &WorkflowState) -> bool {
        match &self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::Conditional { expr } => evaluate_condition(expr, state.context().data()),
        }
    }

    pub fn confidence_in(&self, state: &WorkflowState) -> f64 {
        match &self.confidence {
            Confidence::Fixed(value) => *value,
            Confidence::FromContext(key) => state.context().get_f64(key).unwrap_or(0.0),
        }
    }
}

/// Evaluate a simple conditional expression against context data.
///
/// Supported expressions:
/// - `key == "value"` - exact match
/// - `key != "value"` - not equal
/// - `key contains "substr"` - substring match
///
/// Numbers and booleans compare by their JSON text. Returns `false` for
/// unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return lookup(context, key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup(context, key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup(context, key).is_some_and(|s| s == value);
    }

    false
}

fn lookup(context: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    match context.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        v @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_)) => Some(v.to_string()),
        _ => None,
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}

/// Default routing predicate built from a graph's edges.
///
/// Every matching outgoing edge is a candidate; when two edges lead to the
/// same node the higher confidence wins.
#[derive(Debug, Clone, Default)]
pub struct EdgeRouter {
    edges: Vec<Edge>,
}

impl EdgeRouter {
    pub fn new(edges: Vec<Edge>) -> Self {
        Self { edges }
    }
}

impl RoutePredicate for EdgeRouter {
    fn candidates(&self, node: &str, state: &WorkflowState) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for edge in self.edges.iter().filter(|e| e.from == node && e.matches(state)) {
            let confidence = edge.confidence_in(state);
            out.entry(edge.to.clone())
                .and_modify(|c: &mut f64| *c = c.max(confidence))
                .or_insert(confidence);
        }
        out
    }
}
