use serde::{Deserialize, Serialize};

/// A node in the workflow graph.
///
/// Task nodes run the handler registered under their id. Review nodes
/// suspend the workflow until a human decision arrives. Parallel nodes fan
/// out to the named tasks and join them before continuing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    /// Handler deadline. Exceeding it counts as a timeout error.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Task,
    Review {
        reason: String,
        /// Overrides `review.default_timeout_secs`.
        #[serde(default)]
        timeout_secs: Option<u64>,
        /// Node to continue at when the review is rejected.
        #[serde(default)]
        on_reject: Option<String>,
    },
    Parallel {
        tasks: Vec<String>,
    },
}

impl Node {
    /// Create a task node.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Task,
            timeout_secs: None,
        }
    }

    /// Create a human review gate.
    pub fn review(id: impl Into<String>, reason: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: NodeKind::Review {
                reason: reason.into(),
                timeout_secs: None,
                on_reject: None,
            },
            timeout_secs: None,
        }
    }

    /// Create a fan-out node over registered parallel tasks.
    pub fn parallel(id: impl Into<String>, tasks: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: NodeKind::Parallel { tasks },
            timeout_secs: None,
        }
    }

    /// Set the handler deadline.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set the rejection target of a review node. No-op on other kinds.
    pub fn with_on_reject(mut self, target: impl Into<String>) -> Self {
        if let NodeKind::Review { on_reject, .. } = &mut self.kind {
            *on_reject = Some(target.into());
        }
        self
    }

    /// Set the deadline of a review node. No-op on other kinds.
    pub fn with_review_timeout(mut self, secs: u64) -> Self {
        if let NodeKind::Review { timeout_secs, .. } = &mut self.kind {
            *timeout_secs = Some(secs);
        }
        self
    }

    pub fn is_task(&self) -> bool {
        matches!(self.kind, NodeKind::Task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builders() {
        let node = Node::new("draft", "Draft article").with_timeout(30);
        assert_eq!(node.id, "draft");
        assert_eq!(node.name, "Draft article");
        assert!(node.is_task());
        assert_eq!(node.timeout_secs, Some(30));

        let review = Node::review("review", "approve the draft")
            .with_on_reject("regenerate")
            .with_review_timeout(600);
        match review.kind {
            NodeKind::Review {
                reason,
                timeout_secs,
                on_reject,
            } => {
                assert_eq!(reason, "approve the draft");
                assert_eq!(timeout_secs, Some(600));
                assert_eq!(on_reject.as_deref(), Some("regenerate"));
            }
            other => panic!("expected review node, got {:?}", other),
        }

        let task = Node::new("t", "t").with_on_reject("x");
        assert_eq!(task.kind, NodeKind::Task);
    }

    #[test]
    fn test_kind_from_toml() {
        let node: Node = toml::from_str(
            r#"
id = "gate"
kind = { type = "review", reason = "check tone", on_reject = "rewrite" }
"#,
        )
        .unwrap();
        assert!(matches!(node.kind, NodeKind::Review { .. }));

        let node: Node = toml::from_str(r#"id = "plain""#).unwrap();
        assert_eq!(node.kind, NodeKind::Task);
        assert_eq!(node.timeout_secs, None);
    }
}
