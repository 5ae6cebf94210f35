//! Hierarchical subgoal tree for a session.
//!
//! Status transitions are monotonic: once a node is `done` or `failed` it only
//! changes through [`TaskTree::reset`], and a node may only become terminal
//! after every required child is terminal.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::reply::TaskUpdate;

pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    fn marker(self) -> &'static str {
        match self {
            TaskStatus::Pending => "[ ]",
            TaskStatus::InProgress => "[~]",
            TaskStatus::Done => "[x]",
            TaskStatus::Failed => "[!]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub parent: Option<String>,
    /// Position among siblings (insertion order).
    pub order: u32,
    /// Required children gate their parent's terminal transition.
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("unknown parent '{0}'")]
    UnknownParent(String),
    #[error("duplicate task id '{0}'")]
    DuplicateId(String),
    #[error("task '{id}' is already {status:?}; reset it first")]
    Terminal { id: String, status: TaskStatus },
    #[error("task '{id}' has unfinished required children: {}", pending.join(", "))]
    ChildrenNotTerminal { id: String, pending: Vec<String> },
}

/// Flat arena of task nodes rooted at the challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTree {
    nodes: Vec<TaskNode>,
}

impl TaskTree {
    pub fn new(challenge_title: &str) -> Self {
        Self {
            nodes: vec![TaskNode {
                id: ROOT_ID.to_string(),
                description: challenge_title.to_string(),
                status: TaskStatus::Pending,
                parent: None,
                order: 0,
                required: true,
            }],
        }
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    /// Children of `id` in sibling order.
    pub fn children(&self, id: &str) -> Vec<&TaskNode> {
        let mut children: Vec<&TaskNode> = self
            .nodes
            .iter()
            .filter(|node| node.parent.as_deref() == Some(id))
            .collect();
        children.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        children
    }

    /// Add a pending node under `parent` (the root when `None`).
    pub fn add(
        &mut self,
        id: &str,
        description: &str,
        parent: Option<&str>,
        required: bool,
    ) -> Result<(), TaskError> {
        if self.get(id).is_some() {
            return Err(TaskError::DuplicateId(id.to_string()));
        }
        let parent_id = parent.unwrap_or(ROOT_ID);
        let parent_node = self
            .get(parent_id)
            .ok_or_else(|| TaskError::UnknownParent(parent_id.to_string()))?;
        if parent_node.status.is_terminal() && required {
            return Err(TaskError::Terminal {
                id: parent_id.to_string(),
                status: parent_node.status,
            });
        }
        let order = self.children(parent_id).len() as u32;
        self.nodes.push(TaskNode {
            id: id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            parent: Some(parent_id.to_string()),
            order,
            required,
        });
        Ok(())
    }

    /// Move `id` to `status`. Returns `false` when the status was already set.
    pub fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<bool, TaskError> {
        let current = self
            .get(id)
            .ok_or_else(|| TaskError::UnknownTask(id.to_string()))?
            .status;
        if current == status {
            return Ok(false);
        }
        if current.is_terminal() {
            return Err(TaskError::Terminal {
                id: id.to_string(),
                status: current,
            });
        }
        if status.is_terminal() {
            let pending: Vec<String> = self
                .children(id)
                .into_iter()
                .filter(|child| child.required && !child.status.is_terminal())
                .map(|child| child.id.clone())
                .collect();
            if !pending.is_empty() {
                return Err(TaskError::ChildrenNotTerminal {
                    id: id.to_string(),
                    pending,
                });
            }
        }
        if let Some(node) = self.get_mut(id) {
            node.status = status;
        }
        Ok(true)
    }

    /// Explicitly reopen `id`. Terminal ancestors are reopened too, so no
    /// terminal node is left with a non-terminal required child. Returns the
    /// ids that changed, nearest first.
    pub fn reset(&mut self, id: &str) -> Result<Vec<String>, TaskError> {
        if self.get(id).is_none() {
            return Err(TaskError::UnknownTask(id.to_string()));
        }
        let mut changed = Vec::new();
        let mut cursor = Some(id.to_string());
        let mut first = true;
        while let Some(current) = cursor {
            let Some(node) = self.get_mut(&current) else {
                break;
            };
            if first || (node.status.is_terminal() && node.required) {
                if node.status != TaskStatus::Pending {
                    node.status = TaskStatus::Pending;
                    changed.push(node.id.clone());
                }
            } else if !node.status.is_terminal() {
                break;
            }
            first = false;
            cursor = node.parent.clone();
        }
        Ok(changed)
    }

    /// Apply a model-proposed update: create the node if unknown, then move it
    /// to the requested status.
    pub fn apply_update(&mut self, update: &TaskUpdate) -> Result<(), TaskError> {
        if self.get(&update.id).is_none() {
            let description = update.description.as_deref().unwrap_or(&update.id);
            self.add(&update.id, description, update.parent.as_deref(), true)?;
        } else if let Some(description) = &update.description
            && let Some(node) = self.get_mut(&update.id)
            && !node.status.is_terminal()
        {
            node.description = description.clone();
        }
        self.set_status(&update.id, update.status)?;
        Ok(())
    }

    /// Indented, depth-first rendering for prompts.
    pub fn summary(&self, max_nodes: usize) -> String {
        let mut lines = Vec::new();
        self.summary_inner(ROOT_ID, 0, max_nodes, &mut lines);
        lines.join("\n")
    }

    fn summary_inner(&self, id: &str, depth: usize, max_nodes: usize, lines: &mut Vec<String>) {
        if lines.len() >= max_nodes {
            return;
        }
        let Some(node) = self.get(id) else {
            return;
        };
        lines.push(format!(
            "{}- {} {}: {}",
            "  ".repeat(depth),
            node.status.marker(),
            node.id,
            node.description
        ));
        for child in self.children(id) {
            self.summary_inner(&child.id, depth + 1, max_nodes, lines);
        }
    }
}

/// Check structural invariants. Returns stable error messages (empty on success).
pub fn validate_invariants(tree: &TaskTree) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut roots = 0;

    for node in tree.nodes() {
        if !seen.insert(node.id.as_str()) {
            errors.push(format!("duplicate id '{}'", node.id));
        }
        match &node.parent {
            None => roots += 1,
            Some(parent) if tree.get(parent).is_none() => {
                errors.push(format!("{}: unknown parent '{}'", node.id, parent));
            }
            Some(_) => {}
        }
        if node.status.is_terminal() {
            for child in tree.children(&node.id) {
                if child.required && !child.status.is_terminal() {
                    errors.push(format!(
                        "{}: terminal with unfinished child '{}'",
                        node.id, child.id
                    ));
                }
            }
        }
    }

    if roots != 1 {
        errors.push(format!("expected exactly one root, found {roots}"));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_children() -> TaskTree {
        let mut tree = TaskTree::new("challenge");
        tree.add("recon", "look around", None, true).expect("add");
        tree.add("decode", "decode blob", None, true).expect("add");
        tree.add("decode-b64", "try base64", Some("decode"), true)
            .expect("add");
        tree
    }

    #[test]
    fn children_follow_insertion_order() {
        let tree = tree_with_children();
        let ids: Vec<&str> = tree
            .children(ROOT_ID)
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(ids, vec!["recon", "decode"]);
        assert!(validate_invariants(&tree).is_empty());
    }

    #[test]
    fn parent_cannot_finish_before_required_children() {
        let mut tree = tree_with_children();
        let err = tree.set_status("decode", TaskStatus::Done).unwrap_err();
        assert_eq!(
            err,
            TaskError::ChildrenNotTerminal {
                id: "decode".to_string(),
                pending: vec!["decode-b64".to_string()],
            }
        );
        let err = tree.set_status("decode", TaskStatus::Failed).unwrap_err();
        assert!(matches!(err, TaskError::ChildrenNotTerminal { .. }));

        tree.set_status("decode-b64", TaskStatus::Failed).expect("fail child");
        assert!(tree.set_status("decode", TaskStatus::Done).expect("done"));
    }

    #[test]
    fn optional_children_do_not_gate_parent() {
        let mut tree = TaskTree::new("challenge");
        tree.add("a", "a", None, true).expect("add");
        tree.add("a-hint", "maybe", Some("a"), false).expect("add");
        assert!(tree.set_status("a", TaskStatus::Done).expect("done"));
    }

    #[test]
    fn terminal_status_is_monotonic() {
        let mut tree = tree_with_children();
        tree.set_status("recon", TaskStatus::Done).expect("done");

        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Failed,
        ] {
            let err = tree.set_status("recon", status).unwrap_err();
            assert!(matches!(err, TaskError::Terminal { .. }));
            assert_eq!(tree.get("recon").expect("node").status, TaskStatus::Done);
        }
        // Re-asserting the same terminal status is a no-op.
        assert!(!tree.set_status("recon", TaskStatus::Done).expect("noop"));
    }

    #[test]
    fn reset_reopens_node_and_terminal_ancestors() {
        let mut tree = tree_with_children();
        tree.set_status("decode-b64", TaskStatus::Done).expect("child");
        tree.set_status("decode", TaskStatus::Done).expect("parent");

        let changed = tree.reset("decode-b64").expect("reset");
        assert_eq!(changed, vec!["decode-b64".to_string(), "decode".to_string()]);
        assert_eq!(
            tree.get("decode").expect("node").status,
            TaskStatus::Pending
        );
        assert!(validate_invariants(&tree).is_empty());
    }

    #[test]
    fn cannot_add_required_child_under_terminal_parent() {
        let mut tree = tree_with_children();
        tree.set_status("recon", TaskStatus::Done).expect("done");
        let err = tree.add("late", "late", Some("recon"), true).unwrap_err();
        assert!(matches!(err, TaskError::Terminal { .. }));
        assert!(matches!(
            tree.add("recon", "dup", None, true).unwrap_err(),
            TaskError::DuplicateId(_)
        ));
        assert!(matches!(
            tree.add("x", "x", Some("nope"), true).unwrap_err(),
            TaskError::UnknownParent(_)
        ));
    }

    #[test]
    fn apply_update_creates_then_transitions() {
        let mut tree = TaskTree::new("challenge");
        tree.apply_update(&TaskUpdate {
            id: "1".to_string(),
            description: Some("inspect file".to_string()),
            status: TaskStatus::InProgress,
            parent: None,
        })
        .expect("create");
        tree.apply_update(&TaskUpdate {
            id: "1".to_string(),
            description: None,
            status: TaskStatus::Done,
            parent: None,
        })
        .expect("finish");
        let node = tree.get("1").expect("node");
        assert_eq!(node.status, TaskStatus::Done);
        assert_eq!(node.description, "inspect file");
        assert!(tree.summary(10).contains("[x] 1: inspect file"));
    }
}
