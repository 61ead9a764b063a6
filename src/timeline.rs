//! Per-session history arena
//!
//! A [`Timeline`] owns every checkpoint record of one session, addressed by
//! id. Parent links are ids, never references, so the structure has no
//! ownership cycles and a branch is just two records naming the same
//! parent:
//!
//! ```text
//! A
//! ├── B
//! └── pre-restore
//!     └── C          (created after restoring to A)
//! ```
//!
//! The arena also remembers creation order, which is what
//! [`CheckpointIndex::list`](crate::index::CheckpointIndex::list) yields,
//! and the session's current pointer.
//!
//! A parent must already be in the arena when a child is added. Since ids
//! are fresh UUIDs this alone rules out cycles; the explicit check in
//! [`Timeline::add_checkpoint`] guards against hand-edited records on load.

use crate::checkpoint::Checkpoint;
use crate::collections::{fast_map, fast_set, FastMap, FastSet};
use crate::error::{Result, RewindError};
use crate::utils::short_id;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// History arena for one session
#[derive(Debug, Clone)]
pub struct Timeline {
    session_id: String,
    checkpoints: FastMap<String, Checkpoint>,
    order: Vec<String>,
    current_checkpoint_id: Option<String>,
    roots: Vec<String>,
    children: FastMap<String, Vec<String>>,
}

impl Timeline {
    /// Empty timeline for `session_id`
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            checkpoints: fast_map(),
            order: Vec::new(),
            current_checkpoint_id: None,
            roots: Vec::new(),
            children: fast_map(),
        }
    }

    /// Session this timeline belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Add a record in creation order
    ///
    /// Does not move the current pointer.
    ///
    /// # Errors
    ///
    /// - [`RewindError::NotFound`] if the parent is not in the arena
    /// - [`RewindError::CircularDependency`] if the link would close a cycle
    /// - [`RewindError::Internal`] for a duplicate id or foreign session
    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if checkpoint.session_id != self.session_id {
            return Err(RewindError::internal(format!(
                "checkpoint {} belongs to session '{}', not '{}'",
                checkpoint.short_id(),
                checkpoint.session_id,
                self.session_id
            )));
        }
        if self.checkpoints.contains_key(&checkpoint.id) {
            return Err(RewindError::internal(format!(
                "checkpoint {} is already in the timeline",
                checkpoint.id
            )));
        }

        let checkpoint_id = checkpoint.id.clone();
        match &checkpoint.parent_id {
            Some(parent_id) => {
                if !self.checkpoints.contains_key(parent_id) {
                    return Err(RewindError::not_found("checkpoint", parent_id.clone()));
                }
                if self.would_create_cycle(&checkpoint_id, parent_id) {
                    return Err(RewindError::CircularDependency(checkpoint_id));
                }
                self.children
                    .entry(parent_id.clone())
                    .or_default()
                    .push(checkpoint_id.clone());
            }
            None => self.roots.push(checkpoint_id.clone()),
        }

        self.checkpoints.insert(checkpoint_id.clone(), checkpoint);
        self.order.push(checkpoint_id.clone());
        trace!("Added checkpoint {} to timeline {}", short_id(&checkpoint_id), self.session_id);
        Ok(())
    }

    /// Move the current pointer
    pub fn set_current(&mut self, checkpoint_id: &str) -> Result<()> {
        if !self.checkpoints.contains_key(checkpoint_id) {
            return Err(RewindError::not_found("checkpoint", checkpoint_id));
        }
        self.current_checkpoint_id = Some(checkpoint_id.to_string());
        debug!("Set current checkpoint of {} to {}", self.session_id, short_id(checkpoint_id));
        Ok(())
    }

    /// Id of the current checkpoint
    pub fn current_id(&self) -> Option<&str> {
        self.current_checkpoint_id.as_deref()
    }

    /// The current checkpoint
    pub fn current_checkpoint(&self) -> Option<&Checkpoint> {
        self.current_checkpoint_id
            .as_ref()
            .and_then(|id| self.checkpoints.get(id))
    }

    /// Record by id
    pub fn get(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(checkpoint_id)
    }

    /// Whether the arena holds `checkpoint_id`
    pub fn contains(&self, checkpoint_id: &str) -> bool {
        self.checkpoints.contains_key(checkpoint_id)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the session has no history yet
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ids in creation order
    pub fn ids_in_order(&self) -> &[String] {
        &self.order
    }

    /// Records in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.order.iter().filter_map(|id| self.checkpoints.get(id))
    }

    /// Direct children, oldest first
    pub fn children(&self, checkpoint_id: &str) -> Vec<&Checkpoint> {
        self.children
            .get(checkpoint_id)
            .map(|ids| ids.iter().filter_map(|id| self.checkpoints.get(id)).collect())
            .unwrap_or_default()
    }

    /// Every descendant, breadth first
    pub fn descendants(&self, checkpoint_id: &str) -> Vec<&Checkpoint> {
        let mut descendants = Vec::new();
        let mut queue: VecDeque<&String> = VecDeque::new();
        if let Some(children) = self.children.get(checkpoint_id) {
            queue.extend(children.iter());
        }
        while let Some(id) = queue.pop_front() {
            if let Some(checkpoint) = self.checkpoints.get(id) {
                descendants.push(checkpoint);
                if let Some(children) = self.children.get(id) {
                    queue.extend(children.iter());
                }
            }
        }
        descendants
    }

    /// Parent, grandparent, ... up to the root
    ///
    /// Nearest first; `checkpoint_id` itself is not included.
    pub fn ancestors(&self, checkpoint_id: &str) -> Vec<&Checkpoint> {
        let mut chain = self.chain(checkpoint_id);
        if !chain.is_empty() {
            chain.remove(0);
        }
        chain
    }

    /// `checkpoint_id` followed by its ancestors
    fn chain(&self, checkpoint_id: &str) -> Vec<&Checkpoint> {
        let mut chain = Vec::new();
        let mut next = self.checkpoints.get(checkpoint_id);
        while let Some(checkpoint) = next {
            chain.push(checkpoint);
            next = checkpoint
                .parent_id
                .as_ref()
                .and_then(|parent| self.checkpoints.get(parent));
        }
        chain
    }

    /// Lowest common ancestor of two checkpoints
    ///
    /// A checkpoint counts as its own ancestor, so the result for `a` and a
    /// descendant of `a` is `a`. Both chains are walked from their start;
    /// the chain whose start is closer to the current pointer is walked
    /// first and its first id present in the other chain wins.
    pub fn common_ancestor(&self, a: &str, b: &str) -> Option<&Checkpoint> {
        let chain_a = self.chain(a);
        let chain_b = self.chain(b);
        if chain_a.is_empty() || chain_b.is_empty() {
            return None;
        }

        let (primary, secondary) = match self.current_checkpoint_id.as_deref() {
            Some(current) if self.distance(b, current) < self.distance(a, current) => {
                (chain_b, chain_a)
            }
            _ => (chain_a, chain_b),
        };

        let other: FastSet<&str> = {
            let mut set = fast_set();
            set.extend(secondary.iter().map(|c| c.id.as_str()));
            set
        };
        primary.into_iter().find(|c| other.contains(c.id.as_str()))
    }

    /// Number of parent links between two checkpoints (through their LCA)
    fn distance(&self, a: &str, b: &str) -> usize {
        let chain_a = self.chain(a);
        let chain_b = self.chain(b);
        let positions: FastMap<&str, usize> = {
            let mut map = fast_map();
            map.extend(chain_b.iter().enumerate().map(|(i, c)| (c.id.as_str(), i)));
            map
        };
        chain_a
            .iter()
            .enumerate()
            .find_map(|(i, c)| positions.get(c.id.as_str()).map(|j| i + j))
            .unwrap_or(usize::MAX)
    }

    fn would_create_cycle(&self, child_id: &str, parent_id: &str) -> bool {
        if child_id == parent_id {
            return true;
        }

        let mut current_id = parent_id;
        let mut visited = fast_set();
        while let Some(checkpoint) = self.checkpoints.get(current_id) {
            if !visited.insert(current_id) || current_id == child_id {
                return true;
            }
            match &checkpoint.parent_id {
                Some(id) => current_id = id,
                None => break,
            }
        }
        false
    }

    /// Shape statistics
    pub fn stats(&self) -> TimelineStats {
        let leaf_checkpoints = self
            .checkpoints
            .keys()
            .filter(|id| !self.children.contains_key(*id))
            .count();
        let max_depth = self
            .roots
            .iter()
            .map(|root| self.depth_below(root))
            .max()
            .unwrap_or(0);
        let total_branches = self.children.values().filter(|c| c.len() > 1).count();
        let pre_restore_checkpoints = self.checkpoints.values().filter(|c| c.is_pre_restore()).count();

        TimelineStats {
            total_checkpoints: self.checkpoints.len(),
            root_checkpoints: self.roots.len(),
            leaf_checkpoints,
            max_depth,
            total_branches,
            pre_restore_checkpoints,
        }
    }

    fn depth_below(&self, checkpoint_id: &str) -> usize {
        // Iterative so very long sessions cannot overflow the stack
        let mut max_depth = 0;
        let mut stack = vec![(checkpoint_id, 1usize)];
        while let Some((id, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            if let Some(children) = self.children.get(id) {
                stack.extend(children.iter().map(|c| (c.as_str(), depth + 1)));
            }
        }
        max_depth
    }

    /// Tree view rooted at each root checkpoint
    pub fn to_tree_nodes(&self) -> Vec<TimelineNode> {
        self.roots
            .iter()
            .filter_map(|root_id| self.build_tree_node(root_id))
            .collect()
    }

    fn build_tree_node(&self, checkpoint_id: &str) -> Option<TimelineNode> {
        let checkpoint = self.checkpoints.get(checkpoint_id)?;
        let children = self
            .children
            .get(checkpoint_id)
            .map(|ids| ids.iter().filter_map(|id| self.build_tree_node(id)).collect())
            .unwrap_or_default();

        Some(TimelineNode {
            checkpoint: checkpoint.clone(),
            children,
            is_current: self.current_checkpoint_id.as_deref() == Some(checkpoint_id),
        })
    }
}

/// Node of the rendered history tree
#[derive(Debug, Clone)]
pub struct TimelineNode {
    /// Record at this node
    pub checkpoint: Checkpoint,
    /// Children, oldest first
    pub children: Vec<TimelineNode>,
    /// Whether this is the session's current checkpoint
    pub is_current: bool,
}

impl TimelineNode {
    /// Render this node and its subtree with box-drawing connectors
    pub fn format_tree(&self, prefix: &str, is_last: bool) -> String {
        let mut result = String::new();
        let connector = if is_last { "└── " } else { "├── " };
        let marker = if self.is_current { "* " } else { "" };

        result.push_str(prefix);
        result.push_str(connector);
        result.push_str(marker);
        result.push_str(&self.checkpoint.display_format());
        result.push('\n');

        let extension = if is_last { "    " } else { "│   " };
        let child_prefix = format!("{}{}", prefix, extension);
        for (i, child) in self.children.iter().enumerate() {
            result.push_str(&child.format_tree(&child_prefix, i == self.children.len() - 1));
        }
        result
    }
}

/// Shape of a session's history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineStats {
    /// Records in the session
    pub total_checkpoints: usize,
    /// Records without a parent
    pub root_checkpoints: usize,
    /// Records without children
    pub leaf_checkpoints: usize,
    /// Longest root-to-leaf chain
    pub max_depth: usize,
    /// Records with more than one child
    pub total_branches: usize,
    /// Automatic pre-restore snapshots
    pub pre_restore_checkpoints: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointKind, CheckpointMetadataBuilder};
    use crate::store::BlobHash;

    fn checkpoint(id: &str, parent_id: Option<&str>) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(
            "s1",
            parent_id.map(str::to_string),
            BlobHash::of(id.as_bytes()),
            format!("Checkpoint {}", id),
            CheckpointKind::Manual,
            0,
            CheckpointMetadataBuilder::new().build(),
        );
        checkpoint.id = id.to_string();
        checkpoint
    }

    fn branched() -> Timeline {
        //   root
        //   ├── branch1
        //   │   └── leaf1
        //   └── branch2
        let mut timeline = Timeline::new("s1");
        timeline.add_checkpoint(checkpoint("root", None)).unwrap();
        timeline.add_checkpoint(checkpoint("branch1", Some("root"))).unwrap();
        timeline.add_checkpoint(checkpoint("leaf1", Some("branch1"))).unwrap();
        timeline.add_checkpoint(checkpoint("branch2", Some("root"))).unwrap();
        timeline
    }

    #[test]
    fn test_basic_operations() {
        let mut timeline = Timeline::new("s1");
        timeline.add_checkpoint(checkpoint("root", None)).unwrap();
        assert_eq!(timeline.len(), 1);
        assert!(timeline.current_id().is_none());

        timeline.set_current("root").unwrap();
        timeline.add_checkpoint(checkpoint("child", Some("root"))).unwrap();
        assert_eq!(timeline.children("root").len(), 1);
        assert_eq!(timeline.current_id(), Some("root"));
        assert_eq!(timeline.ids_in_order(), &["root".to_string(), "child".to_string()]);
    }

    #[test]
    fn test_rejects_unknown_parent_and_duplicates() {
        let mut timeline = Timeline::new("s1");
        assert!(matches!(
            timeline.add_checkpoint(checkpoint("orphan", Some("missing"))),
            Err(RewindError::NotFound { .. })
        ));
        timeline.add_checkpoint(checkpoint("c1", None)).unwrap();
        assert!(timeline.add_checkpoint(checkpoint("c1", None)).is_err());
        assert!(matches!(
            timeline.set_current("nope"),
            Err(RewindError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rejects_foreign_session() {
        let mut timeline = Timeline::new("other");
        assert!(timeline.add_checkpoint(checkpoint("c1", None)).is_err());
    }

    #[test]
    fn test_navigation() {
        let timeline = branched();

        let ancestors: Vec<_> = timeline.ancestors("leaf1").iter().map(|c| c.id.clone()).collect();
        assert_eq!(ancestors, vec!["branch1", "root"]);
        assert!(timeline.ancestors("root").is_empty());
        assert_eq!(timeline.descendants("root").len(), 3);

        assert_eq!(timeline.common_ancestor("leaf1", "branch2").unwrap().id, "root");
        assert_eq!(timeline.common_ancestor("leaf1", "branch1").unwrap().id, "branch1");
        assert_eq!(timeline.common_ancestor("leaf1", "leaf1").unwrap().id, "leaf1");
        assert!(timeline.common_ancestor("leaf1", "missing").is_none());
    }

    #[test]
    fn test_common_ancestor_is_symmetric_regardless_of_current() {
        let mut timeline = branched();
        for current in ["leaf1", "branch2", "root"] {
            timeline.set_current(current).unwrap();
            assert_eq!(timeline.common_ancestor("leaf1", "branch2").unwrap().id, "root");
            assert_eq!(timeline.common_ancestor("branch2", "leaf1").unwrap().id, "root");
        }
    }

    #[test]
    fn test_stats() {
        let mut timeline = Timeline::new("s1");
        timeline.add_checkpoint(checkpoint("root", None)).unwrap();
        timeline.add_checkpoint(checkpoint("b1", Some("root"))).unwrap();
        timeline.add_checkpoint(checkpoint("b2", Some("root"))).unwrap();
        timeline.add_checkpoint(checkpoint("l1", Some("b1"))).unwrap();
        timeline.add_checkpoint(checkpoint("l2", Some("b1"))).unwrap();

        let stats = timeline.stats();
        assert_eq!(stats.total_checkpoints, 5);
        assert_eq!(stats.root_checkpoints, 1);
        assert_eq!(stats.leaf_checkpoints, 3);
        assert_eq!(stats.max_depth, 3);
        assert_eq!(stats.total_branches, 2);
    }

    #[test]
    fn test_tree_rendering_marks_current() {
        let mut timeline = branched();
        timeline.set_current("branch2").unwrap();
        let nodes = timeline.to_tree_nodes();
        assert_eq!(nodes.len(), 1);
        let rendered = nodes[0].format_tree("", true);
        assert_eq!(rendered.lines().count(), 4);
        assert!(rendered.lines().any(|l| l.contains("* ") && l.contains("branch2")));
        assert!(rendered.contains("├── "));
    }
}
