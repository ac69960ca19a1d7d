//! Node tree snapshots.
//!
//! A [`NodeTree`] is the parent/children forest of groups and synths at one
//! offset. It always contains the root group, and every other node appears
//! in exactly one parent's child list.

use std::collections::{BTreeMap, BTreeSet};

use crate::entity::EntityId;
use crate::protocol::AddAction;
use crate::state::{Transition, Transitions};

/// Parent/children maps rooted at [`EntityId::ROOT`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTree {
    children: BTreeMap<EntityId, Vec<EntityId>>,
    parents: BTreeMap<EntityId, EntityId>,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    /// A tree holding only the root group.
    pub fn new() -> Self {
        let mut children = BTreeMap::new();
        children.insert(EntityId::ROOT, Vec::new());
        Self {
            children,
            parents: BTreeMap::new(),
        }
    }

    /// Whether the node is part of the tree.
    pub fn contains(&self, node: EntityId) -> bool {
        self.children.contains_key(&node)
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether only the root is present.
    pub fn is_empty(&self) -> bool {
        self.children.len() <= 1
    }

    /// Ordered children of a node (empty if absent).
    pub fn children(&self, node: EntityId) -> &[EntityId] {
        self.children.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Parent of a node. The root has none.
    pub fn parent(&self, node: EntityId) -> Option<EntityId> {
        self.parents.get(&node).copied()
    }

    /// The node followed by each of its ancestors up to the root.
    pub fn parentage(&self, node: EntityId) -> Vec<EntityId> {
        if !self.contains(node) {
            return Vec::new();
        }
        let mut parentage = vec![node];
        let mut current = node;
        while let Some(parent) = self.parent(current) {
            parentage.push(parent);
            current = parent;
        }
        parentage
    }

    /// Whether `ancestor` is `node` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: EntityId, node: EntityId) -> bool {
        self.parentage(node).contains(&ancestor)
    }

    /// Every node in pre-order, starting with the root.
    pub fn iter_depth_first(&self) -> Vec<EntityId> {
        self.descendants(EntityId::ROOT)
    }

    /// `node` and its descendants in pre-order.
    pub fn descendants(&self, node: EntityId) -> Vec<EntityId> {
        let mut order = Vec::new();
        if !self.contains(node) {
            return order;
        }
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            order.push(current);
            stack.extend(self.children(current).iter().rev());
        }
        order
    }

    /// `(parent, child)` pairs in pre-order.
    pub fn pairs(&self) -> Vec<(EntityId, EntityId)> {
        self.iter_depth_first()
            .into_iter()
            .filter_map(|node| self.parent(node).map(|parent| (parent, node)))
            .collect()
    }

    /// Apply one placement. Returns false when the transition cannot apply:
    /// the target is missing, or the move would create a cycle.
    pub fn move_node(&mut self, transition: &Transition) -> bool {
        let Transition {
            source,
            target,
            action,
        } = *transition;
        if source == EntityId::ROOT || source == target || !self.contains(target) {
            return false;
        }
        if self.contains(source) && self.is_ancestor(source, target) {
            return false;
        }
        let new_parent = if action.is_sibling() {
            match self.parent(target) {
                Some(parent) => parent,
                None => return false,
            }
        } else {
            target
        };
        self.detach(source);
        self.children.entry(source).or_default();
        let siblings = self.children.entry(new_parent).or_default();
        let index = match action {
            AddAction::AddToHead => 0,
            AddAction::AddToTail => siblings.len(),
            AddAction::AddBefore => siblings
                .iter()
                .position(|c| *c == target)
                .unwrap_or(siblings.len()),
            AddAction::AddAfter => siblings
                .iter()
                .position(|c| *c == target)
                .map_or(siblings.len(), |i| i + 1),
        };
        siblings.insert(index, source);
        self.parents.insert(source, new_parent);
        true
    }

    /// Remove a node and, recursively, all of its descendants.
    pub fn free_node(&mut self, node: EntityId) {
        if node == EntityId::ROOT {
            return;
        }
        for child in self.children(node).to_vec() {
            self.free_node(child);
        }
        self.detach(node);
        self.children.remove(&node);
    }

    /// Remove a node, splicing its children into its former slot.
    pub fn remove_spliced(&mut self, node: EntityId) {
        if node == EntityId::ROOT || !self.contains(node) {
            return;
        }
        let inner = self.children.remove(&node).unwrap_or_default();
        let Some(parent) = self.parents.remove(&node) else {
            return;
        };
        for child in &inner {
            self.parents.insert(*child, parent);
        }
        if let Some(siblings) = self.children.get_mut(&parent) {
            if let Some(index) = siblings.iter().position(|c| *c == node) {
                siblings.splice(index..=index, inner);
            }
        }
    }

    /// A copy with every stop node freed.
    pub fn without(&self, stops: &BTreeSet<EntityId>) -> NodeTree {
        let mut tree = self.clone();
        for stop in stops {
            tree.free_node(*stop);
        }
        tree
    }

    /// Replay transitions, then free stop nodes, on a copy of this tree.
    pub fn apply(&self, transitions: &Transitions, stops: &BTreeSet<EntityId>) -> NodeTree {
        let mut tree = self.clone();
        for transition in transitions.iter() {
            if !tree.move_node(transition) {
                log::warn!(
                    "[STATE] Skipping transition of {} relative to {}: target missing or cyclic",
                    transition.source,
                    transition.target
                );
            }
        }
        for stop in stops {
            tree.free_node(*stop);
        }
        tree
    }

    fn detach(&mut self, node: EntityId) {
        if let Some(parent) = self.parents.remove(&node) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|c| *c != node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> EntityId {
        EntityId(n)
    }

    fn place(source: u32, target: u32, action: AddAction) -> Transition {
        Transition {
            source: id(source),
            target: id(target),
            action,
        }
    }

    fn sample() -> NodeTree {
        // root -> [1 -> [3, 4], 2]
        let mut tree = NodeTree::new();
        tree.move_node(&place(1, 0, AddAction::AddToTail));
        tree.move_node(&place(2, 0, AddAction::AddToTail));
        tree.move_node(&place(3, 1, AddAction::AddToHead));
        tree.move_node(&place(4, 3, AddAction::AddAfter));
        tree
    }

    #[test]
    fn test_move_node_actions() {
        let tree = sample();
        assert_eq!(tree.children(id(0)), &[id(1), id(2)]);
        assert_eq!(tree.children(id(1)), &[id(3), id(4)]);
        assert_eq!(tree.parent(id(4)), Some(id(1)));
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_move_before() {
        let mut tree = sample();
        assert!(tree.move_node(&place(2, 4, AddAction::AddBefore)));
        assert_eq!(tree.children(id(0)), &[id(1)]);
        assert_eq!(tree.children(id(1)), &[id(3), id(2), id(4)]);
    }

    #[test]
    fn test_move_rejects_cycles_and_missing_targets() {
        let mut tree = sample();
        assert!(!tree.move_node(&place(1, 3, AddAction::AddToHead)));
        assert!(!tree.move_node(&place(2, 9, AddAction::AddToHead)));
        assert!(!tree.move_node(&place(2, 0, AddAction::AddBefore)));
        assert_eq!(tree, sample());
    }

    #[test]
    fn test_iteration_order() {
        let tree = sample();
        assert_eq!(tree.iter_depth_first(), vec![id(0), id(1), id(3), id(4), id(2)]);
        assert_eq!(
            tree.pairs(),
            vec![(id(0), id(1)), (id(1), id(3)), (id(1), id(4)), (id(0), id(2))]
        );
        assert_eq!(tree.parentage(id(4)), vec![id(4), id(1), id(0)]);
        assert!(tree.is_ancestor(id(1), id(4)));
        assert!(!tree.is_ancestor(id(2), id(4)));
    }

    #[test]
    fn test_free_node_is_recursive() {
        let mut tree = sample();
        tree.free_node(id(1));
        assert_eq!(tree.iter_depth_first(), vec![id(0), id(2)]);
        assert!(!tree.contains(id(3)));
    }

    #[test]
    fn test_remove_spliced() {
        let mut tree = sample();
        tree.remove_spliced(id(1));
        assert_eq!(tree.children(id(0)), &[id(3), id(4), id(2)]);
        assert_eq!(tree.parent(id(3)), Some(id(0)));
    }

    #[test]
    fn test_apply() {
        let tree = sample();
        let mut transitions = Transitions::new();
        transitions.insert(place(5, 2, AddAction::AddToHead));
        transitions.insert(place(4, 5, AddAction::AddToTail));
        let stops = BTreeSet::from([id(3)]);

        let applied = tree.apply(&transitions, &stops);
        assert_eq!(applied.iter_depth_first(), vec![id(0), id(1), id(2), id(5), id(4)]);
        // the source tree is untouched
        assert_eq!(tree, sample());
    }
}
