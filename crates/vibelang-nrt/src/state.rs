//! Per-offset states and the transition diff engine.
//!
//! A [`State`] records what happens at one offset: which nodes and buffers
//! start or stop, and the ordered [`Transitions`] that place nodes. Its tree
//! is a cache derived from the previous tree. A sparse state holds no tree
//! and resolves to the nearest preceding dense one.

use std::collections::BTreeSet;

use crate::entity::EntityId;
use crate::error::{Result, SessionError};
use crate::offset::Offset;
use crate::protocol::AddAction;
use crate::tree::NodeTree;

/// Placement of `source` relative to `target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub source: EntityId,
    pub target: EntityId,
    pub action: AddAction,
}

/// Ordered transitions, at most one per source.
///
/// Re-inserting a source replaces its transition in place, keeping its
/// position in the replay order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transitions(Vec<Transition>);

impl Transitions {
    /// Create an empty set.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or replace the transition for `transition.source`.
    pub fn insert(&mut self, transition: Transition) {
        match self.0.iter_mut().find(|t| t.source == transition.source) {
            Some(slot) => *slot = transition,
            None => self.0.push(transition),
        }
    }

    /// Transition recorded for a source.
    pub fn get(&self, source: EntityId) -> Option<&Transition> {
        self.0.iter().find(|t| t.source == source)
    }

    /// Whether a source has a transition.
    pub fn contains(&self, source: EntityId) -> bool {
        self.get(source).is_some()
    }

    /// Remove and return the transition for a source.
    pub fn remove(&mut self, source: EntityId) -> Option<Transition> {
        let index = self.0.iter().position(|t| t.source == source)?;
        Some(self.0.remove(index))
    }

    /// Iterate in replay order.
    pub fn iter(&self) -> std::slice::Iter<'_, Transition> {
        self.0.iter()
    }

    /// Number of transitions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are none.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hand every reference to `old` over to `new`, in place.
    ///
    /// The transition that places `new` keeps its own target.
    pub(crate) fn hand_over(&mut self, old: EntityId, new: EntityId) {
        for transition in &mut self.0 {
            if transition.source == old {
                transition.source = new;
            }
            if transition.target == old && transition.source != new {
                transition.target = new;
            }
        }
    }
}

impl Extend<Transition> for Transitions {
    fn extend<I: IntoIterator<Item = Transition>>(&mut self, iter: I) {
        for transition in iter {
            self.insert(transition);
        }
    }
}

impl FromIterator<Transition> for Transitions {
    fn from_iter<I: IntoIterator<Item = Transition>>(iter: I) -> Self {
        let mut transitions = Transitions::new();
        transitions.extend(iter);
        transitions
    }
}

impl IntoIterator for Transitions {
    type Item = Transition;
    type IntoIter = std::vec::IntoIter<Transition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Transitions {
    type Item = &'a Transition;
    type IntoIter = std::slice::Iter<'a, Transition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Everything that happens at one offset.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    pub(crate) offset: Offset,
    pub(crate) tree: Option<NodeTree>,
    pub(crate) transitions: Transitions,
    pub(crate) start_nodes: BTreeSet<EntityId>,
    pub(crate) stop_nodes: BTreeSet<EntityId>,
    pub(crate) start_buffers: BTreeSet<EntityId>,
    pub(crate) stop_buffers: BTreeSet<EntityId>,
}

impl State {
    /// A sparse state with nothing scheduled.
    pub fn new(offset: Offset) -> Self {
        Self {
            offset,
            tree: None,
            transitions: Transitions::new(),
            start_nodes: BTreeSet::new(),
            stop_nodes: BTreeSet::new(),
            start_buffers: BTreeSet::new(),
            stop_buffers: BTreeSet::new(),
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset.as_f64()
    }

    /// The materialized tree, or `None` when sparse.
    pub fn tree(&self) -> Option<&NodeTree> {
        self.tree.as_ref()
    }

    pub fn transitions(&self) -> &Transitions {
        &self.transitions
    }

    pub fn start_nodes(&self) -> &BTreeSet<EntityId> {
        &self.start_nodes
    }

    pub fn stop_nodes(&self) -> &BTreeSet<EntityId> {
        &self.stop_nodes
    }

    pub fn start_buffers(&self) -> &BTreeSet<EntityId> {
        &self.start_buffers
    }

    pub fn stop_buffers(&self) -> &BTreeSet<EntityId> {
        &self.stop_buffers
    }

    /// Whether the tree here is necessarily identical to the previous one.
    pub fn is_sparse(&self) -> bool {
        self.start_nodes.is_empty() && self.stop_nodes.is_empty() && self.transitions.is_empty()
    }

    /// Whether any buffer starts or stops here.
    pub fn has_buffer_activity(&self) -> bool {
        !self.start_buffers.is_empty() || !self.stop_buffers.is_empty()
    }
}

/// A parent's children at one offset, classified against the previous offset.
///
/// Each list is sorted and the five are disjoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChildrenInspection {
    /// Moved in from elsewhere.
    pub entering: Vec<EntityId>,
    /// Moved out to elsewhere.
    pub exiting: Vec<EntityId>,
    /// Present before and after.
    pub occupying: Vec<EntityId>,
    /// Created exactly here.
    pub starting: Vec<EntityId>,
    /// Ending exactly here.
    pub stopping: Vec<EntityId>,
}

/// First placement that brings `current` closer to `desired`.
///
/// Parents are visited in `current`'s pre-order, skipping nodes that stop
/// here. Within a parent the first diverging child position yields the
/// transition. A parent whose next placement would pull one of its own
/// ancestors inside it is deferred until that ancestor has moved away.
pub fn find_first_inconsistency(
    current: &NodeTree,
    desired: &NodeTree,
    stops: &BTreeSet<EntityId>,
) -> Option<Transition> {
    'parents: for parent in current.iter_depth_first() {
        if stops.contains(&parent) {
            continue;
        }
        let ones: Vec<EntityId> = current
            .children(parent)
            .iter()
            .copied()
            .filter(|child| !stops.contains(child))
            .collect();
        let twos = desired.children(parent);
        if ones.as_slice() == twos || twos.is_empty() {
            continue;
        }
        for (index, &child) in twos.iter().enumerate() {
            let (action, target) = if ones.is_empty() {
                (AddAction::AddToHead, parent)
            } else if ones.len() <= index {
                (AddAction::AddAfter, ones[index - 1])
            } else if ones[index] != child {
                (AddAction::AddBefore, ones[index])
            } else {
                continue;
            };
            if current.contains(child) && current.is_ancestor(child, parent) {
                continue 'parents;
            }
            return Some(Transition {
                source: child,
                target,
                action,
            });
        }
    }
    None
}

/// Derive the transitions that turn `previous` into `desired` at `offset`.
///
/// Each round applies one corrective placement to a working copy. The loop
/// is bounded by `max(limit, 2 × nodes)` and the result is checked by
/// replaying it from `previous`.
pub fn rebuild_transitions(
    offset: Offset,
    previous: &NodeTree,
    desired: &NodeTree,
    stops: &BTreeSet<EntityId>,
    limit: usize,
) -> Result<Transitions> {
    let bound = limit.max(2 * previous.len().max(desired.len()));
    let mut working = previous.clone();
    let mut transitions = Transitions::new();
    let mut iterations = 0;
    let diverged = |iterations| SessionError::TransitionConvergence {
        offset: offset.as_f64(),
        iterations,
    };

    while &working.without(stops) != desired {
        if iterations >= bound {
            return Err(diverged(iterations));
        }
        let transition =
            find_first_inconsistency(&working, desired, stops).ok_or_else(|| diverged(iterations))?;
        if !working.move_node(&transition) {
            return Err(diverged(iterations));
        }
        transitions.insert(transition);
        iterations += 1;
    }

    if &previous.apply(&transitions, stops) != desired {
        return Err(diverged(iterations));
    }
    if iterations > bound / 2 {
        log::warn!(
            "[STATE] Rebuilding transitions at {} took {} of {} iterations",
            offset,
            iterations,
            bound
        );
    }
    Ok(transitions)
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

    fn tree(placements: &[Transition]) -> NodeTree {
        let mut tree = NodeTree::new();
        for placement in placements {
            assert!(tree.move_node(placement));
        }
        tree
    }

    #[test]
    fn test_transitions_replace_in_place() {
        let mut transitions = Transitions::new();
        transitions.insert(place(1, 0, AddAction::AddToHead));
        transitions.insert(place(2, 0, AddAction::AddToTail));
        transitions.insert(place(1, 2, AddAction::AddAfter));

        let sources: Vec<_> = transitions.iter().map(|t| t.source).collect();
        assert_eq!(sources, vec![id(1), id(2)]);
        assert_eq!(transitions.get(id(1)).map(|t| t.target), Some(id(2)));
        assert!(transitions.remove(id(1)).is_some());
        assert!(!transitions.contains(id(1)));
    }

    #[test]
    fn test_hand_over() {
        let mut at_split = Transitions::new();
        at_split.insert(place(5, 1, AddAction::AddBefore));
        at_split.insert(place(3, 1, AddAction::AddToHead));
        at_split.hand_over(id(1), id(5));
        assert_eq!(at_split.get(id(5)), Some(&place(5, 1, AddAction::AddBefore)));
        assert_eq!(at_split.get(id(3)), Some(&place(3, 5, AddAction::AddToHead)));

        let mut later = Transitions::new();
        later.insert(place(1, 0, AddAction::AddToTail));
        later.hand_over(id(1), id(5));
        assert_eq!(later.get(id(5)), Some(&place(5, 0, AddAction::AddToTail)));
        assert!(!later.contains(id(1)));
    }

    #[test]
    fn test_sparse_state() {
        let mut state = State::new(Offset::ZERO);
        assert!(state.is_sparse());
        state.start_buffers.insert(id(4));
        assert!(state.is_sparse());
        assert!(state.has_buffer_activity());
        state.stop_nodes.insert(id(1));
        assert!(!state.is_sparse());
    }

    #[test]
    fn test_no_transitions_for_equal_trees() {
        let a = tree(&[place(1, 0, AddAction::AddToHead)]);
        let transitions =
            rebuild_transitions(Offset::ZERO, &a, &a.clone(), &BTreeSet::new(), 100).unwrap();
        assert!(transitions.is_empty());
    }

    #[test]
    fn test_rebuild_reorders_children() {
        let a = tree(&[
            place(1, 0, AddAction::AddToTail),
            place(2, 0, AddAction::AddToTail),
            place(3, 0, AddAction::AddToTail),
        ]);
        let b = tree(&[
            place(3, 0, AddAction::AddToTail),
            place(1, 0, AddAction::AddToTail),
            place(2, 0, AddAction::AddToTail),
        ]);
        let transitions = rebuild_transitions(Offset::ZERO, &a, &b, &BTreeSet::new(), 100).unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions.get(id(3)), Some(&place(3, 1, AddAction::AddBefore)));
    }

    #[test]
    fn test_rebuild_new_subtree_and_stops() {
        let a = tree(&[
            place(1, 0, AddAction::AddToTail),
            place(2, 1, AddAction::AddToTail),
        ]);
        // 1 stops, 2 moves to a new group 3 which holds new synth 4
        let stops = BTreeSet::from([id(1)]);
        let b = tree(&[
            place(3, 0, AddAction::AddToTail),
            place(2, 3, AddAction::AddToTail),
            place(4, 3, AddAction::AddToTail),
        ]);
        let transitions = rebuild_transitions(Offset::ZERO, &a, &b, &stops, 100).unwrap();
        assert_eq!(a.apply(&transitions, &stops), b);
        assert_eq!(transitions.get(id(3)), Some(&place(3, 0, AddAction::AddToHead)));
        assert_eq!(transitions.len(), 3);
    }

    #[test]
    fn test_rebuild_fails_for_unreachable_tree() {
        let a = tree(&[place(1, 0, AddAction::AddToTail)]);
        // 1 vanishes without stopping
        let b = NodeTree::new();
        let result = rebuild_transitions(Offset::ZERO, &a, &b, &BTreeSet::new(), 100);
        assert!(matches!(result, Err(SessionError::TransitionConvergence { .. })));
    }

    #[test]
    fn test_rebuild_defers_moves_into_descendants() {
        // 1 -> [3 -> [4]], 2  becomes  1, 2 -> [4 -> [3]]
        let a = tree(&[
            place(1, 0, AddAction::AddToTail),
            place(2, 0, AddAction::AddToTail),
            place(3, 1, AddAction::AddToTail),
            place(4, 3, AddAction::AddToTail),
        ]);
        let b = tree(&[
            place(1, 0, AddAction::AddToTail),
            place(2, 0, AddAction::AddToTail),
            place(4, 2, AddAction::AddToTail),
            place(3, 4, AddAction::AddToTail),
        ]);
        let transitions = rebuild_transitions(Offset::ZERO, &a, &b, &BTreeSet::new(), 100).unwrap();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions.get(id(4)), Some(&place(4, 2, AddAction::AddToHead)));
        assert_eq!(transitions.get(id(3)), Some(&place(3, 4, AddAction::AddToHead)));
        assert_eq!(a.apply(&transitions, &BTreeSet::new()), b);
    }

    #[test]
    fn test_first_inconsistency_appends_after() {
        let a = tree(&[place(1, 0, AddAction::AddToTail)]);
        let b = tree(&[
            place(1, 0, AddAction::AddToTail),
            place(2, 0, AddAction::AddToTail),
        ]);
        let transition = find_first_inconsistency(&a, &b, &BTreeSet::new());
        assert_eq!(transition, Some(place(2, 1, AddAction::AddAfter)));
    }
}
