//! Per-attribute event timelines.

use crate::offset::Offset;

/// An ordered list of `(offset, value)` events, unique by offset.
///
/// The value in effect at `t` is the value of the last event at or before `t`.
#[derive(Clone, Debug, PartialEq)]
pub struct Timeline<V> {
    events: Vec<(Offset, V)>,
}

impl<V> Default for Timeline<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Timeline<V> {
    /// Create an empty timeline.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Insert an event. A write at an existing offset replaces the old value.
    pub fn insert(&mut self, offset: Offset, value: V) {
        let index = self.events.partition_point(|(o, _)| *o < offset);
        match self.events.get_mut(index) {
            Some((existing, slot)) if *existing == offset => *slot = value,
            _ => self.events.insert(index, (offset, value)),
        }
    }

    /// The value in effect at `offset` and the offset of the event providing it.
    pub fn value_at(&self, offset: Offset) -> Option<(&V, Offset)> {
        let index = self.events.partition_point(|(o, _)| *o <= offset);
        if index == 0 {
            return None;
        }
        let (at, value) = &self.events[index - 1];
        Some((value, *at))
    }

    /// The value of an event placed exactly at `offset`, if any.
    pub fn event_at(&self, offset: Offset) -> Option<&V> {
        self.value_at(offset)
            .and_then(|(value, at)| (at == offset).then_some(value))
    }

    /// Iterate events in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (Offset, &V)> {
        self.events.iter().map(|(offset, value)| (*offset, value))
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether there are no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<V: Clone> Timeline<V> {
    /// Move every event at or after `offset` into a new timeline.
    ///
    /// When events remain on the left and the right half has no event exactly
    /// at `offset`, the right half gains a boundary event carrying the last
    /// value from before the split.
    pub fn split_off(&mut self, offset: Offset) -> Timeline<V> {
        let index = self.events.partition_point(|(o, _)| *o < offset);
        let mut right = self.events.split_off(index);
        let starts_at_split = right.first().is_some_and(|(o, _)| *o == offset);
        if !starts_at_split {
            if let Some((_, last)) = self.events.last() {
                right.insert(0, (offset, last.clone()));
            }
        }
        Timeline { events: right }
    }
}
