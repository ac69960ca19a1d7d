//! The non-realtime session: entity registry, per-offset states and edits.
//!
//! All edits happen inside a [`Moment`](crate::moment::Moment) obtained from
//! [`Session::at`]. Each edit records starts, stops and transitions on the
//! affected states, then propagates the derived trees forward so that every
//! later snapshot reflects a retroactive change.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new();
//! let group = session.at(0.0)?.add_group(EntityId::ROOT, AddAction::AddToHead, 10.0)?;
//! {
//!     let mut moment = session.at(5.0)?;
//!     moment.set_control(group, "amp", ControlValue::Number(0.5))?;
//! }
//! let stream = session.to_command_stream(None)?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use crate::block::{Block, BufferGroup, BusGroup};
use crate::buffer::BufferOperation;
use crate::config::SessionOptions;
use crate::definition::SynthDefinition;
use crate::entity::{BufferOperations, BufferSpec, ControlValue, Controls, Entity, EntityId, EntityKind};
use crate::error::{Result, SessionError};
use crate::moment::Moment;
use crate::offset::Offset;
use crate::protocol::{AddAction, CalculationRate};
use crate::state::{rebuild_transitions, ChildrenInspection, State, Transition, Transitions};
use crate::timeline::Timeline;
use crate::tree::NodeTree;

/// Owner of every entity and state in a score.
pub struct Session {
    options: SessionOptions,
    entities: Vec<Option<Entity>>,
    /// Tree in effect before the first state.
    origin: NodeTree,
    states: BTreeMap<Offset, State>,
    moments: Vec<Offset>,
    /// Every synth definition used so far, by name.
    definitions: BTreeMap<String, Arc<SynthDefinition>>,
    next_node_id: i32,
    next_bus_id: i32,
    next_buffer_id: i32,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("entities", &self.entities.iter().flatten().count())
            .field("states", &self.states.len())
            .field("moments", &self.moments)
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create a session with default options.
    pub fn new() -> Self {
        Self::with_options(SessionOptions::default())
    }

    /// Create a session with the given options.
    pub fn with_options(options: SessionOptions) -> Self {
        let root = Entity {
            id: EntityId::ROOT,
            session_id: 0,
            start: Offset::NEG_INFINITY,
            stop: Offset::INFINITY,
            kind: EntityKind::Group {
                controls: Controls::new(),
            },
        };
        let mut states = BTreeMap::new();
        states.insert(Offset::ZERO, State::new(Offset::ZERO));
        Self {
            next_node_id: options.node_id_base,
            next_bus_id: 0,
            next_buffer_id: 0,
            options,
            entities: vec![Some(root)],
            origin: NodeTree::new(),
            states,
            moments: Vec::new(),
            definitions: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// A live entity.
    pub fn entity(&self, id: EntityId) -> Result<&Entity> {
        self.entities
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(SessionError::UnknownEntity(id))
    }

    fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        self.entities
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(SessionError::UnknownEntity(id))
    }

    /// A live group or synth.
    pub fn node(&self, id: EntityId) -> Result<&Entity> {
        let entity = self.entity(id)?;
        if !entity.is_node() {
            return Err(SessionError::NotANode(id));
        }
        Ok(entity)
    }

    /// Every live entity in creation order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().flatten()
    }

    /// State recorded at an offset, if any.
    pub fn state(&self, offset: f64) -> Option<&State> {
        let offset = Offset::new(offset).ok()?;
        self.states.get(&offset)
    }

    /// Every state in offset order.
    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.values()
    }

    /// Offsets that carry a state.
    pub fn offsets(&self) -> Vec<f64> {
        self.states.keys().map(|o| o.as_f64()).collect()
    }

    /// Offset of the innermost open moment.
    pub fn active_offset(&self) -> Result<Offset> {
        self.moments
            .last()
            .copied()
            .ok_or(SessionError::NoActiveMoment)
    }

    /// Tree in effect at `offset`, after its transitions and stops.
    pub fn tree_at(&self, offset: Offset) -> &NodeTree {
        self.states
            .range(..=offset)
            .rev()
            .find_map(|(_, state)| state.tree.as_ref())
            .unwrap_or(&self.origin)
    }

    /// Tree in effect just before `offset`.
    pub fn tree_before(&self, offset: Offset) -> &NodeTree {
        self.states
            .range(..offset)
            .rev()
            .find_map(|(_, state)| state.tree.as_ref())
            .unwrap_or(&self.origin)
    }

    pub(crate) fn lifetime(&self, id: EntityId) -> (Offset, Offset) {
        self.entity(id)
            .map(|e| (e.start, e.stop))
            .unwrap_or((Offset::NEG_INFINITY, Offset::INFINITY))
    }

    /// Score length: the last finite state offset, plus padding.
    pub fn duration(&self) -> f64 {
        let last = self
            .states
            .keys()
            .rev()
            .find(|o| o.is_finite())
            .map_or(0.0, |o| o.as_f64())
            .max(0.0);
        match self.options.padding {
            Some(padding) if last > 0.0 => last + padding,
            _ => last,
        }
    }

    // ------------------------------------------------------------------
    // Moments and propagation
    // ------------------------------------------------------------------

    /// Open a moment at `offset`. Edits go through the returned guard.
    pub fn at(&mut self, offset: f64) -> Result<Moment<'_>> {
        let offset = Offset::new(offset)?;
        if !offset.is_finite() || offset < Offset::ZERO {
            return Err(SessionError::InvalidOffset(offset.as_f64()));
        }
        self.enter_moment(offset);
        Ok(Moment::new(self, offset))
    }

    pub(crate) fn enter_moment(&mut self, offset: Offset) {
        if let Some(&active) = self.moments.last() {
            self.propagate([active]);
        }
        self.ensure_state(offset);
        self.moments.push(offset);
        self.propagate([offset]);
    }

    pub(crate) fn exit_moment(&mut self) {
        if let Some(offset) = self.moments.pop() {
            self.propagate([offset]);
            self.prune_state(offset);
        }
    }

    /// Run `edit` inside a temporary moment, closing it on every path.
    fn within<T>(&mut self, offset: Offset, edit: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.enter_moment(offset);
        let result = edit(self);
        self.exit_moment();
        result
    }

    fn ensure_state(&mut self, offset: Offset) -> &mut State {
        self.states
            .entry(offset)
            .or_insert_with(|| State::new(offset))
    }

    /// Re-derive trees starting at `offsets`, chaining forward while they change.
    pub(crate) fn propagate<I: IntoIterator<Item = Offset>>(&mut self, offsets: I) {
        let mut queue: BTreeSet<Offset> = offsets.into_iter().collect();
        while let Some(offset) = queue.pop_first() {
            let derived = match self.states.get(&offset) {
                Some(state) if state.is_sparse() => None,
                Some(state) => {
                    Some(self.tree_before(offset).apply(&state.transitions, &state.stop_nodes))
                }
                None => continue,
            };
            let Some(state) = self.states.get_mut(&offset) else {
                continue;
            };
            let changed = match (&state.tree, &derived) {
                (Some(old), Some(new)) => old != new,
                _ => true,
            };
            state.tree = derived;
            if changed {
                let next = self
                    .states
                    .range((Bound::Excluded(offset), Bound::Unbounded))
                    .next()
                    .map(|(o, _)| *o);
                if let Some(next) = next {
                    queue.insert(next);
                }
            }
        }
    }

    fn propagate_range(&mut self, from: Offset, to: Offset) {
        let offsets: Vec<Offset> = self.states.range(from..=to).map(|(o, _)| *o).collect();
        self.propagate(offsets);
    }

    /// Drop a state that no longer carries anything.
    fn prune_state(&mut self, offset: Offset) {
        if offset == Offset::ZERO || self.moments.contains(&offset) {
            return;
        }
        let prunable = self
            .states
            .get(&offset)
            .is_some_and(|s| s.is_sparse() && !s.has_buffer_activity());
        if prunable && !self.has_events_at(offset) {
            self.states.remove(&offset);
            log::debug!("[STATE] Pruned empty state at {}", offset);
        }
    }

    fn has_events_at(&self, offset: Offset) -> bool {
        self.entities().any(|entity| match &entity.kind {
            EntityKind::Group { controls } | EntityKind::Synth { controls, .. } => controls
                .values()
                .any(|timeline| timeline.event_at(offset).is_some()),
            EntityKind::Bus { values, .. } => values.event_at(offset).is_some(),
            EntityKind::Buffer { operations, .. } => operations.contains_key(&offset),
        })
    }

    // ------------------------------------------------------------------
    // Node creation
    // ------------------------------------------------------------------

    /// Add a group relative to `target` at the active moment.
    pub fn add_group(&mut self, target: EntityId, action: AddAction, duration: f64) -> Result<EntityId> {
        let offset = self.active_offset()?;
        self.check_target(target, action, offset)?;
        let stop = stop_after(offset, duration)?;
        let kind = EntityKind::Group {
            controls: Controls::new(),
        };
        let id = self.insert_node(kind, offset, stop, target, action);
        self.propagate([offset, stop]);
        Ok(id)
    }

    /// Add a synth relative to `target` at the active moment.
    ///
    /// `settings` become control events at the synth's start.
    pub fn add_synth(
        &mut self,
        target: EntityId,
        action: AddAction,
        definition: &Arc<SynthDefinition>,
        duration: f64,
        settings: &[(&str, ControlValue)],
    ) -> Result<EntityId> {
        let offset = self.active_offset()?;
        self.check_target(target, action, offset)?;
        self.check_definition(definition)?;
        let stop = stop_after(offset, duration)?;
        let mut controls = Controls::new();
        for (name, value) in settings {
            if definition.parameter(name).is_none() {
                return Err(SessionError::UnknownParameter {
                    definition: definition.name.clone(),
                    name: name.to_string(),
                });
            }
            self.check_control_value(*value)?;
            controls
                .entry(name.to_string())
                .or_default()
                .insert(offset, *value);
        }
        self.definitions
            .entry(definition.name.clone())
            .or_insert_with(|| Arc::clone(definition));
        let kind = EntityKind::Synth {
            definition: Arc::clone(definition),
            controls,
        };
        let id = self.insert_node(kind, offset, stop, target, action);
        self.propagate([offset, stop]);
        Ok(id)
    }

    /// A name stays bound to the first definition registered under it.
    fn check_definition(&self, definition: &SynthDefinition) -> Result<()> {
        match self.definitions.get(&definition.name) {
            Some(existing) if **existing != *definition => Err(SessionError::DefinitionConflict {
                name: definition.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn check_target(&self, target: EntityId, action: AddAction, offset: Offset) -> Result<()> {
        let entity = self.node(target)?;
        let valid = if target == EntityId::ROOT {
            !action.is_sibling()
        } else {
            entity.is_group() || action.is_sibling()
        };
        if !valid {
            return Err(SessionError::InvalidAddAction { action, target });
        }
        if !self.tree_at(offset).contains(target) {
            return Err(SessionError::NodeNotAlive {
                node: target,
                offset: offset.as_f64(),
            });
        }
        Ok(())
    }

    fn check_control_value(&self, value: ControlValue) -> Result<()> {
        match value {
            ControlValue::Number(_) => Ok(()),
            ControlValue::Bus(bus) => match self.entity(bus)?.kind {
                EntityKind::Bus { .. } => Ok(()),
                _ => Err(SessionError::NotABus(bus)),
            },
            ControlValue::Buffer(buffer) => match self.entity(buffer)?.kind {
                EntityKind::Buffer { .. } => Ok(()),
                _ => Err(SessionError::NotABuffer(buffer)),
            },
        }
    }

    /// Register a node and its placement without propagating.
    fn insert_node(
        &mut self,
        kind: EntityKind,
        start: Offset,
        stop: Offset,
        target: EntityId,
        action: AddAction,
    ) -> EntityId {
        let id = EntityId(self.entities.len() as u32);
        let session_id = self.next_node_id;
        self.next_node_id += 1;
        self.entities.push(Some(Entity {
            id,
            session_id,
            start,
            stop,
            kind,
        }));
        let state = self.ensure_state(start);
        state.start_nodes.insert(id);
        state.transitions.insert(Transition {
            source: id,
            target,
            action,
        });
        if stop.is_finite() {
            self.ensure_state(stop).stop_nodes.insert(id);
        }
        log::debug!(
            "[SESSION] Added node {} ({:?} {}) over {}..{}",
            session_id,
            action,
            target,
            start,
            stop
        );
        id
    }

    // ------------------------------------------------------------------
    // Buses and buffers
    // ------------------------------------------------------------------

    /// Add a bus. Buses exist for the whole session.
    pub fn add_bus(&mut self, rate: CalculationRate) -> EntityId {
        self.push_bus(rate, None)
    }

    /// Add `count` buses of one rate that receive contiguous indices.
    pub fn add_bus_group(&mut self, count: u32, rate: CalculationRate) -> Result<BusGroup> {
        if count == 0 {
            return Err(SessionError::EmptyGroup);
        }
        let first = EntityId(self.entities.len() as u32);
        for position in 0..count {
            self.push_bus(rate, Some(Block { first, position, count }));
        }
        log::debug!("[SESSION] Added {:?} bus group of {} from {}", rate, count, first);
        Ok(BusGroup { first, count, rate })
    }

    fn push_bus(&mut self, rate: CalculationRate, block: Option<Block>) -> EntityId {
        let id = EntityId(self.entities.len() as u32);
        let session_id = self.next_bus_id;
        self.next_bus_id += 1;
        self.entities.push(Some(Entity {
            id,
            session_id,
            start: Offset::NEG_INFINITY,
            stop: Offset::INFINITY,
            kind: EntityKind::Bus {
                rate,
                values: Timeline::new(),
                block,
            },
        }));
        id
    }

    /// Set a control bus's value at the active moment.
    pub fn set_bus(&mut self, bus: EntityId, value: f64) -> Result<()> {
        let offset = self.active_offset()?;
        match &mut self.entity_mut(bus)?.kind {
            EntityKind::Bus {
                rate: CalculationRate::Control,
                values,
                ..
            } => {
                values.insert(offset, value);
                Ok(())
            }
            EntityKind::Bus { .. } => Err(SessionError::UnsupportedBusRate(bus)),
            _ => Err(SessionError::NotABus(bus)),
        }
    }

    /// A bus's value at the active moment (0.0 until first set).
    pub fn bus_value(&self, bus: EntityId) -> Result<f64> {
        let offset = self.active_offset()?;
        match &self.entity(bus)?.kind {
            EntityKind::Bus { values, .. } => {
                Ok(values.value_at(offset).map_or(0.0, |(value, _)| *value))
            }
            _ => Err(SessionError::NotABus(bus)),
        }
    }

    /// Set every bus of a control-rate group to `value` at the active moment.
    pub fn fill_bus_group(&mut self, group: &BusGroup, value: f64) -> Result<()> {
        self.active_offset()?;
        if group.rate != CalculationRate::Control {
            return Err(SessionError::UnsupportedBusRate(group.first));
        }
        for bus in group.buses() {
            self.set_bus(bus, value)?;
        }
        Ok(())
    }

    /// Values of every bus in a group at the active moment.
    pub fn bus_group_values(&self, group: &BusGroup) -> Result<Vec<f64>> {
        group.buses().map(|bus| self.bus_value(bus)).collect()
    }

    /// Allocate a buffer at the active moment for `duration` seconds.
    pub fn add_buffer(&mut self, spec: BufferSpec, duration: f64) -> Result<EntityId> {
        let start = self.active_offset()?;
        let stop = stop_after(start, duration)?;
        Ok(self.push_buffer(spec, start, stop, None))
    }

    /// Allocate `count` empty buffers of one shape that receive contiguous numbers.
    pub fn add_buffer_group(
        &mut self,
        count: u32,
        channel_count: u32,
        frame_count: u32,
        duration: f64,
    ) -> Result<BufferGroup> {
        let start = self.active_offset()?;
        let stop = stop_after(start, duration)?;
        if count == 0 {
            return Err(SessionError::EmptyGroup);
        }
        let first = EntityId(self.entities.len() as u32);
        for position in 0..count {
            let spec = BufferSpec::new(channel_count, frame_count);
            self.push_buffer(spec, start, stop, Some(Block { first, position, count }));
        }
        Ok(BufferGroup { first, count })
    }

    fn push_buffer(&mut self, spec: BufferSpec, start: Offset, stop: Offset, block: Option<Block>) -> EntityId {
        let id = EntityId(self.entities.len() as u32);
        let session_id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.entities.push(Some(Entity {
            id,
            session_id,
            start,
            stop,
            kind: EntityKind::Buffer {
                spec,
                operations: BufferOperations::new(),
                block,
            },
        }));
        self.ensure_state(start).start_buffers.insert(id);
        if stop.is_finite() {
            self.ensure_state(stop).stop_buffers.insert(id);
        }
        log::debug!("[SESSION] Added buffer {} over {}..{}", session_id, start, stop);
        id
    }

    /// Schedule `operation` on `buffer` at the active moment.
    ///
    /// The offset must lie within `[start, stop]` of the buffer. A later
    /// operation of the same kind at the same offset replaces the earlier one.
    pub fn add_buffer_operation(&mut self, buffer: EntityId, operation: BufferOperation) -> Result<()> {
        let offset = self.active_offset()?;
        let entity = self.entity(buffer)?;
        if !matches!(entity.kind, EntityKind::Buffer { .. }) {
            return Err(SessionError::NotABuffer(buffer));
        }
        if offset < entity.start || offset > entity.stop {
            return Err(SessionError::OffsetOutOfRange {
                entity: buffer,
                offset: offset.as_f64(),
            });
        }
        match &operation {
            BufferOperation::Generate { generator, .. } => {
                generator
                    .validate()
                    .map_err(|reason| SessionError::InvalidBufferOperation { buffer, reason })?;
            }
            BufferOperation::Copy { target, .. } => {
                let target_entity = self.entity(*target)?;
                if !matches!(target_entity.kind, EntityKind::Buffer { .. }) {
                    return Err(SessionError::NotABuffer(*target));
                }
                if !target_entity.is_alive_at(offset) {
                    return Err(SessionError::OffsetOutOfRange {
                        entity: *target,
                        offset: offset.as_f64(),
                    });
                }
            }
            _ => {}
        }
        let kind = operation.kind();
        if let EntityKind::Buffer { operations, .. } = &mut self.entity_mut(buffer)?.kind {
            operations.entry(offset).or_default().insert(kind, operation);
        }
        self.ensure_state(offset);
        log::debug!("[SESSION] Scheduled {:?} on {} at {}", kind, buffer, offset);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------

    /// Write a control at the active moment.
    ///
    /// Writes outside the node's `[start, stop)` span are dropped.
    pub fn set_control(&mut self, node: EntityId, name: &str, value: ControlValue) -> Result<()> {
        let offset = self.active_offset()?;
        match self.write_control(node, name, value, offset) {
            Err(error @ SessionError::OffsetOutOfRange { .. }) => {
                log::debug!("[SESSION] Dropping write to '{}': {}", name, error);
                Ok(())
            }
            other => other,
        }
    }

    fn write_control(
        &mut self,
        node: EntityId,
        name: &str,
        value: ControlValue,
        offset: Offset,
    ) -> Result<()> {
        if node == EntityId::ROOT {
            return Err(SessionError::RootImmutable);
        }
        self.check_control_value(value)?;
        let entity = self.node(node)?;
        if let Some(definition) = entity.definition() {
            if definition.parameter(name).is_none() {
                return Err(SessionError::UnknownParameter {
                    definition: definition.name.clone(),
                    name: name.to_string(),
                });
            }
        }
        if !entity.is_alive_at(offset) {
            return Err(SessionError::OffsetOutOfRange {
                entity: node,
                offset: offset.as_f64(),
            });
        }
        if let Some(controls) = self.entity_mut(node)?.controls_mut() {
            controls
                .entry(name.to_string())
                .or_default()
                .insert(offset, value);
        }
        Ok(())
    }

    /// A control's value at the active moment, falling back to the definition default.
    pub fn control(&self, node: EntityId, name: &str) -> Result<Option<ControlValue>> {
        let offset = self.active_offset()?;
        let entity = self.node(node)?;
        let written = entity
            .controls()
            .and_then(|controls| controls.get(name))
            .and_then(|timeline| timeline.value_at(offset))
            .map(|(value, _)| *value);
        Ok(written.or_else(|| {
            entity
                .definition()
                .and_then(|d| d.parameter(name))
                .map(|p| ControlValue::Number(p.default))
        }))
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Move `node` relative to `target` at the active moment.
    pub fn move_node(&mut self, target: EntityId, node: EntityId, action: AddAction) -> Result<()> {
        let offset = self.active_offset()?;
        if node == EntityId::ROOT {
            return Err(SessionError::RootImmutable);
        }
        let entity = self.node(node)?;
        if !entity.is_alive_at(offset) {
            return Err(SessionError::NodeNotAlive {
                node,
                offset: offset.as_f64(),
            });
        }
        let stop = entity.stop;
        self.check_target(target, action, offset)?;
        let tree = self.tree_at(offset);
        if target == node || (tree.contains(node) && tree.is_ancestor(node, target)) {
            return Err(SessionError::InvalidParentage { node, target });
        }
        self.ensure_state(offset).transitions.insert(Transition {
            source: node,
            target,
            action,
        });
        log::debug!("[SESSION] Moving {} {:?} {} at {}", node, action, target, offset);
        self.propagate([offset, stop]);
        Ok(())
    }

    /// Split `node` at the active moment.
    ///
    /// Returns the truncated original followed by the new node that owns the
    /// rest of its lifetime, or just the original when the moment is not
    /// strictly inside it. Children crossing the split are split too when
    /// they occupy the node across it (`split_occupiers`) or move in or out
    /// exactly there (`split_traversers`).
    pub fn split(
        &mut self,
        node: EntityId,
        split_occupiers: bool,
        split_traversers: bool,
    ) -> Result<Vec<EntityId>> {
        let offset = self.active_offset()?;
        if node == EntityId::ROOT {
            return Err(SessionError::RootImmutable);
        }
        self.node(node)?;
        self.propagate([offset]);
        let shards = self.split_node(node, offset, split_occupiers, split_traversers)?;
        let last_stop = shards
            .iter()
            .map(|shard| self.lifetime(*shard).1)
            .max()
            .unwrap_or(offset);
        self.propagate_range(offset, last_stop);
        Ok(shards)
    }

    fn split_node(
        &mut self,
        node: EntityId,
        at: Offset,
        split_occupiers: bool,
        split_traversers: bool,
    ) -> Result<Vec<EntityId>> {
        let inspection = self.inspect_children_at(node, at);
        let children = self.tree_at(at).children(node).to_vec();
        let entity = self.node(node)?;
        let (start, stop) = (entity.start, entity.stop);
        if !(start < at && at < stop) {
            return Ok(vec![node]);
        }
        let kind = entity.blank_kind();
        let new_node = self.insert_node(kind, at, stop, node, AddAction::AddBefore);
        log::debug!("[SPLIT] Split {} at {} into {}", node, at, new_node);

        // The new node takes over the original's placement here, or goes first
        // when the original stays put. Its inherited children follow it in order.
        let state = self.ensure_state(at);
        let own = state.transitions.remove(new_node);
        let mut ordered: Vec<Transition> = state
            .transitions
            .iter()
            .filter(|t| !children.contains(&t.source))
            .copied()
            .collect();
        let slot = match ordered.iter().position(|t| t.source == node) {
            Some(index) => {
                ordered[index].source = new_node;
                index + 1
            }
            None => match own {
                Some(own) => {
                    ordered.insert(0, own);
                    1
                }
                None => 0,
            },
        };
        for (index, child) in children.iter().enumerate() {
            ordered.insert(
                slot + index,
                Transition {
                    source: *child,
                    target: new_node,
                    action: AddAction::AddToTail,
                },
            );
        }
        state.transitions = ordered.into_iter().collect();

        self.split_controls(node, new_node, at)?;
        self.move_stop(node, at);
        for (_, state) in self.states.range_mut(at..=stop) {
            state.transitions.hand_over(node, new_node);
        }
        self.propagate([at, stop]);

        for child in children.iter().chain(inspection.exiting.iter()) {
            let occupies = split_occupiers && inspection.occupying.contains(child);
            let traverses = split_traversers
                && (inspection.entering.contains(child) || inspection.exiting.contains(child));
            if occupies || traverses {
                self.split_node(*child, at, split_occupiers, split_traversers)?;
            }
        }
        Ok(vec![node, new_node])
    }

    fn split_controls(&mut self, node: EntityId, new_node: EntityId, at: Offset) -> Result<()> {
        let mut right = Controls::new();
        if let Some(controls) = self.entity_mut(node)?.controls_mut() {
            for (name, timeline) in controls.iter_mut() {
                let tail = timeline.split_off(at);
                if !tail.is_empty() {
                    right.insert(name.clone(), tail);
                }
            }
            controls.retain(|_, timeline| !timeline.is_empty());
        }
        if let Some(controls) = self.entity_mut(new_node)?.controls_mut() {
            *controls = right;
        }
        Ok(())
    }

    /// Re-register a node's stop at `new_stop`.
    fn move_stop(&mut self, node: EntityId, new_stop: Offset) {
        let old_stop = self.lifetime(node).1;
        if old_stop == new_stop {
            return;
        }
        if let Some(state) = self.states.get_mut(&old_stop) {
            state.stop_nodes.remove(&node);
        }
        if let Ok(entity) = self.entity_mut(node) {
            entity.stop = new_stop;
        }
        self.prune_state(old_stop);
        if new_stop.is_finite() {
            self.ensure_state(new_stop).stop_nodes.insert(node);
        }
    }

    /// Remove a node from every state, handing its children to its parent.
    pub fn delete(&mut self, node: EntityId) -> Result<()> {
        if node == EntityId::ROOT {
            return Err(SessionError::RootImmutable);
        }
        let entity = self.node(node)?;
        let (start, stop) = (entity.start, entity.stop);
        let plan = self.plan_removal(node, start, stop)?;

        for (offset, transitions) in plan {
            let Some(state) = self.states.get_mut(&offset) else {
                continue;
            };
            state.start_nodes.remove(&node);
            state.stop_nodes.remove(&node);
            state.transitions = transitions;
            // re-derived by the propagation below, which then carries past the stop
            state.tree = None;
        }
        self.entities[node.index()] = None;
        self.prune_state(start);
        self.prune_state(stop);
        self.propagate_range(start, stop);
        log::debug!("[SESSION] Deleted {}", node);
        Ok(())
    }

    /// Transitions for every state in `[start, stop]` once `node` is gone.
    ///
    /// While the node lives its children take its slot in the parent. At its
    /// stop the state is replayed without it, so descendants that outlive it
    /// stay in place instead of being freed along with it. A state whose own
    /// transitions still produce the wanted tree keeps them unchanged.
    fn plan_removal(
        &self,
        node: EntityId,
        start: Offset,
        stop: Offset,
    ) -> Result<Vec<(Offset, Transitions)>> {
        let limit = self.options.transition_iteration_limit;
        let mut previous = self.tree_before(start).clone();
        let mut plan = Vec::new();
        for (offset, state) in self.states.range(start..=stop) {
            let mut stops = state.stop_nodes.clone();
            stops.remove(&node);
            let kept: Transitions = state
                .transitions
                .iter()
                .filter(|t| t.source != node && t.target != node)
                .copied()
                .collect();
            let replayed = previous.apply(&kept, &stops);
            let desired = if *offset < stop {
                let mut tree = self.tree_at(*offset).clone();
                tree.remove_spliced(node);
                tree
            } else {
                replayed.clone()
            };
            let transitions = if replayed == desired {
                kept
            } else {
                rebuild_transitions(*offset, &previous, &desired, &stops, limit)?
            };
            plan.push((*offset, transitions));
            previous = desired;
        }
        Ok(plan)
    }

    /// Change a node's duration.
    ///
    /// Shrinking splits at the new stop and deletes the tail. With
    /// `clip_children` the tail's descendants are deleted as well, otherwise
    /// they are handed to the node's parent. Extending re-homes the node
    /// before each ancestor that would stop earlier.
    pub fn set_duration(
        &mut self,
        node: EntityId,
        duration: f64,
        clip_children: bool,
    ) -> Result<EntityId> {
        if node == EntityId::ROOT {
            return Err(SessionError::RootImmutable);
        }
        let entity = self.node(node)?;
        let (start, stop) = (entity.start, entity.stop);
        if duration.is_nan() || duration <= 0.0 {
            return Err(SessionError::InvalidDuration(duration));
        }
        let new_stop = start.after(duration);
        if new_stop == stop {
            return Ok(node);
        }

        if new_stop < stop {
            let tail = self.within(new_stop, |session| {
                let shards = session.split(node, clip_children, clip_children)?;
                Ok(shards.get(1).copied())
            })?;
            if let Some(tail) = tail {
                if clip_children {
                    let doomed = self.tree_at(new_stop).descendants(tail);
                    for descendant in doomed.into_iter().rev() {
                        self.delete(descendant)?;
                    }
                } else {
                    self.delete(tail)?;
                }
            }
            self.prune_state(stop);
            return Ok(node);
        }

        let mut parent = self.tree_before(stop).parent(node);
        self.move_stop(node, new_stop);
        while let Some(current) = parent {
            let parent_stop = self.lifetime(current).1;
            if parent_stop >= new_stop {
                break;
            }
            self.ensure_state(parent_stop).transitions.insert(Transition {
                source: node,
                target: current,
                action: AddAction::AddBefore,
            });
            parent = self.tree_before(parent_stop).parent(current);
        }
        self.propagate_range(start, new_stop);
        Ok(node)
    }

    /// End a node at the active moment, clipping its children.
    pub fn free(&mut self, node: EntityId) -> Result<EntityId> {
        let offset = self.active_offset()?;
        let entity = self.node(node)?;
        let duration = offset.as_f64() - entity.start.as_f64();
        if duration > entity.duration() {
            return Err(SessionError::InvalidDuration(duration));
        }
        self.set_duration(node, duration, true)
    }

    // ------------------------------------------------------------------
    // Relations
    // ------------------------------------------------------------------

    /// Tree used for relation queries: a node stopping now is read from just before.
    fn relation_tree(&self, node: EntityId, offset: Offset) -> &NodeTree {
        if self.lifetime(node).1 == offset {
            self.tree_before(offset)
        } else {
            self.tree_at(offset)
        }
    }

    /// Parent of a node at the active moment.
    pub fn get_parent(&self, node: EntityId) -> Result<Option<EntityId>> {
        let offset = self.active_offset()?;
        self.node(node)?;
        Ok(self.relation_tree(node, offset).parent(node))
    }

    /// The node and its ancestors up to the root at the active moment.
    pub fn get_parentage(&self, node: EntityId) -> Result<Vec<EntityId>> {
        let offset = self.active_offset()?;
        self.node(node)?;
        let parentage = self.relation_tree(node, offset).parentage(node);
        if parentage.is_empty() {
            return Err(SessionError::NodeNotAlive {
                node,
                offset: offset.as_f64(),
            });
        }
        Ok(parentage)
    }

    /// Ordered children of a node at the active moment.
    pub fn get_children(&self, node: EntityId) -> Result<Vec<EntityId>> {
        let offset = self.active_offset()?;
        self.node(node)?;
        Ok(self.relation_tree(node, offset).children(node).to_vec())
    }

    /// Classify a node's children at the active moment.
    pub fn inspect_children(&self, node: EntityId) -> Result<ChildrenInspection> {
        let offset = self.active_offset()?;
        self.node(node)?;
        Ok(self.inspect_children_at(node, offset))
    }

    pub(crate) fn inspect_children_at(&self, node: EntityId, offset: Offset) -> ChildrenInspection {
        let previous = self.tree_before(offset).children(node);
        let current = self.tree_at(offset).children(node);
        let mut entering = BTreeSet::new();
        let mut exiting = BTreeSet::new();
        let mut occupying = BTreeSet::new();
        let mut starting = BTreeSet::new();
        let mut stopping = BTreeSet::new();
        for child in previous {
            let (_, stop) = self.lifetime(*child);
            if stop == offset {
                stopping.insert(*child);
            } else if current.contains(child) {
                occupying.insert(*child);
            } else {
                exiting.insert(*child);
            }
        }
        for child in current {
            let (start, stop) = self.lifetime(*child);
            if start == offset {
                starting.insert(*child);
            } else if stop == offset {
                stopping.insert(*child);
            } else if previous.contains(child) {
                occupying.insert(*child);
            } else {
                entering.insert(*child);
            }
        }
        ChildrenInspection {
            entering: entering.into_iter().collect(),
            exiting: exiting.into_iter().collect(),
            occupying: occupying.into_iter().collect(),
            starting: starting.into_iter().collect(),
            stopping: stopping.into_iter().collect(),
        }
    }

    // ------------------------------------------------------------------
    // Whole-session operations
    // ------------------------------------------------------------------

    /// Re-derive every state's transitions from its materialized tree.
    pub fn rebuild_transitions(&mut self) -> Result<()> {
        let limit = self.options.transition_iteration_limit;
        let offsets: Vec<Offset> = self.states.keys().copied().collect();
        for offset in offsets {
            let previous = self.tree_before(offset).clone();
            let Some(state) = self.states.get_mut(&offset) else {
                continue;
            };
            let Some(desired) = state.tree.clone() else {
                continue;
            };
            state.transitions = rebuild_transitions(offset, &previous, &desired, &state.stop_nodes, limit)?;
        }
        self.propagate_range(Offset::NEG_INFINITY, Offset::INFINITY);
        Ok(())
    }

    /// Dump the node tree at every offset where it changes.
    pub fn to_strings(&self, include_controls: bool) -> String {
        let mut lines = Vec::new();
        let mut previous: Option<Vec<String>> = None;
        for offset in self.states.keys() {
            let block = self.describe_tree(*offset, include_controls);
            if previous.as_ref() == Some(&block) {
                continue;
            }
            lines.push(format!("{:?}:", offset.as_f64()));
            lines.extend(block.iter().map(|line| format!("    {}", line)));
            previous = Some(block);
        }
        lines.join("\n")
    }

    fn describe_tree(&self, offset: Offset, include_controls: bool) -> Vec<String> {
        let tree = self.tree_at(offset);
        let mut lines = vec!["NODE TREE 0 group".to_string()];
        let mut stack: Vec<(EntityId, usize)> = tree
            .children(EntityId::ROOT)
            .iter()
            .rev()
            .map(|child| (*child, 1))
            .collect();
        while let Some((node, depth)) = stack.pop() {
            let indent = "    ".repeat(depth);
            let Ok(entity) = self.entity(node) else {
                continue;
            };
            let name = entity
                .definition()
                .map_or("group".to_string(), |d| d.name.clone());
            lines.push(format!("{}{} {}", indent, entity.session_id, name));
            if include_controls {
                if let Some(settings) = self.describe_controls(entity, offset) {
                    lines.push(format!("{}    {}", indent, settings));
                }
            }
            stack.extend(tree.children(node).iter().rev().map(|child| (*child, depth + 1)));
        }
        lines
    }

    fn describe_controls(&self, entity: &Entity, offset: Offset) -> Option<String> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        if let Some(definition) = entity.definition() {
            for parameter in &definition.parameters {
                let value = entity
                    .controls()
                    .and_then(|c| c.get(&parameter.name))
                    .and_then(|t| t.value_at(offset))
                    .map(|(v, _)| *v)
                    .unwrap_or(ControlValue::Number(parameter.default));
                pairs.push((parameter.name.clone(), self.describe_value(value)));
            }
        } else if let Some(controls) = entity.controls() {
            for (name, timeline) in controls {
                if let Some((value, _)) = timeline.value_at(offset) {
                    pairs.push((name.clone(), self.describe_value(*value)));
                }
            }
        }
        if pairs.is_empty() {
            return None;
        }
        Some(
            pairs
                .into_iter()
                .map(|(name, value)| format!("{}: {}", name, value))
                .collect::<Vec<_>>()
                .join(", "),
        )
    }

    fn describe_value(&self, value: ControlValue) -> String {
        match value {
            ControlValue::Number(number) => format!("{:?}", number),
            ControlValue::Bus(bus) => match self.entity(bus) {
                Ok(entity) => {
                    let prefix = entity.bus_rate().map_or('c', |rate| rate.map_prefix());
                    format!("{}{}", prefix, entity.session_id)
                }
                Err(_) => "?".to_string(),
            },
            ControlValue::Buffer(buffer) => self
                .entity(buffer)
                .map_or("?".to_string(), |entity| format!("{:?}", entity.session_id as f64)),
        }
    }
}

fn stop_after(start: Offset, duration: f64) -> Result<Offset> {
    if duration.is_nan() || duration < 0.0 {
        return Err(SessionError::InvalidDuration(duration));
    }
    Ok(start.after(duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Generator;
    use crate::definition::ParameterSpec;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn sine() -> Arc<SynthDefinition> {
        Arc::new(
            SynthDefinition::new("sine", vec![0u8; 4])
                .with_parameter(ParameterSpec::new("freq", 440.0))
                .with_parameter(ParameterSpec::new("amp", 0.1)),
        )
    }

    fn at(value: f64) -> Offset {
        Offset::new(value).unwrap()
    }

    #[test]
    fn test_new_session() {
        let session = Session::new();
        assert_eq!(session.offsets(), vec![0.0]);
        assert_eq!(session.duration(), 0.0);
        assert!(session.tree_at(at(3.0)).is_empty());
        assert!(matches!(session.active_offset(), Err(SessionError::NoActiveMoment)));
    }

    #[test]
    fn test_add_requires_moment() {
        let mut session = Session::new();
        let result = session.add_group(EntityId::ROOT, AddAction::AddToHead, 1.0);
        assert!(matches!(result, Err(SessionError::NoActiveMoment)));
    }

    #[test]
    fn test_add_group_registers_states() {
        init_logging();
        let mut session = Session::new();
        let group = session
            .at(1.0)
            .unwrap()
            .add_group(EntityId::ROOT, AddAction::AddToHead, 2.0)
            .unwrap();

        assert_eq!(session.offsets(), vec![0.0, 1.0, 3.0]);
        assert!(session.state(1.0).unwrap().start_nodes().contains(&group));
        assert!(session.state(3.0).unwrap().stop_nodes().contains(&group));
        assert_eq!(session.tree_at(at(1.0)).children(EntityId::ROOT), &[group]);
        assert_eq!(session.tree_at(at(2.0)).children(EntityId::ROOT), &[group]);
        assert!(session.tree_at(at(3.0)).is_empty());
        assert!(session.state(0.0).unwrap().tree().is_none());
        assert_eq!(session.duration(), 3.0);
    }

    #[test]
    fn test_invalid_add_actions() {
        let mut session = Session::new();
        let mut moment = session.at(0.0).unwrap();
        let result = moment.add_group(EntityId::ROOT, AddAction::AddBefore, 1.0);
        assert!(matches!(result, Err(SessionError::InvalidAddAction { .. })));

        let synth = moment
            .add_synth(EntityId::ROOT, AddAction::AddToHead, &sine(), 1.0, &[])
            .unwrap();
        let result = moment.add_group(synth, AddAction::AddToHead, 1.0);
        assert!(matches!(result, Err(SessionError::InvalidAddAction { .. })));
        assert!(moment.add_group(synth, AddAction::AddAfter, 1.0).is_ok());
    }

    #[test]
    fn test_target_must_be_alive() {
        let mut session = Session::new();
        let group = session
            .at(0.0)
            .unwrap()
            .add_group(EntityId::ROOT, AddAction::AddToHead, 1.0)
            .unwrap();
        let result = session
            .at(2.0)
            .unwrap()
            .add_group(group, AddAction::AddToHead, 1.0);
        assert!(matches!(result, Err(SessionError::NodeNotAlive { .. })));
    }

    #[test]
    fn test_unknown_parameter() {
        let mut session = Session::new();
        let result = session.at(0.0).unwrap().add_synth(
            EntityId::ROOT,
            AddAction::AddToHead,
            &sine(),
            1.0,
            &[("cutoff", ControlValue::Number(1.0))],
        );
        assert!(matches!(result, Err(SessionError::UnknownParameter { .. })));
    }

    #[test]
    fn test_retroactive_edit_propagates() {
        let mut session = Session::new();
        let outer = session
            .at(0.0)
            .unwrap()
            .add_group(EntityId::ROOT, AddAction::AddToHead, 20.0)
            .unwrap();
        let late = session
            .at(10.0)
            .unwrap()
            .add_group(outer, AddAction::AddToTail, 5.0)
            .unwrap();
        // added after the later edit, still visible there
        let early = session
            .at(5.0)
            .unwrap()
            .add_group(outer, AddAction::AddToHead, 10.0)
            .unwrap();

        assert_eq!(session.tree_at(at(12.0)).children(outer), &[early, late]);
        assert_eq!(session.tree_at(at(16.0)).children(outer), &[] as &[EntityId]);
    }

    #[test]
    fn test_move_node() {
        let mut session = Session::new();
        let (a, b, synth) = {
            let mut moment = session.at(0.0).unwrap();
            let a = moment.add_group(EntityId::ROOT, AddAction::AddToTail, 10.0).unwrap();
            let b = moment.add_group(EntityId::ROOT, AddAction::AddToTail, 10.0).unwrap();
            let synth = moment
                .add_synth(a, AddAction::AddToHead, &sine(), 10.0, &[])
                .unwrap();
            (a, b, synth)
        };
        session
            .at(5.0)
            .unwrap()
            .move_node(b, synth, AddAction::AddToHead)
            .unwrap();

        assert_eq!(session.tree_at(at(4.0)).children(a), &[synth]);
        assert_eq!(session.tree_at(at(5.0)).children(b), &[synth]);
        let moment = session.at(7.0).unwrap();
        assert_eq!(moment.get_parent(synth).unwrap(), Some(b));
        assert_eq!(moment.get_parentage(synth).unwrap(), vec![synth, b, EntityId::ROOT]);
    }

    #[test]
    fn test_invalid_parentage() {
        let mut session = Session::new();
        let mut moment = session.at(0.0).unwrap();
        let outer = moment.add_group(EntityId::ROOT, AddAction::AddToHead, 10.0).unwrap();
        let inner = moment.add_group(outer, AddAction::AddToHead, 10.0).unwrap();
        let result = moment.move_node(inner, outer, AddAction::AddToHead);
        assert!(matches!(result, Err(SessionError::InvalidParentage { .. })));
        let result = moment.move_node(outer, outer, AddAction::AddToHead);
        assert!(matches!(result, Err(SessionError::InvalidParentage { .. })));
    }

    #[test]
    fn test_control_writes_are_clamped() {
        let mut session = Session::new();
        let synth = session
            .at(1.0)
            .unwrap()
            .add_synth(EntityId::ROOT, AddAction::AddToHead, &sine(), 2.0, &[])
            .unwrap();
        {
            let mut moment = session.at(2.0).unwrap();
            moment.set_control(synth, "freq", ControlValue::Number(880.0)).unwrap();
            assert_eq!(moment.control(synth, "freq").unwrap(), Some(ControlValue::Number(880.0)));
        }
        {
            // out of range: silently dropped
            let mut moment = session.at(3.0).unwrap();
            moment.set_control(synth, "freq", ControlValue::Number(220.0)).unwrap();
        }
        let moment = session.at(1.5).unwrap();
        assert_eq!(moment.control(synth, "freq").unwrap(), Some(ControlValue::Number(440.0)));
        assert_eq!(moment.control(synth, "amp").unwrap(), Some(ControlValue::Number(0.1)));
        drop(moment);

        let timeline_len = session.entity(synth).unwrap().controls().unwrap()["freq"].len();
        assert_eq!(timeline_len, 1);
    }

    #[test]
    fn test_bus_values() {
        let mut session = Session::new();
        let bus = session.add_bus(CalculationRate::Control);
        session.at(1.0).unwrap().set_bus(bus, 0.5).unwrap();
        session.at(3.0).unwrap().set_bus(bus, 0.75).unwrap();

        let values: Vec<f64> = (0..5)
            .map(|t| session.at(t as f64).unwrap().bus_value(bus).unwrap())
            .collect();
        assert_eq!(values, vec![0.0, 0.5, 0.5, 0.75, 0.75]);

        let audio = session.add_bus(CalculationRate::Audio);
        let result = session.at(1.0).unwrap().set_bus(audio, 1.0);
        assert!(matches!(result, Err(SessionError::UnsupportedBusRate(_))));
    }

    #[test]
    fn test_bus_group_values() {
        let mut session = Session::new();
        let group = session.add_bus_group(3, CalculationRate::Control).unwrap();
        {
            let mut moment = session.at(1.0).unwrap();
            let first = group.bus(0).unwrap();
            moment.set_bus(first, 0.333).unwrap();
        }
        session.at(3.0).unwrap().fill_bus_group(&group, 0.5).unwrap();
        {
            let mut moment = session.at(5.0).unwrap();
            moment.set_bus(group.bus(1).unwrap(), 0.666).unwrap();
            moment.set_bus(group.bus(2).unwrap(), 0.75).unwrap();
        }

        let values: Vec<Vec<f64>> = (0..7)
            .map(|t| session.at(t as f64).unwrap().bus_group_values(&group).unwrap())
            .collect();
        assert_eq!(
            values,
            vec![
                vec![0.0, 0.0, 0.0],
                vec![0.333, 0.0, 0.0],
                vec![0.333, 0.0, 0.0],
                vec![0.5, 0.5, 0.5],
                vec![0.5, 0.5, 0.5],
                vec![0.5, 0.666, 0.75],
                vec![0.5, 0.666, 0.75],
            ]
        );
        assert!(matches!(
            session.add_bus_group(0, CalculationRate::Audio),
            Err(SessionError::EmptyGroup)
        ));
        let audio = session.add_bus_group(2, CalculationRate::Audio).unwrap();
        let result = session.at(1.0).unwrap().fill_bus_group(&audio, 1.0);
        assert!(matches!(result, Err(SessionError::UnsupportedBusRate(_))));
    }

    #[test]
    fn test_definition_names_are_bound_to_content() {
        let one = Arc::new(SynthDefinition::new("default", vec![1]));
        let two = Arc::new(SynthDefinition::new("default", vec![2]));
        let mut session = Session::new();
        let mut moment = session.at(0.0).unwrap();
        moment
            .add_synth(EntityId::ROOT, AddAction::AddToHead, &one, 1.0, &[])
            .unwrap();
        let result = moment.add_synth(EntityId::ROOT, AddAction::AddToHead, &two, 1.0, &[]);
        assert!(matches!(
            result,
            Err(SessionError::DefinitionConflict { ref name }) if name == "default"
        ));
        let same = Arc::new(SynthDefinition::new("default", vec![1]));
        moment
            .add_synth(EntityId::ROOT, AddAction::AddToHead, &same, 1.0, &[])
            .unwrap();
        drop(moment);
        assert_eq!(session.entities().filter(|e| e.is_node()).count(), 3);
    }

    #[test]
    fn test_buffer_operation_validation() {
        let mut session = Session::new();
        let (buffer, bus) = {
            let mut moment = session.at(1.0).unwrap();
            let buffer = moment.add_buffer(BufferSpec::new(1, 64), 2.0).unwrap();
            (buffer, moment.add_bus(CalculationRate::Control))
        };

        let mut moment = session.at(0.5).unwrap();
        assert!(matches!(
            moment.add_buffer_operation(buffer, BufferOperation::Zero),
            Err(SessionError::OffsetOutOfRange { .. })
        ));
        drop(moment);

        let mut moment = session.at(2.0).unwrap();
        assert!(matches!(
            moment.add_buffer_operation(bus, BufferOperation::Zero),
            Err(SessionError::NotABuffer(_))
        ));
        assert!(matches!(
            moment.add_buffer_operation(buffer, BufferOperation::copy_to(bus)),
            Err(SessionError::NotABuffer(_))
        ));
        let mismatched = BufferOperation::generate(Generator::Sine3 {
            frequencies: vec![1.0],
            amplitudes: vec![1.0],
            phases: Vec::new(),
        });
        assert!(matches!(
            moment.add_buffer_operation(buffer, mismatched),
            Err(SessionError::InvalidBufferOperation { .. })
        ));
        moment.add_buffer_operation(buffer, BufferOperation::Zero).unwrap();
        drop(moment);

        // the write at the stop offset is kept; the rejected one left no state
        session
            .at(3.0)
            .unwrap()
            .add_buffer_operation(buffer, BufferOperation::write("out.aiff"))
            .unwrap();
        assert_eq!(session.offsets(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_inspect_children() {
        let mut session = Session::new();
        let (group, other, stays, leaves, stops, arrives) = {
            let mut moment = session.at(0.0).unwrap();
            let group = moment.add_group(EntityId::ROOT, AddAction::AddToHead, 10.0).unwrap();
            let other = moment.add_group(EntityId::ROOT, AddAction::AddToTail, 10.0).unwrap();
            let stays = moment.add_group(group, AddAction::AddToTail, 10.0).unwrap();
            let leaves = moment.add_group(group, AddAction::AddToTail, 10.0).unwrap();
            let stops = moment.add_group(group, AddAction::AddToTail, 5.0).unwrap();
            let arrives = moment.add_group(other, AddAction::AddToHead, 10.0).unwrap();
            (group, other, stays, leaves, stops, arrives)
        };
        let starts = {
            let mut moment = session.at(5.0).unwrap();
            moment.move_node(other, leaves, AddAction::AddToTail).unwrap();
            moment.move_node(group, arrives, AddAction::AddToTail).unwrap();
            moment.add_group(group, AddAction::AddToHead, 1.0).unwrap()
        };

        let inspection = session.at(5.0).unwrap().inspect_children(group).unwrap();
        assert_eq!(inspection.entering, vec![arrives]);
        assert_eq!(inspection.exiting, vec![leaves]);
        assert_eq!(inspection.occupying, vec![stays]);
        assert_eq!(inspection.starting, vec![starts]);
        assert_eq!(inspection.stopping, vec![stops]);
    }

    #[test]
    fn test_to_strings() {
        let mut session = Session::new();
        {
            let mut moment = session.at(0.0).unwrap();
            let group = moment.add_group(EntityId::ROOT, AddAction::AddToHead, 2.0).unwrap();
            moment
                .add_synth(group, AddAction::AddToHead, &sine(), 1.0, &[("freq", ControlValue::Number(220.0))])
                .unwrap();
        }
        let dump = session.to_strings(true);
        let expected = [
            "0.0:",
            "    NODE TREE 0 group",
            "        1000 group",
            "            1001 sine",
            "                freq: 220.0, amp: 0.1",
            "1.0:",
            "    NODE TREE 0 group",
            "        1000 group",
            "2.0:",
            "    NODE TREE 0 group",
        ]
        .join("\n");
        assert_eq!(dump, expected);
    }

    #[test]
    fn test_moment_validates_offset() {
        let mut session = Session::new();
        assert!(matches!(session.at(-1.0), Err(SessionError::InvalidOffset(_))));
        assert!(matches!(session.at(f64::INFINITY), Err(SessionError::InvalidOffset(_))));
        assert!(session.at(f64::NAN).is_err());
    }
}
