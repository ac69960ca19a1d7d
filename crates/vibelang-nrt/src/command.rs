//! Abstract server commands and their synthesis from a session.
//!
//! The stream produced here is wire-agnostic: each [`CommandBundle`] holds
//! the ordered commands for one offset. The `score` module turns them into
//! OSC bundles.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::block::Block;
use crate::buffer::{BufferOperation, Generator, HeaderFormat, OperationKind, SampleFormat};
use crate::definition::SynthDefinition;
use crate::entity::{ControlValue, Entity, EntityId, EntityKind};
use crate::error::{Result, SessionError};
use crate::offset::{Offset, Timespan};
use crate::protocol::{AddAction, BufNum, CalculationRate, NodeId};
use crate::session::Session;
use crate::state::Transition;

/// An inline creation argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlArg {
    Number(f64),
    /// Map the control to a bus, encoded as `c<index>` or `a<index>`.
    Bus { rate: CalculationRate, index: i32 },
}

/// One abstract server command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Register synth definitions (`/d_recv`).
    DefinitionReceive {
        definitions: Vec<Arc<SynthDefinition>>,
    },
    /// Allocate an empty buffer (`/b_alloc`).
    BufferAllocate {
        buffer: BufNum,
        frame_count: u32,
        channel_count: u32,
    },
    /// Allocate a buffer and read a sound file into it (`/b_allocRead`).
    BufferAllocateRead {
        buffer: BufNum,
        path: PathBuf,
        starting_frame: u32,
        frame_count: u32,
    },
    /// Read a sound file into an allocated buffer (`/b_read`, or
    /// `/b_readChannel` when channels are given).
    BufferRead {
        buffer: BufNum,
        path: PathBuf,
        channels: Option<Vec<u32>>,
        starting_frame_in_file: u32,
        frame_count: Option<u32>,
        starting_frame_in_buffer: u32,
        leave_open: bool,
    },
    /// Zero a buffer (`/b_zero`).
    BufferZero { buffer: BufNum },
    /// Fill sample runs (`/b_fill`).
    BufferFill {
        buffer: BufNum,
        triples: Vec<(u32, u32, f64)>,
    },
    /// Generate a waveform (`/b_gen`).
    BufferGenerate {
        buffer: BufNum,
        generator: Generator,
        normalize: bool,
        as_wavetable: bool,
        clear_first: bool,
    },
    /// Set individual samples (`/b_set`).
    BufferSet { buffer: BufNum, pairs: Vec<(u32, f64)> },
    /// Set runs of samples (`/b_setn`).
    BufferSetContiguous {
        buffer: BufNum,
        runs: Vec<(u32, Vec<f64>)>,
    },
    /// Normalize (`/b_gen normalize` or `wnormalize`).
    BufferNormalize {
        buffer: BufNum,
        new_maximum: f64,
        as_wavetable: bool,
    },
    /// Copy samples between buffers (`/b_gen copy`).
    BufferCopy {
        source: BufNum,
        target: BufNum,
        source_starting_frame: u32,
        target_starting_frame: u32,
        frame_count: Option<u32>,
    },
    /// Write a buffer to a sound file (`/b_write`).
    BufferWrite {
        buffer: BufNum,
        path: PathBuf,
        header_format: HeaderFormat,
        sample_format: SampleFormat,
        frame_count: Option<u32>,
        starting_frame: u32,
        leave_open: bool,
    },
    /// Close a buffer's open sound file (`/b_close`).
    BufferClose { buffer: BufNum },
    /// Create a synth (`/s_new`) or, without a definition, a group (`/g_new`).
    NodeCreate {
        node: NodeId,
        definition: Option<String>,
        action: AddAction,
        target: NodeId,
        controls: Vec<(String, ControlArg)>,
    },
    /// Move an existing node.
    NodeMove {
        node: NodeId,
        action: AddAction,
        target: NodeId,
    },
    /// Set numeric controls (`/n_set`).
    NodeSet {
        node: NodeId,
        controls: Vec<(String, f64)>,
    },
    /// Map controls to buses of one rate (`/n_map` or `/n_mapa`).
    NodeMapToBus {
        node: NodeId,
        rate: CalculationRate,
        mappings: Vec<(String, i32)>,
    },
    /// Set control bus values (`/c_set`).
    BusSet { pairs: Vec<(i32, f64)> },
    /// Free nodes immediately (`/n_free`).
    NodeFree { nodes: Vec<NodeId> },
    /// Free a buffer (`/b_free`).
    BufferFree { buffer: BufNum },
    /// Terminal marker (`/none`).
    EndOfScore,
}

/// Commands scheduled at one offset.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandBundle {
    /// Seconds from the start of the rendered window.
    pub offset: f64,
    pub commands: Vec<Command>,
}

/// Protocol ids for every entity that takes part in a window.
#[derive(Debug, Default)]
struct IdMapping {
    nodes: BTreeMap<EntityId, NodeId>,
    buffers: BTreeMap<EntityId, BufNum>,
    buses: BTreeMap<EntityId, (CalculationRate, i32)>,
}

impl IdMapping {
    fn build(session: &Session, window: &Timespan) -> Self {
        let mut mapping = IdMapping::default();
        mapping.nodes.insert(EntityId::ROOT, NodeId::root());
        let mut next_node = session.options().node_id_base;
        let mut next_buffer = 0;
        let mut next_control = 0;
        let mut next_audio = session.options().first_private_audio_bus();
        let mut blocks = BTreeMap::new();
        for entity in session.entities() {
            match &entity.kind {
                EntityKind::Group { .. } | EntityKind::Synth { .. } => {
                    if entity.id != EntityId::ROOT && overlaps(entity, window) {
                        mapping.nodes.insert(entity.id, NodeId::new(next_node));
                        next_node += 1;
                    }
                }
                EntityKind::Buffer { block, .. } => {
                    if overlaps(entity, window) {
                        let num = allocate(&mut next_buffer, *block, &mut blocks);
                        mapping.buffers.insert(entity.id, BufNum::new(num));
                    }
                }
                EntityKind::Bus { rate, block, .. } => {
                    let counter = match rate {
                        CalculationRate::Control => &mut next_control,
                        CalculationRate::Audio => &mut next_audio,
                    };
                    let index = allocate(counter, *block, &mut blocks);
                    mapping.buses.insert(entity.id, (*rate, index));
                }
            }
        }
        mapping
    }

    fn node(&self, id: EntityId) -> Option<NodeId> {
        self.nodes.get(&id).copied()
    }

    fn buffer(&self, id: EntityId) -> Option<BufNum> {
        self.buffers.get(&id).copied()
    }
}

/// Next id from `counter`. A block reserves all of its ids at its first member.
fn allocate(counter: &mut i32, block: Option<Block>, blocks: &mut BTreeMap<EntityId, i32>) -> i32 {
    let Some(block) = block else {
        *counter += 1;
        return *counter - 1;
    };
    let first = *blocks.entry(block.first).or_insert_with(|| {
        let first = *counter;
        *counter += block.count as i32;
        first
    });
    first + block.position as i32
}

/// Whether an entity has any presence inside the window.
fn overlaps(entity: &Entity, window: &Timespan) -> bool {
    entity.start < window.stop && (entity.start >= window.start || entity.stop > window.start)
}

/// Walks a session's offsets and emits each offset's commands.
struct StreamBuilder<'a> {
    session: &'a Session,
    window: Timespan,
    ids: IdMapping,
    visited_definitions: Vec<Arc<SynthDefinition>>,
    /// Buffers whose sound file a read or write left open.
    open_buffers: BTreeSet<BufNum>,
}

impl<'a> StreamBuilder<'a> {
    fn new(session: &'a Session, window: Timespan) -> Self {
        Self {
            ids: IdMapping::build(session, &window),
            session,
            window,
            visited_definitions: Vec::new(),
            open_buffers: BTreeSet::new(),
        }
    }

    /// Window start, every state strictly inside the window, window stop.
    fn offsets(&self) -> Vec<Offset> {
        let mut offsets = vec![self.window.start];
        offsets.extend(
            self.session
                .states()
                .map(|state| state.offset)
                .filter(|offset| self.window.start < *offset && *offset < self.window.stop),
        );
        if self.window.stop > self.window.start {
            offsets.push(self.window.stop);
        }
        offsets
    }

    fn commands_at(&mut self, offset: Offset, snapshot: bool, last: bool) -> Vec<Command> {
        let session = self.session;
        let state = session.state(offset.as_f64());
        let tree = session.tree_at(offset);

        // Node placements in emission order, flagged when they create the node.
        let mut placements: Vec<(Transition, bool)> = Vec::new();
        if snapshot {
            for (parent, child) in tree.pairs() {
                let transition = Transition {
                    source: child,
                    target: parent,
                    action: AddAction::AddToTail,
                };
                placements.push((transition, true));
            }
        }
        if let Some(state) = state {
            for transition in state.transitions.iter() {
                let starting = state.start_nodes.contains(&transition.source);
                if !snapshot {
                    placements.push((*transition, starting));
                } else if starting && state.stop_nodes.contains(&transition.source) {
                    // zero-length nodes never show up in the snapshot tree
                    placements.push((*transition, true));
                }
            }
        }
        let created: BTreeSet<EntityId> = placements
            .iter()
            .filter(|(_, creates)| *creates)
            .map(|(transition, _)| transition.source)
            .collect();

        let mut commands = Vec::new();
        commands.extend(self.definition_commands(&created));
        commands.extend(self.buffer_allocations(offset, snapshot));
        commands.extend(self.buffer_operations(offset, false));
        for (transition, creates) in placements {
            let Transition { source, target, action } = transition;
            if creates {
                commands.extend(self.creation(source, action, target, offset));
                continue;
            }
            match (self.ids.node(source), self.ids.node(target)) {
                (Some(node), Some(target)) => commands.push(Command::NodeMove {
                    node,
                    action,
                    target,
                }),
                _ => log::debug!("[COMMANDS] Skipping move of {} outside the window", source),
            }
        }
        for node in tree.iter_depth_first() {
            commands.extend(self.control_commands(node, offset, snapshot, &created));
        }
        commands.extend(self.bus_commands(offset, snapshot));
        commands.extend(self.stop_commands(offset, last));
        commands.extend(self.buffer_operations(offset, true));
        commands.extend(self.buffer_frees(offset, last));
        if last {
            commands.push(Command::EndOfScore);
        }
        commands
    }

    /// One `DefinitionReceive` for definitions not sent yet, compared by content.
    fn definition_commands(&mut self, created: &BTreeSet<EntityId>) -> Option<Command> {
        let session = self.session;
        let mut unseen: Vec<Arc<SynthDefinition>> = Vec::new();
        for id in created {
            if self.ids.node(*id).is_none() {
                continue;
            }
            let Some(definition) = session.entity(*id).ok().and_then(Entity::definition) else {
                continue;
            };
            let known = self
                .visited_definitions
                .iter()
                .chain(unseen.iter())
                .any(|seen| **seen == **definition);
            if !known {
                unseen.push(Arc::clone(definition));
            }
        }
        if unseen.is_empty() {
            return None;
        }
        unseen.sort_by(|a, b| a.name.cmp(&b.name));
        self.visited_definitions.extend(unseen.iter().cloned());
        Some(Command::DefinitionReceive { definitions: unseen })
    }

    fn buffer_allocations(&self, offset: Offset, snapshot: bool) -> Vec<Command> {
        let mut starting: Vec<(BufNum, &Entity)> = self
            .session
            .entities()
            .filter(|entity| {
                entity.start == offset
                    || (snapshot && entity.start < offset && entity.stop > offset)
            })
            .filter_map(|entity| self.ids.buffer(entity.id).map(|buffer| (buffer, entity)))
            .collect();
        starting.sort_by_key(|(buffer, _)| *buffer);
        starting
            .into_iter()
            .filter_map(|(buffer, entity)| match &entity.kind {
                EntityKind::Buffer { spec, .. } => Some(match &spec.file_path {
                    Some(path) => Command::BufferAllocateRead {
                        buffer,
                        path: path.clone(),
                        starting_frame: spec.starting_frame,
                        frame_count: spec.frame_count,
                    },
                    None => Command::BufferAllocate {
                        buffer,
                        frame_count: spec.frame_count.max(1),
                        channel_count: spec.channel_count.max(1),
                    },
                }),
                _ => None,
            })
            .collect()
    }

    /// Buffer operations at `offset`, either the post-allocation kinds or the
    /// pre-free ones, ordered by kind and then by buffer number.
    fn buffer_operations(&mut self, offset: Offset, pre_free: bool) -> Vec<Command> {
        let session = self.session;
        let mut scheduled: Vec<(OperationKind, BufNum, &BufferOperation)> = Vec::new();
        for entity in session.entities() {
            let EntityKind::Buffer { operations, .. } = &entity.kind else {
                continue;
            };
            let (Some(buffer), Some(at_offset)) = (self.ids.buffer(entity.id), operations.get(&offset)) else {
                continue;
            };
            for (kind, operation) in at_offset {
                if kind.is_pre_free() == pre_free {
                    scheduled.push((*kind, buffer, operation));
                }
            }
        }
        scheduled.sort_by_key(|(kind, buffer, _)| (*kind, *buffer));
        let mut commands = Vec::new();
        for (_, buffer, operation) in scheduled {
            commands.extend(self.buffer_operation(buffer, operation));
        }
        commands
    }

    fn buffer_operation(&mut self, buffer: BufNum, operation: &BufferOperation) -> Vec<Command> {
        let command = match operation {
            BufferOperation::Read {
                path,
                channels,
                frame_count,
                starting_frame_in_buffer,
                starting_frame_in_file,
                leave_open,
            } => {
                let mut commands = self.close_if_open(buffer);
                commands.push(Command::BufferRead {
                    buffer,
                    path: path.clone(),
                    channels: channels.clone(),
                    starting_frame_in_file: *starting_frame_in_file,
                    frame_count: *frame_count,
                    starting_frame_in_buffer: *starting_frame_in_buffer,
                    leave_open: *leave_open,
                });
                if *leave_open {
                    self.open_buffers.insert(buffer);
                }
                return commands;
            }
            BufferOperation::Write {
                path,
                header_format,
                sample_format,
                frame_count,
                starting_frame,
                leave_open,
            } => {
                let mut commands = self.close_if_open(buffer);
                commands.push(Command::BufferWrite {
                    buffer,
                    path: path.clone(),
                    header_format: *header_format,
                    sample_format: *sample_format,
                    frame_count: *frame_count,
                    starting_frame: *starting_frame,
                    leave_open: *leave_open,
                });
                if *leave_open {
                    self.open_buffers.insert(buffer);
                }
                return commands;
            }
            BufferOperation::Close => return self.close_if_open(buffer),
            BufferOperation::Zero => Command::BufferZero { buffer },
            BufferOperation::Fill { triples } => Command::BufferFill {
                buffer,
                triples: triples.clone(),
            },
            BufferOperation::Generate {
                generator,
                normalize,
                as_wavetable,
                clear_first,
            } => Command::BufferGenerate {
                buffer,
                generator: generator.clone(),
                normalize: *normalize,
                as_wavetable: *as_wavetable,
                clear_first: *clear_first,
            },
            BufferOperation::Set { pairs } => Command::BufferSet {
                buffer,
                pairs: pairs.clone(),
            },
            BufferOperation::SetContiguous { runs } => Command::BufferSetContiguous {
                buffer,
                runs: runs.clone(),
            },
            BufferOperation::Normalize {
                new_maximum,
                as_wavetable,
            } => Command::BufferNormalize {
                buffer,
                new_maximum: *new_maximum,
                as_wavetable: *as_wavetable,
            },
            BufferOperation::Copy {
                target,
                frame_count,
                source_starting_frame,
                target_starting_frame,
            } => {
                let Some(target) = self.ids.buffer(*target) else {
                    log::debug!("[COMMANDS] Skipping copy into {} outside the window", target);
                    return Vec::new();
                };
                Command::BufferCopy {
                    source: buffer,
                    target,
                    source_starting_frame: *source_starting_frame,
                    target_starting_frame: *target_starting_frame,
                    frame_count: *frame_count,
                }
            }
        };
        vec![command]
    }

    fn close_if_open(&mut self, buffer: BufNum) -> Vec<Command> {
        if self.open_buffers.remove(&buffer) {
            vec![Command::BufferClose { buffer }]
        } else {
            Vec::new()
        }
    }

    fn creation(
        &self,
        source: EntityId,
        action: AddAction,
        target: EntityId,
        offset: Offset,
    ) -> Option<Command> {
        let (Some(node), Some(target_id)) = (self.ids.node(source), self.ids.node(target)) else {
            log::debug!("[COMMANDS] Skipping creation of {} outside the window", source);
            return None;
        };
        let entity = self.session.entity(source).ok()?;
        let Some(definition) = entity.definition() else {
            return Some(Command::NodeCreate {
                node,
                definition: None,
                action,
                target: target_id,
                controls: Vec::new(),
            });
        };
        let mut controls = Vec::new();
        for parameter in &definition.parameters {
            if parameter.name == "duration" {
                let stop = entity.stop.min(self.window.stop);
                controls.push((
                    parameter.name.clone(),
                    ControlArg::Number(stop.as_f64() - offset.as_f64()),
                ));
                continue;
            }
            let value = entity
                .controls()
                .and_then(|c| c.get(&parameter.name))
                .and_then(|timeline| timeline.value_at(offset));
            let Some((value, _)) = value else {
                continue;
            };
            let scalar = definition.is_scalar(&parameter.name);
            let arg = match *value {
                ControlValue::Number(number) => Some(ControlArg::Number(number)),
                ControlValue::Bus(bus) => {
                    self.ids.buses.get(&bus).map(|(rate, index)| {
                        if scalar {
                            ControlArg::Number(*index as f64)
                        } else {
                            ControlArg::Bus {
                                rate: *rate,
                                index: *index,
                            }
                        }
                    })
                }
                ControlValue::Buffer(buffer) => self
                    .ids
                    .buffer(buffer)
                    .map(|num| ControlArg::Number(num.as_i32() as f64)),
            };
            if let Some(arg) = arg {
                controls.push((parameter.name.clone(), arg));
            }
        }
        Some(Command::NodeCreate {
            node,
            definition: Some(definition.name.clone()),
            action,
            target: target_id,
            controls,
        })
    }

    fn control_commands(
        &self,
        node: EntityId,
        offset: Offset,
        snapshot: bool,
        created: &BTreeSet<EntityId>,
    ) -> Vec<Command> {
        let Some(node_id) = self.ids.node(node) else {
            return Vec::new();
        };
        let Ok(entity) = self.session.entity(node) else {
            return Vec::new();
        };
        if entity.definition().is_some() && created.contains(&node) {
            return Vec::new();
        }
        let Some(controls) = entity.controls() else {
            return Vec::new();
        };
        let persistent = snapshot && created.contains(&node);

        let mut numbers = Vec::new();
        let mut audio = Vec::new();
        let mut control = Vec::new();
        for (name, timeline) in controls {
            if entity.definition().is_some_and(|d| d.is_scalar(name)) {
                continue;
            }
            let value = if persistent {
                timeline.value_at(offset).map(|(value, _)| value)
            } else {
                timeline.event_at(offset)
            };
            match value {
                Some(ControlValue::Number(number)) => numbers.push((name.clone(), *number)),
                Some(ControlValue::Buffer(buffer)) => {
                    if let Some(num) = self.ids.buffer(*buffer) {
                        numbers.push((name.clone(), num.as_i32() as f64));
                    }
                }
                Some(ControlValue::Bus(bus)) => match self.ids.buses.get(bus) {
                    Some((CalculationRate::Audio, index)) => audio.push((name.clone(), *index)),
                    Some((CalculationRate::Control, index)) => control.push((name.clone(), *index)),
                    None => {}
                },
                None => {}
            }
        }

        let mut commands = Vec::new();
        if !numbers.is_empty() {
            commands.push(Command::NodeSet {
                node: node_id,
                controls: numbers,
            });
        }
        if !audio.is_empty() {
            commands.push(Command::NodeMapToBus {
                node: node_id,
                rate: CalculationRate::Audio,
                mappings: audio,
            });
        }
        if !control.is_empty() {
            commands.push(Command::NodeMapToBus {
                node: node_id,
                rate: CalculationRate::Control,
                mappings: control,
            });
        }
        commands
    }

    fn bus_commands(&self, offset: Offset, snapshot: bool) -> Option<Command> {
        let mut pairs = Vec::new();
        for entity in self.session.entities() {
            let EntityKind::Bus { values, .. } = &entity.kind else {
                continue;
            };
            let Some((CalculationRate::Control, index)) = self.ids.buses.get(&entity.id).copied() else {
                continue;
            };
            let value = if snapshot {
                values.value_at(offset).map(|(value, _)| *value)
            } else {
                values.event_at(offset).copied()
            };
            if let Some(value) = value {
                pairs.push((index, value));
            }
        }
        if pairs.is_empty() {
            return None;
        }
        pairs.sort_by_key(|(index, _)| *index);
        Some(Command::BusSet { pairs })
    }

    fn stop_commands(&self, offset: Offset, last: bool) -> Vec<Command> {
        let mut stopping: BTreeSet<EntityId> = self
            .session
            .state(offset.as_f64())
            .map(|state| state.stop_nodes.clone())
            .unwrap_or_default();
        if last {
            stopping.extend(
                self.session
                    .entities()
                    .filter(|e| e.is_node() && e.start < offset && e.stop > offset)
                    .map(|e| e.id),
            );
        }

        let mut free = Vec::new();
        let mut release = Vec::new();
        for id in stopping {
            let (Some(node), Ok(entity)) = (self.ids.node(id), self.session.entity(id)) else {
                continue;
            };
            if node == NodeId::root() {
                continue;
            }
            if entity.has_gate() {
                release.push(node);
            } else if entity.duration() > 0.0 {
                free.push(node);
            }
        }
        free.sort();
        release.sort();

        let mut commands = Vec::new();
        if !free.is_empty() {
            commands.push(Command::NodeFree { nodes: free });
        }
        for node in release {
            commands.push(Command::NodeSet {
                node,
                controls: vec![("gate".to_string(), 0.0)],
            });
        }
        commands
    }

    fn buffer_frees(&mut self, offset: Offset, last: bool) -> Vec<Command> {
        let mut buffers: Vec<BufNum> = self
            .session
            .entities()
            .filter(|e| e.stop == offset || (last && e.start < offset && e.stop > offset))
            .filter_map(|e| self.ids.buffer(e.id))
            .collect();
        buffers.sort();
        let mut commands = Vec::new();
        for buffer in buffers {
            commands.extend(self.close_if_open(buffer));
            commands.push(Command::BufferFree { buffer });
        }
        commands
    }
}

impl Session {
    /// Synthesize the command stream, optionally restricted to `window`.
    ///
    /// The window is clamped to `[0, duration]` and its start becomes offset
    /// zero in the output. The final bundle releases everything still alive
    /// and ends the score.
    pub fn to_command_stream(&self, window: Option<Timespan>) -> Result<Vec<CommandBundle>> {
        let window = self.clamp_window(window)?;
        let mut builder = StreamBuilder::new(self, window);
        let offsets = builder.offsets();
        let mut bundles = Vec::new();
        for (index, offset) in offsets.iter().enumerate() {
            let last = index + 1 == offsets.len();
            let snapshot = index == 0 && *offset > Offset::ZERO && !last;
            let commands = builder.commands_at(*offset, snapshot, last);
            if commands.is_empty() {
                continue;
            }
            bundles.push(CommandBundle {
                offset: offset.as_f64() - window.start.as_f64(),
                commands,
            });
        }
        log::info!(
            "[COMMANDS] Synthesized {} bundles for window {}..{}",
            bundles.len(),
            window.start,
            window.stop
        );
        Ok(bundles)
    }

    fn clamp_window(&self, window: Option<Timespan>) -> Result<Timespan> {
        let duration = self.duration();
        let (start, stop) = match window {
            Some(window) => (
                window.start.as_f64().max(0.0),
                window.stop.as_f64().min(duration),
            ),
            None => (0.0, duration),
        };
        if start > stop || (start == stop && duration > 0.0) {
            return Err(SessionError::InvalidWindow { start, stop });
        }
        Timespan::new(start, stop)
    }
}
