//! Timed entities owned by a session.
//!
//! Every group, synth, bus and buffer lives in the session's arena and is
//! addressed by an [`EntityId`]. Kind-specific payloads live in
//! [`EntityKind`], which is matched exhaustively wherever behaviour differs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::block::Block;
use crate::buffer::{BufferOperation, OperationKind};
use crate::definition::SynthDefinition;
use crate::offset::Offset;
use crate::protocol::CalculationRate;
use crate::timeline::Timeline;

/// Stable handle into a session's entity arena.
///
/// Handles are allocated in creation order and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub(crate) u32);

impl EntityId {
    /// The synthetic root group present at every offset.
    pub const ROOT: EntityId = EntityId(0);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity #{}", self.0)
    }
}

/// A value written to a node control.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlValue {
    /// A plain number.
    Number(f64),
    /// Read the control from a bus.
    Bus(EntityId),
    /// Pass a buffer's number.
    Buffer(EntityId),
}

impl From<f64> for ControlValue {
    fn from(value: f64) -> Self {
        ControlValue::Number(value)
    }
}

/// Per-parameter control timelines.
pub type Controls = BTreeMap<String, Timeline<ControlValue>>;

/// Allocation details for a buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferSpec {
    /// Number of channels.
    pub channel_count: u32,
    /// Number of frames. Zero with a file path means "read the whole file".
    pub frame_count: u32,
    /// Sound file to read on allocation.
    pub file_path: Option<PathBuf>,
    /// First frame to read from the file.
    pub starting_frame: u32,
}

impl BufferSpec {
    /// An empty buffer of the given shape.
    pub fn new(channel_count: u32, frame_count: u32) -> Self {
        Self {
            channel_count,
            frame_count,
            file_path: None,
            starting_frame: 0,
        }
    }

    /// A buffer allocated by reading a sound file.
    pub fn read(path: impl Into<PathBuf>) -> Self {
        Self {
            channel_count: 0,
            frame_count: 0,
            file_path: Some(path.into()),
            starting_frame: 0,
        }
    }

    /// Set the first frame to read.
    pub fn with_starting_frame(mut self, frame: u32) -> Self {
        self.starting_frame = frame;
        self
    }

    /// Set the number of frames.
    pub fn with_frame_count(mut self, frames: u32) -> Self {
        self.frame_count = frames;
        self
    }
}

/// Buffer operations by offset, one per kind.
pub type BufferOperations = BTreeMap<Offset, BTreeMap<OperationKind, BufferOperation>>;

/// Kind-specific entity payload.
#[derive(Clone, Debug)]
pub enum EntityKind {
    Group {
        controls: Controls,
    },
    Synth {
        definition: Arc<SynthDefinition>,
        controls: Controls,
    },
    Bus {
        rate: CalculationRate,
        values: Timeline<f64>,
        block: Option<Block>,
    },
    Buffer {
        spec: BufferSpec,
        operations: BufferOperations,
        block: Option<Block>,
    },
}

/// A timed, identity-bearing object.
#[derive(Clone, Debug)]
pub struct Entity {
    /// Arena handle.
    pub id: EntityId,
    /// Per-kind creation counter (nodes from the configured base, others from 0).
    pub session_id: i32,
    /// First offset at which the entity exists.
    pub start: Offset,
    /// First offset at which it no longer exists.
    pub stop: Offset,
    /// Kind-specific payload.
    pub kind: EntityKind,
}

impl Entity {
    /// Length of the entity's lifetime in seconds.
    pub fn duration(&self) -> f64 {
        self.stop.as_f64() - self.start.as_f64()
    }

    /// Whether the entity exists at `offset`.
    pub fn is_alive_at(&self, offset: Offset) -> bool {
        self.start <= offset && offset < self.stop
    }

    /// Whether this is a group or synth.
    pub fn is_node(&self) -> bool {
        matches!(self.kind, EntityKind::Group { .. } | EntityKind::Synth { .. })
    }

    /// Whether this is a group.
    pub fn is_group(&self) -> bool {
        matches!(self.kind, EntityKind::Group { .. })
    }

    /// The synth definition, for synths.
    pub fn definition(&self) -> Option<&Arc<SynthDefinition>> {
        match &self.kind {
            EntityKind::Synth { definition, .. } => Some(definition),
            _ => None,
        }
    }

    /// Whether stopping this node is a soft release.
    pub fn has_gate(&self) -> bool {
        self.definition().is_some_and(|d| d.has_gate())
    }

    /// Control timelines, for nodes.
    pub fn controls(&self) -> Option<&Controls> {
        match &self.kind {
            EntityKind::Group { controls } | EntityKind::Synth { controls, .. } => Some(controls),
            _ => None,
        }
    }

    pub(crate) fn controls_mut(&mut self) -> Option<&mut Controls> {
        match &mut self.kind {
            EntityKind::Group { controls } | EntityKind::Synth { controls, .. } => Some(controls),
            _ => None,
        }
    }

    /// Rate of a bus.
    pub fn bus_rate(&self) -> Option<CalculationRate> {
        match &self.kind {
            EntityKind::Bus { rate, .. } => Some(*rate),
            _ => None,
        }
    }

    /// Contiguous block membership, for grouped buses and buffers.
    pub fn block(&self) -> Option<Block> {
        match &self.kind {
            EntityKind::Bus { block, .. } | EntityKind::Buffer { block, .. } => *block,
            _ => None,
        }
    }

    /// A copy of this node's payload without any control events.
    pub(crate) fn blank_kind(&self) -> EntityKind {
        match &self.kind {
            EntityKind::Synth { definition, .. } => EntityKind::Synth {
                definition: Arc::clone(definition),
                controls: Controls::new(),
            },
            EntityKind::Group { .. } => EntityKind::Group {
                controls: Controls::new(),
            },
            other => other.clone(),
        }
    }
}
