//! VibeLang NRT - Non-realtime score scheduling for SuperCollider.
//!
//! This crate turns a declared timeline of groups, synths, buses and buffers
//! into the ordered, time-stamped command stream that reproduces it when
//! `scsynth` renders offline:
//!
//! - **Session** - Entity registry, per-offset states and retroactive edits
//! - **Buffer** - Reads, writes, fills and other scheduled buffer operations
//! - **Moment** - Scoped edit context bound to one offset
//! - **State** - Node tree snapshots and the transitions between them
//! - **Command** - Abstract server commands and stream synthesis
//! - **Score** - OSC encoding and NRT score files
//!
//! # Architecture
//!
//! Every edit is recorded on the [`State`] at its offset: which nodes start,
//! which stop, and which placements ([`Transition`]s) happen there. Trees are
//! derived by replaying transitions onto the previous tree, and a change at
//! one offset propagates forward until the derived trees stop changing.
//! [`Session::to_command_stream`] then walks the offsets and emits
//! [`CommandBundle`]s.
//!
//! # Feature Flags
//!
//! - `osc` (default) - Score encoding via `rosc`

pub mod block;
pub mod buffer;
pub mod command;
pub mod config;
pub mod definition;
pub mod entity;
pub mod error;
pub mod moment;
pub mod offset;
pub mod protocol;
pub mod session;
pub mod state;
pub mod timeline;
pub mod tree;

#[cfg(feature = "osc")]
pub mod score;

pub use block::{Block, BufferGroup, BusGroup};
pub use buffer::{BufferOperation, Generator, HeaderFormat, OperationKind, SampleFormat};
pub use command::{Command, CommandBundle, ControlArg};
pub use config::SessionOptions;
pub use definition::{ParameterSpec, SynthDefinition};
pub use entity::{BufferOperations, BufferSpec, ControlValue, Entity, EntityId, EntityKind};
pub use error::{Result, SessionError};
pub use moment::Moment;
pub use offset::{Offset, Timespan};
pub use protocol::{AddAction, BufNum, CalculationRate, NodeId, ParameterRate};
pub use session::Session;
pub use state::{ChildrenInspection, State, Transition, Transitions};
pub use timeline::Timeline;
pub use tree::NodeTree;

#[cfg(feature = "osc")]
pub use score::ScoreWriter;
