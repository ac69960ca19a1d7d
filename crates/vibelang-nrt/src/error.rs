//! Error types for the non-realtime scheduling engine.

use thiserror::Error;

use crate::entity::EntityId;
use crate::protocol::AddAction;

/// Errors that can occur while editing a session or synthesizing commands.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A mutation was attempted outside of any moment.
    #[error("No active moment: open one with Session::at()")]
    NoActiveMoment,

    /// An offset fell outside an entity's `[start, stop)` span.
    #[error("Offset {offset} is outside of {entity}'s lifetime")]
    OffsetOutOfRange { entity: EntityId, offset: f64 },

    /// A move would make a node its own ancestor.
    #[error("Cannot move {node} into its own subtree at {target}")]
    InvalidParentage { node: EntityId, target: EntityId },

    /// Transition rebuilding did not converge within its iteration bound.
    #[error("Transitions at offset {offset} did not converge after {iterations} iterations")]
    TransitionConvergence { offset: f64, iterations: usize },

    /// The add action is not valid for the chosen target.
    #[error("Invalid add action {action:?} relative to {target}")]
    InvalidAddAction { action: AddAction, target: EntityId },

    /// No live entity has this handle.
    #[error("Unknown entity: {0}")]
    UnknownEntity(EntityId),

    /// The entity is not a group or synth.
    #[error("{0} is not a node")]
    NotANode(EntityId),

    /// The entity is not a bus.
    #[error("{0} is not a bus")]
    NotABus(EntityId),

    /// The entity is not a buffer.
    #[error("{0} is not a buffer")]
    NotABuffer(EntityId),

    /// The synth definition declares no such parameter.
    #[error("Unknown parameter '{name}' for synth definition '{definition}'")]
    UnknownParameter { definition: String, name: String },

    /// A different synth definition is already registered under this name.
    #[error("Synth definition '{name}' is already registered with different content")]
    DefinitionConflict { name: String },

    /// A buffer operation's arguments are inconsistent.
    #[error("Invalid operation on {buffer}: {reason}")]
    InvalidBufferOperation {
        buffer: EntityId,
        reason: &'static str,
    },

    /// Bus and buffer groups need at least one member.
    #[error("A bus or buffer group needs at least one member")]
    EmptyGroup,

    /// Offsets must be real numbers, and moments cannot open before zero.
    #[error("Invalid offset: {0}")]
    InvalidOffset(f64),

    /// Durations must be non-negative (or strictly positive when resizing).
    #[error("Invalid duration: {0}")]
    InvalidDuration(f64),

    /// The requested window is empty once clamped to the session.
    #[error("Invalid window: {start}..{stop}")]
    InvalidWindow { start: f64, stop: f64 },

    /// The node does not exist in the tree at this offset.
    #[error("{node} is not alive at offset {offset}")]
    NodeNotAlive { node: EntityId, offset: f64 },

    /// The root group cannot be moved, resized or deleted.
    #[error("The root node cannot be modified")]
    RootImmutable,

    /// Only control-rate buses carry values.
    #[error("{0} is not a control-rate bus")]
    UnsupportedBusRate(EntityId),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
