//! Server-level vocabulary shared by the engine and the score encoder.
//!
//! These mirror the values scsynth expects on the wire:
//!
//! - [`AddAction`] - Placement of a node relative to a target
//! - [`NodeId`] / [`BufNum`] - Protocol-level identifiers
//! - [`CalculationRate`] / [`ParameterRate`] - Bus and parameter rates

/// Action for placing a node relative to a target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddAction {
    /// Add to head of target group (first to execute).
    AddToHead = 0,
    /// Add to tail of target group (last to execute).
    AddToTail = 1,
    /// Add immediately before target node.
    AddBefore = 2,
    /// Add immediately after target node.
    AddAfter = 3,
}

impl AddAction {
    /// Whether the target becomes a sibling rather than the parent.
    pub fn is_sibling(self) -> bool {
        matches!(self, AddAction::AddBefore | AddAction::AddAfter)
    }
}

impl From<AddAction> for i32 {
    fn from(action: AddAction) -> Self {
        action as i32
    }
}

/// Node ID for synth and group nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub i32);

impl NodeId {
    /// Create a new NodeId with an explicit value.
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// The root group's ID (0).
    pub fn root() -> Self {
        Self(0)
    }

    /// Get the inner i32 value.
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl From<NodeId> for i32 {
    fn from(node_id: NodeId) -> Self {
        node_id.0
    }
}

/// Buffer number for audio buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufNum(pub i32);

impl BufNum {
    /// Create a new buffer number.
    pub fn new(num: i32) -> Self {
        Self(num)
    }

    /// Get the inner i32 value.
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl From<BufNum> for i32 {
    fn from(bufnum: BufNum) -> Self {
        bufnum.0
    }
}

/// Calculation rate of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CalculationRate {
    Audio,
    Control,
}

impl CalculationRate {
    /// Prefix used in map symbols such as `c3` or `a16`.
    pub fn map_prefix(self) -> char {
        match self {
            CalculationRate::Audio => 'a',
            CalculationRate::Control => 'c',
        }
    }
}

/// Rate of a synth definition parameter.
///
/// Scalar parameters are fixed at creation and never receive `/n_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParameterRate {
    Scalar,
    #[default]
    Control,
    Audio,
    Trigger,
}
