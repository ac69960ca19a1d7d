//! Bus and buffer groups: members that need contiguous server ids.

use crate::entity::EntityId;
use crate::protocol::CalculationRate;

/// Membership of a bus or buffer in a contiguous block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    /// First member of the block.
    pub first: EntityId,
    /// Zero-based position of this member.
    pub position: u32,
    /// Number of members.
    pub count: u32,
}

/// Handles of `count` consecutive entities starting at `first`.
fn members(first: EntityId, count: u32) -> impl Iterator<Item = EntityId> {
    (0..count).map(move |position| EntityId(first.0 + position))
}

/// Buses of one rate allocated as a contiguous block.
///
/// Mapping a control to [`BusGroup::first`] reads the whole block on
/// multichannel inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusGroup {
    pub(crate) first: EntityId,
    pub(crate) count: u32,
    pub(crate) rate: CalculationRate,
}

impl BusGroup {
    /// The bus at `position`.
    pub fn bus(&self, position: u32) -> Option<EntityId> {
        (position < self.count).then(|| EntityId(self.first.0 + position))
    }

    /// The first bus, which stands for the whole group when mapped.
    pub fn first(&self) -> EntityId {
        self.first
    }

    pub fn buses(&self) -> impl Iterator<Item = EntityId> {
        members(self.first, self.count)
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn rate(&self) -> CalculationRate {
        self.rate
    }
}

/// Buffers sharing shape and lifetime, allocated as a contiguous block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferGroup {
    pub(crate) first: EntityId,
    pub(crate) count: u32,
}

impl BufferGroup {
    /// The buffer at `position`.
    pub fn buffer(&self, position: u32) -> Option<EntityId> {
        (position < self.count).then(|| EntityId(self.first.0 + position))
    }

    pub fn buffers(&self) -> impl Iterator<Item = EntityId> {
        members(self.first, self.count)
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
