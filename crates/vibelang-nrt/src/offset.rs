//! Timeline offsets and timespans.
//!
//! Offsets are seconds on the score's timeline. `+∞` marks entities that
//! never stop and `-∞` is the origin state that holds the bare root group.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, SessionError};

/// A totally ordered point on the timeline.
///
/// NaN is rejected at construction, which makes `Eq` and `Ord` sound.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Offset(f64);

impl Offset {
    /// The pre-timeline origin.
    pub const NEG_INFINITY: Offset = Offset(f64::NEG_INFINITY);
    /// Sentinel for "never stops".
    pub const INFINITY: Offset = Offset(f64::INFINITY);
    /// The start of the score.
    pub const ZERO: Offset = Offset(0.0);

    /// Create an offset, rejecting NaN.
    pub fn new(value: f64) -> Result<Self> {
        if value.is_nan() {
            return Err(SessionError::InvalidOffset(value));
        }
        // Collapse -0.0 so that equal offsets hash and compare identically.
        Ok(Self(value + 0.0))
    }

    /// Get the inner value in seconds.
    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Whether this offset is a finite point in time.
    pub fn is_finite(self) -> bool {
        self.0.is_finite()
    }

    /// Offset `duration` seconds later. Durations are never NaN here.
    pub(crate) fn after(self, duration: f64) -> Self {
        Self(self.0 + duration)
    }
}

impl Eq for Offset {}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<f64> for Offset {
    type Error = SessionError;

    fn try_from(value: f64) -> Result<Self> {
        Offset::new(value)
    }
}

impl From<Offset> for f64 {
    fn from(offset: Offset) -> Self {
        offset.0
    }
}

/// A half-open span `[start, stop)` on the timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timespan {
    pub start: Offset,
    pub stop: Offset,
}

impl Timespan {
    /// Create a timespan from raw seconds.
    pub fn new(start: f64, stop: f64) -> Result<Self> {
        Ok(Self {
            start: Offset::new(start)?,
            stop: Offset::new(stop)?,
        })
    }

    /// A timespan from `start` that never ends.
    pub fn starting_at(start: f64) -> Result<Self> {
        Self::new(start, f64::INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_rejects_nan() {
        assert!(Offset::new(f64::NAN).is_err());
        assert!(Offset::new(1.5).is_ok());
    }

    #[test]
    fn test_offset_ordering() {
        let mut offsets = vec![
            Offset::INFINITY,
            Offset::new(2.0).unwrap(),
            Offset::NEG_INFINITY,
            Offset::ZERO,
        ];
        offsets.sort();
        assert_eq!(
            offsets,
            vec![
                Offset::NEG_INFINITY,
                Offset::ZERO,
                Offset::new(2.0).unwrap(),
                Offset::INFINITY
            ]
        );
    }

    #[test]
    fn test_negative_zero_is_zero() {
        assert_eq!(Offset::new(-0.0).unwrap(), Offset::ZERO);
        assert_eq!(Offset::new(-0.0).unwrap().cmp(&Offset::ZERO), Ordering::Equal);
    }

    #[test]
    fn test_timespan_bounds() {
        let span = Timespan::new(1.0, 3.0).unwrap();
        assert_eq!(span.start, Offset::new(1.0).unwrap());
        assert_eq!(span.stop, Offset::new(3.0).unwrap());
        assert!(Timespan::new(f64::NAN, 1.0).is_err());

        let open = Timespan::starting_at(2.0).unwrap();
        assert_eq!(open.stop, Offset::INFINITY);
    }
}
