//! Scoped edit context.

use std::ops::{Deref, DerefMut};

use crate::offset::Offset;
use crate::session::Session;

/// An open moment on a session.
///
/// Every offset-dependent edit made through the guard lands at its offset.
/// Dropping the guard closes the moment and propagates its edits forward.
/// Moments nest: `moment.at(t)` opens an inner one that wins until dropped.
pub struct Moment<'a> {
    session: &'a mut Session,
    offset: Offset,
}

impl<'a> Moment<'a> {
    pub(crate) fn new(session: &'a mut Session, offset: Offset) -> Self {
        Self { session, offset }
    }

    /// The offset this moment edits at.
    pub fn offset(&self) -> f64 {
        self.offset.as_f64()
    }
}

impl Deref for Moment<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for Moment<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for Moment<'_> {
    fn drop(&mut self) {
        log::trace!("[SESSION] Closing moment at {}", self.offset);
        self.session.exit_moment();
    }
}
