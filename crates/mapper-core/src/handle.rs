//! Entity handles.

use std::fmt;

/// A reference to an entity managed by one unit of work.
///
/// Handles are cheap to copy and compare. Two handles are equal exactly when
/// they denote the same in-memory entity, so handle equality is reference
/// identity. Each handle also records the session that issued it; a handle
/// presented to a different unit of work is rejected as "not managed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle {
    session: u32,
    index: u32,
}

impl EntityHandle {
    /// Create a handle for slot `index` of session `session`.
    pub const fn new(session: u32, index: u32) -> Self {
        Self { session, index }
    }

    /// The session that issued this handle.
    pub const fn session(&self) -> u32 {
        self.session
    }

    /// The arena slot this handle points at.
    pub const fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.session)
    }
}
