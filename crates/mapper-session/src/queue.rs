//! Insertion-ordered sets of entity handles backing the intent queues.

use mapper_core::EntityHandle;
use std::collections::{BTreeMap, HashMap};

/// A set of handles that iterates in the order they were first queued.
///
/// Membership, insertion and removal do not scan the queue.
#[derive(Debug, Clone, Default)]
pub(crate) struct HandleQueue {
    next: u64,
    positions: HashMap<EntityHandle, u64>,
    order: BTreeMap<u64, EntityHandle>,
}

impl HandleQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue `handle` at the back. Returns `false` if it was already queued.
    pub(crate) fn push(&mut self, handle: EntityHandle) -> bool {
        if self.positions.contains_key(&handle) {
            return false;
        }
        let seq = self.next;
        self.next += 1;
        self.positions.insert(handle, seq);
        self.order.insert(seq, handle);
        true
    }

    pub(crate) fn remove(&mut self, handle: EntityHandle) -> bool {
        match self.positions.remove(&handle) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, handle: EntityHandle) -> bool {
        self.positions.contains_key(&handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.positions.len()
    }

    pub(crate) fn clear(&mut self) {
        self.positions.clear();
        self.order.clear();
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.order.values().copied()
    }

    /// Snapshot of the queue, for walking it while it changes.
    pub(crate) fn to_vec(&self) -> Vec<EntityHandle> {
        self.iter().collect()
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(EntityHandle) -> bool) {
        let positions = &mut self.positions;
        self.order.retain(|_, handle| {
            let kept = keep(*handle);
            if !kept {
                positions.remove(handle);
            }
            kept
        });
    }
}

impl FromIterator<EntityHandle> for HandleQueue {
    fn from_iter<I: IntoIterator<Item = EntityHandle>>(iter: I) -> Self {
        let mut queue = Self::new();
        for handle in iter {
            queue.push(handle);
        }
        queue
    }
}
