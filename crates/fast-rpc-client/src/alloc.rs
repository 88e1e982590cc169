//! Allocation of request ids on one connection.

use std::collections::HashSet;

use fast_proto::MsgId;
use fast_proto::msg::MSG_ID_MAX;

/// A per-connection allocator of request ids.
///
/// Ids are issued from a monotonically advancing counter, wrapping
/// from 2^31 - 1 back to 1 and skipping any id that is still claimed.
/// The id stays claimed until [`release`](IdAllocator::release), after
/// which it may be issued again.
pub(crate) struct IdAllocator {
    /// The next candidate id.  Always in 1..=[`MSG_ID_MAX`].
    next: u32,
    /// Every id currently claimed.
    live: HashSet<MsgId>,
}

impl IdAllocator {
    /// Make a new allocator with no ids claimed.
    pub(crate) fn new() -> Self {
        IdAllocator {
            next: 1,
            live: HashSet::new(),
        }
    }

    /// Claim and return an id not currently in use.
    ///
    /// Returns None if every id is claimed.  (With 2^31 - 1 ids that
    /// would take a while, but the caller must not loop on it.)
    pub(crate) fn alloc(&mut self) -> Option<MsgId> {
        if self.live.len() >= MSG_ID_MAX as usize {
            return None;
        }
        loop {
            let candidate =
                MsgId::new(self.next).expect("candidate outside 1..=MSG_ID_MAX somehow");
            self.next = if self.next == MSG_ID_MAX {
                1
            } else {
                self.next + 1
            };
            if self.live.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    /// Return `id` to the pool.
    ///
    /// Releasing an id that is not claimed is a no-op.
    pub(crate) fn release(&mut self, id: MsgId) {
        self.live.remove(&id);
    }
}
