//! A workpile: FIFO deque of ready task guids.
//!
//! The owner pushes and pops at the front-to-back FIFO ends; thieves take
//! from the back so they contend with the owner as little as possible.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::registry::Guid;
use crate::scheduler::WorkerId;

pub(crate) struct Workpile {
    inner: Mutex<VecDeque<Guid>>,
}

impl Workpile {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, task: Guid) {
        self.inner.lock().push_back(task);
    }

    /// Owner-side dequeue, oldest first.
    pub(crate) fn pop(&self, owner: WorkerId) -> Option<Guid> {
        let task = self.inner.lock().pop_front();
        if let Some(task) = task {
            tracing::trace!(worker = %owner, %task, "popped work");
        }
        task
    }

    /// Thief-side dequeue, newest first.
    pub(crate) fn steal(&self, thief: WorkerId) -> Option<Guid> {
        let task = self.inner.lock().pop_back();
        if let Some(task) = task {
            tracing::trace!(worker = %thief, %task, "stole work");
        }
        task
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
