//! Lock-free waiter registration list.
//!
//! Waiters are prepended with a CAS loop. Firing an event swings the head
//! to a sealed sentinel in one CAS; from then on every registration
//! attempt observes `Sealed` and falls back to immediate delivery. Each
//! node is freed exactly once, by whichever side unlinks it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::registry::Guid;

/// A registration frozen out of a sealed list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    pub(crate) target: Guid,
    pub(crate) slot: u32,
}

struct WaiterNode {
    target: Guid,
    slot: u32,
    next: *mut WaiterNode,
}

/// The list was already sealed; the caller must deliver the signal itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sealed;

/// Sentinel marking a fired list. Never dereferenced.
#[inline]
fn sealed() -> *mut WaiterNode {
    usize::MAX as *mut WaiterNode
}

pub(crate) struct WaiterList {
    head: AtomicPtr<WaiterNode>,
}

// SAFETY: nodes are only reachable through the atomic head, and ownership
// transfers atomically on push/seal.
unsafe impl Send for WaiterList {}
unsafe impl Sync for WaiterList {}

impl WaiterList {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Register a waiter. Fails with [`Sealed`] if the event already fired.
    pub(crate) fn push(&self, target: Guid, slot: u32) -> Result<(), Sealed> {
        let node = Box::into_raw(Box::new(WaiterNode {
            target,
            slot,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::SeqCst);
        loop {
            if head == sealed() {
                // SAFETY: the node was never published.
                drop(unsafe { Box::from_raw(node) });
                return Err(Sealed);
            }
            // SAFETY: node is still exclusively ours until the CAS below
            // publishes it.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange(head, node, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(current) => head = current,
            }
        }
    }

    /// Seal the list and return the frozen registrations, newest first.
    ///
    /// Returns `None` if the list was already sealed, which makes
    /// "fire at most once" structural for the caller.
    pub(crate) fn seal(&self) -> Option<Vec<Waiter>> {
        let mut head = self.head.load(Ordering::SeqCst);
        loop {
            if head == sealed() {
                return None;
            }
            match self
                .head
                .compare_exchange(head, sealed(), Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        let mut waiters = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            // SAFETY: the CAS above made this chain unreachable to other
            // threads; we own every node in it.
            let node = unsafe { Box::from_raw(cursor) };
            waiters.push(Waiter {
                target: node.target,
                slot: node.slot,
            });
            cursor = node.next;
        }
        Some(waiters)
    }

    /// Whether the list has been sealed.
    pub(crate) fn is_sealed(&self) -> bool {
        self.head.load(Ordering::SeqCst) == sealed()
    }
}

impl Drop for WaiterList {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        if cursor == sealed() {
            return;
        }
        while !cursor.is_null() {
            // SAFETY: &mut self means no concurrent access; the chain is ours.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next;
        }
    }
}
