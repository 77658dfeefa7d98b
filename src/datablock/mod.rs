//! Datablocks: refcounted storage with deferred destruction.
//!
//! A datablock tracks which tasks currently use it, split into external
//! acquires (explicit API calls) and internal acquires (taken by the
//! runtime on a task's behalf when a dependence delivers the block).
//! `request_free` never destroys a block out from under a user; the last
//! release performs the destruction.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{Result, RuntimeError};
use crate::memory::Allocator;
use crate::registry::{Guid, Registry};


struct BlockState {
    /// Acquires still outstanding, internal ones included.
    users: u32,
    /// The subset of `users` acquired internally by the runtime.
    internal_users: u32,
    free_requested: bool,
    destroyed: bool,
    /// Guids currently holding the block; bounded by `capacity`.
    tracker: SmallVec<[Guid; 8]>,
    capacity: usize,
}

pub struct Datablock {
    guid: Guid,
    size: usize,
    ptr: NonNull<u8>,
    allocator: Arc<dyn Allocator>,
    state: Mutex<BlockState>,
}

// SAFETY: the backing storage is only handed out as a raw pointer; all
// bookkeeping is behind the mutex.
unsafe impl Send for Datablock {}
unsafe impl Sync for Datablock {}

impl Datablock {
    pub(crate) fn new(
        guid: Guid,
        size: usize,
        ptr: NonNull<u8>,
        allocator: Arc<dyn Allocator>,
        capacity: usize,
    ) -> Self {
        Self {
            guid,
            size,
            ptr,
            allocator,
            state: Mutex::new(BlockState {
                users: 0,
                internal_users: 0,
                free_requested: false,
                destroyed: false,
                tracker: SmallVec::new(),
                capacity,
            }),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Acquire the block for `requester` and return the backing pointer.
    ///
    /// Every requester is tracked, internal or not, and re-acquires by an
    /// already-tracked requester are idempotent. Fails with
    /// `AccessDenied` once a free was requested, and with
    /// `CapacityExceeded` when the tracker is full.
    pub fn acquire(&self, requester: Guid, internal: bool) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        if state.free_requested {
            return Err(RuntimeError::AccessDenied);
        }
        if state.tracker.contains(&requester) {
            return Ok(self.ptr);
        }
        if state.tracker.len() >= state.capacity {
            return Err(RuntimeError::CapacityExceeded);
        }
        state.tracker.push(requester);
        state.users += 1;
        if internal {
            state.internal_users += 1;
        }
        tracing::trace!(
            block = %self.guid,
            %requester,
            internal,
            users = state.users,
            internal_users = state.internal_users,
            "datablock acquired"
        );
        Ok(self.ptr)
    }

    /// Release one hold on the block. Destroys the block if this was the
    /// last hold and a free is pending.
    pub fn release(&self, registry: &Registry, requester: Guid, internal: bool) -> Result<()> {
        let destroy = {
            let mut state = self.state.lock();
            match state.tracker.iter().position(|&g| g == requester) {
                Some(pos) => {
                    state.tracker.swap_remove(pos);
                    state.users -= 1;
                    if internal {
                        state.internal_users = state.internal_users.saturating_sub(1);
                    }
                }
                // The runtime may re-release a block the task already
                // released itself; that extra release is benign.
                None if internal => {
                    state.internal_users = state.internal_users.saturating_sub(1);
                }
                None => return Err(RuntimeError::AccessDenied),
            }
            tracing::trace!(
                block = %self.guid,
                %requester,
                internal,
                users = state.users,
                internal_users = state.internal_users,
                "datablock released"
            );
            self.ready_to_destroy(&mut state)
        };
        if destroy {
            self.destruct(registry)?;
        }
        Ok(())
    }

    /// Mark the block for destruction. If `requester` currently holds the
    /// block, this routes through its release; otherwise the block is
    /// destroyed as soon as all holds drain (immediately if none remain).
    pub fn request_free(&self, registry: &Registry, requester: Guid) -> Result<()> {
        let (route_release, destroy) = {
            let mut state = self.state.lock();
            if state.free_requested {
                return Err(RuntimeError::AlreadyRequested);
            }
            state.free_requested = true;
            tracing::debug!(block = %self.guid, %requester, "datablock free requested");
            if state.tracker.contains(&requester) {
                (true, false)
            } else {
                (false, self.ready_to_destroy(&mut state))
            }
        };
        if route_release {
            return self.release(registry, requester, false);
        }
        if destroy {
            self.destruct(registry)?;
        }
        Ok(())
    }

    fn ready_to_destroy(&self, state: &mut BlockState) -> bool {
        if state.users == 0 && state.internal_users == 0 && state.free_requested && !state.destroyed
        {
            state.destroyed = true;
            true
        } else {
            false
        }
    }

    fn destruct(&self, registry: &Registry) -> Result<()> {
        tracing::debug!(block = %self.guid, size = self.size, "datablock destroyed");
        // SAFETY: ptr/size came from this allocator at construction, and
        // `destroyed` guarantees we get here once.
        unsafe { self.allocator.free(self.ptr, self.size) };
        registry.release(self.guid)
    }
}

impl fmt::Debug for Datablock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datablock")
            .field("guid", &self.guid)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
