//! Datablock storage allocation.
//!
//! The datablock module does not talk to `std::alloc` directly; it goes
//! through the [`Allocator`] trait so tests and embedders can substitute
//! their own storage policy.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::error::{Result, RuntimeError};

/// Alignment for datablock storage. Large enough for any payload the
/// runtime itself writes (u64 words).
const BLOCK_ALIGN: usize = 8;

/// Storage provider for datablocks.
///
/// `allocate` returns zeroed storage or `OutOfMemory`; `free` must be
/// called with the exact pointer and size returned by `allocate`.
pub trait Allocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from a prior `allocate(size)` on this allocator
    /// and must not be freed twice.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

/// Allocator backed by the global system allocator.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl SystemAllocator {
    #[inline]
    fn layout(size: usize) -> Result<Layout> {
        // Zero-sized datablocks still get a distinct allocation.
        Layout::from_size_align(size.max(1), BLOCK_ALIGN)
            .map_err(|_| RuntimeError::OutOfMemory)
    }
}

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(RuntimeError::OutOfMemory)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let layout = match Self::layout(size) {
            Ok(layout) => layout,
            // allocate() would have rejected this size.
            Err(_) => return,
        };
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

static SYSTEM: Lazy<Arc<SystemAllocator>> = Lazy::new(|| Arc::new(SystemAllocator));

/// The shared default allocator.
pub fn system_allocator() -> Arc<dyn Allocator> {
    SYSTEM.clone() as Arc<dyn Allocator>
}
