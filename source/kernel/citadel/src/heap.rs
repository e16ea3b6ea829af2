// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel heap bring-up for freestanding targets
//! OWNERS: @core-team
//! PUBLIC API: init(start, size)
//! DEPENDS_ON: linked_list_allocator
//! INVARIANTS: Initialised exactly once, before the first allocation

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hands the boot-reserved heap window to the allocator.
///
/// # Safety
/// `start..start + size` must be unused RAM, mapped writable, and must stay
/// reserved for the heap for the lifetime of the kernel.
#[cfg(target_os = "none")]
pub unsafe fn init(start: usize, size: usize) {
    unsafe { ALLOCATOR.lock().init(start as *mut u8, size) };
}

// Hosted builds get their allocator from the test harness.
#[cfg(not(target_os = "none"))]
pub unsafe fn init(_start: usize, _size: usize) {}
