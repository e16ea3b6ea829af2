// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical memory and translation-tree management
//! OWNERS: @core-mm-team
//! PUBLIC API: frame::{FrameAllocator, FrameKind, FrameError}, page_table::{AddressSpace, PagePerms}
//! DEPENDS_ON: types, hal::Tlb
//! INVARIANTS: Every in-use frame has exactly one owner; page-table nodes live
//!             in frames owned by the same domain as the tree

pub mod frame;
pub mod page_table;

pub use frame::{FrameAllocator, FrameError, FrameKind, FrameState};
pub use page_table::{AddressSpace, MapKind, PagePerms, PageTableError};

/// Size of a physical frame and of a virtual page, in bytes.
pub const FRAME_SIZE: usize = 4096;

/// Fan-out of every translation-table level.
pub const TABLE_ENTRIES: usize = 512;

/// Source of physical frames for a specific owner. The page-table manager
/// allocates its intermediate nodes through this seam so quota accounting can
/// be layered on by the kernel without the tree code knowing about domains.
pub trait FrameSource {
    fn alloc(&mut self, count: usize, kind: FrameKind) -> Result<crate::types::PhysAddr, FrameError>;
    fn free(&mut self, base: crate::types::PhysAddr, count: usize) -> Result<(), FrameError>;
}

#[cfg(test)]
mod tests;
