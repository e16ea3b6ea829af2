// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Primitive newtypes shared by every core component
//! OWNERS: @core-team
//! PUBLIC API: PhysAddr, VirtAddr, FrameIndex, DomainId, ThreadId, CapId, CapHandle, Priority
//! DEPENDS_ON: mm::FRAME_SIZE
//! INVARIANTS: DomainId 0 is CORE; CapId 0 is the reserved invalid slot; no raw ids cross the ABI

use crate::mm::FRAME_SIZE;

/// Physical address.
///
/// **Ownership**: handed out by the frame allocator; never synthesised by
/// other components.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// True when the address sits on a frame boundary.
    #[inline]
    pub const fn frame_aligned(self) -> bool {
        self.0 % FRAME_SIZE == 0
    }

    /// Frame index of the frame containing this address.
    #[inline]
    pub const fn frame(self) -> FrameIndex {
        FrameIndex(self.0 / FRAME_SIZE)
    }

    #[inline]
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

/// Virtual address. The core treats these as opaque page-granular keys into
/// translation trees; canonicality is a per-architecture property enforced by
/// the HAL backend before addresses reach the core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn page_aligned(self) -> bool {
        self.0 % FRAME_SIZE == 0
    }

    #[inline]
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

/// Index of a physical frame inside the allocator window.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameIndex(pub usize);

impl FrameIndex {
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

/// Protection-domain identifier.
///
/// **Invariant**: id 0 names the CORE domain and is created during boot; it
/// is never exposed as a destroyable handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(u16);

impl DomainId {
    pub const CORE: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Thread identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    /// The CORE idle thread created during boot.
    pub const IDLE: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Capability identifier (slot index in the global capability table).
///
/// **Invariant**: slot 0 is reserved and never valid; a zero CapId therefore
/// doubles as "no capability" in audit records.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapId(u16);

impl CapId {
    pub const NONE: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Domain-scoped obfuscated capability handle.
///
/// The raw value is `MAC32 | domain16 | cap16`; construction and
/// verification live in `cap::handle` and require the per-domain secret.
/// Userspace only ever sees this token.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CapHandle(u64);

impl CapHandle {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Scheduling priority, 0..=4 with 4 reserved for realtime service threads.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Realtime = 4,
}

/// Number of distinct priorities (and ready queues).
pub const PRIORITY_LEVELS: usize = 5;

impl Priority {
    #[inline]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Realtime),
            _ => None,
        }
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_frame_rounding() {
        let addr = PhysAddr::new(3 * FRAME_SIZE + 17);
        assert!(!addr.frame_aligned());
        assert_eq!(addr.frame(), FrameIndex(3));
        assert!(PhysAddr::new(4 * FRAME_SIZE).frame_aligned());
    }

    #[test]
    fn priority_decode_window() {
        assert_eq!(Priority::from_raw(4), Some(Priority::Realtime));
        assert_eq!(Priority::from_raw(5), None);
        assert_eq!(Priority::Realtime.index(), 4);
    }
}
