// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bitmap physical frame allocator with per-frame ownership
//! OWNERS: @core-mm-team
//! PUBLIC API: FrameAllocator (add_region/alloc_frames/free_frames/mark_used/frame_info)
//! DEPENDS_ON: types::{PhysAddr, DomainId}
//! INVARIANTS: First-fit, frame-aligned, fixed bitmap; free xor in-use per
//!             managed frame; in-use implies owner set and refcount >= 1

extern crate alloc;

use alloc::vec::Vec;

use crate::types::{DomainId, PhysAddr};

use super::FRAME_SIZE;

/// Purpose tag carried by every allocated frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Core,
    Privileged,
    Application,
    Shared,
    Device,
    PageTable,
}

/// Allocation state of a frame inside the window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// Not covered by any registered region.
    Unavailable,
    Free,
    /// Pinned by an early-boot reservation.
    Reserved,
    InUse,
}

/// Side-table record for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRecord {
    pub state: FrameState,
    pub kind: FrameKind,
    pub owner: DomainId,
    pub refcount: u32,
}

impl FrameRecord {
    const fn vacant(state: FrameState) -> Self {
        Self { state, kind: FrameKind::Core, owner: DomainId::CORE, refcount: 0 }
    }
}

/// Errors produced by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Region intersects one registered earlier.
    Overlap,
    /// No run of free frames long enough.
    NoMemory,
    /// Address outside the window, misaligned, zero count, or a bit that is
    /// not in the expected state (double free is never silent).
    Invalid,
}

/// Counters snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
}

/// Plain [`super::FrameSource`] drawing frames for a fixed owner with no
/// quota layer. The kernel wraps this with quota charging; early boot and
/// tests use it directly.
pub struct OwnerFrames<'a> {
    pub pmm: &'a mut FrameAllocator,
    pub owner: DomainId,
}

impl super::FrameSource for OwnerFrames<'_> {
    fn alloc(&mut self, count: usize, kind: FrameKind) -> Result<PhysAddr, FrameError> {
        self.pmm.alloc_frames(self.owner, count, kind)
    }

    fn free(&mut self, base: PhysAddr, count: usize) -> Result<(), FrameError> {
        self.pmm.free_frames(base, count)
    }
}

/// Bitmap allocator over a fixed window of physical frames.
///
/// A set bit means "not allocatable" (in use, reserved, or never added);
/// `add_region` clears bits, `alloc_frames`/`mark_used` set them. The bitmap
/// never grows after construction.
pub struct FrameAllocator {
    base_frame: usize,
    frame_count: usize,
    bitmap: Vec<u64>,
    records: Vec<FrameRecord>,
    regions: Vec<(usize, usize)>, // [start, end) frame indices, window-relative
    stats: FrameStats,
}

impl FrameAllocator {
    /// Creates an allocator covering `frame_count` frames starting at the
    /// frame containing `window_base`. Every frame starts unavailable.
    pub fn new(window_base: PhysAddr, frame_count: usize) -> Self {
        let words = frame_count.div_ceil(64);
        let mut bitmap = Vec::with_capacity(words);
        bitmap.resize(words, u64::MAX);
        let mut records = Vec::with_capacity(frame_count);
        records.resize(frame_count, FrameRecord::vacant(FrameState::Unavailable));
        Self {
            base_frame: window_base.raw() / FRAME_SIZE,
            frame_count,
            bitmap,
            records,
            regions: Vec::new(),
            stats: FrameStats::default(),
        }
    }

    #[inline]
    fn bit(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    #[inline]
    fn set_bit(&mut self, frame: usize) {
        self.bitmap[frame / 64] |= 1 << (frame % 64);
    }

    #[inline]
    fn clear_bit(&mut self, frame: usize) {
        self.bitmap[frame / 64] &= !(1 << (frame % 64));
    }

    /// Window-relative frame index for `addr`, if inside the window.
    fn index_of(&self, addr: PhysAddr) -> Option<usize> {
        let frame = addr.raw() / FRAME_SIZE;
        frame.checked_sub(self.base_frame).filter(|idx| *idx < self.frame_count)
    }

    fn addr_of(&self, index: usize) -> PhysAddr {
        PhysAddr::new((self.base_frame + index) * FRAME_SIZE)
    }

    /// Registers a usable RAM region. `base` is aligned up and the end of the
    /// region aligned down to frame boundaries; the part extending past the
    /// bitmap window is silently dropped.
    pub fn add_region(&mut self, base: PhysAddr, size: usize) -> Result<(), FrameError> {
        let start_addr = base.raw().checked_add(FRAME_SIZE - 1).ok_or(FrameError::Invalid)?
            & !(FRAME_SIZE - 1);
        let end_addr = base.raw().checked_add(size).ok_or(FrameError::Invalid)? & !(FRAME_SIZE - 1);
        if end_addr <= start_addr {
            return Err(FrameError::Invalid);
        }
        let start = match (start_addr / FRAME_SIZE).checked_sub(self.base_frame) {
            Some(idx) => idx,
            None => return Err(FrameError::Invalid),
        };
        let end = (end_addr / FRAME_SIZE - self.base_frame).min(self.frame_count);
        if start >= self.frame_count {
            return Err(FrameError::Invalid);
        }
        for &(rs, re) in &self.regions {
            if start < re && rs < end {
                return Err(FrameError::Overlap);
            }
        }
        for frame in start..end {
            self.clear_bit(frame);
            self.records[frame] = FrameRecord::vacant(FrameState::Free);
        }
        self.regions.push((start, end));
        let added = end - start;
        self.stats.total += added;
        self.stats.free += added;
        log_debug!(target: "pmm", "region added: frames {}..{} ({} total)", start, end, self.stats.total);
        Ok(())
    }

    /// Allocates the first (lowest-index) run of `count` consecutive free
    /// frames, stamping owner and kind. First-fit is part of the contract so
    /// allocation patterns are reproducible.
    pub fn alloc_frames(
        &mut self,
        owner: DomainId,
        count: usize,
        kind: FrameKind,
    ) -> Result<PhysAddr, FrameError> {
        if count == 0 {
            return Err(FrameError::Invalid);
        }
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for frame in 0..self.frame_count {
            if self.bit(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set_bit(f);
                    self.records[f] =
                        FrameRecord { state: FrameState::InUse, kind, owner, refcount: 1 };
                }
                self.stats.free -= count;
                self.stats.used += count;
                let addr = self.addr_of(run_start);
                log_debug!(target: "pmm", "alloc {} frame(s) at {:#x} for domain {}", count, addr.raw(), owner.raw());
                return Ok(addr);
            }
        }
        log_warn!(target: "pmm", "out of frames: wanted {} ({} free)", count, self.stats.free);
        Err(FrameError::NoMemory)
    }

    /// Releases one reference on each frame in the range. Frames drop back to
    /// free when the last reference goes; a frame that is not currently
    /// allocated fails the whole call with `Invalid` before anything changes.
    pub fn free_frames(&mut self, base: PhysAddr, count: usize) -> Result<(), FrameError> {
        if count == 0 || !base.frame_aligned() {
            return Err(FrameError::Invalid);
        }
        let start = self.index_of(base).ok_or(FrameError::Invalid)?;
        if start + count > self.frame_count {
            return Err(FrameError::Invalid);
        }
        for frame in start..start + count {
            if !self.bit(frame) || self.records[frame].state != FrameState::InUse {
                return Err(FrameError::Invalid);
            }
        }
        for frame in start..start + count {
            let record = &mut self.records[frame];
            record.refcount -= 1;
            if record.refcount == 0 {
                *record = FrameRecord::vacant(FrameState::Free);
                self.clear_bit(frame);
                self.stats.free += 1;
                self.stats.used -= 1;
            }
        }
        Ok(())
    }

    /// Adds a reference to each frame in an allocated range (shared
    /// mappings). Fails with `Invalid` if any frame is not in use.
    pub fn add_ref(&mut self, base: PhysAddr, count: usize) -> Result<(), FrameError> {
        if count == 0 || !base.frame_aligned() {
            return Err(FrameError::Invalid);
        }
        let start = self.index_of(base).ok_or(FrameError::Invalid)?;
        if start + count > self.frame_count {
            return Err(FrameError::Invalid);
        }
        for frame in start..start + count {
            if self.records[frame].state != FrameState::InUse {
                return Err(FrameError::Invalid);
            }
        }
        for frame in start..start + count {
            self.records[frame].refcount += 1;
        }
        Ok(())
    }

    /// Forces the frames covering `[base, base + size)` to the reserved
    /// state. Used for early-boot carve-outs; idempotent.
    pub fn mark_used(&mut self, base: PhysAddr, size: usize) {
        let start_addr = base.raw() & !(FRAME_SIZE - 1);
        let end_addr = match base.raw().checked_add(size) {
            Some(end) => (end + FRAME_SIZE - 1) & !(FRAME_SIZE - 1),
            None => return,
        };
        for addr in (start_addr..end_addr).step_by(FRAME_SIZE) {
            let Some(frame) = self.index_of(PhysAddr::new(addr)) else { continue };
            if self.records[frame].state == FrameState::Free {
                self.set_bit(frame);
                self.records[frame] = FrameRecord {
                    state: FrameState::Reserved,
                    kind: FrameKind::Core,
                    owner: DomainId::CORE,
                    refcount: 1,
                };
                self.stats.free -= 1;
                self.stats.used += 1;
            }
        }
    }

    /// Side-table record for the frame containing `addr`.
    pub fn frame_info(&self, addr: PhysAddr) -> Option<FrameRecord> {
        self.index_of(addr).map(|frame| self.records[frame])
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Checks the bitmap/side-table/counter agreement. Cheap enough to run
    /// from tests and from the fatal path before halting.
    pub fn verify(&self) -> Result<(), &'static str> {
        let mut free = 0usize;
        let mut used = 0usize;
        for frame in 0..self.frame_count {
            let record = self.records[frame];
            match record.state {
                FrameState::Unavailable => {
                    if !self.bit(frame) {
                        return Err("pmm: unavailable frame with clear bit");
                    }
                }
                FrameState::Free => {
                    if self.bit(frame) {
                        return Err("pmm: free frame with set bit");
                    }
                    free += 1;
                }
                FrameState::Reserved | FrameState::InUse => {
                    if !self.bit(frame) {
                        return Err("pmm: allocated frame with clear bit");
                    }
                    if record.refcount == 0 {
                        return Err("pmm: allocated frame with zero refcount");
                    }
                    used += 1;
                }
            }
        }
        if free != self.stats.free || used != self.stats.used {
            return Err("pmm: counter drift");
        }
        if free + used != self.stats.total {
            return Err("pmm: total drift");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with(frames: usize) -> FrameAllocator {
        let mut pmm = FrameAllocator::new(PhysAddr::new(0x8000_0000), frames);
        pmm.add_region(PhysAddr::new(0x8000_0000), frames * FRAME_SIZE).unwrap();
        pmm
    }

    #[test]
    fn alloc_then_free_is_identity() {
        let mut pmm = allocator_with(16);
        let before = pmm.stats();
        let addr = pmm.alloc_frames(DomainId::from_raw(1), 3, FrameKind::Application).unwrap();
        assert_eq!(pmm.stats().used, 3);
        pmm.free_frames(addr, 3).unwrap();
        assert_eq!(pmm.stats(), before);
        pmm.verify().unwrap();
    }

    #[test]
    fn first_fit_reuses_smallest_freed_run() {
        let mut pmm = allocator_with(16);
        let base = pmm.alloc_frames(DomainId::from_raw(1), 3, FrameKind::Application).unwrap();
        // Free the middle frame of the run.
        let middle = PhysAddr::new(base.raw() + FRAME_SIZE);
        pmm.free_frames(middle, 1).unwrap();
        // A 2-frame request cannot use the 1-frame hole; it lands right after
        // the original run. A 1-frame request takes the hole.
        let two = pmm.alloc_frames(DomainId::from_raw(1), 2, FrameKind::Application).unwrap();
        assert_eq!(two.raw(), base.raw() + 3 * FRAME_SIZE);
        let one = pmm.alloc_frames(DomainId::from_raw(1), 1, FrameKind::Application).unwrap();
        assert_eq!(one, middle);
    }

    #[test]
    fn double_free_is_loud() {
        let mut pmm = allocator_with(8);
        let addr = pmm.alloc_frames(DomainId::from_raw(2), 2, FrameKind::Shared).unwrap();
        pmm.free_frames(addr, 2).unwrap();
        assert_eq!(pmm.free_frames(addr, 2), Err(FrameError::Invalid));
    }

    #[test]
    fn overlap_rejected_and_truncation_silent() {
        let mut pmm = FrameAllocator::new(PhysAddr::new(0x8000_0000), 8);
        pmm.add_region(PhysAddr::new(0x8000_0000), 4 * FRAME_SIZE).unwrap();
        assert_eq!(
            pmm.add_region(PhysAddr::new(0x8000_0000 + 2 * FRAME_SIZE), 4 * FRAME_SIZE),
            Err(FrameError::Overlap)
        );
        // Region extending beyond the 8-frame window is clipped to it.
        pmm.add_region(PhysAddr::new(0x8000_0000 + 4 * FRAME_SIZE), 64 * FRAME_SIZE).unwrap();
        assert_eq!(pmm.stats().total, 8);
    }

    #[test]
    fn unaligned_region_is_trimmed_to_whole_frames() {
        let mut pmm = FrameAllocator::new(PhysAddr::new(0x8000_0000), 8);
        pmm.add_region(PhysAddr::new(0x8000_0000 + 10), 3 * FRAME_SIZE).unwrap();
        // Base aligned up, end aligned down: only two whole frames remain.
        assert_eq!(pmm.stats().total, 2);
    }

    #[test]
    fn mark_used_is_idempotent() {
        let mut pmm = allocator_with(8);
        pmm.mark_used(PhysAddr::new(0x8000_0000), 2 * FRAME_SIZE);
        let after_first = pmm.stats();
        pmm.mark_used(PhysAddr::new(0x8000_0000), 2 * FRAME_SIZE);
        assert_eq!(pmm.stats(), after_first);
        assert_eq!(
            pmm.frame_info(PhysAddr::new(0x8000_0000)).map(|r| r.state),
            Some(FrameState::Reserved)
        );
        pmm.verify().unwrap();
    }

    #[test]
    fn shared_frames_survive_one_release() {
        let mut pmm = allocator_with(8);
        let addr = pmm.alloc_frames(DomainId::from_raw(1), 1, FrameKind::Shared).unwrap();
        pmm.add_ref(addr, 1).unwrap();
        pmm.free_frames(addr, 1).unwrap();
        assert_eq!(pmm.frame_info(addr).map(|r| r.state), Some(FrameState::InUse));
        pmm.free_frames(addr, 1).unwrap();
        assert_eq!(pmm.frame_info(addr).map(|r| r.state), Some(FrameState::Free));
        pmm.verify().unwrap();
    }
}
