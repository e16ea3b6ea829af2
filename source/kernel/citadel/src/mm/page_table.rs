// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Four-level translation trees stored in PMM frames
//! OWNERS: @core-mm-team
//! PUBLIC API: AddressSpace (create/map/unmap/set_perm/translate/destroy/switch_to), PagePerms
//! DEPENDS_ON: mm::{FrameSource, FRAME_SIZE, TABLE_ENTRIES}, hal::{Tlb, Mmu}
//! INVARIANTS: Table nodes are frames of kind PageTable owned by the tree's
//!             domain; intermediate nodes are never shared between trees;
//!             narrowing or removing a live mapping invalidates the TLB first

extern crate alloc;

use alloc::vec::Vec;
use core::marker::PhantomData;

use bitflags::bitflags;

use crate::hal::{Mmu, Tlb};
use crate::types::{DomainId, PhysAddr, VirtAddr};

use super::{FrameError, FrameKind, FrameSource, FRAME_SIZE, TABLE_ENTRIES};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Permission bits carried by leaf entries.
    pub struct PagePerms: u64 {
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXEC = 1 << 3;
        const USER = 1 << 4;
    }
}

const PRESENT: u64 = 1 << 0;
const FLAG_BITS: u64 = 0xFFF;
const ADDR_MASK: u64 = !FLAG_BITS;

/// Depth of the translation tree.
const LEVELS: usize = 4;

/// Mapping flavour: `Identity` keeps the supervisor-only view used for core
/// regions, `User` adds the user-accessible bit on every leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapKind {
    Identity,
    User,
}

/// Errors produced while editing a translation tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageTableError {
    /// Address or length not page-granular, or empty range.
    Unaligned,
    /// A frame for an intermediate table could not be allocated. The tree is
    /// rolled back to its pre-call state before this is returned.
    NoMemory,
    /// An operation required an existing mapping that is not there.
    NotMapped,
}

impl From<FrameError> for PageTableError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::NoMemory => Self::NoMemory,
            FrameError::Overlap | FrameError::Invalid => Self::Unaligned,
        }
    }
}

#[repr(align(4096))]
struct TableNode {
    entries: [u64; TABLE_ENTRIES],
}

/// Returns the entry index for `va` at `level` (0 = root).
#[inline]
fn index_at(va: usize, level: usize) -> usize {
    (va >> (12 + 9 * (LEVELS - 1 - level))) & (TABLE_ENTRIES - 1)
}

/// # Safety
/// `addr` must be a live frame previously allocated as a table node of this
/// tree; exclusivity follows from `AddressSpace` being `!Send + !Sync` and
/// trees never sharing nodes.
unsafe fn node_mut<'a>(addr: PhysAddr) -> &'a mut TableNode {
    unsafe { &mut *(addr.raw() as *mut TableNode) }
}

unsafe fn node_ref<'a>(addr: PhysAddr) -> &'a TableNode {
    unsafe { &*(addr.raw() as *const TableNode) }
}

/// One domain's translation tree. The value is only a (root, owner) pair;
/// all state lives in the frames themselves, exactly as the hardware walker
/// sees it.
pub struct AddressSpace {
    root: PhysAddr,
    owner: DomainId,
    // Tree mutation is single-context; the core runs one CPU at a time.
    _not_send_sync: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(AddressSpace: Send, Sync);

impl AddressSpace {
    /// Allocates a zeroed root table owned by `owner`.
    pub fn create(frames: &mut dyn FrameSource, owner: DomainId) -> Result<Self, PageTableError> {
        let root = alloc_node(frames)?;
        Ok(Self { root, owner, _not_send_sync: PhantomData })
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn owner(&self) -> DomainId {
        self.owner
    }

    /// Installs this tree as the live address space.
    pub fn switch_to(&self, mmu: &(impl Mmu + ?Sized)) {
        mmu.set_page_root(self.root);
    }

    /// Maps `[virt, virt + size)` onto `[phys, phys + size)` with `perms`.
    /// Existing mappings in the range are silently replaced (the old
    /// translation is invalidated). On intermediate-table exhaustion the
    /// whole call unwinds and the tree is left as it was.
    pub fn map(
        &mut self,
        frames: &mut dyn FrameSource,
        virt: VirtAddr,
        phys: PhysAddr,
        size: usize,
        perms: PagePerms,
        kind: MapKind,
        tlb: &(impl Tlb + ?Sized),
    ) -> Result<(), PageTableError> {
        if !virt.page_aligned() || !phys.frame_aligned() || size == 0 {
            return Err(PageTableError::Unaligned);
        }
        let pages = size.div_ceil(FRAME_SIZE);
        let effective = match kind {
            MapKind::Identity => perms.difference(PagePerms::USER),
            MapKind::User => perms.union(PagePerms::USER),
        };

        // Undo journal: entry overwrites and nodes born in this call.
        let mut touched: Vec<(PhysAddr, usize, u64)> = Vec::new();
        let mut born: Vec<(PhysAddr, usize, PhysAddr)> = Vec::new();

        for page in 0..pages {
            let va = virt.raw() + page * FRAME_SIZE;
            let pa = phys.raw() + page * FRAME_SIZE;
            match self.map_one(frames, va, pa, effective, &mut touched, &mut born) {
                Ok(prev_present) => {
                    if prev_present {
                        tlb.invalidate_page(VirtAddr::new(va));
                    }
                }
                Err(err) => {
                    self.rollback(frames, touched, born);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn map_one(
        &mut self,
        frames: &mut dyn FrameSource,
        va: usize,
        pa: usize,
        perms: PagePerms,
        touched: &mut Vec<(PhysAddr, usize, u64)>,
        born: &mut Vec<(PhysAddr, usize, PhysAddr)>,
    ) -> Result<bool, PageTableError> {
        let mut table = self.root;
        for level in 0..LEVELS - 1 {
            let index = index_at(va, level);
            // SAFETY: `table` is a node of this tree (root or reached through
            // PRESENT intermediate entries we wrote ourselves).
            let entry = unsafe { node_mut(table) }.entries[index];
            if entry & PRESENT != 0 {
                table = PhysAddr::new((entry & ADDR_MASK) as usize);
                continue;
            }
            let child = alloc_node(frames)?;
            unsafe { node_mut(table) }.entries[index] = child.raw() as u64 | PRESENT;
            born.push((table, index, child));
            table = child;
        }
        let index = index_at(va, LEVELS - 1);
        let leaf = unsafe { node_mut(table) };
        let prev = leaf.entries[index];
        touched.push((table, index, prev));
        leaf.entries[index] = pa as u64 | perms.bits() | PRESENT;
        Ok(prev & PRESENT != 0)
    }

    fn rollback(
        &mut self,
        frames: &mut dyn FrameSource,
        touched: Vec<(PhysAddr, usize, u64)>,
        born: Vec<(PhysAddr, usize, PhysAddr)>,
    ) {
        for (node, index, prev) in touched.into_iter().rev() {
            // SAFETY: journal entries name nodes that are still part of the
            // tree; this-call children are unlinked below, after restoration.
            unsafe { node_mut(node) }.entries[index] = prev;
        }
        for (parent, index, child) in born.into_iter().rev() {
            unsafe { node_mut(parent) }.entries[index] = 0;
            // A node allocated by the failed call can hold nothing the tree
            // still references.
            let _ = frames.free(child, 1);
        }
    }

    /// Clears every leaf entry in the range and invalidates each page.
    /// Intermediate tables are left allocated; reclamation happens only at
    /// `destroy`.
    pub fn unmap(
        &mut self,
        virt: VirtAddr,
        size: usize,
        tlb: &(impl Tlb + ?Sized),
    ) -> Result<(), PageTableError> {
        if !virt.page_aligned() || size == 0 {
            return Err(PageTableError::Unaligned);
        }
        let pages = size.div_ceil(FRAME_SIZE);
        for page in 0..pages {
            let va = virt.raw() + page * FRAME_SIZE;
            if let Some((node, index)) = self.walk_leaf(va) {
                // SAFETY: walk_leaf only returns nodes of this tree.
                let leaf = unsafe { node_mut(node) };
                if leaf.entries[index] & PRESENT != 0 {
                    leaf.entries[index] = 0;
                    tlb.invalidate_page(VirtAddr::new(va));
                }
            }
        }
        Ok(())
    }

    /// Replaces the permission bits on every mapped page in the range,
    /// preserving the present bit and target frame. The whole range must be
    /// mapped; nothing changes otherwise. Ends with a full flush, which
    /// covers narrowing in one shot.
    pub fn set_perm(
        &mut self,
        virt: VirtAddr,
        size: usize,
        perms: PagePerms,
        tlb: &(impl Tlb + ?Sized),
    ) -> Result<(), PageTableError> {
        if !virt.page_aligned() || size == 0 {
            return Err(PageTableError::Unaligned);
        }
        let pages = size.div_ceil(FRAME_SIZE);
        // Validate first so a partial range never half-applies.
        for page in 0..pages {
            let va = virt.raw() + page * FRAME_SIZE;
            let mapped = self
                .walk_leaf(va)
                .map(|(node, index)| unsafe { node_ref(node) }.entries[index] & PRESENT != 0)
                .unwrap_or(false);
            if !mapped {
                return Err(PageTableError::NotMapped);
            }
        }
        for page in 0..pages {
            let va = virt.raw() + page * FRAME_SIZE;
            let (node, index) = match self.walk_leaf(va) {
                Some(found) => found,
                None => return Err(PageTableError::NotMapped),
            };
            let leaf = unsafe { node_mut(node) };
            let entry = leaf.entries[index];
            leaf.entries[index] = (entry & ADDR_MASK) | perms.bits() | PRESENT;
        }
        tlb.flush_all();
        Ok(())
    }

    /// Pure translation of `virt` through the tree.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let (node, index) = self.walk_leaf(virt.raw() & !(FRAME_SIZE - 1))?;
        // SAFETY: walk_leaf only returns nodes of this tree.
        let entry = unsafe { node_ref(node) }.entries[index];
        if entry & PRESENT == 0 {
            return None;
        }
        let base = (entry & ADDR_MASK) as usize;
        Some(PhysAddr::new(base | (virt.raw() & (FRAME_SIZE - 1))))
    }

    /// Leaf permissions at `virt`, if mapped.
    pub fn leaf_perms(&self, virt: VirtAddr) -> Option<PagePerms> {
        let (node, index) = self.walk_leaf(virt.raw())?;
        let entry = unsafe { node_ref(node) }.entries[index];
        if entry & PRESENT == 0 {
            return None;
        }
        Some(PagePerms::from_bits_truncate(entry & FLAG_BITS))
    }

    /// Finds the leaf node and index covering `va`, without requiring the
    /// final entry to be present.
    fn walk_leaf(&self, va: usize) -> Option<(PhysAddr, usize)> {
        let mut table = self.root;
        for level in 0..LEVELS - 1 {
            let index = index_at(va, level);
            // SAFETY: `table` is a node of this tree.
            let entry = unsafe { node_ref(table) }.entries[index];
            if entry & PRESENT == 0 {
                return None;
            }
            table = PhysAddr::new((entry & ADDR_MASK) as usize);
        }
        Some((table, index_at(va, LEVELS - 1)))
    }

    /// Post-order teardown: frees every table node, then the root, returning
    /// how many table frames went back. Mapped target frames are not
    /// touched; their lifetime belongs to the owning domain's allocations.
    pub fn destroy(self, frames: &mut dyn FrameSource) -> usize {
        fn drop_level(frames: &mut dyn FrameSource, node: PhysAddr, level: usize) -> usize {
            let mut freed = 0;
            if level < LEVELS - 1 {
                for index in 0..TABLE_ENTRIES {
                    // SAFETY: `node` is a live table node of the tree being
                    // destroyed; children are unique to it.
                    let entry = unsafe { node_ref(node) }.entries[index];
                    if entry & PRESENT != 0 {
                        freed +=
                            drop_level(frames, PhysAddr::new((entry & ADDR_MASK) as usize), level + 1);
                    }
                }
            }
            if frames.free(node, 1).is_ok() {
                freed += 1;
            }
            freed
        }
        drop_level(frames, self.root, 0)
    }

    /// Structural check: intermediate entries never carry permission bits
    /// and every present leaf targets a frame-aligned base.
    pub fn verify(&self) -> Result<(), &'static str> {
        fn walk(node: PhysAddr, level: usize) -> Result<(), &'static str> {
            for index in 0..TABLE_ENTRIES {
                // SAFETY: nodes reachable from the root belong to this tree.
                let entry = unsafe { node_ref(node) }.entries[index];
                if entry & PRESENT == 0 {
                    if entry != 0 {
                        return Err("pt: nonzero entry without PRESENT");
                    }
                    continue;
                }
                if level < LEVELS - 1 {
                    if entry & PagePerms::all().bits() != 0 {
                        return Err("pt: intermediate entry carries perms");
                    }
                    walk(PhysAddr::new((entry & ADDR_MASK) as usize), level + 1)?;
                } else if (entry & ADDR_MASK) as usize % FRAME_SIZE != 0 {
                    return Err("pt: leaf target misaligned");
                }
            }
            Ok(())
        }
        walk(self.root, 0)
    }
}

fn alloc_node(frames: &mut dyn FrameSource) -> Result<PhysAddr, PageTableError> {
    let addr = frames.alloc(1, FrameKind::PageTable)?;
    // SAFETY: the frame was just allocated for this tree and is unreferenced.
    unsafe { core::ptr::write_bytes(addr.raw() as *mut u8, 0, FRAME_SIZE) };
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::host::{HostMachine, TlbOp};
    use crate::mm::frame::{FrameAllocator, OwnerFrames};
    use crate::mm::testutil::leak_window;

    fn fixture(frames: usize) -> (FrameAllocator, HostMachine) {
        let base = leak_window(frames);
        let mut pmm = FrameAllocator::new(base, frames);
        pmm.add_region(base, frames * FRAME_SIZE).unwrap();
        (pmm, HostMachine::new(0))
    }

    const D1: DomainId = DomainId::from_raw(1);

    #[test]
    fn map_translate_unmap_roundtrip() {
        let (mut pmm, hal) = fixture(32);
        let data = pmm.alloc_frames(D1, 2, FrameKind::Application).unwrap();
        let mut src = OwnerFrames { pmm: &mut pmm, owner: D1 };
        let mut space = AddressSpace::create(&mut src, D1).unwrap();
        let va = VirtAddr::new(0x4000_0000);
        space
            .map(&mut src, va, data, 2 * FRAME_SIZE, PagePerms::READ | PagePerms::WRITE, MapKind::User, &hal)
            .unwrap();
        assert_eq!(space.translate(VirtAddr::new(va.raw() + 0x17)), Some(PhysAddr::new(data.raw() + 0x17)));
        assert_eq!(
            space.translate(VirtAddr::new(va.raw() + FRAME_SIZE)),
            Some(PhysAddr::new(data.raw() + FRAME_SIZE))
        );
        assert!(space.leaf_perms(va).unwrap().contains(PagePerms::USER));

        space.unmap(va, 2 * FRAME_SIZE, &hal).unwrap();
        for page in 0..2 {
            assert_eq!(space.translate(VirtAddr::new(va.raw() + page * FRAME_SIZE)), None);
        }
        // One invalidation per removed page.
        let ops = hal.take_tlb_ops();
        assert!(ops.contains(&TlbOp::Page(va)));
        assert!(ops.contains(&TlbOp::Page(VirtAddr::new(va.raw() + FRAME_SIZE))));
        space.destroy(&mut src);
        pmm.verify().unwrap();
    }

    #[test]
    fn destroy_returns_every_table_frame() {
        let (mut pmm, hal) = fixture(32);
        let before = pmm.stats();
        let data = pmm.alloc_frames(D1, 1, FrameKind::Application).unwrap();
        let mut src = OwnerFrames { pmm: &mut pmm, owner: D1 };
        let mut space = AddressSpace::create(&mut src, D1).unwrap();
        // Two distant pages force two distinct intermediate chains.
        space
            .map(&mut src, VirtAddr::new(0x1000), data, FRAME_SIZE, PagePerms::READ, MapKind::Identity, &hal)
            .unwrap();
        space
            .map(
                &mut src,
                VirtAddr::new(0x7F00_0000_0000),
                data,
                FRAME_SIZE,
                PagePerms::READ,
                MapKind::Identity,
                &hal,
            )
            .unwrap();
        space.destroy(&mut src);
        pmm.free_frames(data, 1).unwrap();
        assert_eq!(pmm.stats(), before);
    }

    #[test]
    fn map_failure_rolls_back_to_initial_state() {
        // Window sized so the root and first chain fit but a second distant
        // mapping runs out of table frames mid-way: 7 = data + root + three
        // intermediates + two spare.
        let (mut pmm, hal) = fixture(7);
        let data = pmm.alloc_frames(D1, 1, FrameKind::Application).unwrap();
        let mut src = OwnerFrames { pmm: &mut pmm, owner: D1 };
        let mut space = AddressSpace::create(&mut src, D1).unwrap();
        let va = VirtAddr::new(0x4000_0000);
        space
            .map(&mut src, va, data, FRAME_SIZE, PagePerms::READ, MapKind::User, &hal)
            .unwrap();
        let used_before = src.pmm.stats().used;
        // A far-away address needs three fresh intermediates; only two frames
        // remain.
        let err = space
            .map(
                &mut src,
                VirtAddr::new(0x7F00_0000_0000),
                data,
                FRAME_SIZE,
                PagePerms::READ,
                MapKind::User,
                &hal,
            )
            .unwrap_err();
        assert_eq!(err, PageTableError::NoMemory);
        assert_eq!(src.pmm.stats().used, used_before);
        assert_eq!(space.translate(va), Some(data));
        assert_eq!(space.translate(VirtAddr::new(0x7F00_0000_0000)), None);
        space.destroy(&mut src);
        pmm.verify().unwrap();
    }

    #[test]
    fn set_perm_narrows_and_flushes() {
        let (mut pmm, hal) = fixture(32);
        let data = pmm.alloc_frames(D1, 1, FrameKind::Application).unwrap();
        let mut src = OwnerFrames { pmm: &mut pmm, owner: D1 };
        let mut space = AddressSpace::create(&mut src, D1).unwrap();
        let va = VirtAddr::new(0x4000_0000);
        space
            .map(&mut src, va, data, FRAME_SIZE, PagePerms::READ | PagePerms::WRITE, MapKind::User, &hal)
            .unwrap();
        hal.take_tlb_ops();
        space.set_perm(va, FRAME_SIZE, PagePerms::READ | PagePerms::USER, &hal).unwrap();
        assert_eq!(space.leaf_perms(va), Some(PagePerms::READ | PagePerms::USER));
        assert_eq!(space.translate(va), Some(data));
        assert_eq!(hal.take_tlb_ops(), &[TlbOp::FlushAll]);
        // Partially unmapped ranges are rejected whole.
        assert_eq!(
            space.set_perm(va, 2 * FRAME_SIZE, PagePerms::READ, &hal),
            Err(PageTableError::NotMapped)
        );
        space.destroy(&mut src);
    }

    #[test]
    fn overwrite_invalidates_old_translation() {
        let (mut pmm, hal) = fixture(32);
        let a = pmm.alloc_frames(D1, 1, FrameKind::Application).unwrap();
        let b = pmm.alloc_frames(D1, 1, FrameKind::Application).unwrap();
        let mut src = OwnerFrames { pmm: &mut pmm, owner: D1 };
        let mut space = AddressSpace::create(&mut src, D1).unwrap();
        let va = VirtAddr::new(0x2000_0000);
        space.map(&mut src, va, a, FRAME_SIZE, PagePerms::READ, MapKind::User, &hal).unwrap();
        hal.take_tlb_ops();
        // Remap without an intervening unmap is the documented contract.
        space.map(&mut src, va, b, FRAME_SIZE, PagePerms::READ, MapKind::User, &hal).unwrap();
        assert_eq!(space.translate(va), Some(b));
        assert_eq!(hal.take_tlb_ops(), &[TlbOp::Page(va)]);
        space.destroy(&mut src);
    }

    #[test]
    fn identity_mappings_never_carry_user() {
        let (mut pmm, hal) = fixture(32);
        let data = pmm.alloc_frames(DomainId::CORE, 1, FrameKind::Core).unwrap();
        let mut src = OwnerFrames { pmm: &mut pmm, owner: DomainId::CORE };
        let mut space = AddressSpace::create(&mut src, DomainId::CORE).unwrap();
        let va = VirtAddr::new(data.raw());
        space
            .map(
                &mut src,
                va,
                data,
                FRAME_SIZE,
                PagePerms::READ | PagePerms::WRITE | PagePerms::USER,
                MapKind::Identity,
                &hal,
            )
            .unwrap();
        assert!(!space.leaf_perms(va).unwrap().contains(PagePerms::USER));
        space.verify().unwrap();
        space.destroy(&mut src);
    }
}
