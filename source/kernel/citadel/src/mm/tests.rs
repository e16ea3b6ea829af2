// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Cross-cutting memory-manager tests (allocator + trees together)
//! OWNERS: @core-mm-team
//! NOTE: Tests only. Deterministic stress mixes and property tests that
//!       hammer the allocator invariants harder than the per-file units.
//!
//! TEST_SCOPE:
//!   - P1: free xor in-use per frame; counters always consistent
//!   - alloc/free round trips restore the exact allocator state
//!   - page tables and data frames share one allocator without interference
//!
//! TEST_SCENARIOS:
//!   - alloc_free_roundtrip_prop(): arbitrary alloc sizes come back losslessly
//!   - state_machine_stress_allocator_invariants(): 2000-step deterministic mix
//!   - trees_and_data_share_the_window(): tree teardown releases exactly its nodes

use alloc::vec::Vec;

use proptest::prelude::*;

use crate::hal::host::HostMachine;
use crate::types::{DomainId, PhysAddr, VirtAddr};

use super::frame::{FrameAllocator, OwnerFrames};
use super::page_table::{AddressSpace, MapKind, PagePerms};
use super::testutil::leak_window;
use super::{FrameKind, FRAME_SIZE};

const D1: DomainId = DomainId::from_raw(1);

fn allocator(frames: usize) -> FrameAllocator {
    let mut pmm = FrameAllocator::new(PhysAddr::new(0x4000_0000), frames);
    pmm.add_region(PhysAddr::new(0x4000_0000), frames * FRAME_SIZE).unwrap();
    pmm
}

proptest! {
    #[test]
    fn alloc_free_roundtrip_prop(sizes in proptest::collection::vec(1usize..6, 1..12)) {
        let mut pmm = allocator(128);
        let before = pmm.stats();
        let mut live: Vec<(PhysAddr, usize)> = Vec::new();
        for size in sizes {
            if let Ok(base) = pmm.alloc_frames(D1, size, FrameKind::Application) {
                live.push((base, size));
            }
            pmm.verify().unwrap();
        }
        for (base, size) in live.into_iter().rev() {
            pmm.free_frames(base, size).unwrap();
            pmm.verify().unwrap();
        }
        prop_assert_eq!(pmm.stats(), before);
    }

    #[test]
    fn first_fit_is_lowest_index(hole in 1usize..6, tail in 1usize..6) {
        let mut pmm = allocator(64);
        let first = pmm.alloc_frames(D1, hole, FrameKind::Application).unwrap();
        let _second = pmm.alloc_frames(D1, tail, FrameKind::Application).unwrap();
        pmm.free_frames(first, hole).unwrap();
        // A request no larger than the hole lands exactly in the hole.
        let again = pmm.alloc_frames(D1, hole, FrameKind::Application).unwrap();
        prop_assert_eq!(again, first);
    }
}

#[test]
fn state_machine_stress_allocator_invariants() {
    // Deterministic stress mix (NOT a fuzzer framework): mutate the
    // allocator through its whole surface and assert invariants each step so
    // accidental regressions show up in host `cargo test`.
    fn next_u64(state: &mut u64) -> u64 {
        // xorshift64*
        let mut x = *state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        *state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    let mut pmm = allocator(96);
    let mut seed: u64 = 0x434F_5245_504D_4D31; // "COREPMM1"
    let mut live: Vec<(PhysAddr, usize)> = Vec::new();

    for _step in 0..2_000u32 {
        let r = next_u64(&mut seed);
        match r % 5 {
            // allocate a small run for a rotating owner
            0 | 1 => {
                let count = 1 + (r as usize >> 8) % 4;
                let owner = DomainId::from_raw(1 + ((r >> 16) % 3) as u16);
                if let Ok(base) = pmm.alloc_frames(owner, count, FrameKind::Application) {
                    live.push((base, count));
                }
            }
            // free the oldest live run
            2 => {
                if !live.is_empty() {
                    let (base, count) = live.remove(0);
                    pmm.free_frames(base, count).unwrap();
                }
            }
            // double-free attempt must stay loud and harmless
            3 => {
                if let Some((base, count)) = live.last().copied() {
                    pmm.free_frames(base, count).unwrap();
                    live.pop();
                    assert_eq!(pmm.free_frames(base, count).unwrap_err(), super::FrameError::Invalid);
                }
            }
            // shared refcount cycle
            _ => {
                if let Some((base, count)) = live.first().copied() {
                    pmm.add_ref(base, count).unwrap();
                    pmm.free_frames(base, count).unwrap();
                }
            }
        }
        pmm.verify().unwrap();
        let stats = pmm.stats();
        assert_eq!(stats.free + stats.used, stats.total);
    }
}

#[test]
fn trees_and_data_share_the_window() {
    let base = leak_window(64);
    let mut pmm = FrameAllocator::new(base, 64);
    pmm.add_region(base, 64 * FRAME_SIZE).unwrap();
    let hal = HostMachine::new(0);

    let data = pmm.alloc_frames(D1, 4, FrameKind::Shared).unwrap();
    let baseline = pmm.stats();

    let mut src = OwnerFrames { pmm: &mut pmm, owner: D1 };
    let mut space = AddressSpace::create(&mut src, D1).unwrap();
    space
        .map(
            &mut src,
            VirtAddr::new(0x5000_0000),
            data,
            4 * FRAME_SIZE,
            PagePerms::READ | PagePerms::WRITE,
            MapKind::User,
            &hal,
        )
        .unwrap();
    // Root + three intermediates on top of the data frames.
    assert_eq!(src.pmm.stats().used, baseline.used + 4);
    for page in 0..4 {
        let va = VirtAddr::new(0x5000_0000 + page * FRAME_SIZE);
        assert_eq!(
            space.translate(va),
            Some(PhysAddr::new(data.raw() + page * FRAME_SIZE))
        );
    }
    let freed = space.destroy(&mut src);
    assert_eq!(freed, 4);
    // Tree teardown releases only table nodes; the data survives.
    assert_eq!(pmm.stats(), baseline);
    assert_eq!(pmm.frame_info(data).map(|r| r.kind), Some(FrameKind::Shared));
    pmm.verify().unwrap();
}
