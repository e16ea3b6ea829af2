// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic hosted HAL for host builds and the unit-test suite
//! OWNERS: @core-team
//! PUBLIC API: HostMachine (advance/tlb_log/interrupts_enabled)
//! DEPENDS_ON: hal traits, types
//! INVARIANTS: No wall-clock time; the timestamp only moves through advance()

extern crate alloc;

use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::types::{PhysAddr, VirtAddr};

use super::{Barrier, ContextOps, Cpu, CpuContext, Entropy, IrqControl, Mmu, Timer, Tlb};

/// What the hosted TLB recorded, for assertions on the invalidation
/// discipline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlbOp {
    Page(VirtAddr),
    FlushAll,
}

/// Software machine backing host builds. The timestamp is a counter moved
/// explicitly by tests, the entropy stream is a splitmix64 sequence from the
/// construction seed, and TLB traffic is logged instead of executed.
pub struct HostMachine {
    now_ns: AtomicU64,
    irq_enabled: AtomicBool,
    rng_state: AtomicU64,
    page_root: Mutex<Option<PhysAddr>>,
    tlb_ops: Mutex<Vec<TlbOp>>,
}

impl HostMachine {
    pub fn new(seed: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(0),
            irq_enabled: AtomicBool::new(true),
            rng_state: AtomicU64::new(seed),
            page_root: Mutex::new(None),
            tlb_ops: Mutex::new(Vec::new()),
        }
    }

    /// Moves virtual time forward.
    pub fn advance(&self, delta_ns: u64) {
        self.now_ns.fetch_add(delta_ns, Ordering::Relaxed);
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Relaxed)
    }

    /// Drains the recorded TLB maintenance operations.
    pub fn take_tlb_ops(&self) -> Vec<TlbOp> {
        core::mem::take(&mut *self.tlb_ops.lock())
    }

    /// Currently installed translation root, if any.
    pub fn page_root(&self) -> Option<PhysAddr> {
        *self.page_root.lock()
    }
}

impl Cpu for HostMachine {
    fn halt(&self) -> ! {
        loop {
            self.idle();
        }
    }

    fn idle(&self) {
        core::hint::spin_loop();
    }

    fn current_privilege_level(&self) -> u8 {
        0
    }
}

impl Timer for HostMachine {
    fn timestamp(&self) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }
}

impl IrqControl for HostMachine {
    fn disable_interrupts(&self) -> bool {
        self.irq_enabled.swap(false, Ordering::Relaxed)
    }

    fn enable_interrupts(&self) {
        self.irq_enabled.store(true, Ordering::Relaxed);
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        self.irq_enabled.store(was_enabled, Ordering::Relaxed);
    }
}

impl Barrier for HostMachine {
    fn memory_barrier(&self) {
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    fn read_barrier(&self) {
        core::sync::atomic::fence(Ordering::Acquire);
    }

    fn write_barrier(&self) {
        core::sync::atomic::fence(Ordering::Release);
    }
}

impl Tlb for HostMachine {
    fn invalidate_page(&self, va: VirtAddr) {
        self.tlb_ops.lock().push(TlbOp::Page(va));
    }

    fn flush_all(&self) {
        self.tlb_ops.lock().push(TlbOp::FlushAll);
    }
}

impl Mmu for HostMachine {
    fn set_page_root(&self, root: PhysAddr) {
        *self.page_root.lock() = Some(root);
    }
}

impl ContextOps for HostMachine {
    fn context_init(&self, entry: VirtAddr, stack: VirtAddr) -> CpuContext {
        let mut ctx = CpuContext::ZERO;
        ctx.words_mut()[0] = entry.raw() as u64;
        ctx.words_mut()[1] = stack.raw() as u64;
        ctx
    }

    fn context_save(&self, _ctx: &mut CpuContext) {}

    fn context_restore(&self, _ctx: &CpuContext) {}

    fn context_switch(&self, from: &mut CpuContext, to: &CpuContext) {
        self.context_save(from);
        self.context_restore(to);
    }

    fn context_set_return(&self, ctx: &mut CpuContext, value: usize) {
        ctx.words_mut()[2] = value as u64;
    }

    fn context_return(&self, ctx: &CpuContext) -> usize {
        ctx.words()[2] as usize
    }
}

impl Entropy for HostMachine {
    fn entropy64(&self) -> u64 {
        // splitmix64; deterministic per seed so tests can pin handle values.
        let mut z = self.rng_state.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}
