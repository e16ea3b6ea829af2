// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware abstraction layer traits consumed by the core
//! OWNERS: @core-team
//! PUBLIC API: Cpu, Timer, IrqControl, Barrier, Tlb, Mmu, ContextOps, Entropy, PortIo, Platform
//! DEPENDS_ON: types::{PhysAddr, VirtAddr}
//! INVARIANTS: The core never names an architecture; backends implement these traits out of tree

use crate::types::{PhysAddr, VirtAddr};

pub mod host;

/// Basic CPU control.
pub trait Cpu {
    /// Stops the CPU permanently. Only the fatal path calls this.
    fn halt(&self) -> !;
    /// Relaxes the CPU until the next event (WFI/HLT class instruction).
    fn idle(&self);
    /// Current privilege level, 0 = most privileged.
    fn current_privilege_level(&self) -> u8;
}

/// Monotonic timestamp source.
pub trait Timer {
    /// Returns the current time in nanoseconds since boot.
    fn timestamp(&self) -> u64;
}

/// Interrupt masking primitive protecting every core critical section.
pub trait IrqControl {
    /// Masks interrupts and returns whether they were previously enabled.
    fn disable_interrupts(&self) -> bool;
    /// Unmasks interrupts.
    fn enable_interrupts(&self);
    /// Restores the state captured by [`IrqControl::disable_interrupts`].
    fn restore_interrupts(&self, was_enabled: bool);
}

/// Memory ordering barriers.
pub trait Barrier {
    fn memory_barrier(&self);
    fn read_barrier(&self);
    fn write_barrier(&self);
}

/// Translation-cache maintenance.
pub trait Tlb {
    /// Invalidates the cached translation for a single page.
    fn invalidate_page(&self, va: VirtAddr);
    /// Flushes the entire translation cache.
    fn flush_all(&self);
}

/// Translation-root control. Installing a root is the only way the live
/// address space changes.
pub trait Mmu {
    fn set_page_root(&self, root: PhysAddr);
}

/// Saved execution state of a thread. The layout is owned by the HAL
/// backend; the core stores and moves these blobs without inspecting them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuContext {
    words: [u64; 32],
}

impl CpuContext {
    pub const ZERO: Self = Self { words: [0; 32] };

    /// Raw access for backends. The core itself never calls this.
    #[inline]
    pub fn words_mut(&mut self) -> &mut [u64; 32] {
        &mut self.words
    }

    #[inline]
    pub fn words(&self) -> &[u64; 32] {
        &self.words
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Architecture context management.
pub trait ContextOps {
    /// Builds a fresh context that will start executing at `entry` with the
    /// stack pointer set to `stack`.
    fn context_init(&self, entry: VirtAddr, stack: VirtAddr) -> CpuContext;
    /// Saves the live register state into `ctx`.
    fn context_save(&self, ctx: &mut CpuContext);
    /// Restores `ctx` as the live register state.
    fn context_restore(&self, ctx: &CpuContext);
    /// Atomically saves into `from` and restores `to`.
    fn context_switch(&self, from: &mut CpuContext, to: &CpuContext);
    /// Writes the syscall return register of a saved context. The core uses
    /// this to deliver a status to a thread that is not on the CPU (crash
    /// returns).
    fn context_set_return(&self, ctx: &mut CpuContext, value: usize);
    /// Reads the syscall return register of a saved context.
    fn context_return(&self, ctx: &CpuContext) -> usize;
}

/// Entropy used to seed per-domain handle keys. Hardware backends wire this
/// to a platform RNG; the hosted backend derives a deterministic stream.
pub trait Entropy {
    fn entropy64(&self) -> u64;
}

/// Port-mapped I/O, present only on platforms that need it.
pub trait PortIo {
    /// # Safety
    /// Port access bypasses the memory model entirely; callers must name a
    /// port that is safe to touch on the running platform.
    unsafe fn io_in8(&self, port: u16) -> u8;
    unsafe fn io_out8(&self, port: u16, value: u8);
    unsafe fn io_in16(&self, port: u16) -> u16;
    unsafe fn io_out16(&self, port: u16, value: u16);
    unsafe fn io_in32(&self, port: u16) -> u32;
    unsafe fn io_out32(&self, port: u16, value: u32);
}

/// Everything the core needs from a platform, as one object-safe bundle.
pub trait Platform:
    Cpu + Timer + IrqControl + Barrier + Tlb + Mmu + ContextOps + Entropy + Sync
{
}

impl<T> Platform for T where
    T: Cpu + Timer + IrqControl + Barrier + Tlb + Mmu + ContextOps + Entropy + Sync
{
}

/// RAII interrupt-masked critical section.
///
/// Every mutation of core state happens inside one of these; nesting is fine
/// because the previous mask state is restored, not unconditionally enabled.
pub struct IrqGuard<'a, I: IrqControl + ?Sized> {
    irq: &'a I,
    was_enabled: bool,
}

impl<'a, I: IrqControl + ?Sized> IrqGuard<'a, I> {
    pub fn enter(irq: &'a I) -> Self {
        let was_enabled = irq.disable_interrupts();
        Self { irq, was_enabled }
    }
}

impl<I: IrqControl + ?Sized> Drop for IrqGuard<'_, I> {
    fn drop(&mut self) {
        self.irq.restore_interrupts(self.was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::host::HostMachine;
    use super::*;

    #[test]
    fn irq_guard_restores_previous_state() {
        let hal = HostMachine::new(0);
        assert!(hal.disable_interrupts());
        {
            let _inner = IrqGuard::enter(&hal);
            // Nested guard sees interrupts already masked.
            assert!(!hal.interrupts_enabled());
        }
        // Outer mask is still in force after the inner guard dropped.
        assert!(!hal.interrupts_enabled());
        hal.restore_interrupts(true);
        assert!(hal.interrupts_enabled());
    }
}
