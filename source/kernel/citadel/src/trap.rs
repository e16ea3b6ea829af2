// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Exception and interrupt demultiplexer tables
//! OWNERS: @core-team
//! PUBLIC API: Event, ExceptionKind, ExceptionContext, TrapTables, Disposition
//! DEPENDS_ON: types, spin (last-trap diagnostic slot)
//! INVARIANTS: One handler per exception type / IRQ vector; CORE faults are
//!             never recoverable

extern crate alloc;

use alloc::vec::Vec;

use spin::Mutex;

use crate::types::{DomainId, ThreadId, VirtAddr};

/// CPU fault classes the demultiplexer distinguishes. The set is
/// architecture-neutral; HAL backends fold their vector numbers into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    DivideError,
    Breakpoint,
    InvalidOpcode,
    GeneralProtection,
    PageFault,
    DoubleFault,
    AlignmentCheck,
    MachineCheck,
}

impl ExceptionKind {
    pub const COUNT: usize = 8;

    pub const fn index(self) -> usize {
        match self {
            Self::DivideError => 0,
            Self::Breakpoint => 1,
            Self::InvalidOpcode => 2,
            Self::GeneralProtection => 3,
            Self::PageFault => 4,
            Self::DoubleFault => 5,
            Self::AlignmentCheck => 6,
            Self::MachineCheck => 7,
        }
    }

    pub const fn describe(self) -> &'static str {
        match self {
            Self::DivideError => "DivideError",
            Self::Breakpoint => "Breakpoint",
            Self::InvalidOpcode => "InvalidOpcode",
            Self::GeneralProtection => "GeneralProtection",
            Self::PageFault => "PageFault",
            Self::DoubleFault => "DoubleFault",
            Self::AlignmentCheck => "AlignmentCheck",
            Self::MachineCheck => "MachineCheck",
        }
    }
}

/// Everything known about one CPU fault, resolved against the thread that
/// was on the CPU when it fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionContext {
    pub kind: ExceptionKind,
    pub domain: DomainId,
    pub thread: ThreadId,
    pub error_code: u64,
    pub fault_addr: Option<VirtAddr>,
}

/// CPU-originated events entering the single demux entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// A synchronous fault raised by the running thread.
    Fault { kind: ExceptionKind, error_code: u64, fault_addr: Option<VirtAddr> },
    /// An external interrupt line.
    Interrupt { vector: u32 },
    /// The scheduler tick.
    TimerTick,
    /// The syscall gate: number plus the four register arguments.
    Syscall { number: usize, args: [usize; 4] },
}

/// What the caller of the demux must do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Return to the interrupted context.
    Resume,
    /// Run the dispatcher before returning.
    Resched,
    /// A syscall completed; the glue writes `value` into the trap frame's
    /// return register.
    SyscallReturn { value: usize, resched: bool },
    /// The offending thread was terminated.
    ThreadTerminated { thread: ThreadId },
    /// Unrecoverable CORE fault: the boot glue must halt the machine.
    Panic { reason: &'static str },
}

/// Errors from handler installation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapError {
    /// Vector out of range.
    Invalid,
    /// A handler is already installed.
    Busy,
}

/// Handler for a CPU fault; returns true when the fault was repaired and the
/// thread may resume.
pub type ExceptionHandler = fn(&mut crate::kernel::Kernel, &ExceptionContext) -> bool;

/// Handler for an external interrupt vector.
pub type IrqHandler = fn(&mut crate::kernel::Kernel, u32);

/// Registration tables consulted by the kernel's demux.
pub struct TrapTables {
    exceptions: [Option<ExceptionHandler>; ExceptionKind::COUNT],
    irqs: Vec<Option<IrqHandler>>,
}

impl TrapTables {
    pub fn new(max_irqs: usize) -> Self {
        let mut irqs = Vec::with_capacity(max_irqs);
        irqs.resize_with(max_irqs, || None);
        Self { exceptions: [None; ExceptionKind::COUNT], irqs }
    }

    pub fn register_exception(
        &mut self,
        kind: ExceptionKind,
        handler: ExceptionHandler,
    ) -> Result<(), TrapError> {
        let slot = &mut self.exceptions[kind.index()];
        if slot.is_some() {
            return Err(TrapError::Busy);
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn exception_handler(&self, kind: ExceptionKind) -> Option<ExceptionHandler> {
        self.exceptions[kind.index()]
    }

    pub fn register_irq(&mut self, vector: u32, handler: IrqHandler) -> Result<(), TrapError> {
        let slot = self.irqs.get_mut(vector as usize).ok_or(TrapError::Invalid)?;
        if slot.is_some() {
            return Err(TrapError::Busy);
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn unregister_irq(&mut self, vector: u32) -> Result<(), TrapError> {
        let slot = self.irqs.get_mut(vector as usize).ok_or(TrapError::Invalid)?;
        if slot.take().is_none() {
            return Err(TrapError::Invalid);
        }
        Ok(())
    }

    pub fn irq_handler(&self, vector: u32) -> Option<IrqHandler> {
        self.irqs.get(vector as usize).and_then(|h| *h)
    }
}

static LAST_FAULT: Mutex<Option<ExceptionContext>> = Mutex::new(None);

/// Records the latest fault context for post-mortem inspection.
pub fn record(ctx: &ExceptionContext) {
    *LAST_FAULT.lock() = Some(*ctx);
}

/// Most recently recorded fault, if any.
pub fn last_fault() -> Option<ExceptionContext> {
    *LAST_FAULT.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_irq(_kernel: &mut crate::kernel::Kernel, _vector: u32) {}
    fn nop_exc(_kernel: &mut crate::kernel::Kernel, _ctx: &ExceptionContext) -> bool {
        true
    }

    #[test]
    fn single_registration_per_vector() {
        let mut tables = TrapTables::new(8);
        tables.register_irq(3, nop_irq).unwrap();
        assert_eq!(tables.register_irq(3, nop_irq), Err(TrapError::Busy));
        assert_eq!(tables.register_irq(64, nop_irq), Err(TrapError::Invalid));
        tables.unregister_irq(3).unwrap();
        assert_eq!(tables.unregister_irq(3), Err(TrapError::Invalid));
        tables.register_irq(3, nop_irq).unwrap();
    }

    #[test]
    fn exception_slots_are_per_kind() {
        let mut tables = TrapTables::new(1);
        tables.register_exception(ExceptionKind::PageFault, nop_exc).unwrap();
        assert!(tables.exception_handler(ExceptionKind::PageFault).is_some());
        assert!(tables.exception_handler(ExceptionKind::DivideError).is_none());
        assert_eq!(
            tables.register_exception(ExceptionKind::PageFault, nop_exc),
            Err(TrapError::Busy)
        );
    }

    #[test]
    fn fault_record_roundtrip() {
        let ctx = ExceptionContext {
            kind: ExceptionKind::GeneralProtection,
            domain: DomainId::from_raw(2),
            thread: ThreadId::from_raw(5),
            error_code: 0x10,
            fault_addr: Some(VirtAddr::new(0xdead_0000)),
        };
        // The diagnostic slot is process-wide and other tests fault too;
        // retry until our write is the one observed.
        for _ in 0..16 {
            record(&ctx);
            if last_fault() == Some(ctx) {
                return;
            }
        }
        panic!("fault record kept being overwritten");
    }
}
