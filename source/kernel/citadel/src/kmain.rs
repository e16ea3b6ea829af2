// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel main routine responsible for bring-up after the arch shim
//! OWNERS: @core-team
//! PUBLIC API: kmain(hal, boot)
//! DEPENDS_ON: kernel::Kernel, selftest, diag
//! INVARIANTS: The kernel value lives on the boot stack; the arch trap vector
//!             drives Kernel::handle_event with this value for the machine's
//!             lifetime

use crate::boot::BootInfo;
use crate::hal::Platform;
use crate::kernel::Kernel;
use crate::trap::{Disposition, Event};

fn banner() {
    log_info!(target: "boot", "CITADEL core {} starting", env!("CARGO_PKG_VERSION"));
}

/// Kernel main, entered by the architecture shim once the heap window is
/// initialised and the trap vector is installed. Never returns; a failed
/// bring-up halts instead of limping onward.
pub fn kmain(hal: &'static dyn Platform, boot: &BootInfo<'_>) -> ! {
    banner();
    let mut kernel = match Kernel::new(hal, boot) {
        Ok(kernel) => kernel,
        Err(status) => {
            log_error!(target: "boot", "core bring-up failed: {}", status);
            hal.halt();
        }
    };

    #[cfg(feature = "selftest")]
    if let Err(reason) = crate::selftest::run(&mut kernel) {
        log_error!(target: "boot", "selftest failed: {}", reason);
        hal.halt();
    }

    log_info!(target: "boot", "entering idle loop");
    loop {
        // Prove the tick path end to end before sleeping, exactly as the
        // trap vector will drive it once interrupts are unmasked.
        match kernel.handle_event(Event::TimerTick) {
            Disposition::Resched => {
                let _ = kernel.reschedule();
            }
            Disposition::Panic { reason } => {
                log_error!(target: "boot", "fatal: {}", reason);
                hal.halt();
            }
            _ => {}
        }
        hal.idle();
    }
}
