// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time sanity checks run against the live kernel state
//! OWNERS: @core-team
//! PUBLIC API: run(kernel)
//! DEPENDS_ON: kernel::Kernel surface (crate-internal cleanup helpers)
//! INVARIANTS: Leaves the kernel exactly as it found it; failure is fatal to boot

use crate::cap::{CapKind, Rights};
use crate::domain::{DomainKind, Quota, Resource};
use crate::kernel::Kernel;
use crate::mm::FRAME_SIZE;
use crate::syscall::Status;
use crate::types::{Priority, VirtAddr};

/// Runs the bring-up sanity suite. The boot glue halts on any failure: a
/// core that cannot pass its own checks must not schedule anything.
pub fn run(kernel: &mut Kernel) -> Result<(), &'static str> {
    structural(kernel)?;
    domain_lifecycle(kernel)?;
    capability_path(kernel)?;
    structural(kernel)?;
    log_info!(target: "selftest", "all boot selftests passed");
    Ok(())
}

fn structural(kernel: &Kernel) -> Result<(), &'static str> {
    kernel.verify()
}

fn scratch_quota() -> Quota {
    Quota { max_frames: 4, max_threads: 2, max_caps: 4, cpu_percent: 10 }
}

fn domain_lifecycle(kernel: &mut Kernel) -> Result<(), &'static str> {
    let core = kernel.core_domain();
    let domain = kernel
        .domain_create(DomainKind::Application, Some(core), scratch_quota(), 0)
        .map_err(|_| "selftest: domain create failed")?;
    let thread = kernel
        .thread_create(domain, VirtAddr::new(0x1000), VirtAddr::new(0x2000), Priority::Low, 0)
        .map_err(|_| "selftest: thread create failed")?;
    if kernel.domain_destroy(domain, 0) != Err(Status::Busy) {
        return Err("selftest: destroy of a live domain must be busy");
    }
    kernel.thread_destroy(thread, 0).map_err(|_| "selftest: thread destroy failed")?;
    kernel.domain_suspend(domain, 0).map_err(|_| "selftest: suspend failed")?;
    kernel.domain_destroy(domain, 0).map_err(|_| "selftest: domain destroy failed")?;
    Ok(())
}

fn capability_path(kernel: &mut Kernel) -> Result<(), &'static str> {
    let core = kernel.core_domain();
    let domain = kernel
        .domain_create(DomainKind::Application, Some(core), scratch_quota(), 0)
        .map_err(|_| "selftest: domain create failed")?;
    let handle = kernel
        .shmem_alloc(domain, 1, Rights::READ | Rights::WRITE, 0)
        .map_err(|_| "selftest: shmem alloc failed")?;
    let cap = kernel
        .authenticate(domain, handle, Rights::READ)
        .map_err(|_| "selftest: owner handle must verify")?;
    let (base, len) = match kernel.caps.resolve_kind(cap) {
        Ok(CapKind::Memory { base, len }) => (base, len),
        _ => return Err("selftest: shmem cap must resolve to memory"),
    };

    let narrowed = kernel
        .cap_derive(domain, handle, Rights::READ, 0)
        .map_err(|_| "selftest: derive failed")?;
    if kernel.authenticate(domain, narrowed, Rights::WRITE) != Err(Status::Permission) {
        return Err("selftest: narrowed handle must not write");
    }
    if kernel.cap_revoke(domain, handle, 0) != Ok(2) {
        return Err("selftest: revoke must cover the derivation tree");
    }
    if kernel.authenticate(domain, narrowed, Rights::empty()) != Err(Status::CapRevoked) {
        return Err("selftest: revoked handle must stay dead");
    }

    // Cleanup: release the revoked slots, hand the scratch frames back and
    // tear the scratch domain down.
    for owned in kernel.caps.owned_by(domain) {
        let _ = kernel.caps.release(owned);
    }
    let frames = len / FRAME_SIZE;
    kernel.pmm.free_frames(base, frames).map_err(|_| "selftest: scratch free failed")?;
    kernel.domains.uncharge(domain, Resource::Frames, frames);
    kernel.domain_suspend(domain, 0).map_err(|_| "selftest: suspend failed")?;
    kernel.domain_destroy(domain, 0).map_err(|_| "selftest: cleanup destroy failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{BootInfo, DebugPort, MemoryRegion, MemoryRegionKind, BOOT_MAGIC, BOOT_VERSION};
    use crate::hal::host::HostMachine;
    use crate::mm::testutil::leak_window;

    use alloc::boxed::Box;

    #[test]
    fn selftests_pass_and_leave_no_residue() {
        let hal: &'static HostMachine = Box::leak(Box::new(HostMachine::new(0xC0FE)));
        let base = leak_window(128);
        let map: &'static [MemoryRegion] = Box::leak(Box::new([MemoryRegion {
            base,
            len: 128 * FRAME_SIZE,
            kind: MemoryRegionKind::Usable,
        }]));
        let info = BootInfo {
            magic: BOOT_MAGIC,
            version: BOOT_VERSION,
            memory_map: map,
            cmdline: "",
            modules: &[],
            debug_port: DebugPort::default(),
            config_blob: &[],
        };
        let mut kernel = Kernel::new(hal, &info).unwrap();
        let used_before = kernel.pmm.stats().used;
        run(&mut kernel).unwrap();
        // Scratch domains, threads, caps and frames are all gone again.
        assert_eq!(kernel.pmm.stats().used, used_before);
        run(&mut kernel).unwrap();
    }
}
