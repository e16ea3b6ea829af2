// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Root kernel state value and the cross-component operations
//! OWNERS: @core-team
//! PUBLIC API: Kernel (new/handle_event/reschedule plus the syscall backends)
//! DEPENDS_ON: every other core module, hal::Platform
//! INVARIANTS: All mutation happens on `&mut self` inside an interrupts-masked
//!             section; audit entries land before an operation returns

extern crate alloc;

use crate::audit::{AuditEvent, AuditLog};
use crate::boot::BootInfo;
use crate::cap::{CapKind, CapTable, Rights};
use crate::config::Config;
use crate::diag;
use crate::domain::{ChargedFrames, DomainKind, DomainState, DomainTable, Quota, Resource};
use crate::hal::{IrqGuard, Platform};
use crate::ipc::{CallFrame, SwitchStack};
use crate::mm::{
    FrameAllocator, FrameKind, MapKind, PagePerms, FRAME_SIZE,
};
use crate::sched::{BlockReason, Scheduler, Switch, ThreadState, WakeReason};
use crate::syscall::{self, api, Status, SysResult, SyscallTable};
use crate::trap::{self, Disposition, Event, ExceptionContext, TrapTables};
use crate::types::{CapHandle, CapId, DomainId, Priority, ThreadId, VirtAddr};

/// Entries retained by the audit ring.
const AUDIT_CAPACITY: usize = 1024;
/// Safety-net timeout for blocked threads swept by the tick path.
const BLOCK_TIMEOUT_NS: u64 = 1_000_000_000;
/// Upper bound for an IPC message descriptor.
const MAX_IPC_BYTES: usize = 64 * 1024;

fn log_level_observer(config: &Config) {
    diag::log::set_max_level(config.log_level);
}

/// The single root value owning every mutable core structure. One instance
/// exists per machine; the boot glue drives it from the trap vector.
pub struct Kernel {
    hal: &'static dyn Platform,
    pub(crate) config: Config,
    pub(crate) pmm: FrameAllocator,
    pub(crate) caps: CapTable,
    pub(crate) domains: DomainTable,
    pub(crate) sched: Scheduler,
    pub(crate) switch: SwitchStack,
    pub(crate) audit: AuditLog,
    pub(crate) traps: TrapTables,
    syscalls: SyscallTable,
    core_domain: DomainId,
    idle_thread: ThreadId,
}

impl Kernel {
    /// Brings the core up from a validated loader handoff: configuration,
    /// frame allocator, the CORE domain and its idle thread.
    pub fn new(hal: &'static dyn Platform, boot: &BootInfo<'_>) -> Result<Self, Status> {
        boot.validate().map_err(|_| Status::Invalid)?;

        let mut config = Config::from_boot_options(
            boot.cmdline.split_whitespace().filter_map(|pair| pair.split_once('=')),
        );
        config.subscribe(log_level_observer);

        // Frame window spanning the usable regions.
        let lowest = boot
            .usable_regions()
            .map(|r| r.base.raw())
            .min()
            .ok_or(Status::NoMemory)?;
        let highest = boot
            .usable_regions()
            .filter_map(|r| r.base.raw().checked_add(r.len))
            .max()
            .ok_or(Status::NoMemory)?;
        let window_base = crate::types::PhysAddr::new(lowest & !(FRAME_SIZE - 1));
        let frame_count = (highest - window_base.raw()).div_ceil(FRAME_SIZE);
        let mut pmm = FrameAllocator::new(window_base, frame_count);
        for region in boot.usable_regions() {
            pmm.add_region(region.base, region.len).map_err(Status::from)?;
        }
        // Pin loader-owned carve-outs that overlap the usable window.
        for region in boot.reserved_regions() {
            pmm.mark_used(region.base, region.len);
        }
        for module in boot.modules {
            pmm.mark_used(module.base, module.len);
        }

        let mut caps = CapTable::new(config.max_capabilities, config.max_domains);
        let mut domains = DomainTable::new(config.max_domains);
        let core_domain = domains
            .create(DomainKind::Core, None, Quota::UNLIMITED, &mut pmm)
            .map_err(Status::from)?;
        caps.install_key(core_domain, [hal.entropy64(), hal.entropy64()])
            .map_err(Status::from)?;
        domains.start(core_domain).map_err(Status::from)?;

        let mut sched = Scheduler::new(config.max_threads, config.slice_ticks());
        domains.charge(core_domain, Resource::Threads, 1).map_err(Status::from)?;
        let idle_thread = sched
            .create(core_domain, Priority::Idle, hal.context_init(VirtAddr::new(0), VirtAddr::new(0)))
            .map_err(Status::from)?;
        sched.set_idle(idle_thread).map_err(Status::from)?;

        let mut audit = AuditLog::new(AUDIT_CAPACITY);
        audit.set_enabled(config.enable_audit);
        audit.append(
            hal.timestamp(),
            AuditEvent::Boot,
            core_domain,
            CapId::NONE,
            idle_thread,
            [frame_count as u64, 0, 0, 0],
            true,
        );

        let traps = TrapTables::new(config.max_irqs);
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);

        log_info!(target: "kernel", "core up: {} frames, audit seq {}", frame_count, audit.next_sequence());
        Ok(Self {
            hal,
            config,
            pmm,
            caps,
            domains,
            sched,
            switch: SwitchStack::new(),
            audit,
            traps,
            syscalls,
            core_domain,
            idle_thread,
        })
    }

    pub fn core_domain(&self) -> DomainId {
        self.core_domain
    }

    pub fn idle_thread(&self) -> ThreadId {
        self.idle_thread
    }

    fn now(&self) -> u64 {
        self.hal.timestamp()
    }

    fn note(
        &mut self,
        event: AuditEvent,
        domain: DomainId,
        cap: CapId,
        thread: ThreadId,
        data: [u64; 4],
        ok: bool,
    ) {
        self.audit.append(self.hal.timestamp(), event, domain, cap, thread, data, ok);
    }

    /// Runtime configuration change plus the side effects that live outside
    /// the config record itself.
    pub fn set_option(&mut self, key: &str, value: &str) -> SysResult<()> {
        let _masked = IrqGuard::enter(self.hal);
        self.config.set(key, value).map_err(Status::from)?;
        self.audit.set_enabled(self.config.enable_audit);
        self.note(AuditEvent::ConfigChange, self.core_domain, CapId::NONE, self.idle_thread, [0; 4], true);
        Ok(())
    }

    pub(crate) fn require_privileged(&self, domain: DomainId) -> SysResult<()> {
        match self.domains.kind(domain).map_err(Status::from)? {
            DomainKind::Core | DomainKind::Privileged => Ok(()),
            DomainKind::Application => Err(Status::Permission),
        }
    }

    /// Handle authentication with an audit trail: every verdict lands as a
    /// CAP_VERIFY record.
    pub(crate) fn authenticate(
        &mut self,
        domain: DomainId,
        handle: CapHandle,
        required: Rights,
    ) -> SysResult<CapId> {
        let thread = self.sched.current().unwrap_or(self.idle_thread);
        match self.caps.check_access(domain, handle, required) {
            Ok(cap) => {
                self.note(
                    AuditEvent::CapVerify,
                    domain,
                    cap,
                    thread,
                    [handle.raw(), u64::from(required.bits()), 0, 0],
                    true,
                );
                Ok(cap)
            }
            Err(err) => {
                self.note(
                    AuditEvent::CapVerify,
                    domain,
                    CapId::NONE,
                    thread,
                    [handle.raw(), u64::from(required.bits()), 0, 0],
                    false,
                );
                log_debug!(target: "cap", "verify failed for domain {}: {:?}", domain.raw(), err);
                Err(err.into())
            }
        }
    }

    // ——— Domain lifecycle ———

    pub fn domain_create(
        &mut self,
        kind: DomainKind,
        parent: Option<DomainId>,
        quota: Quota,
        _now: u64,
    ) -> SysResult<DomainId> {
        let _masked = IrqGuard::enter(self.hal);
        if quota.max_frames != usize::MAX && quota.max_frames > self.pmm.stats().free {
            log_warn!(target: "domain", "quota over-commits memory: {} frames requested, {} free", quota.max_frames, self.pmm.stats().free);
        }
        let id = self
            .domains
            .create(kind, parent, quota, &mut self.pmm)
            .map_err(Status::from)?;
        self.caps
            .install_key(id, [self.hal.entropy64(), self.hal.entropy64()])
            .map_err(Status::from)?;
        self.note(AuditEvent::DomainCreate, id, CapId::NONE, self.idle_thread, [quota.max_frames as u64, quota.max_threads as u64, quota.max_caps as u64, 0], true);
        Ok(id)
    }

    pub fn domain_destroy(&mut self, id: DomainId, now: u64) -> SysResult<()> {
        let _masked = IrqGuard::enter(self.hal);
        if id == self.core_domain {
            return Err(Status::Permission);
        }
        // Callers still parked on this domain get their crash status before
        // the domain goes away.
        if let Some(frame) = self.switch.unwind_for_target(id) {
            self.note(AuditEvent::ServiceCrash, id, CapId::NONE, frame.caller_thread, [0; 4], false);
            self.deliver_crash_return(frame, now);
        }
        match self.domains.destroy(id, &mut self.pmm) {
            Ok(()) => {
                self.caps.purge_key(id);
                self.note(AuditEvent::DomainDestroy, id, CapId::NONE, self.idle_thread, [0; 4], true);
                Ok(())
            }
            Err(err) => {
                self.note(AuditEvent::DomainDestroy, id, CapId::NONE, self.idle_thread, [0; 4], false);
                Err(err.into())
            }
        }
    }

    pub fn domain_suspend(&mut self, id: DomainId, now: u64) -> SysResult<()> {
        let _masked = IrqGuard::enter(self.hal);
        self.domains.suspend(id).map_err(Status::from)?;
        self.sched.suspend_domain(id, now);
        self.note(AuditEvent::DomainSuspend, id, CapId::NONE, self.idle_thread, [0; 4], true);
        Ok(())
    }

    pub fn domain_resume(&mut self, id: DomainId, _now: u64) -> SysResult<()> {
        let _masked = IrqGuard::enter(self.hal);
        self.domains.resume(id).map_err(Status::from)?;
        self.sched.resume_domain(id);
        self.note(AuditEvent::DomainResume, id, CapId::NONE, self.idle_thread, [0; 4], true);
        Ok(())
    }

    // ——— Threads ———

    pub fn thread_create(
        &mut self,
        domain: DomainId,
        entry: VirtAddr,
        stack: VirtAddr,
        priority: Priority,
        _now: u64,
    ) -> SysResult<ThreadId> {
        let _masked = IrqGuard::enter(self.hal);
        match self.domains.state(domain).map_err(Status::from)? {
            DomainState::Init | DomainState::Running => {}
            _ => return Err(Status::Busy),
        }
        self.domains.charge(domain, Resource::Threads, 1).map_err(Status::from)?;
        let ctx = self.hal.context_init(entry, stack);
        let id = match self.sched.create(domain, priority, ctx) {
            Ok(id) => id,
            Err(err) => {
                self.domains.uncharge(domain, Resource::Threads, 1);
                return Err(err.into());
            }
        };
        // The first thread takes an INIT domain live.
        if self.domains.state(domain) == Ok(DomainState::Init) {
            self.domains.start(domain).map_err(Status::from)?;
        }
        self.note(AuditEvent::ThreadCreate, domain, CapId::NONE, id, [entry.raw() as u64, priority.raw() as u64, 0, 0], true);
        Ok(id)
    }

    pub fn thread_destroy(&mut self, id: ThreadId, _now: u64) -> SysResult<()> {
        let _masked = IrqGuard::enter(self.hal);
        if id == self.idle_thread {
            return Err(Status::Permission);
        }
        let domain = self.sched.destroy(id).map_err(Status::from)?;
        self.domains.uncharge(domain, Resource::Threads, 1);
        self.note(AuditEvent::ThreadDestroy, domain, CapId::NONE, id, [0; 4], true);
        Ok(())
    }

    pub fn thread_yield(&mut self) {
        let _masked = IrqGuard::enter(self.hal);
        self.sched.yield_now();
    }

    // ——— Capability operations (syscall backends) ———

    pub fn cap_transfer(
        &mut self,
        from: DomainId,
        handle: CapHandle,
        to: DomainId,
        _now: u64,
    ) -> SysResult<CapHandle> {
        let _masked = IrqGuard::enter(self.hal);
        let cap = self.authenticate(from, handle, Rights::empty())?;
        self.domains.state(to).map_err(|_| Status::Invalid)?;
        self.domains.charge(to, Resource::Caps, 1).map_err(Status::from)?;
        let sealed = match self.caps.transfer(from, to, cap) {
            Ok(sealed) => sealed,
            Err(err) => {
                self.domains.uncharge(to, Resource::Caps, 1);
                self.note(AuditEvent::CapTransfer, from, cap, self.idle_thread, [u64::from(to.raw()), 0, 0, 0], false);
                return Err(err.into());
            }
        };
        self.domains.uncharge(from, Resource::Caps, 1);
        self.note(AuditEvent::CapTransfer, from, cap, self.idle_thread, [u64::from(to.raw()), 0, 0, 0], true);
        Ok(sealed)
    }

    pub fn cap_derive(
        &mut self,
        owner: DomainId,
        handle: CapHandle,
        sub_rights: Rights,
        _now: u64,
    ) -> SysResult<CapHandle> {
        let _masked = IrqGuard::enter(self.hal);
        let parent = self.authenticate(owner, handle, Rights::empty())?;
        self.domains.charge(owner, Resource::Caps, 1).map_err(Status::from)?;
        let child = match self.caps.derive(owner, parent, sub_rights) {
            Ok(child) => child,
            Err(err) => {
                self.domains.uncharge(owner, Resource::Caps, 1);
                self.note(AuditEvent::CapDerive, owner, parent, self.idle_thread, [u64::from(sub_rights.bits()), 0, 0, 0], false);
                return Err(err.into());
            }
        };
        let sealed = self.caps.grant(owner, child).map_err(Status::from)?;
        self.note(AuditEvent::CapDerive, owner, child, self.idle_thread, [u64::from(parent.raw()), u64::from(sub_rights.bits()), 0, 0], true);
        Ok(sealed)
    }

    /// Revokes the capability behind `handle` and its whole derivation tree.
    /// One audit record per revoked id, in revocation order.
    pub fn cap_revoke(
        &mut self,
        owner: DomainId,
        handle: CapHandle,
        _now: u64,
    ) -> SysResult<usize> {
        let _masked = IrqGuard::enter(self.hal);
        let cap = self.authenticate(owner, handle, Rights::empty())?;
        let revoked = self.caps.revoke(cap).map_err(Status::from)?;
        for id in &revoked {
            if let Ok(holder) = self.caps.owner_of(*id) {
                self.domains.uncharge(holder, Resource::Caps, 1);
            }
            self.note(AuditEvent::CapRevoke, owner, *id, self.idle_thread, [u64::from(cap.raw()), 0, 0, 0], true);
        }
        Ok(revoked.len())
    }

    /// Creates a capability for `owner` and charges its cap quota. Used by
    /// boot glue and the Privileged tier through the core API.
    pub fn cap_create_memory(
        &mut self,
        owner: DomainId,
        base: crate::types::PhysAddr,
        len: usize,
        rights: Rights,
    ) -> SysResult<CapHandle> {
        let _masked = IrqGuard::enter(self.hal);
        self.domains.charge(owner, Resource::Caps, 1).map_err(Status::from)?;
        let cap = match self.caps.create_memory(owner, base, len, rights) {
            Ok(cap) => cap,
            Err(err) => {
                self.domains.uncharge(owner, Resource::Caps, 1);
                return Err(err.into());
            }
        };
        let sealed = self.caps.grant(owner, cap).map_err(Status::from)?;
        self.note(AuditEvent::CapCreate, owner, cap, self.idle_thread, [base.raw() as u64, len as u64, 0, 0], true);
        Ok(sealed)
    }

    pub fn cap_create_endpoint(
        &mut self,
        owner: DomainId,
        target: DomainId,
    ) -> SysResult<CapHandle> {
        let _masked = IrqGuard::enter(self.hal);
        self.domains.state(target).map_err(|_| Status::Invalid)?;
        self.domains.charge(owner, Resource::Caps, 1).map_err(Status::from)?;
        let cap = match self.caps.create_endpoint(owner, target) {
            Ok(cap) => cap,
            Err(err) => {
                self.domains.uncharge(owner, Resource::Caps, 1);
                return Err(err.into());
            }
        };
        let sealed = self.caps.grant(owner, cap).map_err(Status::from)?;
        self.note(AuditEvent::CapCreate, owner, cap, self.idle_thread, [u64::from(target.raw()), 0, 0, 0], true);
        Ok(sealed)
    }

    // ——— Shared memory ———

    pub fn shmem_alloc(
        &mut self,
        owner: DomainId,
        frames: usize,
        rights: Rights,
        _now: u64,
    ) -> SysResult<CapHandle> {
        let _masked = IrqGuard::enter(self.hal);
        self.domains.charge(owner, Resource::Frames, frames).map_err(Status::from)?;
        let base = match self.pmm.alloc_frames(owner, frames, FrameKind::Shared) {
            Ok(base) => base,
            Err(err) => {
                self.domains.uncharge(owner, Resource::Frames, frames);
                return Err(err.into());
            }
        };
        let sealed = match self.cap_create_memory(owner, base, frames * FRAME_SIZE, rights | Rights::MAP) {
            Ok(sealed) => sealed,
            Err(err) => {
                let _ = self.pmm.free_frames(base, frames);
                self.domains.uncharge(owner, Resource::Frames, frames);
                return Err(err);
            }
        };
        self.note(AuditEvent::ShmemAlloc, owner, CapId::NONE, self.idle_thread, [base.raw() as u64, frames as u64, 0, 0], true);
        Ok(sealed)
    }

    pub fn shmem_map(
        &mut self,
        domain: DomainId,
        handle: CapHandle,
        virt: VirtAddr,
        _now: u64,
    ) -> SysResult<()> {
        let _masked = IrqGuard::enter(self.hal);
        let cap = self.authenticate(domain, handle, Rights::MAP)?;
        let (base, len) = match self.caps.resolve_kind(cap).map_err(Status::from)? {
            CapKind::Memory { base, len } => (base, len),
            _ => return Err(Status::Invalid),
        };
        let rights = self.caps.get(cap).map_err(Status::from)?.rights;
        let mut perms = PagePerms::empty();
        if rights.contains(Rights::READ) {
            perms |= PagePerms::READ;
        }
        if rights.contains(Rights::WRITE) {
            perms |= PagePerms::WRITE;
        }
        if perms.is_empty() {
            return Err(Status::Permission);
        }
        let frames = len.div_ceil(FRAME_SIZE);
        let mut space = self.domains.take_space(domain).map_err(Status::from)?;
        let result = {
            let mut source =
                ChargedFrames { pmm: &mut self.pmm, domains: &mut self.domains, owner: domain };
            space.map(&mut source, virt, base, len, perms, MapKind::User, self.hal)
        };
        self.domains.put_space(domain, space);
        result.map_err(Status::from)?;
        // Cross-domain mappings pin the frames so the owner cannot free them
        // away underneath the mapper.
        if self.pmm.frame_info(base).map(|r| r.owner) != Some(domain) {
            self.pmm.add_ref(base, frames).map_err(Status::from)?;
        }
        self.note(AuditEvent::MemoryMap, domain, cap, self.idle_thread, [virt.raw() as u64, base.raw() as u64, len as u64, 0], true);
        Ok(())
    }

    // ——— Domain switch / IPC ———

    /// The call path: authenticate, validate the target, push the caller,
    /// install the target space and hand the CPU to its service thread.
    pub fn ipc_call(
        &mut self,
        caller_thread: ThreadId,
        handle: CapHandle,
        msg_base: usize,
        msg_len: usize,
        now: u64,
    ) -> SysResult<usize> {
        let _masked = IrqGuard::enter(self.hal);
        let caller_domain = self.sched.domain_of(caller_thread).map_err(Status::from)?;
        let cap = self.authenticate(caller_domain, handle, Rights::CALL)?;
        let target = match self.caps.resolve_kind(cap).map_err(Status::from)? {
            CapKind::Endpoint { target } => target,
            _ => return Err(Status::Invalid),
        };
        if self.domains.state(target).map_err(Status::from)? != DomainState::Running {
            self.note(AuditEvent::IpcCall, caller_domain, cap, caller_thread, [u64::from(target.raw()), 0, 0, 0], false);
            return Err(Status::Busy);
        }
        if msg_len > 0 {
            if msg_len > MAX_IPC_BYTES {
                return Err(Status::Invalid);
            }
            let space = self.domains.space(caller_domain).map_err(Status::from)?;
            if space.translate(VirtAddr::new(msg_base)).is_none() {
                return Err(Status::Invalid);
            }
        }
        let Some(service) = self.service_thread_of(target) else {
            self.note(AuditEvent::IpcCall, caller_domain, cap, caller_thread, [u64::from(target.raw()), 0, 0, 0], false);
            return Err(Status::Busy);
        };

        let saved = self.sched.context(caller_thread).map_err(Status::from)?;
        self.switch
            .push(CallFrame { caller_domain, caller_thread, target_domain: target, saved })
            .map_err(|err| {
                self.note(AuditEvent::IpcCall, caller_domain, cap, caller_thread, [u64::from(target.raw()), 0, 0, 0], false);
                Status::from(err)
            })?;

        let root = self.domains.page_root(target).map_err(Status::from)?;
        self.hal.set_page_root(root);
        self.sched.block(caller_thread, BlockReason::IpcReply, now).map_err(Status::from)?;
        if self.sched.thread_info(service).map_err(Status::from)?.state == ThreadState::Waiting {
            self.sched.wake(service, WakeReason::Requested).map_err(Status::from)?;
        }
        if let Ok(Some(switch)) = self.sched.dispatch(service, now, self.hal) {
            self.account_switch(&switch);
        }
        self.note(
            AuditEvent::IpcCall,
            caller_domain,
            cap,
            caller_thread,
            [u64::from(target.raw()), msg_base as u64, msg_len as u64, self.switch.depth() as u64],
            true,
        );
        Ok(0)
    }

    /// The return path: pop, reinstall the caller's space and context, park
    /// the callee for its next request.
    pub fn ipc_return(&mut self, callee_thread: ThreadId, retval: usize, now: u64) -> SysResult<usize> {
        let _masked = IrqGuard::enter(self.hal);
        let callee_domain = self.sched.domain_of(callee_thread).map_err(Status::from)?;
        let frame = self.switch.pop().map_err(Status::from)?;
        if frame.target_domain != callee_domain {
            // Not this thread's call; put it back untouched.
            let _ = self.switch.push(frame);
            return Err(Status::Permission);
        }

        // An empty stack after this pop hands control back to CORE's tier:
        // the caller below is by construction the chain's origin.
        let root = self.domains.page_root(frame.caller_domain).map_err(Status::from)?;
        self.hal.set_page_root(root);
        let mut saved = frame.saved;
        self.hal.context_set_return(&mut saved, retval);
        self.sched.set_context(frame.caller_thread, saved).map_err(Status::from)?;
        self.sched.block(callee_thread, BlockReason::IpcWait, now).map_err(Status::from)?;
        self.sched.wake(frame.caller_thread, WakeReason::IpcReturn).map_err(Status::from)?;
        if let Ok(Some(switch)) = self.sched.dispatch(frame.caller_thread, now, self.hal) {
            self.account_switch(&switch);
        }
        self.note(
            AuditEvent::IpcReturn,
            callee_domain,
            CapId::NONE,
            callee_thread,
            [u64::from(frame.caller_domain.raw()), retval as u64, self.switch.depth() as u64, 0],
            true,
        );
        Ok(0)
    }

    /// Picks the thread of `domain` that will service an incoming call: a
    /// parked service thread first, else any ready thread.
    fn service_thread_of(&self, domain: DomainId) -> Option<ThreadId> {
        let threads = self.sched.threads_of(domain);
        threads
            .iter()
            .copied()
            .find(|id| {
                self.sched
                    .thread_info(*id)
                    .map(|info| {
                        info.state == ThreadState::Waiting
                            && info.block_reason == Some(BlockReason::IpcWait)
                    })
                    .unwrap_or(false)
            })
            .or_else(|| {
                threads.iter().copied().find(|id| {
                    self.sched
                        .thread_info(*id)
                        .map(|info| info.state == ThreadState::Ready)
                        .unwrap_or(false)
                })
            })
    }

    /// Restores the nearest surviving caller of a crashed service with an
    /// ERR_CRASH status in its return register.
    fn deliver_crash_return(&mut self, frame: CallFrame, now: u64) {
        let mut saved = frame.saved;
        self.hal.context_set_return(&mut saved, Status::Crash.code() as usize);
        let _ = self.sched.set_context(frame.caller_thread, saved);
        if let Ok(root) = self.domains.page_root(frame.caller_domain) {
            self.hal.set_page_root(root);
        }
        let _ = self.sched.wake(frame.caller_thread, WakeReason::IpcReturn);
        if let Ok(Some(switch)) = self.sched.dispatch(frame.caller_thread, now, self.hal) {
            self.account_switch(&switch);
        }
    }

    fn account_switch(&mut self, switch: &Switch) {
        self.domains.charge_cpu(switch.from_domain, switch.from_ran_ns);
        if switch.from_domain != switch.to_domain {
            if let Ok(root) = self.domains.page_root(switch.to_domain) {
                self.hal.set_page_root(root);
            }
        }
    }

    // ——— Event demultiplexer ———

    /// Single entry point for every CPU-originated event.
    pub fn handle_event(&mut self, event: Event) -> Disposition {
        let _masked = IrqGuard::enter(self.hal);
        let now = self.now();
        match event {
            Event::Fault { kind, error_code, fault_addr } => {
                let thread = self.sched.current().unwrap_or(self.idle_thread);
                let domain = self.sched.domain_of(thread).unwrap_or(self.core_domain);
                let ctx = ExceptionContext { kind, domain, thread, error_code, fault_addr };
                trap::record(&ctx);
                if domain == self.core_domain {
                    self.note(AuditEvent::Panic, domain, CapId::NONE, thread, [error_code, fault_addr.map(|a| a.raw() as u64).unwrap_or(0), 0, 0], false);
                    log_error!(target: "trap", "CORE fault: {} ec={:#x}", kind.describe(), error_code);
                    return Disposition::Panic { reason: kind.describe() };
                }
                let handled = match self.traps.exception_handler(kind) {
                    Some(handler) => handler(self, &ctx),
                    None => false,
                };
                self.note(
                    AuditEvent::Exception,
                    domain,
                    CapId::NONE,
                    thread,
                    [kind.index() as u64, error_code, fault_addr.map(|a| a.raw() as u64).unwrap_or(0), 0],
                    handled,
                );
                if handled {
                    return Disposition::Resume;
                }
                self.fault_terminate(thread, domain, now)
            }
            Event::Interrupt { vector } => {
                match self.traps.irq_handler(vector) {
                    Some(handler) => {
                        handler(self, vector);
                        self.note(AuditEvent::Interrupt, self.core_domain, CapId::NONE, self.idle_thread, [u64::from(vector), 0, 0, 0], true);
                    }
                    None => {
                        log_debug!(target: "trap", "spurious irq {}", vector);
                        self.note(AuditEvent::Interrupt, self.core_domain, CapId::NONE, self.idle_thread, [u64::from(vector), 0, 0, 0], false);
                    }
                }
                if self.sched.resched_pending() {
                    Disposition::Resched
                } else {
                    Disposition::Resume
                }
            }
            Event::TimerTick => {
                self.sched.tick();
                self.sched.check_timeouts(now, BLOCK_TIMEOUT_NS);
                if self.sched.resched_pending() {
                    Disposition::Resched
                } else {
                    Disposition::Resume
                }
            }
            Event::Syscall { number, args } => {
                let Some(caller_thread) = self.sched.current() else {
                    return Disposition::SyscallReturn {
                        value: Status::Invalid.code() as usize,
                        resched: false,
                    };
                };
                let caller_domain = self.sched.domain_of(caller_thread).unwrap_or(self.core_domain);
                let table = core::mem::take(&mut self.syscalls);
                let result = {
                    let mut ctx = api::Context { kernel: self, caller_thread, caller_domain, now };
                    table.dispatch(number, &mut ctx, &syscall::Args::new(args))
                };
                self.syscalls = table;
                self.note(
                    AuditEvent::Syscall,
                    caller_domain,
                    CapId::NONE,
                    caller_thread,
                    [number as u64, args[0] as u64, args[1] as u64, 0],
                    result.is_ok(),
                );
                Disposition::SyscallReturn {
                    value: syscall::encode_result(result),
                    resched: self.sched.resched_pending(),
                }
            }
        }
    }

    /// Terminates a faulting thread and, when the thread's domain was
    /// serving a cross-domain call, unwinds the call chain with ERR_CRASH.
    fn fault_terminate(&mut self, thread: ThreadId, domain: DomainId, now: u64) -> Disposition {
        let _ = self.sched.destroy(thread);
        self.domains.uncharge(domain, Resource::Threads, 1);
        self.note(AuditEvent::ThreadDestroy, domain, CapId::NONE, thread, [1, 0, 0, 0], true);
        if let Some(frame) = self.switch.unwind_for_target(domain) {
            self.note(AuditEvent::ServiceCrash, domain, CapId::NONE, thread, [u64::from(frame.caller_domain.raw()), 0, 0, 0], false);
            log_warn!(target: "trap", "service crash in domain {}, unwinding to domain {}", domain.raw(), frame.caller_domain.raw());
            self.deliver_crash_return(frame, now);
        }
        Disposition::ThreadTerminated { thread }
    }

    /// Runs the dispatcher and applies address-space and accounting side
    /// effects. Called by the trap glue on a `Resched` disposition.
    pub fn reschedule(&mut self) -> Option<Switch> {
        let _masked = IrqGuard::enter(self.hal);
        let now = self.now();
        let switch = self.sched.schedule(now, self.hal)?;
        self.account_switch(&switch);
        Some(switch)
    }

    /// Cross-structure invariant sweep for tests and the fatal path.
    pub fn verify(&self) -> Result<(), &'static str> {
        self.pmm.verify()?;
        self.caps.verify()?;
        self.domains.verify()?;
        self.sched.verify()?;
        Ok(())
    }
}
