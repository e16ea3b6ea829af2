// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @core-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: kernel::Kernel, syscall::{Args, Status}
//! INVARIANTS: Decode -> check -> execute; handlers never bypass the
//!             capability checks the kernel methods perform

use crate::cap::Rights;
use crate::domain::{DomainKind, Quota};
use crate::kernel::Kernel;
use crate::types::{CapHandle, DomainId, Priority, ThreadId, VirtAddr};

use super::{Args, Status, SysResult, SyscallTable};

/// Per-syscall execution context: the caller identity resolved by the trap
/// path plus exclusive access to the kernel state.
pub struct Context<'a> {
    pub kernel: &'a mut Kernel,
    pub caller_thread: ThreadId,
    pub caller_domain: DomainId,
    pub now: u64,
}

// Typed decoders, decode -> check -> execute.

#[derive(Copy, Clone)]
struct DomainCreateArgs {
    kind: DomainKind,
    quota: Quota,
}

impl DomainCreateArgs {
    #[inline]
    fn decode(args: &Args) -> SysResult<Self> {
        let kind = match args.get(0) {
            1 => DomainKind::Privileged,
            2 => DomainKind::Application,
            // CORE is never creatable from the ABI.
            _ => return Err(Status::Invalid),
        };
        let quota = Quota {
            max_frames: args.get(1),
            max_threads: args.get(2),
            max_caps: args.get(3),
            cpu_percent: 100,
        };
        if quota.max_frames == 0 || quota.max_threads == 0 {
            return Err(Status::Invalid);
        }
        Ok(Self { kind, quota })
    }
}

#[derive(Copy, Clone)]
struct ThreadCreateArgs {
    entry: VirtAddr,
    stack: VirtAddr,
    priority: Priority,
}

impl ThreadCreateArgs {
    #[inline]
    fn decode(args: &Args) -> SysResult<Self> {
        let entry = VirtAddr::new(args.get(0));
        let stack = VirtAddr::new(args.get(1));
        if entry.raw() == 0 {
            return Err(Status::Invalid);
        }
        let priority = Priority::from_raw(args.get(2) as u8).ok_or(Status::Invalid)?;
        Ok(Self { entry, stack, priority })
    }
}

fn handle_arg(args: &Args, index: usize) -> CapHandle {
    CapHandle::from_raw(args.get(index) as u64)
}

fn sys_ipc_call(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let handle = handle_arg(args, 0);
    let msg_base = args.get(1);
    let msg_len = args.get(2);
    ctx.kernel.ipc_call(ctx.caller_thread, handle, msg_base, msg_len, ctx.now)
}

fn sys_ipc_return(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let retval = args.get(0);
    ctx.kernel.ipc_return(ctx.caller_thread, retval, ctx.now)
}

fn sys_cap_transfer(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let handle = handle_arg(args, 0);
    let to = DomainId::from_raw(args.get(1) as u16);
    let sealed = ctx.kernel.cap_transfer(ctx.caller_domain, handle, to, ctx.now)?;
    Ok(sealed.raw() as usize)
}

fn sys_cap_derive(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let handle = handle_arg(args, 0);
    let rights = Rights::from_bits(args.get(1) as u32).ok_or(Status::Invalid)?;
    let sealed = ctx.kernel.cap_derive(ctx.caller_domain, handle, rights, ctx.now)?;
    Ok(sealed.raw() as usize)
}

fn sys_cap_revoke(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let handle = handle_arg(args, 0);
    let count = ctx.kernel.cap_revoke(ctx.caller_domain, handle, ctx.now)?;
    Ok(count)
}

fn sys_domain_create(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let decoded = DomainCreateArgs::decode(args)?;
    ctx.kernel.require_privileged(ctx.caller_domain)?;
    let id = ctx.kernel.domain_create(
        decoded.kind,
        Some(ctx.caller_domain),
        decoded.quota,
        ctx.now,
    )?;
    Ok(id.raw() as usize)
}

fn sys_domain_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = DomainId::from_raw(args.get(0) as u16);
    ctx.kernel.require_privileged(ctx.caller_domain)?;
    ctx.kernel.domain_destroy(target, ctx.now)?;
    Ok(0)
}

fn sys_thread_create(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let decoded = ThreadCreateArgs::decode(args)?;
    let id = ctx.kernel.thread_create(
        ctx.caller_domain,
        decoded.entry,
        decoded.stack,
        decoded.priority,
        ctx.now,
    )?;
    Ok(id.raw() as usize)
}

fn sys_thread_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.kernel.thread_yield();
    Ok(0)
}

fn sys_shmem_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let frames = args.get(0);
    let rights = Rights::from_bits(args.get(1) as u32).ok_or(Status::Invalid)?;
    if frames == 0 || rights.intersects(Rights::EXEC) {
        // Shared memory is never executable.
        return Err(Status::Invalid);
    }
    let sealed = ctx.kernel.shmem_alloc(ctx.caller_domain, frames, rights, ctx.now)?;
    Ok(sealed.raw() as usize)
}

fn sys_shmem_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let handle = handle_arg(args, 0);
    let virt = VirtAddr::new(args.get(1));
    if !virt.page_aligned() || virt.raw() == 0 {
        return Err(Status::Invalid);
    }
    ctx.kernel.shmem_map(ctx.caller_domain, handle, virt, ctx.now)?;
    Ok(0)
}

/// Installs every handler into the dispatch table.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(super::SYSCALL_IPC_CALL, sys_ipc_call);
    table.register(super::SYSCALL_IPC_RETURN, sys_ipc_return);
    table.register(super::SYSCALL_CAP_TRANSFER, sys_cap_transfer);
    table.register(super::SYSCALL_CAP_DERIVE, sys_cap_derive);
    table.register(super::SYSCALL_CAP_REVOKE, sys_cap_revoke);
    table.register(super::SYSCALL_DOMAIN_CREATE, sys_domain_create);
    table.register(super::SYSCALL_DOMAIN_DESTROY, sys_domain_destroy);
    table.register(super::SYSCALL_THREAD_CREATE, sys_thread_create);
    table.register(super::SYSCALL_THREAD_YIELD, sys_thread_yield);
    table.register(super::SYSCALL_SHMEM_ALLOC, sys_shmem_alloc);
    table.register(super::SYSCALL_SHMEM_MAP, sys_shmem_map);
}
