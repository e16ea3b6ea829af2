// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall numbering, status taxonomy and the dispatch table
//! OWNERS: @core-team
//! PUBLIC API: SyscallTable, Args, Status, Handler, SYSCALL_* ids
//! DEPENDS_ON: every component error type (From conversions)
//! INVARIANTS: Stable syscall ids and status codes; unknown numbers return
//!             ERR_INVALID; decode/check/execute discipline in handlers

pub mod api;

use core::fmt;

use crate::cap::CapError;
use crate::config::ConfigError;
use crate::domain::DomainError;
use crate::ipc::SwitchError;
use crate::mm::{FrameError, PageTableError};
use crate::sched::SchedError;
use crate::trap::TrapError;

/// Number of syscall slots in the dispatch table.
const MAX_SYSCALL: usize = 16;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Status>;

/// Syscall arguments: up to four register values.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [usize; 4],
}

impl Args {
    pub const fn new(regs: [usize; 4]) -> Self {
        Self { regs }
    }

    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

// Public syscall numbers. Argument 1 is a capability handle where relevant.
/// Authenticated cross-domain call through an endpoint handle.
pub const SYSCALL_IPC_CALL: usize = 0;
/// Return from a domain-switch call (callee side).
pub const SYSCALL_IPC_RETURN: usize = 1;
/// Move a capability to another domain; returns the new owner's handle.
pub const SYSCALL_CAP_TRANSFER: usize = 2;
/// Mint a child capability with a subset of the parent rights.
pub const SYSCALL_CAP_DERIVE: usize = 3;
/// Revoke a capability and all its descendants.
pub const SYSCALL_CAP_REVOKE: usize = 4;
/// Create a protection domain (privileged callers only).
pub const SYSCALL_DOMAIN_CREATE: usize = 5;
/// Destroy a suspended, empty domain (privileged callers only).
pub const SYSCALL_DOMAIN_DESTROY: usize = 6;
/// Create a thread in the caller's domain.
pub const SYSCALL_THREAD_CREATE: usize = 7;
/// Give up the rest of the current time slice.
pub const SYSCALL_THREAD_YIELD: usize = 8;
/// Allocate shared frames and return a memory capability handle.
pub const SYSCALL_SHMEM_ALLOC: usize = 9;
/// Map a memory capability into the caller's address space.
pub const SYSCALL_SHMEM_MAP: usize = 10;

/// Single status taxonomy every core routine resolves to at the ABI edge.
/// The discriminating codes are stable; userspace sees `code()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Malformed argument (null, out of range, wrong type).
    Invalid,
    /// No free frames or table slots.
    NoMemory,
    /// A capability or privilege check failed.
    Permission,
    /// Capability lookup failed (stale or forged id).
    CapInvalid,
    /// Capability was revoked.
    CapRevoked,
    /// Domain quota would be exceeded.
    Quota,
    /// Resource state forbids the operation.
    Busy,
    /// Switch stack full.
    CallDepth,
    /// Callee terminated during an IPC call.
    Crash,
    /// Region overlaps a previously registered one.
    Overlap,
    /// Lookup found nothing.
    NotFound,
}

impl Status {
    /// ABI encoding: zero for success, small stable negatives for errors.
    pub const fn code(self) -> isize {
        match self {
            Status::Ok => 0,
            Status::Invalid => -1,
            Status::NoMemory => -2,
            Status::Permission => -3,
            Status::CapInvalid => -4,
            Status::CapRevoked => -5,
            Status::Quota => -6,
            Status::Busy => -7,
            Status::CallDepth => -8,
            Status::Crash => -9,
            Status::Overlap => -10,
            Status::NotFound => -11,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<CapError> for Status {
    fn from(value: CapError) -> Self {
        match value {
            CapError::Stale => Status::CapInvalid,
            CapError::Invalid => Status::Invalid,
            CapError::NoSpace => Status::NoMemory,
            CapError::Permission => Status::Permission,
            CapError::Revoked => Status::CapRevoked,
        }
    }
}

impl From<FrameError> for Status {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::Overlap => Status::Overlap,
            FrameError::NoMemory => Status::NoMemory,
            FrameError::Invalid => Status::Invalid,
        }
    }
}

impl From<PageTableError> for Status {
    fn from(value: PageTableError) -> Self {
        match value {
            PageTableError::Unaligned => Status::Invalid,
            PageTableError::NoMemory => Status::NoMemory,
            PageTableError::NotMapped => Status::NotFound,
        }
    }
}

impl From<DomainError> for Status {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Invalid => Status::Invalid,
            DomainError::NoSpace => Status::NoMemory,
            DomainError::Quota => Status::Quota,
            DomainError::Busy => Status::Busy,
        }
    }
}

impl From<SchedError> for Status {
    fn from(value: SchedError) -> Self {
        match value {
            SchedError::Invalid => Status::Invalid,
            SchedError::NoSpace => Status::NoMemory,
        }
    }
}

impl From<SwitchError> for Status {
    fn from(value: SwitchError) -> Self {
        match value {
            SwitchError::CallDepth => Status::CallDepth,
            SwitchError::Empty => Status::Invalid,
        }
    }
}

impl From<TrapError> for Status {
    fn from(value: TrapError) -> Self {
        match value {
            TrapError::Invalid => Status::Invalid,
            TrapError::Busy => Status::Busy,
        }
    }
}

impl From<ConfigError> for Status {
    fn from(_value: ConfigError) -> Self {
        Status::Invalid
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler for `number`; unknown numbers are `Invalid`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Status::Invalid)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds a handler result into the ABI register value.
pub fn encode_result(result: SysResult<usize>) -> usize {
    match result {
        Ok(value) => value,
        Err(status) => status.code() as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::Invalid.code(), -1);
        assert_eq!(Status::CallDepth.code(), -8);
        assert_eq!(Status::Crash.code(), -9);
        assert_eq!(Status::NotFound.code(), -11);
    }

    #[test]
    fn component_errors_map_to_taxonomy() {
        assert_eq!(Status::from(CapError::Revoked), Status::CapRevoked);
        assert_eq!(Status::from(FrameError::Overlap), Status::Overlap);
        assert_eq!(Status::from(PageTableError::NotMapped), Status::NotFound);
        assert_eq!(Status::from(DomainError::Quota), Status::Quota);
        assert_eq!(Status::from(SwitchError::CallDepth), Status::CallDepth);
    }
}
