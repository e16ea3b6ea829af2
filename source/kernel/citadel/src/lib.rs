// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CITADEL trusted core: capability table, domain table, frame allocator,
//! four-level page tables, scheduler, exception demux, domain-switch IPC and
//! the audit ring. Everything above this crate (drivers, services,
//! applications) runs in the Privileged or Application tier and reaches the
//! core only through the syscall gate.

#![no_std]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

#[cfg(test)]
extern crate std;

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod audit;
pub mod boot;
pub mod cap;
pub mod config;
pub mod domain;
pub mod hal;
pub mod heap;
pub mod ipc;
pub mod kernel;
pub mod kmain;
pub mod mm;
pub mod module;
#[cfg(all(target_os = "none", feature = "panic_handler"))]
mod panic;
pub mod sched;
#[cfg(any(test, feature = "selftest"))]
pub mod selftest;
pub mod syscall;
pub mod trap;
pub mod types;

pub use kernel::Kernel;
pub use syscall::Status;
