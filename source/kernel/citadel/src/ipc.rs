// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Domain-switch call stack for authenticated cross-domain calls
//! OWNERS: @core-team
//! PUBLIC API: SwitchStack (push/pop/unwind_for_target), CallFrame, MAX_CALL_DEPTH
//! DEPENDS_ON: hal::CpuContext, types::{DomainId, ThreadId}
//! INVARIANTS: Depth bounded at 16; frames pop in LIFO order; a crashed
//!             callee unwinds every frame from its deepest entry upward

extern crate alloc;

use alloc::vec::Vec;

use crate::hal::CpuContext;
use crate::types::{DomainId, ThreadId};

/// Maximum number of in-flight nested cross-domain calls.
pub const MAX_CALL_DEPTH: usize = 16;

/// One suspended caller awaiting a domain-switch return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallFrame {
    pub caller_domain: DomainId,
    pub caller_thread: ThreadId,
    /// The domain that was called; used to find victims when a service dies.
    pub target_domain: DomainId,
    /// Caller register state captured at the call gate.
    pub saved: CpuContext,
}

/// Errors from switch-stack manipulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchError {
    /// The stack already holds `MAX_CALL_DEPTH` frames.
    CallDepth,
    /// Return with no call in flight.
    Empty,
}

/// Bounded LIFO of in-flight cross-domain calls. One stack serves the whole
/// core: a single CPU runs a single call chain at a time.
pub struct SwitchStack {
    frames: Vec<CallFrame>,
}

impl SwitchStack {
    pub fn new() -> Self {
        Self { frames: Vec::with_capacity(MAX_CALL_DEPTH) }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Pushes the caller state for a new call.
    pub fn push(&mut self, frame: CallFrame) -> Result<(), SwitchError> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            log_warn!(target: "switch", "call depth limit hit (caller domain {})", frame.caller_domain.raw());
            return Err(SwitchError::CallDepth);
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pops the most recent call for the return path.
    pub fn pop(&mut self) -> Result<CallFrame, SwitchError> {
        self.frames.pop().ok_or(SwitchError::Empty)
    }

    /// Peeks without popping.
    pub fn top(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// Crash unwind: removes every frame from the deepest entry into
    /// `target` upward and returns that deepest frame, whose caller is the
    /// nearest surviving one. Frames above it belonged to calls made on
    /// behalf of the dead service and die with it.
    pub fn unwind_for_target(&mut self, target: DomainId) -> Option<CallFrame> {
        let lowest = self.frames.iter().position(|f| f.target_domain == target)?;
        let frame = self.frames[lowest];
        self.frames.truncate(lowest);
        Some(frame)
    }

    /// Drops every frame. Used when control is handed back to CORE after a
    /// fatal event.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Default for SwitchStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(caller: u16, target: u16) -> CallFrame {
        CallFrame {
            caller_domain: DomainId::from_raw(caller),
            caller_thread: ThreadId::from_raw(u32::from(caller)),
            target_domain: DomainId::from_raw(target),
            saved: CpuContext::ZERO,
        }
    }

    #[test]
    fn lifo_order() {
        let mut stack = SwitchStack::new();
        stack.push(frame(1, 2)).unwrap();
        stack.push(frame(2, 3)).unwrap();
        assert_eq!(stack.pop().unwrap().caller_domain, DomainId::from_raw(2));
        assert_eq!(stack.pop().unwrap().caller_domain, DomainId::from_raw(1));
        assert_eq!(stack.pop(), Err(SwitchError::Empty));
    }

    #[test]
    fn depth_bound_is_sixteen() {
        let mut stack = SwitchStack::new();
        for i in 0..MAX_CALL_DEPTH as u16 {
            stack.push(frame(i, i + 1)).unwrap();
        }
        assert_eq!(stack.push(frame(99, 100)), Err(SwitchError::CallDepth));
        // The failed push left the stack untouched.
        assert_eq!(stack.depth(), MAX_CALL_DEPTH);
    }

    #[test]
    fn crash_unwind_finds_deepest_entry() {
        let mut stack = SwitchStack::new();
        // A -> B -> C -> B: two frames target B.
        stack.push(frame(1, 2)).unwrap();
        stack.push(frame(2, 3)).unwrap();
        stack.push(frame(3, 2)).unwrap();
        let survivor = stack.unwind_for_target(DomainId::from_raw(2)).unwrap();
        assert_eq!(survivor.caller_domain, DomainId::from_raw(1));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn crash_unwind_keeps_unrelated_frames() {
        let mut stack = SwitchStack::new();
        stack.push(frame(1, 2)).unwrap();
        stack.push(frame(2, 3)).unwrap();
        let survivor = stack.unwind_for_target(DomainId::from_raw(3)).unwrap();
        assert_eq!(survivor.caller_domain, DomainId::from_raw(2));
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.top().unwrap().target_domain, DomainId::from_raw(2));
        assert!(stack.unwind_for_target(DomainId::from_raw(7)).is_none());
    }
}
