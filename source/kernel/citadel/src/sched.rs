// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Thread table and priority scheduler (round-robin within priority)
//! OWNERS: @core-sched-team
//! PUBLIC API: Scheduler (create/destroy/tick/yield_now/block/wake/schedule/check_timeouts)
//! DEPENDS_ON: hal::{ContextOps, CpuContext}, types::{ThreadId, DomainId, Priority}
//! INVARIANTS: At most one RUNNING thread; every live thread is in exactly
//!             one place (a ready queue, blocked, or the running slot);
//!             waking re-inserts at the tail of the priority queue

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::hal::{ContextOps, CpuContext};
use crate::types::{DomainId, Priority, ThreadId, PRIORITY_LEVELS};

/// Thread lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    /// Parked by an explicit block (or a domain suspension).
    Blocked,
    /// Parked waiting for an IPC partner.
    Waiting,
    Terminated,
}

/// Why a thread was parked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    Requested,
    Suspended,
    /// Service thread parked until the next incoming call.
    IpcWait,
    /// Caller parked until its cross-domain call returns.
    IpcReply,
}

/// Why a parked thread was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    Requested,
    Timeout,
    DomainResumed,
    IpcReturn,
}

/// Errors produced by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    /// Unknown thread or a transition the state machine does not admit.
    Invalid,
    /// Thread table full.
    NoSpace,
}

/// Copy-out snapshot of one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub domain: DomainId,
    pub state: ThreadState,
    pub priority: Priority,
    pub cpu_time_ns: u64,
    pub block_reason: Option<BlockReason>,
    pub wake_reason: Option<WakeReason>,
}

struct Thread {
    id: ThreadId,
    domain: DomainId,
    state: ThreadState,
    priority: Priority,
    ctx: CpuContext,
    slice_remaining: u32,
    last_run_ns: u64,
    cpu_time_ns: u64,
    blocked_since_ns: u64,
    block_reason: Option<BlockReason>,
    wake_reason: Option<WakeReason>,
}

/// Outcome of a completed reschedule, for CPU-time charging by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Switch {
    pub from: ThreadId,
    pub from_domain: DomainId,
    pub to: ThreadId,
    pub to_domain: DomainId,
    pub from_ran_ns: u64,
}

/// Priority scheduler over a fixed thread table. One ready queue per
/// priority level, FIFO within a level, strict priority between levels.
pub struct Scheduler {
    threads: Vec<Option<Thread>>,
    ready: [VecDeque<ThreadId>; PRIORITY_LEVELS],
    current: Option<ThreadId>,
    idle: Option<ThreadId>,
    slice_ticks: u32,
    need_resched: bool,
}

impl Scheduler {
    pub fn new(capacity: usize, slice_ticks: u32) -> Self {
        let capacity = capacity.max(1);
        let mut threads = Vec::with_capacity(capacity);
        threads.resize_with(capacity, || None);
        Self {
            threads,
            ready: [const { VecDeque::new() }; PRIORITY_LEVELS],
            current: None,
            idle: None,
            slice_ticks: slice_ticks.max(1),
            need_resched: false,
        }
    }

    fn thread(&self, id: ThreadId) -> Result<&Thread, SchedError> {
        self.threads.get(id.index()).and_then(|t| t.as_ref()).ok_or(SchedError::Invalid)
    }

    fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread, SchedError> {
        self.threads.get_mut(id.index()).and_then(|t| t.as_mut()).ok_or(SchedError::Invalid)
    }

    /// Allocates a thread slot with a ready-to-run context and enqueues it.
    /// Quota charging happens in the kernel before this is called.
    pub fn create(
        &mut self,
        domain: DomainId,
        priority: Priority,
        ctx: CpuContext,
    ) -> Result<ThreadId, SchedError> {
        let index =
            self.threads.iter().position(|slot| slot.is_none()).ok_or(SchedError::NoSpace)?;
        let id = ThreadId::from_raw(index as u32);
        self.threads[index] = Some(Thread {
            id,
            domain,
            state: ThreadState::Ready,
            priority,
            ctx,
            slice_remaining: self.slice_ticks,
            last_run_ns: 0,
            cpu_time_ns: 0,
            blocked_since_ns: 0,
            block_reason: None,
            wake_reason: None,
        });
        self.ready[priority.index()].push_back(id);
        log_debug!(target: "sched", "thread {} created (domain {}, prio {})", id.raw(), domain.raw(), priority.raw());
        Ok(id)
    }

    /// Registers the CORE idle thread. It never sits in a ready queue; it is
    /// the fallback when every queue is empty.
    pub fn set_idle(&mut self, id: ThreadId) -> Result<(), SchedError> {
        let thread = self.thread_mut(id)?;
        thread.state = ThreadState::Ready;
        let priority = thread.priority;
        self.ready[priority.index()].retain(|t| *t != id);
        self.idle = Some(id);
        Ok(())
    }

    /// Removes a thread from every structure and frees its slot.
    pub fn destroy(&mut self, id: ThreadId) -> Result<DomainId, SchedError> {
        let thread = self.thread_mut(id)?;
        let domain = thread.domain;
        thread.state = ThreadState::Terminated;
        let priority = thread.priority;
        self.ready[priority.index()].retain(|t| *t != id);
        if self.current == Some(id) {
            self.current = None;
            self.need_resched = true;
        }
        if self.idle == Some(id) {
            self.idle = None;
        }
        self.threads[id.index()] = None;
        log_debug!(target: "sched", "thread {} destroyed", id.raw());
        Ok(domain)
    }

    /// Gives up the rest of the current time slice.
    pub fn yield_now(&mut self) {
        if let Some(current) = self.current {
            if let Ok(thread) = self.thread_mut(current) {
                thread.slice_remaining = 0;
            }
            self.need_resched = true;
        }
    }

    /// Timer-tick accounting: burns one tick of the current slice and flags
    /// a reschedule when it runs out (the slice is re-armed on dispatch).
    pub fn tick(&mut self) {
        let Some(current) = self.current else {
            return;
        };
        if let Ok(thread) = self.thread_mut(current) {
            thread.slice_remaining = thread.slice_remaining.saturating_sub(1);
            if thread.slice_remaining == 0 {
                self.need_resched = true;
            }
        }
    }

    /// Parks a thread. A running thread leaves the CPU at the next
    /// reschedule; a ready thread leaves its queue immediately.
    pub fn block(&mut self, id: ThreadId, reason: BlockReason, now: u64) -> Result<(), SchedError> {
        let was_current = self.current == Some(id);
        let thread = self.thread_mut(id)?;
        if was_current {
            // Charge the partial run; the dispatcher never sees this thread
            // as `previous` once it is parked.
            let ran = now.saturating_sub(thread.last_run_ns);
            thread.cpu_time_ns = thread.cpu_time_ns.saturating_add(ran);
        }
        match thread.state {
            ThreadState::Ready | ThreadState::Running => {}
            // Re-parking a blocked thread only updates the reason
            // (suspension overrides an IPC wait).
            ThreadState::Blocked | ThreadState::Waiting => {
                thread.block_reason = Some(reason);
                return Ok(());
            }
            ThreadState::Terminated => return Err(SchedError::Invalid),
        }
        thread.state = match reason {
            BlockReason::IpcWait | BlockReason::IpcReply => ThreadState::Waiting,
            _ => ThreadState::Blocked,
        };
        thread.block_reason = Some(reason);
        thread.blocked_since_ns = now;
        let priority = thread.priority;
        self.ready[priority.index()].retain(|t| *t != id);
        if self.current == Some(id) {
            self.current = None;
            self.need_resched = true;
        }
        Ok(())
    }

    /// Releases a parked thread to the tail of its priority queue. Waking a
    /// thread above the current priority requests a preemption.
    pub fn wake(&mut self, id: ThreadId, reason: WakeReason) -> Result<(), SchedError> {
        let current_priority = self
            .current
            .and_then(|c| self.thread(c).ok().map(|t| t.priority))
            .unwrap_or(Priority::Idle);
        let thread = self.thread_mut(id)?;
        match thread.state {
            ThreadState::Blocked | ThreadState::Waiting => {}
            _ => return Err(SchedError::Invalid),
        }
        thread.state = ThreadState::Ready;
        thread.block_reason = None;
        thread.wake_reason = Some(reason);
        let priority = thread.priority;
        self.ready[priority.index()].push_back(id);
        if priority > current_priority {
            self.need_resched = true;
        }
        Ok(())
    }

    /// Head of the highest non-empty queue, or the idle thread.
    pub fn pick_next(&self) -> Option<ThreadId> {
        for queue in self.ready.iter().rev() {
            if let Some(id) = queue.front() {
                return Some(*id);
            }
        }
        self.idle
    }

    /// True when a tick, wake or yield asked for a dispatch.
    pub fn resched_pending(&self) -> bool {
        self.need_resched || self.current.is_none()
    }

    /// Dispatches the next thread if it differs from the current one,
    /// performing the HAL context switch and returning the accounting info.
    /// The previous thread goes to the tail of its queue (round-robin)
    /// before the pick, so it competes fairly within its priority class.
    pub fn schedule(&mut self, now: u64, hal: &(impl ContextOps + ?Sized)) -> Option<Switch> {
        self.need_resched = false;
        let previous = self.current;
        if let Some(prev) = previous {
            let idle = self.idle;
            if let Ok(thread) = self.thread_mut(prev) {
                if thread.state == ThreadState::Running {
                    thread.state = ThreadState::Ready;
                    let priority = thread.priority;
                    if Some(prev) != idle {
                        self.ready[priority.index()].push_back(prev);
                    }
                }
            }
        }

        let Some(next) = self.pick_next() else {
            // Nothing runnable and no idle thread registered.
            self.current = None;
            return None;
        };
        let slice = self.slice_ticks;
        if Some(next) == previous {
            // Sole runnable thread of the top class: keep it, fresh slice.
            if let Ok(thread) = self.thread_mut(next) {
                thread.state = ThreadState::Running;
                thread.slice_remaining = slice;
                let priority = thread.priority;
                self.ready[priority.index()].retain(|t| *t != next);
            }
            return None;
        }

        // Retire the outgoing thread.
        let mut from_ran_ns = 0;
        let mut from_domain = DomainId::CORE;
        let mut from_ctx = CpuContext::ZERO;
        let from = previous.unwrap_or(next);
        if let Some(prev) = previous {
            if let Ok(thread) = self.thread_mut(prev) {
                from_ran_ns = now.saturating_sub(thread.last_run_ns);
                thread.cpu_time_ns = thread.cpu_time_ns.saturating_add(from_ran_ns);
                from_domain = thread.domain;
                from_ctx = thread.ctx;
            }
        }

        // Dispatch the incoming thread.
        let Ok(thread) = self.thread_mut(next) else {
            return None;
        };
        let to_domain = thread.domain;
        thread.state = ThreadState::Running;
        thread.slice_remaining = slice;
        thread.last_run_ns = now;
        let to_ctx = thread.ctx;
        let priority = thread.priority;
        self.ready[priority.index()].retain(|t| *t != next);
        self.current = Some(next);

        hal.context_switch(&mut from_ctx, &to_ctx);
        if let Some(prev) = previous {
            if let Ok(thread) = self.thread_mut(prev) {
                thread.ctx = from_ctx;
            }
        }
        Some(Switch { from, from_domain, to: next, to_domain, from_ran_ns })
    }

    /// Direct dispatch used by the domain-switch call gate: makes `id` the
    /// running thread regardless of queue order. The target must be ready
    /// (wake it first); the outgoing thread rotates to its queue tail.
    pub fn dispatch(
        &mut self,
        id: ThreadId,
        now: u64,
        hal: &(impl ContextOps + ?Sized),
    ) -> Result<Option<Switch>, SchedError> {
        if self.thread(id)?.state != ThreadState::Ready {
            if self.current == Some(id) {
                return Ok(None);
            }
            return Err(SchedError::Invalid);
        }
        self.need_resched = false;
        let previous = self.current;

        let mut from_ran_ns = 0;
        let mut from_domain = DomainId::CORE;
        let mut from_ctx = CpuContext::ZERO;
        let from = previous.unwrap_or(id);
        if let Some(prev) = previous {
            let idle = self.idle;
            if let Ok(thread) = self.thread_mut(prev) {
                from_ran_ns = now.saturating_sub(thread.last_run_ns);
                thread.cpu_time_ns = thread.cpu_time_ns.saturating_add(from_ran_ns);
                from_domain = thread.domain;
                from_ctx = thread.ctx;
                if thread.state == ThreadState::Running {
                    thread.state = ThreadState::Ready;
                    let priority = thread.priority;
                    if Some(prev) != idle {
                        self.ready[priority.index()].push_back(prev);
                    }
                }
            }
        }

        let slice = self.slice_ticks;
        let thread = self.thread_mut(id)?;
        let to_domain = thread.domain;
        thread.state = ThreadState::Running;
        thread.slice_remaining = slice;
        thread.last_run_ns = now;
        let to_ctx = thread.ctx;
        let priority = thread.priority;
        self.ready[priority.index()].retain(|t| *t != id);
        self.current = Some(id);

        hal.context_switch(&mut from_ctx, &to_ctx);
        if let Some(prev) = previous {
            if let Ok(thread) = self.thread_mut(prev) {
                thread.ctx = from_ctx;
            }
        }
        Ok(Some(Switch { from, from_domain, to: id, to_domain, from_ran_ns }))
    }

    /// Safety-net sweep waking blocked or waiting threads whose park time
    /// exceeded `threshold_ns`. Returns the woken thread ids.
    pub fn check_timeouts(&mut self, now: u64, threshold_ns: u64) -> Vec<ThreadId> {
        let mut expired = Vec::new();
        for slot in self.threads.iter().flatten() {
            let parked = matches!(slot.state, ThreadState::Blocked | ThreadState::Waiting);
            if parked && now.saturating_sub(slot.blocked_since_ns) >= threshold_ns {
                expired.push(slot.id);
            }
        }
        for id in &expired {
            let _ = self.wake(*id, WakeReason::Timeout);
            log_warn!(target: "sched", "thread {} woke on timeout", id.raw());
        }
        expired
    }

    /// Parks every live thread of `domain` (domain suspension).
    pub fn suspend_domain(&mut self, domain: DomainId, now: u64) {
        let ids: Vec<ThreadId> = self
            .threads
            .iter()
            .flatten()
            .filter(|t| t.domain == domain && t.state != ThreadState::Terminated)
            .map(|t| t.id)
            .collect();
        for id in ids {
            let _ = self.block(id, BlockReason::Suspended, now);
        }
    }

    /// Releases the threads parked by a suspension of `domain`.
    pub fn resume_domain(&mut self, domain: DomainId) {
        let ids: Vec<ThreadId> = self
            .threads
            .iter()
            .flatten()
            .filter(|t| t.domain == domain && t.block_reason == Some(BlockReason::Suspended))
            .map(|t| t.id)
            .collect();
        for id in ids {
            let _ = self.wake(id, WakeReason::DomainResumed);
        }
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn thread_info(&self, id: ThreadId) -> Result<ThreadInfo, SchedError> {
        let thread = self.thread(id)?;
        Ok(ThreadInfo {
            id: thread.id,
            domain: thread.domain,
            state: thread.state,
            priority: thread.priority,
            cpu_time_ns: thread.cpu_time_ns,
            block_reason: thread.block_reason,
            wake_reason: thread.wake_reason,
        })
    }

    pub fn domain_of(&self, id: ThreadId) -> Result<DomainId, SchedError> {
        Ok(self.thread(id)?.domain)
    }

    /// Saved context access for the domain-switch path.
    pub fn context(&self, id: ThreadId) -> Result<CpuContext, SchedError> {
        Ok(self.thread(id)?.ctx)
    }

    pub fn set_context(&mut self, id: ThreadId, ctx: CpuContext) -> Result<(), SchedError> {
        self.thread_mut(id)?.ctx = ctx;
        Ok(())
    }

    pub fn threads_of(&self, domain: DomainId) -> Vec<ThreadId> {
        self.threads
            .iter()
            .flatten()
            .filter(|t| t.domain == domain)
            .map(|t| t.id)
            .collect()
    }

    /// Structural invariant: at most one RUNNING thread, and no thread both
    /// running and queued.
    pub fn verify(&self) -> Result<(), &'static str> {
        let running = self.threads.iter().flatten().filter(|t| t.state == ThreadState::Running);
        if running.count() > 1 {
            return Err("sched: more than one running thread");
        }
        for queue in &self.ready {
            for id in queue {
                if Some(*id) == self.current {
                    return Err("sched: current thread still queued");
                }
                match self.thread(*id) {
                    Ok(t) if t.state == ThreadState::Ready => {}
                    _ => return Err("sched: queued thread not ready"),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::host::HostMachine;
    use crate::hal::Timer;

    const D1: DomainId = DomainId::from_raw(1);

    fn fixture() -> (Scheduler, HostMachine) {
        (Scheduler::new(16, 4), HostMachine::new(0))
    }

    fn spawn(sched: &mut Scheduler, priority: Priority) -> ThreadId {
        sched.create(D1, priority, CpuContext::ZERO).unwrap()
    }

    #[test]
    fn strict_priority_then_fifo() {
        let (mut sched, hal) = fixture();
        let low = spawn(&mut sched, Priority::Low);
        let norm_a = spawn(&mut sched, Priority::Normal);
        let norm_b = spawn(&mut sched, Priority::Normal);
        assert_eq!(sched.schedule(0, &hal).map(|s| s.to), Some(norm_a));
        sched.yield_now();
        assert_eq!(sched.schedule(1, &hal).map(|s| s.to), Some(norm_b));
        sched.yield_now();
        assert_eq!(sched.schedule(2, &hal).map(|s| s.to), Some(norm_a));
        // The low thread only runs once the normal queue is parked.
        sched.block(norm_a, BlockReason::Requested, 2).unwrap();
        sched.block(norm_b, BlockReason::Requested, 2).unwrap();
        assert_eq!(sched.schedule(3, &hal).map(|s| s.to), Some(low));
        sched.verify().unwrap();
    }

    #[test]
    fn wake_of_higher_priority_preempts() {
        let (mut sched, hal) = fixture();
        let low = spawn(&mut sched, Priority::Low);
        let hi = spawn(&mut sched, Priority::Realtime);
        assert_eq!(sched.schedule(0, &hal).map(|s| s.to), Some(hi));
        sched.block(hi, BlockReason::Requested, 0).unwrap();
        assert_eq!(sched.schedule(1, &hal).map(|s| s.to), Some(low));
        assert!(!sched.resched_pending());
        // Timer interrupt wakes the realtime thread.
        sched.wake(hi, WakeReason::Requested).unwrap();
        assert!(sched.resched_pending());
        assert_eq!(sched.pick_next(), Some(hi));
        let switch = sched.schedule(2, &hal).unwrap();
        assert_eq!(switch.to, hi);
        // The preempted low thread sits at the tail of its queue.
        assert_eq!(sched.thread_info(low).unwrap().state, ThreadState::Ready);
        sched.verify().unwrap();
    }

    #[test]
    fn slice_exhaustion_rotates_round_robin() {
        let (mut sched, hal) = fixture();
        let a = spawn(&mut sched, Priority::Normal);
        let b = spawn(&mut sched, Priority::Normal);
        assert_eq!(sched.schedule(0, &hal).map(|s| s.to), Some(a));
        for _ in 0..3 {
            sched.tick();
            assert!(!sched.resched_pending());
        }
        sched.tick();
        assert!(sched.resched_pending());
        assert_eq!(sched.schedule(4, &hal).map(|s| s.to), Some(b));
        sched.verify().unwrap();
    }

    #[test]
    fn idle_thread_is_fallback_only() {
        let (mut sched, hal) = fixture();
        let idle = sched.create(DomainId::CORE, Priority::Idle, CpuContext::ZERO).unwrap();
        sched.set_idle(idle).unwrap();
        assert_eq!(sched.schedule(0, &hal).map(|s| s.to), Some(idle));
        let worker = spawn(&mut sched, Priority::Normal);
        assert_eq!(sched.schedule(1, &hal).map(|s| s.to), Some(worker));
        sched.block(worker, BlockReason::Requested, 1).unwrap();
        // Idle comes back without ever sitting in a queue.
        assert_eq!(sched.schedule(2, &hal).map(|s| s.to), Some(idle));
        sched.verify().unwrap();
    }

    #[test]
    fn timeout_sweep_wakes_expired_blocks() {
        let (mut sched, hal) = fixture();
        let a = spawn(&mut sched, Priority::Normal);
        let b = spawn(&mut sched, Priority::Normal);
        assert_eq!(sched.schedule(0, &hal).map(|s| s.to), Some(a));
        sched.block(a, BlockReason::Requested, 100).unwrap();
        sched.block(b, BlockReason::IpcWait, 500).unwrap();
        assert!(sched.check_timeouts(400, 1_000).is_empty());
        let woken = sched.check_timeouts(1_200, 1_000);
        assert_eq!(woken, [a]);
        assert_eq!(sched.thread_info(a).unwrap().wake_reason, Some(WakeReason::Timeout));
        let woken = sched.check_timeouts(1_600, 1_000);
        assert_eq!(woken, [b]);
    }

    #[test]
    fn suspend_and_resume_domain_parks_threads() {
        let (mut sched, hal) = fixture();
        let a = spawn(&mut sched, Priority::Normal);
        let b = spawn(&mut sched, Priority::High);
        assert_eq!(sched.schedule(0, &hal).map(|s| s.to), Some(b));
        sched.suspend_domain(D1, 10);
        assert_eq!(sched.thread_info(a).unwrap().state, ThreadState::Blocked);
        assert_eq!(sched.thread_info(b).unwrap().state, ThreadState::Blocked);
        assert_eq!(sched.pick_next(), None);
        sched.resume_domain(D1);
        assert_eq!(sched.thread_info(b).unwrap().wake_reason, Some(WakeReason::DomainResumed));
        assert_eq!(sched.schedule(20, &hal).map(|s| s.to), Some(b));
        sched.verify().unwrap();
    }

    #[test]
    fn cpu_time_accumulates_across_switches() {
        let (mut sched, hal) = fixture();
        let a = spawn(&mut sched, Priority::Normal);
        let b = spawn(&mut sched, Priority::Normal);
        hal.advance(0);
        assert_eq!(sched.schedule(hal.timestamp(), &hal).map(|s| s.to), Some(a));
        hal.advance(5_000);
        sched.yield_now();
        let switch = sched.schedule(hal.timestamp(), &hal).unwrap();
        assert_eq!(switch.to, b);
        assert_eq!(switch.from_ran_ns, 5_000);
        assert_eq!(sched.thread_info(a).unwrap().cpu_time_ns, 5_000);
    }
}
