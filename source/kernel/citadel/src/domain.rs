// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Protection-context lifecycle, quotas and resource ownership
//! OWNERS: @core-team
//! PUBLIC API: DomainTable (create/destroy/suspend/resume/charge/get_info), Quota, ChargedFrames
//! DEPENDS_ON: mm::{AddressSpace, FrameAllocator}, types::DomainId
//! INVARIANTS: usage <= quota componentwise; the FSM admits only
//!             INIT->RUNNING->SUSPENDED->RUNNING and ->TERMINATED; a domain
//!             dies only with empty thread and capability sets

extern crate alloc;

use alloc::vec::Vec;

use crate::mm::frame::OwnerFrames;
use crate::mm::{AddressSpace, FrameAllocator, FrameError, FrameKind, FrameSource};
use crate::types::{DomainId, PhysAddr};

/// Trust tier of a domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainKind {
    Core,
    Privileged,
    Application,
}

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainState {
    Init,
    Running,
    Suspended,
    Terminated,
}

/// Per-domain resource ceilings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    pub max_frames: usize,
    pub max_threads: usize,
    pub max_caps: usize,
    pub cpu_percent: u8,
}

impl Quota {
    pub const UNLIMITED: Self =
        Self { max_frames: usize::MAX, max_threads: usize::MAX, max_caps: usize::MAX, cpu_percent: 100 };
}

/// Current consumption, charged and released atomically inside the core's
/// critical sections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub frames: usize,
    pub threads: usize,
    pub caps: usize,
    pub cpu_time_ns: u64,
}

/// Chargeable resource classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Frames,
    Threads,
    Caps,
}

/// Errors produced by domain operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainError {
    /// Unknown id, table full, or an FSM transition that does not exist.
    Invalid,
    /// No free domain slots.
    NoSpace,
    /// Charging would exceed the quota.
    Quota,
    /// Threads or capabilities still attached.
    Busy,
}

/// Copy-out snapshot for introspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainInfo {
    pub id: DomainId,
    pub kind: DomainKind,
    pub state: DomainState,
    pub quota: Quota,
    pub usage: Usage,
    pub parent: Option<DomainId>,
}

struct Domain {
    id: DomainId,
    kind: DomainKind,
    state: DomainState,
    quota: Quota,
    usage: Usage,
    parent: Option<DomainId>,
    // Taken out while the kernel edits mappings, always restored before the
    // critical section ends.
    space: Option<AddressSpace>,
}

/// Fixed table of protection domains.
pub struct DomainTable {
    slots: Vec<Option<Domain>>,
}

impl DomainTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    fn domain(&self, id: DomainId) -> Result<&Domain, DomainError> {
        self.slots.get(id.index()).and_then(|d| d.as_ref()).ok_or(DomainError::Invalid)
    }

    fn domain_mut(&mut self, id: DomainId) -> Result<&mut Domain, DomainError> {
        self.slots.get_mut(id.index()).and_then(|d| d.as_mut()).ok_or(DomainError::Invalid)
    }

    /// Allocates a slot, builds the root translation tree (one frame, charged
    /// against the new quota) and leaves the domain in `Init`.
    pub fn create(
        &mut self,
        kind: DomainKind,
        parent: Option<DomainId>,
        quota: Quota,
        pmm: &mut FrameAllocator,
    ) -> Result<DomainId, DomainError> {
        if let Some(parent) = parent {
            self.domain(parent)?;
        }
        let index =
            self.slots.iter().position(|slot| slot.is_none()).ok_or(DomainError::NoSpace)?;
        let id = DomainId::from_raw(index as u16);
        if quota.max_frames < 1 {
            return Err(DomainError::Quota);
        }
        let mut frames = OwnerFrames { pmm, owner: id };
        let space = AddressSpace::create(&mut frames, id).map_err(|_| DomainError::NoSpace)?;
        let usage = Usage { frames: 1, ..Usage::default() };
        self.slots[index] =
            Some(Domain { id, kind, state: DomainState::Init, quota, usage, parent, space: Some(space) });
        log_info!(target: "domain", "created domain {} ({:?})", id.raw(), kind);
        Ok(id)
    }

    /// Tears a domain down. Requires `Init` or `Suspended` and empty thread
    /// and capability sets; the translation tree goes back to the allocator
    /// and the slot becomes reusable.
    pub fn destroy(&mut self, id: DomainId, pmm: &mut FrameAllocator) -> Result<(), DomainError> {
        let domain = self.domain_mut(id)?;
        match domain.state {
            DomainState::Init | DomainState::Suspended => {}
            DomainState::Running | DomainState::Terminated => return Err(DomainError::Busy),
        }
        if domain.usage.threads != 0 {
            return Err(DomainError::Busy);
        }
        if domain.usage.caps != 0 {
            return Err(DomainError::Busy);
        }
        let space = domain.space.take();
        domain.state = DomainState::Terminated;
        if let Some(space) = space {
            let mut frames = OwnerFrames { pmm, owner: id };
            let freed = space.destroy(&mut frames);
            let domain = self.domain_mut(id)?;
            domain.usage.frames = domain.usage.frames.saturating_sub(freed);
        }
        // TERMINATED is absorbing; the slot itself may be reused later.
        self.slots[id.index()] = None;
        log_info!(target: "domain", "destroyed domain {}", id.raw());
        Ok(())
    }

    /// INIT -> RUNNING.
    pub fn start(&mut self, id: DomainId) -> Result<(), DomainError> {
        let domain = self.domain_mut(id)?;
        if domain.state != DomainState::Init {
            return Err(DomainError::Invalid);
        }
        domain.state = DomainState::Running;
        Ok(())
    }

    /// RUNNING -> SUSPENDED. The scheduler-side thread parking is the
    /// kernel's job; the table only tracks the state.
    pub fn suspend(&mut self, id: DomainId) -> Result<(), DomainError> {
        let domain = self.domain_mut(id)?;
        if domain.state != DomainState::Running {
            return Err(DomainError::Invalid);
        }
        domain.state = DomainState::Suspended;
        Ok(())
    }

    /// SUSPENDED -> RUNNING.
    pub fn resume(&mut self, id: DomainId) -> Result<(), DomainError> {
        let domain = self.domain_mut(id)?;
        if domain.state != DomainState::Suspended {
            return Err(DomainError::Invalid);
        }
        domain.state = DomainState::Running;
        Ok(())
    }

    pub fn state(&self, id: DomainId) -> Result<DomainState, DomainError> {
        Ok(self.domain(id)?.state)
    }

    /// Check-and-increment against the quota; the counter either moves fully
    /// or not at all.
    pub fn charge(
        &mut self,
        id: DomainId,
        resource: Resource,
        delta: usize,
    ) -> Result<(), DomainError> {
        let domain = self.domain_mut(id)?;
        let (current, limit) = match resource {
            Resource::Frames => (&mut domain.usage.frames, domain.quota.max_frames),
            Resource::Threads => (&mut domain.usage.threads, domain.quota.max_threads),
            Resource::Caps => (&mut domain.usage.caps, domain.quota.max_caps),
        };
        let next = current.checked_add(delta).ok_or(DomainError::Quota)?;
        if next > limit {
            log_warn!(target: "domain", "quota hit: domain {} {:?} {}+{} > {}", id.raw(), resource, current, delta, limit);
            return Err(DomainError::Quota);
        }
        *current = next;
        Ok(())
    }

    /// Releases previously charged consumption.
    pub fn uncharge(&mut self, id: DomainId, resource: Resource, delta: usize) {
        if let Ok(domain) = self.domain_mut(id) {
            let current = match resource {
                Resource::Frames => &mut domain.usage.frames,
                Resource::Threads => &mut domain.usage.threads,
                Resource::Caps => &mut domain.usage.caps,
            };
            *current = current.saturating_sub(delta);
        }
    }

    /// Accumulates CPU time consumed by a thread of this domain.
    pub fn charge_cpu(&mut self, id: DomainId, delta_ns: u64) {
        if let Ok(domain) = self.domain_mut(id) {
            domain.usage.cpu_time_ns = domain.usage.cpu_time_ns.saturating_add(delta_ns);
        }
    }

    pub fn get_info(&self, id: DomainId) -> Result<DomainInfo, DomainError> {
        let domain = self.domain(id)?;
        Ok(DomainInfo {
            id: domain.id,
            kind: domain.kind,
            state: domain.state,
            quota: domain.quota,
            usage: domain.usage,
            parent: domain.parent,
        })
    }

    pub fn kind(&self, id: DomainId) -> Result<DomainKind, DomainError> {
        Ok(self.domain(id)?.kind)
    }

    /// Root of the domain's translation tree (for `switch_to`).
    pub fn page_root(&self, id: DomainId) -> Result<PhysAddr, DomainError> {
        let domain = self.domain(id)?;
        domain.space.as_ref().map(|s| s.root()).ok_or(DomainError::Invalid)
    }

    /// Read-only view of the domain's translation tree.
    pub fn space(&self, id: DomainId) -> Result<&AddressSpace, DomainError> {
        self.domain(id)?.space.as_ref().ok_or(DomainError::Invalid)
    }

    /// Detaches the translation tree so the kernel can edit mappings while
    /// this table stays borrowable for quota charging. Must be paired with
    /// [`DomainTable::put_space`] before the critical section ends.
    pub fn take_space(&mut self, id: DomainId) -> Result<AddressSpace, DomainError> {
        self.domain_mut(id)?.space.take().ok_or(DomainError::Invalid)
    }

    pub fn put_space(&mut self, id: DomainId, space: AddressSpace) {
        if let Ok(domain) = self.domain_mut(id) {
            domain.space = Some(space);
        }
    }

    /// Componentwise usage <= quota, for the invariant sweep.
    pub fn verify(&self) -> Result<(), &'static str> {
        for domain in self.slots.iter().flatten() {
            if domain.usage.frames > domain.quota.max_frames
                || domain.usage.threads > domain.quota.max_threads
                || domain.usage.caps > domain.quota.max_caps
            {
                return Err("domain: usage exceeds quota");
            }
        }
        Ok(())
    }
}

/// [`FrameSource`] that charges every allocation against the owner's frame
/// quota before touching the bitmap, and releases the charge on free.
pub struct ChargedFrames<'a> {
    pub pmm: &'a mut FrameAllocator,
    pub domains: &'a mut DomainTable,
    pub owner: DomainId,
}

impl ChargedFrames<'_> {
    fn kind_for(&self) -> FrameKind {
        match self.domains.kind(self.owner) {
            Ok(DomainKind::Core) => FrameKind::Core,
            Ok(DomainKind::Privileged) => FrameKind::Privileged,
            Ok(DomainKind::Application) | Err(_) => FrameKind::Application,
        }
    }
}

impl FrameSource for ChargedFrames<'_> {
    fn alloc(&mut self, count: usize, kind: FrameKind) -> Result<PhysAddr, FrameError> {
        let kind = if kind == FrameKind::PageTable { kind } else { self.kind_for() };
        self.domains
            .charge(self.owner, Resource::Frames, count)
            .map_err(|_| FrameError::NoMemory)?;
        match self.pmm.alloc_frames(self.owner, count, kind) {
            Ok(addr) => Ok(addr),
            Err(err) => {
                self.domains.uncharge(self.owner, Resource::Frames, count);
                Err(err)
            }
        }
    }

    fn free(&mut self, base: PhysAddr, count: usize) -> Result<(), FrameError> {
        self.pmm.free_frames(base, count)?;
        self.domains.uncharge(self.owner, Resource::Frames, count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testutil::leak_window;
    use crate::mm::FRAME_SIZE;

    fn fixture() -> (DomainTable, FrameAllocator) {
        let base = leak_window(64);
        let mut pmm = FrameAllocator::new(base, 64);
        pmm.add_region(base, 64 * FRAME_SIZE).unwrap();
        (DomainTable::new(8), pmm)
    }

    fn small_quota() -> Quota {
        Quota { max_frames: 8, max_threads: 2, max_caps: 4, cpu_percent: 50 }
    }

    #[test]
    fn lifecycle_fsm() {
        let (mut domains, mut pmm) = fixture();
        let id = domains.create(DomainKind::Application, None, small_quota(), &mut pmm).unwrap();
        assert_eq!(domains.state(id), Ok(DomainState::Init));
        // Cannot resume out of INIT.
        assert_eq!(domains.resume(id), Err(DomainError::Invalid));
        domains.start(id).unwrap();
        assert_eq!(domains.suspend(id), Ok(()));
        assert_eq!(domains.suspend(id), Err(DomainError::Invalid));
        domains.resume(id).unwrap();
        // A running domain cannot be destroyed.
        assert_eq!(domains.destroy(id, &mut pmm), Err(DomainError::Busy));
        domains.suspend(id).unwrap();
        domains.destroy(id, &mut pmm).unwrap();
        assert_eq!(domains.state(id), Err(DomainError::Invalid));
    }

    #[test]
    fn destroy_returns_root_table_frame() {
        let (mut domains, mut pmm) = fixture();
        let before = pmm.stats();
        let id = domains.create(DomainKind::Privileged, None, small_quota(), &mut pmm).unwrap();
        assert_eq!(pmm.stats().used, before.used + 1);
        domains.destroy(id, &mut pmm).unwrap();
        assert_eq!(pmm.stats(), before);
    }

    #[test]
    fn charge_is_check_then_increment() {
        let (mut domains, mut pmm) = fixture();
        let id = domains.create(DomainKind::Application, None, small_quota(), &mut pmm).unwrap();
        domains.charge(id, Resource::Threads, 2).unwrap();
        assert_eq!(domains.charge(id, Resource::Threads, 1), Err(DomainError::Quota));
        // The failed charge moved nothing.
        assert_eq!(domains.get_info(id).unwrap().usage.threads, 2);
        domains.uncharge(id, Resource::Threads, 1);
        domains.charge(id, Resource::Threads, 1).unwrap();
        domains.verify().unwrap();
    }

    #[test]
    fn busy_domain_refuses_destroy() {
        let (mut domains, mut pmm) = fixture();
        let id = domains.create(DomainKind::Application, None, small_quota(), &mut pmm).unwrap();
        domains.charge(id, Resource::Threads, 1).unwrap();
        assert_eq!(domains.destroy(id, &mut pmm), Err(DomainError::Busy));
        domains.uncharge(id, Resource::Threads, 1);
        domains.charge(id, Resource::Caps, 1).unwrap();
        assert_eq!(domains.destroy(id, &mut pmm), Err(DomainError::Busy));
        domains.uncharge(id, Resource::Caps, 1);
        domains.destroy(id, &mut pmm).unwrap();
    }

    #[test]
    fn charged_source_enforces_frame_quota() {
        let (mut domains, mut pmm) = fixture();
        let quota = Quota { max_frames: 3, ..small_quota() };
        let id = domains.create(DomainKind::Application, None, quota, &mut pmm).unwrap();
        let mut source = ChargedFrames { pmm: &mut pmm, domains: &mut domains, owner: id };
        // Root already holds one frame; two more fit, the third does not.
        let a = source.alloc(2, FrameKind::Application).unwrap();
        assert_eq!(source.alloc(1, FrameKind::Application), Err(FrameError::NoMemory));
        source.free(a, 2).unwrap();
        assert_eq!(domains.get_info(id).unwrap().usage.frames, 1);
        domains.verify().unwrap();
    }

    #[test]
    fn parent_must_exist() {
        let (mut domains, mut pmm) = fixture();
        assert_eq!(
            domains.create(
                DomainKind::Application,
                Some(DomainId::from_raw(5)),
                small_quota(),
                &mut pmm
            ),
            Err(DomainError::Invalid)
        );
    }
}
