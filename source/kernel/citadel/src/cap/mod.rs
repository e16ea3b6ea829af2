// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Global capability table: the authoritative authority registry
//! OWNERS: @core-cap-team
//! PUBLIC API: CapTable (create_*/grant/check_access/derive/transfer/revoke/release), Rights
//! DEPENDS_ON: cap::handle, types::{CapId, DomainId, PhysAddr}
//! INVARIANTS: record.id == slot index for every live record; derived rights
//!             are a subset of the parent's; transfer and derive never widen;
//!             revocation is total and instantaneous

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::types::{CapId, DomainId, PhysAddr};

pub mod handle;

pub use handle::DomainKey;

use crate::types::CapHandle;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Rights a capability conveys over its object.
    pub struct Rights: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const MAP = 1 << 3;
        /// Authorises a domain-switch call through an endpoint.
        const CALL = 1 << 4;
        const MANAGE = 1 << 5;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Record state flags.
    pub struct CapFlags: u8 {
        const REVOKED = 1 << 0;
        /// The capability can never change owner.
        const IMMUTABLE = 1 << 1;
    }
}

/// Typed payload of a capability record. `Derived` records resolve their
/// concrete object through the parent link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapKind {
    Memory { base: PhysAddr, len: usize },
    Mmio { base: PhysAddr, len: usize },
    Endpoint { target: DomainId },
    Irq { vector: u32 },
    Derived { parent: CapId },
}

/// One slot of the global table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapRecord {
    pub id: CapId,
    pub kind: CapKind,
    pub rights: Rights,
    pub owner: DomainId,
    pub flags: CapFlags,
    pub refcount: u32,
}

/// Errors produced by capability operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapError {
    /// Id does not name a live record (empty slot or stamped-id mismatch).
    Stale,
    /// Malformed argument or a derivation that is not a subset.
    Invalid,
    /// Table full.
    NoSpace,
    /// Wrong owner, wrong domain, bad MAC, insufficient rights, immutable.
    Permission,
    /// The capability or one of its ancestors was revoked.
    Revoked,
}

/// Fixed global table of capability records plus the per-domain handle keys.
/// Slot 0 is reserved and never valid, so a zero id can travel as "none".
pub struct CapTable {
    slots: Vec<Option<CapRecord>>,
    keys: Vec<Option<DomainKey>>,
}

impl CapTable {
    /// Creates a table with `capacity` slots (slot 0 included and reserved)
    /// and key storage for `max_domains` domains.
    pub fn new(capacity: usize, max_domains: usize) -> Self {
        let capacity = capacity.max(2);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize(capacity, None);
        let mut keys = Vec::with_capacity(max_domains);
        keys.resize(max_domains, None);
        Self { slots, keys }
    }

    /// Registers the handle key for `domain`. Called by domain creation.
    pub fn install_key(&mut self, domain: DomainId, key: DomainKey) -> Result<(), CapError> {
        let slot = self.keys.get_mut(domain.index()).ok_or(CapError::Invalid)?;
        *slot = Some(key);
        Ok(())
    }

    /// Zeroes and removes the key for `domain`. Called by domain destruction;
    /// any handle sealed under the old key dies with it.
    pub fn purge_key(&mut self, domain: DomainId) {
        if let Some(slot) = self.keys.get_mut(domain.index()) {
            *slot = Some([0, 0]);
            *slot = None;
        }
    }

    fn key_for(&self, domain: DomainId) -> Result<&DomainKey, CapError> {
        self.keys.get(domain.index()).and_then(|k| k.as_ref()).ok_or(CapError::Invalid)
    }

    fn insert(&mut self, record: CapRecord) -> Result<CapId, CapError> {
        // First-fit from slot 1; slot 0 stays reserved.
        for index in 1..self.slots.len() {
            if self.slots[index].is_none() {
                let id = CapId::from_raw(index as u16);
                self.slots[index] = Some(CapRecord { id, ..record });
                return Ok(id);
            }
        }
        Err(CapError::NoSpace)
    }

    fn record(&self, cap: CapId) -> Result<&CapRecord, CapError> {
        let record =
            self.slots.get(cap.index()).and_then(|s| s.as_ref()).ok_or(CapError::Stale)?;
        if record.id != cap {
            return Err(CapError::Stale);
        }
        Ok(record)
    }

    fn record_mut(&mut self, cap: CapId) -> Result<&mut CapRecord, CapError> {
        let record =
            self.slots.get_mut(cap.index()).and_then(|s| s.as_mut()).ok_or(CapError::Stale)?;
        if record.id != cap {
            return Err(CapError::Stale);
        }
        Ok(record)
    }

    /// Live (not revoked) record lookup.
    pub fn get(&self, cap: CapId) -> Result<&CapRecord, CapError> {
        let record = self.record(cap)?;
        if record.flags.contains(CapFlags::REVOKED) {
            return Err(CapError::Revoked);
        }
        Ok(record)
    }

    pub fn create_memory(
        &mut self,
        owner: DomainId,
        base: PhysAddr,
        len: usize,
        rights: Rights,
    ) -> Result<CapId, CapError> {
        if len == 0 {
            return Err(CapError::Invalid);
        }
        self.insert(CapRecord {
            id: CapId::NONE,
            kind: CapKind::Memory { base, len },
            rights,
            owner,
            flags: CapFlags::empty(),
            refcount: 1,
        })
    }

    pub fn create_endpoint(
        &mut self,
        owner: DomainId,
        target: DomainId,
    ) -> Result<CapId, CapError> {
        self.insert(CapRecord {
            id: CapId::NONE,
            kind: CapKind::Endpoint { target },
            rights: Rights::CALL | Rights::MANAGE,
            owner,
            flags: CapFlags::empty(),
            refcount: 1,
        })
    }

    pub fn create_mmio(
        &mut self,
        owner: DomainId,
        base: PhysAddr,
        len: usize,
    ) -> Result<CapId, CapError> {
        if len == 0 {
            return Err(CapError::Invalid);
        }
        self.insert(CapRecord {
            id: CapId::NONE,
            kind: CapKind::Mmio { base, len },
            rights: Rights::READ | Rights::WRITE | Rights::MAP,
            owner,
            flags: CapFlags::empty(),
            refcount: 1,
        })
    }

    pub fn create_irq(&mut self, owner: DomainId, vector: u32) -> Result<CapId, CapError> {
        self.insert(CapRecord {
            id: CapId::NONE,
            kind: CapKind::Irq { vector },
            rights: Rights::MANAGE,
            owner,
            flags: CapFlags::empty(),
            refcount: 1,
        })
    }

    /// Marks a capability as permanently non-transferable.
    pub fn set_immutable(&mut self, cap: CapId) -> Result<(), CapError> {
        let record = self.record_mut(cap)?;
        record.flags |= CapFlags::IMMUTABLE;
        Ok(())
    }

    /// Seals a handle presenting `cap` to `domain`. No new record is created;
    /// the same id yields a different token in every domain.
    pub fn grant(&self, domain: DomainId, cap: CapId) -> Result<CapHandle, CapError> {
        let record = self.get(cap)?;
        let key = self.key_for(domain)?;
        Ok(handle::seal(domain, record.id, key))
    }

    /// Authenticates `handle` for `current` and checks `required` rights.
    /// The checks run in fixed order so failures are classified stably:
    /// claimed-domain, slot identity, revocation, MAC, ownership, rights.
    /// The ownership check is what retires the previous owner's handles the
    /// instant a capability is transferred.
    pub fn check_access(
        &self,
        current: DomainId,
        handle: CapHandle,
        required: Rights,
    ) -> Result<CapId, CapError> {
        let (claimed, cap, _mac) = handle::fields(handle);
        if claimed != current {
            return Err(CapError::Permission);
        }
        let record = self.record(cap)?;
        if record.flags.contains(CapFlags::REVOKED) {
            return Err(CapError::Revoked);
        }
        let key = self.key_for(current)?;
        if !handle::verify(handle, key) {
            return Err(CapError::Permission);
        }
        if record.owner != current {
            return Err(CapError::Permission);
        }
        if !record.rights.contains(required) {
            return Err(CapError::Permission);
        }
        Ok(cap)
    }

    /// Creates a child capability with a subset of the parent's rights.
    pub fn derive(
        &mut self,
        owner: DomainId,
        parent: CapId,
        sub_rights: Rights,
    ) -> Result<CapId, CapError> {
        let parent_record = self.get(parent)?;
        if parent_record.owner != owner || !parent_record.rights.contains(sub_rights) {
            return Err(CapError::Invalid);
        }
        let child = self.insert(CapRecord {
            id: CapId::NONE,
            kind: CapKind::Derived { parent },
            rights: sub_rights,
            owner,
            flags: CapFlags::empty(),
            refcount: 1,
        })?;
        // Children pin their parent slot until revoked.
        if let Ok(parent_record) = self.record_mut(parent) {
            parent_record.refcount += 1;
        }
        Ok(child)
    }

    /// Moves ownership of `cap` from `from` to `to` and seals a handle for
    /// the new owner. Handles held by `from` die on the domain-mismatch check
    /// the moment ownership changes.
    pub fn transfer(
        &mut self,
        from: DomainId,
        to: DomainId,
        cap: CapId,
    ) -> Result<CapHandle, CapError> {
        // New owner must be able to receive handles before anything mutates.
        self.key_for(to)?;
        let record = self.record_mut(cap)?;
        if record.flags.contains(CapFlags::REVOKED) {
            return Err(CapError::Revoked);
        }
        if record.owner != from || record.flags.contains(CapFlags::IMMUTABLE) {
            return Err(CapError::Permission);
        }
        record.owner = to;
        self.grant(to, cap)
    }

    /// Revokes `cap` and every transitive descendant in one pass. Returns
    /// the revoked ids, the argument first, descendants in ascending slot
    /// order per generation.
    pub fn revoke(&mut self, cap: CapId) -> Result<Vec<CapId>, CapError> {
        // Already-revoked caps are not revocable again.
        self.get(cap)?;
        let mut revoked: Vec<CapId> = Vec::new();
        let mut frontier: VecDeque<CapId> = VecDeque::new();
        frontier.push_back(cap);
        while let Some(current) = frontier.pop_front() {
            if let Ok(record) = self.record_mut(current) {
                if record.flags.contains(CapFlags::REVOKED) {
                    continue;
                }
                record.flags |= CapFlags::REVOKED;
                revoked.push(current);
            } else {
                continue;
            }
            for index in 1..self.slots.len() {
                if let Some(child) = self.slots[index] {
                    if child.kind == (CapKind::Derived { parent: current })
                        && !child.flags.contains(CapFlags::REVOKED)
                    {
                        frontier.push_back(child.id);
                    }
                }
            }
        }
        // A revoked child no longer pins its parent.
        for id in &revoked {
            if let Ok(record) = self.record(*id) {
                if let CapKind::Derived { parent } = record.kind {
                    if let Ok(parent_record) = self.record_mut(parent) {
                        parent_record.refcount = parent_record.refcount.saturating_sub(1);
                    }
                }
            }
        }
        Ok(revoked)
    }

    /// Drops one holder reference. The slot is recycled once the last
    /// reference is gone; a revoked slot keeps its id stamped until then so
    /// stale handles keep failing as `Revoked`, not as forgeries.
    pub fn release(&mut self, cap: CapId) -> Result<(), CapError> {
        let record = self.record_mut(cap)?;
        record.refcount = record.refcount.saturating_sub(1);
        if record.refcount == 0 {
            self.slots[cap.index()] = None;
        }
        Ok(())
    }

    /// Owner of a slot, revoked records included (quota release on revoke).
    pub fn owner_of(&self, cap: CapId) -> Result<DomainId, CapError> {
        Ok(self.record(cap)?.owner)
    }

    /// Number of live (present, not revoked) records.
    pub fn count_live(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|record| !record.flags.contains(CapFlags::REVOKED))
            .count()
    }

    /// Ids of every capability owned by `domain` (live or revoked-but-held).
    pub fn owned_by(&self, domain: DomainId) -> Vec<CapId> {
        self.slots
            .iter()
            .flatten()
            .filter(|record| record.owner == domain)
            .map(|record| record.id)
            .collect()
    }

    /// Resolves the concrete (non-derived) payload behind `cap`.
    pub fn resolve_kind(&self, cap: CapId) -> Result<CapKind, CapError> {
        let mut current = cap;
        // The parent graph is acyclic by construction (children are created
        // after their parents); the slot count bounds the walk regardless.
        for _ in 0..self.slots.len() {
            let record = self.get(current)?;
            match record.kind {
                CapKind::Derived { parent } => current = parent,
                concrete => return Ok(concrete),
            }
        }
        Err(CapError::Invalid)
    }

    /// Rights-subset invariant: every live derived capability's rights are
    /// contained in its whole parent chain.
    pub fn verify(&self) -> Result<(), &'static str> {
        for record in self.slots.iter().flatten() {
            if record.flags.contains(CapFlags::REVOKED) {
                continue;
            }
            let mut rights = record.rights;
            let mut current = *record;
            while let CapKind::Derived { parent } = current.kind {
                let parent_record = match self.record(parent) {
                    Ok(r) => r,
                    Err(_) => return Err("cap: dangling parent link"),
                };
                if parent_record.flags.contains(CapFlags::REVOKED) {
                    return Err("cap: live child under revoked parent");
                }
                if !parent_record.rights.contains(rights) {
                    return Err("cap: child rights exceed parent");
                }
                rights = parent_record.rights;
                current = *parent_record;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests_prop;
