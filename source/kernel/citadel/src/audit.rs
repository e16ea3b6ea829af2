// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Tamper-evident audit ring: append-only, sequenced, fixed capacity
//! OWNERS: @core-team
//! PUBLIC API: AuditLog (append/snapshot/set_enabled), AuditEntry (encode), AuditEvent
//! DEPENDS_ON: types::{DomainId, CapId, ThreadId}
//! INVARIANTS: Sequence numbers are gap-free and strictly increasing per boot;
//!             wrap overwrites oldest entries (best-effort recent history)

extern crate alloc;

use alloc::vec::Vec;

use crate::types::{CapId, DomainId, ThreadId};

/// Security-relevant event classes. Discriminants are part of the external
/// log format and must never be renumbered; new variants are appended.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditEvent {
    Boot = 0,
    CapCreate = 1,
    CapVerify = 2,
    CapDerive = 3,
    CapTransfer = 4,
    CapRevoke = 5,
    CapRelease = 6,
    DomainCreate = 7,
    DomainDestroy = 8,
    DomainSuspend = 9,
    DomainResume = 10,
    ThreadCreate = 11,
    ThreadDestroy = 12,
    IpcCall = 13,
    IpcReturn = 14,
    ServiceCrash = 15,
    Exception = 16,
    Interrupt = 17,
    Syscall = 18,
    ConfigChange = 19,
    Panic = 20,
    MemoryMap = 21,
    MemoryUnmap = 22,
    ShmemAlloc = 23,
}

/// Size of one encoded entry in the external format.
pub const ENTRY_BYTES: usize = 64;

/// One audit record. Field order mirrors the wire layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: u64,
    pub sequence: u32,
    pub event: AuditEvent,
    pub domain: DomainId,
    pub cap: CapId,
    pub thread: ThreadId,
    pub data: [u64; 4],
    pub ok: bool,
}

impl AuditEntry {
    /// Encodes the entry into the fixed little-endian external layout:
    /// u64 timestamp, u32 sequence, u32 event, u32 domain, u32 cap,
    /// u32 thread, 4 x u64 data, u8 result, 3 reserved bytes.
    pub fn encode(&self) -> [u8; ENTRY_BYTES] {
        let mut out = [0u8; ENTRY_BYTES];
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        out[12..16].copy_from_slice(&(self.event as u32).to_le_bytes());
        out[16..20].copy_from_slice(&(self.domain.raw() as u32).to_le_bytes());
        out[20..24].copy_from_slice(&(self.cap.raw() as u32).to_le_bytes());
        out[24..28].copy_from_slice(&self.thread.raw().to_le_bytes());
        for (i, word) in self.data.iter().enumerate() {
            let at = 28 + i * 8;
            out[at..at + 8].copy_from_slice(&word.to_le_bytes());
        }
        out[60] = u8::from(self.ok);
        out
    }
}

/// Fixed-size circular audit buffer owned by the core.
pub struct AuditLog {
    entries: Vec<Option<AuditEntry>>,
    head: usize,
    next_seq: u32,
    enabled: bool,
}

impl AuditLog {
    /// Creates a ring holding up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize(capacity, None);
        Self { entries, head: 0, next_seq: 0, enabled: true }
    }

    /// Gates writes; driven by the `enable_audit` configuration option.
    /// The sequence counter keeps advancing so re-enabling never reuses a
    /// sequence number.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Appends one record and returns its sequence number.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        timestamp: u64,
        event: AuditEvent,
        domain: DomainId,
        cap: CapId,
        thread: ThreadId,
        data: [u64; 4],
        ok: bool,
    ) -> u32 {
        let sequence = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.enabled {
            self.entries[self.head] =
                Some(AuditEntry { timestamp, sequence, event, domain, cap, thread, data, ok });
            self.head = (self.head + 1) % self.entries.len();
        }
        sequence
    }

    /// Sequence number the next append will receive.
    pub fn next_sequence(&self) -> u32 {
        self.next_seq
    }

    /// Copies out the retained entries, oldest first, and returns how many
    /// were written. `out` shorter than the retained history receives the
    /// most recent tail.
    pub fn snapshot(&self, out: &mut [AuditEntry]) -> usize {
        let cap = self.entries.len();
        let mut ordered: Vec<AuditEntry> = Vec::with_capacity(cap);
        // head points at the oldest slot once the ring has wrapped.
        for offset in 0..cap {
            if let Some(entry) = self.entries[(self.head + offset) % cap] {
                ordered.push(entry);
            }
        }
        let skip = ordered.len().saturating_sub(out.len());
        let tail = &ordered[skip..];
        out[..tail.len()].copy_from_slice(tail);
        tail.len()
    }

    /// Most recent entry, if any.
    pub fn last(&self) -> Option<AuditEntry> {
        let cap = self.entries.len();
        self.entries[(self.head + cap - 1) % cap]
    }

    /// Encodes the retained history, oldest first, into the external wire
    /// format. Returns the number of bytes written; `out` is consumed in
    /// whole 64-byte records.
    pub fn read_encoded(&self, out: &mut [u8]) -> usize {
        let slots = out.len() / ENTRY_BYTES;
        let mut staging: Vec<AuditEntry> = Vec::with_capacity(slots);
        staging.resize(
            slots,
            AuditEntry {
                timestamp: 0,
                sequence: 0,
                event: AuditEvent::Boot,
                domain: DomainId::CORE,
                cap: CapId::NONE,
                thread: ThreadId::IDLE,
                data: [0; 4],
                ok: false,
            },
        );
        let count = self.snapshot(&mut staging);
        for (i, entry) in staging[..count].iter().enumerate() {
            out[i * ENTRY_BYTES..(i + 1) * ENTRY_BYTES].copy_from_slice(&entry.encode());
        }
        count * ENTRY_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append_n(log: &mut AuditLog, n: u32) {
        for i in 0..n {
            log.append(
                u64::from(i) * 10,
                AuditEvent::Syscall,
                DomainId::CORE,
                CapId::NONE,
                ThreadId::IDLE,
                [u64::from(i), 0, 0, 0],
                true,
            );
        }
    }

    #[test]
    fn sequence_is_gap_free_and_increasing() {
        let mut log = AuditLog::new(4);
        append_n(&mut log, 10);
        assert_eq!(log.next_sequence(), 10);
        let mut out = [AuditEntry {
            timestamp: 0,
            sequence: 0,
            event: AuditEvent::Boot,
            domain: DomainId::CORE,
            cap: CapId::NONE,
            thread: ThreadId::IDLE,
            data: [0; 4],
            ok: false,
        }; 4];
        let n = log.snapshot(&mut out);
        assert_eq!(n, 4);
        // Ring of 4 after 10 appends retains sequences 6..=9.
        for (i, entry) in out.iter().enumerate() {
            assert_eq!(entry.sequence, 6 + i as u32);
        }
    }

    #[test]
    fn disabled_log_still_advances_sequence() {
        let mut log = AuditLog::new(4);
        append_n(&mut log, 2);
        log.set_enabled(false);
        let seq = log.append(
            0,
            AuditEvent::CapVerify,
            DomainId::CORE,
            CapId::NONE,
            ThreadId::IDLE,
            [0; 4],
            false,
        );
        assert_eq!(seq, 2);
        log.set_enabled(true);
        assert_eq!(log.last().map(|e| e.sequence), Some(1));
        assert_eq!(log.next_sequence(), 3);
    }

    #[test]
    fn read_encoded_emits_whole_records() {
        let mut log = AuditLog::new(8);
        append_n(&mut log, 3);
        let mut out = [0u8; 2 * ENTRY_BYTES + 17];
        // Room for two records only: the most recent tail is returned.
        let written = log.read_encoded(&mut out);
        assert_eq!(written, 2 * ENTRY_BYTES);
        assert_eq!(&out[8..12], &1u32.to_le_bytes());
        assert_eq!(&out[ENTRY_BYTES + 8..ENTRY_BYTES + 12], &2u32.to_le_bytes());
    }

    #[test]
    fn wire_encoding_layout() {
        let entry = AuditEntry {
            timestamp: 0x1122_3344_5566_7788,
            sequence: 7,
            event: AuditEvent::CapRevoke,
            domain: DomainId::from_raw(3),
            cap: CapId::from_raw(9),
            thread: ThreadId::from_raw(4),
            data: [0xAA, 0xBB, 0xCC, 0xDD],
            ok: true,
        };
        let bytes = entry.encode();
        assert_eq!(&bytes[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &7u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &5u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &3u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &9u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &4u32.to_le_bytes());
        assert_eq!(&bytes[28..36], &0xAAu64.to_le_bytes());
        assert_eq!(bytes[60], 1);
        assert_eq!(&bytes[61..64], &[0, 0, 0]);
    }
}
