// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Domain-scoped capability handle obfuscation
//! OWNERS: @core-cap-team
//! PUBLIC API: seal, fields, verify, DomainKey
//! DEPENDS_ON: siphasher (SipHash-2-4), types::{CapHandle, CapId, DomainId}
//! INVARIANTS: Raw capability ids never cross the syscall boundary; forging a
//!             handle requires the per-domain 128-bit key

use core::hash::Hasher;

use siphasher::sip::SipHasher24;

use crate::types::{CapHandle, CapId, DomainId};

/// 128-bit per-domain secret. Generated from HAL entropy at domain creation
/// and zeroed on destruction.
pub type DomainKey = [u64; 2];

/// Layout of the 64-bit token: `MAC32 << 32 | domain16 << 16 | cap16`.
///
/// SipHash-2-4 is the MAC; it is a keyed PRF designed for exactly this
/// short-input authentication shape, so two domains holding the same cap id
/// see unrelated tokens and neither can produce the other's.
pub fn seal(domain: DomainId, cap: CapId, key: &DomainKey) -> CapHandle {
    let mac = mac32(domain, cap, key);
    CapHandle::from_raw(
        (u64::from(mac) << 32) | (u64::from(domain.raw()) << 16) | u64::from(cap.raw()),
    )
}

/// Splits a handle into its claimed (domain, cap, MAC) fields. The claim is
/// untrusted until [`verify`] passes.
pub fn fields(handle: CapHandle) -> (DomainId, CapId, u32) {
    let raw = handle.raw();
    let domain = DomainId::from_raw(((raw >> 16) & 0xFFFF) as u16);
    let cap = CapId::from_raw((raw & 0xFFFF) as u16);
    let mac = (raw >> 32) as u32;
    (domain, cap, mac)
}

/// Recomputes the MAC under `key` and compares it against the token.
pub fn verify(handle: CapHandle, key: &DomainKey) -> bool {
    let (domain, cap, mac) = fields(handle);
    mac == mac32(domain, cap, key)
}

fn mac32(domain: DomainId, cap: CapId, key: &DomainKey) -> u32 {
    let mut hasher = SipHasher24::new_with_keys(key[0], key[1]);
    hasher.write_u32((u32::from(domain.raw()) << 16) | u32::from(cap.raw()));
    hasher.finish() as u32
}
