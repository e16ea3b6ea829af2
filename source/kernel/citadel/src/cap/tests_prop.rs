// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the capability table
//! OWNERS: @core-cap-team
//! NOTE: Tests only; no kernel logic. Ensures rights monotonicity and handle
//!       binding hold for arbitrary rights/kind combinations.
//!
//! TEST_SCOPE:
//!   - Derivation: child rights always a subset of the parent chain
//!   - Derivation rejects any request outside the parent rights
//!   - Handles: sealed tokens verify only under the issuing domain's key
//!
//! TEST_SCENARIOS:
//!   - derive_chain_preserves_subset(): random chains keep the P-subset invariant
//!   - derive_rejects_superset(): rights outside the parent fail deterministically
//!   - handle_binds_domain_and_cap(): cross-domain presentation always fails

use proptest::prelude::*;

use super::handle::{self, DomainKey};
use super::{CapError, CapTable, Rights};
use crate::types::{CapId, DomainId, PhysAddr};

const D1: DomainId = DomainId::from_raw(1);
const D2: DomainId = DomainId::from_raw(2);
const KEY1: DomainKey = [11, 12];
const KEY2: DomainKey = [21, 22];

fn arb_rights() -> impl Strategy<Value = Rights> {
    (0u32..64).prop_map(Rights::from_bits_truncate)
}

fn table_with_root(rights: Rights) -> (CapTable, CapId) {
    let mut caps = CapTable::new(64, 8);
    caps.install_key(D1, KEY1).unwrap();
    caps.install_key(D2, KEY2).unwrap();
    let root = caps.create_memory(D1, PhysAddr::new(0x8000_0000), 0x4000, rights).unwrap();
    (caps, root)
}

proptest! {
    #[test]
    fn derive_chain_preserves_subset(
        base in arb_rights(),
        masks in proptest::collection::vec(arb_rights(), 1..6),
    ) {
        let (mut caps, root) = table_with_root(base);
        let mut parent = root;
        let mut parent_rights = base;
        for mask in masks {
            let requested = parent_rights & mask;
            let child = caps.derive(D1, parent, requested).unwrap();
            prop_assert_eq!(caps.get(child).unwrap().rights, requested);
            parent = child;
            parent_rights = requested;
        }
        caps.verify().unwrap();
    }

    #[test]
    fn derive_rejects_superset(base in arb_rights(), extra in 1u32..64) {
        let (mut caps, root) = table_with_root(base);
        let extra_rights = Rights::from_bits_truncate(extra);
        prop_assume!(!base.contains(extra_rights));
        prop_assert_eq!(caps.derive(D1, root, base | extra_rights), Err(CapError::Invalid));
    }

    #[test]
    fn handle_binds_domain_and_cap(rights in arb_rights(), flip in 1u64..u64::MAX) {
        let (caps, root) = table_with_root(rights);
        let sealed = caps.grant(D1, root).unwrap();
        // The issuing domain verifies; the other domain never does.
        prop_assert_eq!(caps.check_access(D1, sealed, Rights::empty()), Ok(root));
        prop_assert_eq!(
            caps.check_access(D2, sealed, Rights::empty()),
            Err(CapError::Permission)
        );
        // Any bit flip invalidates the token for its own domain too, except
        // the astronomically unlikely MAC collision.
        let mutated = crate::types::CapHandle::from_raw(sealed.raw() ^ flip);
        if mutated != sealed {
            let (claimed, cap, _mac) = handle::fields(mutated);
            if claimed == D1 && cap == root {
                prop_assert!(!handle::verify(mutated, &KEY1));
            } else {
                prop_assert!(caps.check_access(D1, mutated, Rights::empty()).is_err());
            }
        }
    }
}
