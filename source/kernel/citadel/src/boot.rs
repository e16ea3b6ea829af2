// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Loader handoff structure and its validation
//! OWNERS: @core-team
//! PUBLIC API: BootInfo, MemoryRegion, MemoryRegionKind, BootModule, BootError
//! DEPENDS_ON: types::PhysAddr
//! INVARIANTS: No field is trusted before magic and version check out

use crate::types::PhysAddr;

/// `b"CTDLBOOT"` little-endian.
pub const BOOT_MAGIC: u64 = 0x544F_4F42_4C44_5443;
/// Handoff layout revision this kernel understands.
pub const BOOT_VERSION: u16 = 1;

/// Classification of one region in the loader's memory map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Free RAM the frame allocator may manage.
    Usable,
    Reserved,
    Firmware,
    Bootloader,
    Kernel,
    Module,
}

/// One memory-map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: PhysAddr,
    pub len: usize,
    pub kind: MemoryRegionKind,
}

/// One pre-loaded module image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootModule<'a> {
    pub base: PhysAddr,
    pub len: usize,
    pub name: &'a str,
}

/// Where early console output goes until a real driver claims the port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugPort {
    pub mmio_base: Option<PhysAddr>,
    pub io_port: Option<u16>,
}

/// Errors raised while validating the handoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootError {
    BadMagic,
    /// Newer or older layout than this kernel speaks.
    BadVersion,
    /// Structurally impossible content (empty map, wrapping region).
    Invalid,
}

/// Everything the loader passes to the core, already lifted out of its raw
/// binary form by the boot shim. Nothing here is believed until
/// [`BootInfo::validate`] has run.
pub struct BootInfo<'a> {
    pub magic: u64,
    pub version: u16,
    pub memory_map: &'a [MemoryRegion],
    pub cmdline: &'a str,
    pub modules: &'a [BootModule<'a>],
    pub debug_port: DebugPort,
    /// Raw configuration blob; tokenised by the loader's parser, consumed
    /// here only as opaque bytes.
    pub config_blob: &'a [u8],
}

impl<'a> BootInfo<'a> {
    /// Checks magic, version and the structural sanity of the memory map.
    pub fn validate(&self) -> Result<(), BootError> {
        if self.magic != BOOT_MAGIC {
            return Err(BootError::BadMagic);
        }
        if self.version != BOOT_VERSION {
            return Err(BootError::BadVersion);
        }
        if self.memory_map.is_empty() {
            return Err(BootError::Invalid);
        }
        for region in self.memory_map {
            if region.len == 0 || region.base.checked_add(region.len).is_none() {
                return Err(BootError::Invalid);
            }
        }
        for module in self.modules {
            if module.len == 0 || module.base.checked_add(module.len).is_none() {
                return Err(BootError::Invalid);
            }
        }
        Ok(())
    }

    /// Regions the frame allocator may manage.
    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.memory_map.iter().filter(|r| r.kind == MemoryRegionKind::Usable)
    }

    /// Regions that must be pinned before any allocation happens.
    pub fn reserved_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.memory_map.iter().filter(|r| r.kind != MemoryRegionKind::Usable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_info(map: &[MemoryRegion]) -> BootInfo<'_> {
        BootInfo {
            magic: BOOT_MAGIC,
            version: BOOT_VERSION,
            memory_map: map,
            cmdline: "log_level=debug",
            modules: &[],
            debug_port: DebugPort::default(),
            config_blob: &[],
        }
    }

    const MAP: [MemoryRegion; 2] = [
        MemoryRegion { base: PhysAddr::new(0x10_0000), len: 0x40_0000, kind: MemoryRegionKind::Kernel },
        MemoryRegion { base: PhysAddr::new(0x50_0000), len: 0x100_0000, kind: MemoryRegionKind::Usable },
    ];

    #[test]
    fn accepts_well_formed_handoff() {
        let info = valid_info(&MAP);
        info.validate().unwrap();
        assert_eq!(info.usable_regions().count(), 1);
        assert_eq!(info.reserved_regions().count(), 1);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut info = valid_info(&MAP);
        info.magic = 0;
        assert_eq!(info.validate(), Err(BootError::BadMagic));
        let mut info = valid_info(&MAP);
        info.version = 2;
        assert_eq!(info.validate(), Err(BootError::BadVersion));
    }

    #[test]
    fn rejects_wrapping_region() {
        let map = [MemoryRegion {
            base: PhysAddr::new(usize::MAX - 0x1000),
            len: 0x10_0000,
            kind: MemoryRegionKind::Usable,
        }];
        assert_eq!(valid_info(&map).validate(), Err(BootError::Invalid));
    }

    #[test]
    fn rejects_empty_map() {
        assert_eq!(valid_info(&[]).validate(), Err(BootError::Invalid));
    }
}
