// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Module container format consumed after signature verification
//! OWNERS: @core-team
//! PUBLIC API: ModuleImage (parse/code/data/resource_requests), ResourceRequest
//! DEPENDS_ON: core only
//! INVARIANTS: Every offset/size pair is bounds-checked against the image;
//!             the core only ever sees images the loader already verified

extern crate alloc;

use alloc::vec::Vec;

/// `b"CTDM"` little-endian.
pub const MODULE_MAGIC: u32 = 0x4D44_5443;
/// Container layout revision.
pub const MODULE_VERSION: u16 = 1;

/// Fixed header at offset 0 of every module container, little-endian:
/// magic u32, version u16, reserved u16, uuid 16 bytes, semver 3 x u16,
/// reserved u16, then four (offset u32, size u32) pairs: code, data,
/// metadata, signature.
pub const HEADER_BYTES: usize = 64;

/// Errors raised while parsing a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleError {
    Truncated,
    BadMagic,
    BadVersion,
    /// An offset/size pair points outside the image or overlaps the header.
    BadLayout,
    /// Metadata entry with an unknown tag or impossible payload.
    BadMetadata,
}

/// Declared needs of a module, parsed from its metadata section. The
/// Privileged-tier loader turns these into capability grants; the core only
/// validates and exposes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceRequest {
    /// Physical memory, in frames.
    MemoryFrames { count: u64 },
    /// An interrupt line.
    Irq { vector: u32 },
    /// An IPC endpoint this module will serve, by well-known service id.
    Endpoint { service_id: u64 },
    /// Another module (by truncated UUID prefix) that must load first.
    Dependency { uuid_prefix: u64 },
}

const TAG_MEMORY: u16 = 1;
const TAG_IRQ: u16 = 2;
const TAG_ENDPOINT: u16 = 3;
const TAG_DEPENDENCY: u16 = 4;
/// Metadata entry: tag u16, reserved u16 (zero), payload u64.
const ENTRY_BYTES: usize = 12;

/// Parsed view over a verified module image.
#[derive(Debug)]
pub struct ModuleImage<'a> {
    bytes: &'a [u8],
    pub uuid: [u8; 16],
    pub semver: (u16, u16, u16),
    code: (usize, usize),
    data: (usize, usize),
    metadata: (usize, usize),
    signature: (usize, usize),
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

impl<'a> ModuleImage<'a> {
    /// Parses and bounds-checks the container header.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ModuleError> {
        if bytes.len() < HEADER_BYTES {
            return Err(ModuleError::Truncated);
        }
        if read_u32(bytes, 0) != MODULE_MAGIC {
            return Err(ModuleError::BadMagic);
        }
        if read_u16(bytes, 4) != MODULE_VERSION {
            return Err(ModuleError::BadVersion);
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[8..24]);
        let semver = (read_u16(bytes, 24), read_u16(bytes, 26), read_u16(bytes, 28));
        let mut pairs = [(0usize, 0usize); 4];
        for (i, pair) in pairs.iter_mut().enumerate() {
            let at = 32 + i * 8;
            *pair = (read_u32(bytes, at) as usize, read_u32(bytes, at + 4) as usize);
        }
        let [code, data, metadata, signature] = pairs;
        let image = Self { bytes, uuid, semver, code, data, metadata, signature };
        for (offset, size) in [code, data, metadata, signature] {
            let end = offset.checked_add(size).ok_or(ModuleError::BadLayout)?;
            if offset < HEADER_BYTES || end > bytes.len() {
                return Err(ModuleError::BadLayout);
            }
        }
        // The signature covers everything before it.
        if signature.0 < code.0 + code.1 || signature.0 < metadata.0 + metadata.1 {
            return Err(ModuleError::BadLayout);
        }
        Ok(image)
    }

    pub fn code(&self) -> &'a [u8] {
        &self.bytes[self.code.0..self.code.0 + self.code.1]
    }

    pub fn data(&self) -> &'a [u8] {
        &self.bytes[self.data.0..self.data.0 + self.data.1]
    }

    pub fn signature(&self) -> &'a [u8] {
        &self.bytes[self.signature.0..self.signature.0 + self.signature.1]
    }

    /// Decodes the metadata section into typed resource requests.
    pub fn resource_requests(&self) -> Result<Vec<ResourceRequest>, ModuleError> {
        let (offset, size) = self.metadata;
        let section = &self.bytes[offset..offset + size];
        if size % ENTRY_BYTES != 0 {
            return Err(ModuleError::BadMetadata);
        }
        let mut requests = Vec::with_capacity(size / ENTRY_BYTES);
        for entry in section.chunks_exact(ENTRY_BYTES) {
            let tag = read_u16(entry, 0);
            let payload = read_u64(entry, 4);
            let request = match tag {
                TAG_MEMORY if payload > 0 => ResourceRequest::MemoryFrames { count: payload },
                TAG_IRQ if payload <= u64::from(u32::MAX) => {
                    ResourceRequest::Irq { vector: payload as u32 }
                }
                TAG_ENDPOINT => ResourceRequest::Endpoint { service_id: payload },
                TAG_DEPENDENCY => ResourceRequest::Dependency { uuid_prefix: payload },
                _ => return Err(ModuleError::BadMetadata),
            };
            requests.push(request);
        }
        Ok(requests)
    }
}
