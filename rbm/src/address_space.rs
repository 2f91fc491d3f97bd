// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Host shared-memory allocation.
//!
//! The allocator service obtains buffer backing through an
//! [`AddressSpaceAllocator`]; importers only need the descriptor and the
//! recorded offset, via [`memory_map`] / [`memory_unmap`].
//!
//! The provided [`MemfdAllocator`] backs every block with a sealed memfd.
//! Blocks are placed at unique page-aligned offsets inside their (sparse)
//! files, and the synthetic physical address keeps a constant bias over the
//! offset, which is what the mapper's startup probe measures.

use super::types::{Error, Mapping, Result};
use super::utils;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};

const HOST_PHYS_BASE: u64 = 0x1_0000_0000;
const BLOCK_ALIGN: u64 = 4096;

pub struct AddressSpaceBlock {
    pub fd: OwnedFd,
    pub mapping: Mapping,
    pub phys_addr: u64,
    pub offset: u64,
    pub size: u64,
}

impl AddressSpaceBlock {
    pub fn guest_ptr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }
}

pub trait AddressSpaceAllocator: Send + Sync {
    fn host_malloc(&self, size: u64) -> Result<AddressSpaceBlock>;
    fn host_free(&self, block: AddressSpaceBlock);
}

#[derive(Default)]
pub struct MemfdAllocator {
    next_offset: AtomicU64,
}

impl MemfdAllocator {
    pub fn new() -> Self {
        Default::default()
    }
}

impl AddressSpaceAllocator for MemfdAllocator {
    fn host_malloc(&self, size: u64) -> Result<AddressSpaceBlock> {
        if size == 0 {
            return Err(Error::BadValue);
        }

        let offset = self
            .next_offset
            .fetch_add(utils::align(size, BLOCK_ALIGN), Ordering::Relaxed);

        // pages before `offset` stay as holes
        let fd = utils::memfd_create("rbm-host-memory", offset + size)?;
        let mapping = utils::mmap(&fd, offset, size)?;

        Ok(AddressSpaceBlock {
            fd,
            mapping,
            phys_addr: HOST_PHYS_BASE + offset,
            offset,
            size,
        })
    }

    fn host_free(&self, block: AddressSpaceBlock) {
        let _ = utils::munmap(block.mapping);
    }
}

/// Maps `size` bytes of a shared region at `offset`, for importers.
pub fn memory_map(fd: impl AsFd, offset: u64, size: u64) -> Result<Mapping> {
    utils::mmap(fd, offset, size)
}

pub fn memory_unmap(mapping: Mapping) {
    let _ = utils::munmap(mapping);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_offsets_constant_bias() {
        let space = MemfdAllocator::new();
        let a = space.host_malloc(256).unwrap();
        let b = space.host_malloc(8192).unwrap();

        assert_ne!(a.offset, b.offset);
        assert_eq!(a.phys_addr - a.offset, b.phys_addr - b.offset);

        space.host_free(a);
        space.host_free(b);
    }

    #[test]
    fn second_mapping_sees_writes() {
        let space = MemfdAllocator::new();
        // advance the offset cursor past zero first
        let filler = space.host_malloc(4096).unwrap();
        let block = space.host_malloc(4096).unwrap();

        unsafe { block.guest_ptr().write(0x77) };

        let remap = memory_map(&block.fd, block.offset, block.size).unwrap();
        assert_eq!(unsafe { remap.as_ptr().read() }, 0x77);
        memory_unmap(remap);

        space.host_free(block);
        space.host_free(filler);
    }

    #[test]
    fn zero_sized_blocks_are_rejected() {
        let space = MemfdAllocator::new();
        assert!(matches!(space.host_malloc(0), Err(Error::BadValue)));
    }
}
