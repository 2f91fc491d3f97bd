// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The buffer handle passed between processes.
//!
//! A [`BufferHandle`] owns the descriptors of one allocated buffer plus the
//! scalar fields every importer needs to reconstruct it.  [`RawHandle`] is
//! its wire form: the descriptor list and a fixed-order integer payload.
//! The payload order is a stable ABI shared by every process that speaks
//! this handle format.

use super::metadata::ExternalMetadata;
use super::types::{BufferUsage, Error, Mapping, PixelFormat, Result};
use super::utils;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

// 'RBUF'
const HANDLE_MAGIC: u32 = u32::from_le_bytes(*b"RBUF");
const INT_PAYLOAD_LEN: usize = 16;

const FD_BUFFER: u32 = 1 << 0;
const FD_REFCOUNT: u32 = 1 << 1;

/// Marshalled form of a [`BufferHandle`]: descriptors plus integer payload.
pub struct RawHandle {
    pub fds: Vec<OwnedFd>,
    pub ints: Vec<u32>,
}

pub struct BufferHandle {
    buffer_fd: Option<OwnedFd>,
    host_handle_refcount_fd: Option<OwnedFd>,
    pub host_handle: u32,
    pub usage: BufferUsage,
    pub format: PixelFormat,
    pub drm_format: u32,
    pub stride: u32,
    pub buffer_size: u64,
    pub mmaped_size: u64,
    pub mmaped_offset: u64,
    pub external_metadata_offset: u64,

    // process-local, never marshalled
    mapping: Option<Mapping>,
    locked_usage: AtomicU64,
}

// SAFETY: the mapping points into shared memory owned by the handle; the
// locked-usage word is atomic and every other field is only written through
// exclusive access.
unsafe impl Send for BufferHandle {}
// SAFETY: see above
unsafe impl Sync for BufferHandle {}

impl BufferHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer_fd: OwnedFd,
        host_handle_refcount_fd: Option<OwnedFd>,
        host_handle: u32,
        usage: BufferUsage,
        format: PixelFormat,
        drm_format: u32,
        stride: u32,
        buffer_size: u64,
        mapping: Mapping,
        mmaped_size: u64,
        mmaped_offset: u64,
        external_metadata_offset: u64,
    ) -> Self {
        Self {
            buffer_fd: Some(buffer_fd),
            host_handle_refcount_fd,
            host_handle,
            usage,
            format,
            drm_format,
            stride,
            buffer_size,
            mmaped_size,
            mmaped_offset,
            external_metadata_offset,
            mapping: Some(mapping),
            locked_usage: AtomicU64::new(0),
        }
    }

    pub fn num_fds(&self) -> u32 {
        u32::from(self.buffer_fd.is_some()) + u32::from(self.host_handle_refcount_fd.is_some())
    }

    pub fn num_ints(&self) -> u32 {
        INT_PAYLOAD_LEN as u32
    }

    /// Marshals the handle, duplicating its descriptors.
    pub fn to_raw(&self) -> Result<RawHandle> {
        let mut fds = Vec::with_capacity(2);
        let mut fd_mask = 0;
        if let Some(fd) = &self.buffer_fd {
            fds.push(fd.try_clone()?);
            fd_mask |= FD_BUFFER;
        }
        if let Some(fd) = &self.host_handle_refcount_fd {
            fds.push(fd.try_clone()?);
            fd_mask |= FD_REFCOUNT;
        }

        let ints = vec![
            HANDLE_MAGIC,
            fd_mask,
            self.host_handle,
            self.format.as_raw() as u32,
            self.drm_format,
            self.stride,
            lo32(self.usage.bits()),
            hi32(self.usage.bits()),
            lo32(self.buffer_size),
            hi32(self.buffer_size),
            lo32(self.mmaped_size),
            hi32(self.mmaped_size),
            lo32(self.mmaped_offset),
            hi32(self.mmaped_offset),
            lo32(self.external_metadata_offset),
            hi32(self.external_metadata_offset),
        ];

        Ok(RawHandle { fds, ints })
    }

    /// Reconstructs a process-owned handle from its wire form, taking
    /// ownership of the descriptors.  The shared region is not mapped yet;
    /// call [`BufferHandle::map_into_process`].
    pub fn from_raw(raw: RawHandle) -> Result<Self> {
        let RawHandle { mut fds, ints } = raw;

        if ints.len() != INT_PAYLOAD_LEN || ints[0] != HANDLE_MAGIC {
            return Err(Error::BadBuffer);
        }

        let fd_mask = ints[1];
        if fd_mask & !(FD_BUFFER | FD_REFCOUNT) != 0 || fds.len() != fd_mask.count_ones() as usize
        {
            return Err(Error::BadBuffer);
        }

        let format = PixelFormat::from_raw(ints[3] as i32).ok_or(Error::BadBuffer)?;

        let mut fds = fds.drain(..);
        let buffer_fd = (fd_mask & FD_BUFFER != 0).then(|| fds.next()).flatten();
        let host_handle_refcount_fd = (fd_mask & FD_REFCOUNT != 0).then(|| fds.next()).flatten();

        let handle = Self {
            buffer_fd,
            host_handle_refcount_fd,
            host_handle: ints[2],
            usage: BufferUsage::from_bits_retain(u64_from(ints[6], ints[7])),
            format,
            drm_format: ints[4],
            stride: ints[5],
            buffer_size: u64_from(ints[8], ints[9]),
            mmaped_size: u64_from(ints[10], ints[11]),
            mmaped_offset: u64_from(ints[12], ints[13]),
            external_metadata_offset: u64_from(ints[14], ints[15]),
            mapping: None,
            locked_usage: AtomicU64::new(0),
        };

        if handle.host_handle != 0 && handle.host_handle_refcount_fd.is_none() {
            return Err(Error::BadBuffer);
        }
        if handle.mmaped_size > 0 && handle.buffer_fd.is_none() {
            return Err(Error::BadBuffer);
        }

        Ok(handle)
    }

    /// Maps the shared region at the recorded offset.
    pub fn map_into_process(&mut self) -> Result<()> {
        let fd = self.buffer_fd.as_ref().ok_or(Error::BadBuffer)?;
        let mapping = utils::mmap(fd, self.mmaped_offset, self.mmaped_size)?;
        self.mapping = Some(mapping);
        Ok(())
    }

    pub fn buffer_ptr(&self) -> Option<*mut u8> {
        self.mapping.as_ref().map(Mapping::as_ptr)
    }

    pub fn locked_usage(&self) -> BufferUsage {
        // not a synchronization point; one outstanding lock per handle
        BufferUsage::from_bits_retain(self.locked_usage.load(Ordering::Relaxed))
    }

    pub fn set_locked_usage(&self, usage: BufferUsage) {
        self.locked_usage.store(usage.bits(), Ordering::Relaxed);
    }

    fn metadata_ptr_checked(&self) -> *mut ExternalMetadata {
        let Some(ptr) = self.buffer_ptr() else {
            panic!("buffer {:#x} has no CPU mapping", self.host_handle);
        };
        // SAFETY: the allocator placed the record at this 16-aligned offset
        // inside the mapped region
        let metadata = unsafe { ptr.add(self.external_metadata_offset as usize) }
            .cast::<ExternalMetadata>();
        // SAFETY: metadata points into the live mapping
        assert!(
            unsafe { (*metadata).magic_ok() },
            "corrupt buffer metadata record"
        );
        metadata
    }

    /// The in-buffer metadata record.  Aborts on a corrupt record.
    pub fn external_metadata(&self) -> &ExternalMetadata {
        // SAFETY: checked by metadata_ptr_checked
        unsafe { &*self.metadata_ptr_checked() }
    }

    /// Raw pointer for the writable metadata fields.  The record lives in
    /// shared memory; writers serialize against nothing but the buffer
    /// contract.
    pub fn external_metadata_ptr(&self) -> *mut ExternalMetadata {
        self.metadata_ptr_checked()
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            let _ = utils::munmap(mapping);
        }
    }
}

fn lo32(value: u64) -> u32 {
    value as u32
}

fn hi32(value: u64) -> u32 {
    (value >> 32) as u32
}

fn u64_from(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::{AddressSpaceAllocator, MemfdAllocator};

    fn sample_handle() -> BufferHandle {
        let space = MemfdAllocator::new();
        let block = space.host_malloc(8192).unwrap();
        BufferHandle::new(
            block.fd,
            None,
            0,
            BufferUsage::CPU_READ_OFTEN | BufferUsage::CPU_WRITE_OFTEN,
            PixelFormat::Rgba8888,
            crate::formats::info(PixelFormat::Rgba8888).unwrap().drm_format,
            32,
            4096,
            block.mapping,
            block.size,
            block.offset,
            4096,
        )
    }

    #[test]
    fn wire_round_trip() {
        let handle = sample_handle();
        let raw = handle.to_raw().unwrap();
        assert_eq!(raw.fds.len(), 1);
        assert_eq!(raw.ints.len(), INT_PAYLOAD_LEN);

        let imported = BufferHandle::from_raw(raw).unwrap();
        assert_eq!(imported.format, handle.format);
        assert_eq!(imported.usage, handle.usage);
        assert_eq!(imported.drm_format, handle.drm_format);
        assert_eq!(imported.stride, handle.stride);
        assert_eq!(imported.buffer_size, handle.buffer_size);
        assert_eq!(imported.mmaped_size, handle.mmaped_size);
        assert_eq!(imported.mmaped_offset, handle.mmaped_offset);
        assert_eq!(
            imported.external_metadata_offset,
            handle.external_metadata_offset
        );
        assert!(imported.buffer_ptr().is_none());
    }

    #[test]
    fn import_maps_the_region() {
        let handle = sample_handle();
        // store a byte through the allocator-side mapping
        unsafe { handle.buffer_ptr().unwrap().write(0x5a) };

        let mut imported = BufferHandle::from_raw(handle.to_raw().unwrap()).unwrap();
        imported.map_into_process().unwrap();
        assert_eq!(unsafe { imported.buffer_ptr().unwrap().read() }, 0x5a);
    }

    #[test]
    fn rejects_malformed_payload() {
        let handle = sample_handle();

        let mut raw = handle.to_raw().unwrap();
        raw.ints[0] = 0xdead_beef;
        assert!(matches!(
            BufferHandle::from_raw(raw),
            Err(Error::BadBuffer)
        ));

        let mut raw = handle.to_raw().unwrap();
        raw.ints.pop();
        assert!(matches!(
            BufferHandle::from_raw(raw),
            Err(Error::BadBuffer)
        ));

        // mmaped region without a backing descriptor
        let mut raw = handle.to_raw().unwrap();
        raw.fds.clear();
        raw.ints[1] = 0;
        assert!(matches!(
            BufferHandle::from_raw(raw),
            Err(Error::BadBuffer)
        ));
    }

    #[test]
    fn locked_usage_word() {
        let handle = sample_handle();
        assert!(handle.locked_usage().is_empty());
        handle.set_locked_usage(BufferUsage::CPU_WRITE_MASK);
        assert!(handle
            .locked_usage()
            .intersects(BufferUsage::CPU_WRITE_MASK));
        handle.set_locked_usage(BufferUsage::empty());
        assert!(handle.locked_usage().is_empty());
    }
}
