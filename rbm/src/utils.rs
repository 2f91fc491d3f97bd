// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Utilities for interacting with the OS.
//!
//! This module provides safe and convenient wrappers to interact with the OS.

use super::types::{Error, Mapping, Result};
use nix::{fcntl, poll, sys, unistd};
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::{num, slice};

pub fn align(value: u64, alignment_p2: u64) -> u64 {
    (value + alignment_p2 - 1) & !(alignment_p2 - 1)
}

pub fn align16(value: u64) -> u64 {
    align(value, 16)
}

pub fn open(path: impl AsRef<Path>) -> Result<OwnedFd> {
    let oflag = fcntl::OFlag::O_RDWR | fcntl::OFlag::O_CLOEXEC;
    let mode = sys::stat::Mode::empty();

    let raw_fd = fcntl::open(path.as_ref(), oflag, mode)?;

    // SAFETY: raw_fd is valid
    let owned_fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

    Ok(owned_fd)
}

pub fn mmap(fd: impl AsFd, offset: u64, size: u64) -> Result<Mapping> {
    let prot = sys::mman::ProtFlags::PROT_READ | sys::mman::ProtFlags::PROT_WRITE;
    let flags = sys::mman::MapFlags::MAP_SHARED;

    let len = num::NonZeroUsize::try_from(usize::try_from(size)?)?;
    let ptr =
        // SAFETY: clients assume the responsibility
        unsafe { sys::mman::mmap(None, len, prot, flags, fd, offset.try_into()?) }?;

    Ok(Mapping { ptr, len })
}

pub fn munmap(mapping: Mapping) -> Result<()> {
    // SAFETY: ptr and len are from sys::mman::mmap
    unsafe { sys::mman::munmap(mapping.ptr, mapping.len.into()) }.map_err(Error::from)
}

pub fn memfd_create(name: &str, size: u64) -> Result<OwnedFd> {
    use sys::memfd::MemFdCreateFlag;
    let create_flags = MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING;
    let seal_flags = fcntl::SealFlag::F_SEAL_SHRINK
        | fcntl::SealFlag::F_SEAL_GROW
        | fcntl::SealFlag::F_SEAL_SEAL;
    let fcntl_arg = fcntl::FcntlArg::F_ADD_SEALS(seal_flags);

    let c_name = CString::new(name)?;
    let memfd = sys::memfd::memfd_create(&c_name, create_flags)?;

    unistd::ftruncate(&memfd, size.try_into()?)?;
    fcntl::fcntl(memfd.as_raw_fd(), fcntl_arg)?;

    Ok(memfd)
}

const FENCE_WARNING_TIMEOUT_MS: u16 = 5000;

/// Waits for an acquire fence to signal.  Warns after five seconds and then
/// keeps waiting without a deadline.
pub fn wait_fence(fd: BorrowedFd, logname: &str) -> Result<()> {
    match poll_fence(fd, poll::PollTimeout::from(FENCE_WARNING_TIMEOUT_MS))? {
        true => Ok(()),
        false => {
            log::warn!(
                "{}: fence {} didn't signal in {} ms",
                logname,
                fd.as_raw_fd(),
                FENCE_WARNING_TIMEOUT_MS
            );
            poll_fence(fd, poll::PollTimeout::NONE).map(|_| ())
        }
    }
}

fn poll_fence(fd: BorrowedFd, timeout: poll::PollTimeout) -> Result<bool> {
    let events = poll::PollFlags::POLLIN;
    loop {
        let mut poll_fd = poll::PollFd::new(fd, events);

        match poll::poll(slice::from_mut(&mut poll_fd), timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                let revents = poll_fd.revents().unwrap_or(poll::PollFlags::POLLNVAL);
                if revents.intersects(poll::PollFlags::POLLERR | poll::PollFlags::POLLNVAL) {
                    return Err(Error::NoResources);
                }
                return Ok(true);
            }
            Err(nix::Error::EINTR) | Err(nix::Error::EAGAIN) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align(0, 16), 0);
        assert_eq!(align(1, 16), 16);
        assert_eq!(align(16, 16), 16);
        assert_eq!(align(17, 16), 32);
        assert_eq!(align16(1920 * 1080 * 4), 1920 * 1080 * 4);
        assert_eq!(align16(100), 112);
    }

    #[test]
    fn test_memfd() {
        let fd = memfd_create("rbm-test", 4096).unwrap();
        let mapping = mmap(&fd, 0, 4096).unwrap();

        // SAFETY: mapping covers 4096 writable bytes
        unsafe {
            mapping.as_ptr().write(0xa5);
            assert_eq!(mapping.as_ptr().read(), 0xa5);
        }

        munmap(mapping).unwrap();
    }

    #[test]
    fn test_wait_fence_signaled() {
        let (rd, wr) = unistd::pipe().unwrap();
        unistd::write(&wr, &[1u8]).unwrap();
        wait_fence(rd.as_fd(), "test").unwrap();
    }
}
