// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Host pipe client.
//!
//! Host services are reached by opening the pipe device and writing the
//! service name.  The allocator uses one pipe per buffer to hold a host
//! reference on the color buffer: the host drops the reference when the
//! descriptor closes.

use super::types::{Error, Result};
use super::utils;
use nix::unistd;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

const QEMU_PIPE_PATH: &str = "/dev/qemu_pipe";
const GOLDFISH_PIPE_PATH: &str = "/dev/goldfish_pipe";

pub trait PipeOpener: Send + Sync {
    /// Opens a host pipe connected to `service`.
    fn open(&self, service: &str) -> Result<OwnedFd>;
}

/// Opens pipes through the emulator pipe device.
pub struct QemuPipes;

impl PipeOpener for QemuPipes {
    fn open(&self, service: &str) -> Result<OwnedFd> {
        let fd = utils::open(QEMU_PIPE_PATH).or_else(|_| utils::open(GOLDFISH_PIPE_PATH))?;

        let mut name = Vec::with_capacity(service.len() + 6);
        name.extend_from_slice(b"pipe:");
        name.extend_from_slice(service.as_bytes());
        name.push(0);
        write_all(fd.as_fd(), &name)?;

        Ok(fd)
    }
}

pub fn write_all(fd: BorrowedFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match unistd::write(fd, buf) {
            Ok(0) => return Err(Error::NoResources),
            Ok(n) => buf = &buf[n..],
            Err(nix::Error::EINTR) | Err(nix::Error::EAGAIN) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

pub fn read_exact(fd: BorrowedFd, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        match unistd::read(fd.as_raw_fd(), buf) {
            Ok(0) => return Err(Error::NoResources),
            Ok(n) => buf = &mut buf[n..],
            Err(nix::Error::EINTR) | Err(nix::Error::EAGAIN) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Pushes one host reference on `host_handle` down a refcount pipe.
pub fn push_host_handle_ref(fd: BorrowedFd, host_handle: u32) -> Result<()> {
    write_all(fd, &host_handle.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_push() {
        let (rd, wr) = unistd::pipe().unwrap();
        push_host_handle_ref(wr.as_fd(), 0x1234_5678).unwrap();

        let mut buf = [0u8; 4];
        read_exact(rd.as_fd(), &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x1234_5678);
    }

    #[test]
    fn short_reads_and_writes_retry() {
        let (rd, wr) = unistd::pipe().unwrap();
        let payload: Vec<u8> = (0..=255).collect();
        write_all(wr.as_fd(), &payload).unwrap();

        let mut first = [0u8; 100];
        let mut rest = [0u8; 156];
        read_exact(rd.as_fd(), &mut first).unwrap();
        read_exact(rd.as_fd(), &mut rest).unwrap();
        assert_eq!(first[99], 99);
        assert_eq!(rest[0], 100);
    }
}
