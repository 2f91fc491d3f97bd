// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The stream encoder behind [`HostConnection`](super::HostConnection).
//!
//! Every operation is framed as a little-endian `(opcode, payload length,
//! payload)` record on a host pipe; responses carry fixed-size results or
//! raw pixel data.

use super::super::formats::EmulatorFrameworkFormat;
use super::super::pipe::{self, PipeOpener};
use super::super::types::Result;
use super::{FeatureInfo, RenderControl};
use std::os::fd::{AsFd, OwnedFd};

const RENDER_CONTROL_SERVICE: &str = "opengles";

const OP_GET_FEATURE_INFO: u32 = 10001;
const OP_CREATE_COLOR_BUFFER_DMA: u32 = 10012;
const OP_CLOSE_COLOR_BUFFER: u32 = 10013;
const OP_COLOR_BUFFER_CACHE_FLUSH: u32 = 10014;
const OP_READ_COLOR_BUFFER_YUV: u32 = 10015;
const OP_READ_COLOR_BUFFER_DMA: u32 = 10016;
const OP_UPDATE_COLOR_BUFFER_DMA: u32 = 10017;
const OP_BIND_DMA: u32 = 10018;

const FEATURE_SHARED_SLOTS: u32 = 1 << 0;
const FEATURE_READ_COLOR_BUFFER_DMA: u32 = 1 << 1;
const FEATURE_YUV_CACHE: u32 = 1 << 2;

struct Payload(Vec<u8>);

impl Payload {
    fn new() -> Self {
        Self(Vec::with_capacity(64))
    }

    fn u32(mut self, value: u32) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn i32(mut self, value: i32) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u64(mut self, value: u64) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }
}

pub struct WireRenderControl {
    channel: OwnedFd,
    features: FeatureInfo,
}

impl WireRenderControl {
    /// Opens the render-control pipe and queries the host capabilities.
    pub fn connect(pipes: &dyn PipeOpener) -> Result<Self> {
        let channel = pipes.open(RENDER_CONTROL_SERVICE)?;
        let mut control = Self {
            channel,
            features: FeatureInfo::default(),
        };
        control.features = control.query_feature_info()?;
        Ok(control)
    }

    fn send(&self, opcode: u32, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&opcode.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        pipe::write_all(self.channel.as_fd(), &frame)
    }

    fn recv_u32(&self) -> Result<u32> {
        let mut buf = [0u8; 4];
        pipe::read_exact(self.channel.as_fd(), &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn recv_i32(&self) -> Result<i32> {
        self.recv_u32().map(|v| v as i32)
    }

    fn query_feature_info(&self) -> Result<FeatureInfo> {
        self.send(OP_GET_FEATURE_INFO, &[])?;
        let bits = self.recv_u32()?;
        Ok(FeatureInfo {
            has_shared_slots_host_memory_allocator: bits & FEATURE_SHARED_SLOTS != 0,
            has_read_color_buffer_dma: bits & FEATURE_READ_COLOR_BUFFER_DMA != 0,
            has_yuv_cache: bits & FEATURE_YUV_CACHE != 0,
        })
    }
}

impl RenderControl for WireRenderControl {
    fn feature_info(&self) -> FeatureInfo {
        self.features
    }

    fn create_color_buffer_dma(
        &mut self,
        width: u32,
        height: u32,
        internal_format: i32,
        emu_fwk_format: EmulatorFrameworkFormat,
    ) -> Result<u32> {
        let payload = Payload::new()
            .u32(width)
            .u32(height)
            .i32(internal_format)
            .u32(emu_fwk_format as u32);
        self.send(OP_CREATE_COLOR_BUFFER_DMA, &payload.0)?;
        self.recv_u32()
    }

    fn close_color_buffer(&mut self, host_handle: u32) {
        let _ = self.send(OP_CLOSE_COLOR_BUFFER, &Payload::new().u32(host_handle).0);
    }

    fn color_buffer_cache_flush(&mut self, host_handle: u32) -> Result<i32> {
        self.send(
            OP_COLOR_BUFFER_CACHE_FLUSH,
            &Payload::new().u32(host_handle).0,
        )?;
        self.recv_i32()
    }

    fn read_color_buffer_yuv(
        &mut self,
        host_handle: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        dest: &mut [u8],
    ) -> Result<()> {
        let payload = Payload::new()
            .u32(host_handle)
            .u32(x)
            .u32(y)
            .u32(width)
            .u32(height)
            .u64(dest.len() as u64);
        self.send(OP_READ_COLOR_BUFFER_YUV, &payload.0)?;
        pipe::read_exact(self.channel.as_fd(), dest)
    }

    fn read_color_buffer_dma(
        &mut self,
        host_handle: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        gl_format: i32,
        gl_type: i32,
        dest: &mut [u8],
    ) -> Result<()> {
        let payload = Payload::new()
            .u32(host_handle)
            .u32(x)
            .u32(y)
            .u32(width)
            .u32(height)
            .i32(gl_format)
            .i32(gl_type)
            .u64(dest.len() as u64);
        self.send(OP_READ_COLOR_BUFFER_DMA, &payload.0)?;
        pipe::read_exact(self.channel.as_fd(), dest)
    }

    fn update_color_buffer_dma(
        &mut self,
        host_handle: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        gl_format: i32,
        gl_type: i32,
        src: &[u8],
    ) -> Result<()> {
        let mut payload = Payload::new()
            .u32(host_handle)
            .u32(x)
            .u32(y)
            .u32(width)
            .u32(height)
            .i32(gl_format)
            .i32(gl_type)
            .u64(src.len() as u64);
        payload.0.extend_from_slice(src);
        self.send(OP_UPDATE_COLOR_BUFFER_DMA, &payload.0)
    }

    fn bind_dma_directly(&mut self, guest_phys_addr: u64) -> Result<()> {
        self.send(OP_BIND_DMA, &Payload::new().u64(guest_phys_addr).0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    // a loopback "host" on a socketpair that answers one opcode
    fn loopback() -> (WireRenderControl, OwnedFd) {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

        let (guest, host) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();

        // answer the feature query before connect() blocks on it
        let host_fd = host.as_raw_fd();
        let answer = std::thread::spawn(move || {
            let mut hdr = [0u8; 8];
            pipe::read_exact(unsafe { std::os::fd::BorrowedFd::borrow_raw(host_fd) }, &mut hdr)
                .unwrap();
            assert_eq!(u32::from_le_bytes(hdr[0..4].try_into().unwrap()), 10001);
            pipe::write_all(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(host_fd) },
                &0x7u32.to_le_bytes(),
            )
            .unwrap();
        });

        struct OneFd(OwnedFd);
        impl PipeOpener for OneFd {
            fn open(&self, _service: &str) -> crate::Result<OwnedFd> {
                self.0.try_clone().map_err(crate::Error::from)
            }
        }

        let control = WireRenderControl::connect(&OneFd(guest)).unwrap();
        answer.join().unwrap();
        (control, host)
    }

    #[test]
    fn feature_query_on_connect() {
        let (control, _host) = loopback();
        let features = control.feature_info();
        assert!(features.has_shared_slots_host_memory_allocator);
        assert!(features.has_read_color_buffer_dma);
        assert!(features.has_yuv_cache);
    }

    #[test]
    fn frames_are_length_prefixed() {
        let (mut control, host) = loopback();
        control.bind_dma_directly(0xdead_beef).unwrap();

        let mut frame = [0u8; 16];
        pipe::read_exact(host.as_fd(), &mut frame).unwrap();
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 10018);
        assert_eq!(u32::from_le_bytes(frame[4..8].try_into().unwrap()), 8);
        assert_eq!(
            u64::from_le_bytes(frame[8..16].try_into().unwrap()),
            0xdead_beef
        );
    }
}
