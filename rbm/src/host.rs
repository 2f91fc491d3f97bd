// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The host render-control channel.
//!
//! One process-wide [`HostConnection`] wraps the encoder; every
//! host-touching operation takes a short [`HostConnectionSession`], which
//! serializes access for its duration.  No session may span a call that
//! could re-enter the mapper.

pub mod wire;

use super::formats::EmulatorFrameworkFormat;
use super::types::Result;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

/// Capabilities reported by the host renderer.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeatureInfo {
    pub has_shared_slots_host_memory_allocator: bool,
    pub has_read_color_buffer_dma: bool,
    pub has_yuv_cache: bool,
}

/// Operations of the host rendering encoder.
pub trait RenderControl: Send {
    fn feature_info(&self) -> FeatureInfo;

    /// Creates a host color buffer; returns its non-zero handle.
    fn create_color_buffer_dma(
        &mut self,
        width: u32,
        height: u32,
        internal_format: i32,
        emu_fwk_format: EmulatorFrameworkFormat,
    ) -> Result<u32>;

    fn close_color_buffer(&mut self, host_handle: u32);

    /// Makes pending host GPU writes visible to transfers.  Negative result
    /// means the color buffer is gone.
    fn color_buffer_cache_flush(&mut self, host_handle: u32) -> Result<i32>;

    fn read_color_buffer_yuv(
        &mut self,
        host_handle: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        dest: &mut [u8],
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// Tells the host which guest physical range backs the next transfer.
    fn bind_dma_directly(&mut self, guest_phys_addr: u64) -> Result<()>;
}

pub struct HostConnection {
    encoder: Mutex<Box<dyn RenderControl>>,
}

impl HostConnection {
    pub fn new(encoder: Box<dyn RenderControl>) -> Self {
        Self {
            encoder: Mutex::new(encoder),
        }
    }

    pub fn session(&self) -> HostConnectionSession<'_> {
        HostConnectionSession {
            encoder: self.encoder.lock().unwrap(),
        }
    }
}

/// Exclusive use of the host channel for one operation.
pub struct HostConnectionSession<'a> {
    encoder: MutexGuard<'a, Box<dyn RenderControl>>,
}

impl Deref for HostConnectionSession<'_> {
    type Target = dyn RenderControl;

    fn deref(&self) -> &Self::Target {
        &**self.encoder
    }
}

impl DerefMut for HostConnectionSession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.encoder
    }
}
