// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Fakes shared by the unit tests: an in-memory host renderer, pipe opener
//! and fault-injecting address-space wrapper.

use crate::allocator::BufferDescriptorInfo;
use rbm::address_space::{AddressSpaceAllocator, AddressSpaceBlock, MemfdAllocator};
use rbm::formats::EmulatorFrameworkFormat;
use rbm::host::{FeatureInfo, HostConnection, RenderControl};
use rbm::{Error, PixelFormat, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct RendererState {
    pub next_handle: u32,
    pub color_buffers: HashMap<u32, Vec<u8>>,
    pub create_failures: u32,
}

pub struct FakeRenderer {
    state: Arc<Mutex<RendererState>>,
}

pub fn fake_connection() -> (HostConnection, Arc<Mutex<RendererState>>) {
    let state = Arc::new(Mutex::new(RendererState {
        next_handle: 1,
        ..Default::default()
    }));
    (fake_connection_with_state(&state), state)
}

/// A second connection against the same simulated host, as the mapper in
/// another process would get.
pub fn fake_connection_with_state(state: &Arc<Mutex<RendererState>>) -> HostConnection {
    HostConnection::new(Box::new(FakeRenderer {
        state: state.clone(),
    }))
}

impl RenderControl for FakeRenderer {
    fn feature_info(&self) -> FeatureInfo {
        FeatureInfo {
            has_shared_slots_host_memory_allocator: true,
            has_read_color_buffer_dma: true,
            has_yuv_cache: true,
        }
    }

    fn create_color_buffer_dma(
        &mut self,
        _width: u32,
        _height: u32,
        _internal_format: i32,
        _emu_fwk_format: EmulatorFrameworkFormat,
    ) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(Error::NoResources);
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.color_buffers.insert(handle, Vec::new());
        Ok(handle)
    }

    fn close_color_buffer(&mut self, host_handle: u32) {
        self.state.lock().unwrap().color_buffers.remove(&host_handle);
    }

    fn color_buffer_cache_flush(&mut self, host_handle: u32) -> Result<i32> {
        let state = self.state.lock().unwrap();
        Ok(if state.color_buffers.contains_key(&host_handle) {
            0
        } else {
            -1
        })
    }

    fn read_color_buffer_yuv(
        &mut self,
        host_handle: u32,
        _x: u32,
        _y: u32,
        _width: u32,
        _height: u32,
        dest: &mut [u8],
    ) -> Result<()> {
        self.read_back(host_handle, dest)
    }

    fn read_color_buffer_dma(
        &mut self,
        host_handle: u32,
        _x: u32,
        _y: u32,
        _width: u32,
        _height: u32,
        _gl_format: i32,
        _gl_type: i32,
        dest: &mut [u8],
    ) -> Result<()> {
        self.read_back(host_handle, dest)
    }

    fn update_color_buffer_dma(
        &mut self,
        host_handle: u32,
        _x: u32,
        _y: u32,
        _width: u32,
        _height: u32,
        _gl_format: i32,
        _gl_type: i32,
        src: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.color_buffers.get_mut(&host_handle) {
            Some(store) => {
                *store = src.to_vec();
                Ok(())
            }
            None => Err(Error::NoResources),
        }
    }

    fn bind_dma_directly(&mut self, _guest_phys_addr: u64) -> Result<()> {
        Ok(())
    }
}

impl FakeRenderer {
    fn read_back(&mut self, host_handle: u32, dest: &mut [u8]) -> Result<()> {
        let state = self.state.lock().unwrap();
        let store = state
            .color_buffers
            .get(&host_handle)
            .ok_or(Error::NoResources)?;
        let len = store.len().min(dest.len());
        dest[..len].copy_from_slice(&store[..len]);
        Ok(())
    }
}

/// Plays the host pipe device; a sink descriptor is enough for the
/// refcount protocol, which only ever writes.
pub struct FakePipes;

impl FakePipes {
    pub fn new() -> Self {
        Self
    }
}

impl rbm::pipe::PipeOpener for FakePipes {
    fn open(&self, _service: &str) -> Result<std::os::fd::OwnedFd> {
        rbm::open_device("/dev/null")
    }
}

/// Delegates to a real allocator for a fixed number of calls, then fails.
pub struct FailingAllocator {
    inner: MemfdAllocator,
    remaining: AtomicI32,
}

impl FailingAllocator {
    pub fn new(successes: i32) -> Self {
        Self {
            inner: MemfdAllocator::new(),
            remaining: AtomicI32::new(successes),
        }
    }
}

impl AddressSpaceAllocator for FailingAllocator {
    fn host_malloc(&self, size: u64) -> Result<AddressSpaceBlock> {
        if self.remaining.fetch_sub(1, Ordering::Relaxed) <= 0 {
            return Err(Error::NoResources);
        }
        self.inner.host_malloc(size)
    }

    fn host_free(&self, block: AddressSpaceBlock) {
        self.inner.host_free(block)
    }
}

pub fn descriptor(
    name: &str,
    width: i32,
    height: i32,
    format: PixelFormat,
    usage: u64,
) -> BufferDescriptorInfo {
    BufferDescriptorInfo {
        name: name.as_bytes().to_vec(),
        width,
        height,
        layer_count: 1,
        format: format.as_raw(),
        usage,
        reserved_size: 0,
        additional_options: Vec::new(),
    }
}

/// Open descriptors backed by buffer memory.
pub fn count_buffer_memfds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
        .filter(|target| target.to_string_lossy().contains("rbm-host-memory"))
        .count()
}

/// Asserts the buffer-memory descriptor count returns to `before`.  Other
/// tests run concurrently and may hold such descriptors transiently, so a
/// leak is only declared once the count stops settling.
pub fn assert_fd_count_settles(before: usize) {
    for _ in 0..100 {
        if count_buffer_memfds() <= before {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!(
        "descriptor leak: {} buffer memfds open, expected at most {before}",
        count_buffer_memfds()
    );
}
