// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The buffer allocator.
//!
//! Validates descriptors, resolves plane layouts from the format database,
//! reserves a shared region per buffer, writes the in-buffer metadata
//! record and, for GPU-usable buffers, creates the host color buffer with a
//! refcount pipe holding it alive.

use log::{debug, error};
use rbm::address_space::{AddressSpaceAllocator, AddressSpaceBlock};
use rbm::formats::{self, EmulatorFrameworkFormat};
use rbm::handle::{BufferHandle, RawHandle};
use rbm::host::{HostConnection, RenderControl};
use rbm::metadata::{ExternalMetadata, PlaneLayout, PlaneLayoutComponent};
use rbm::pipe::{self, PipeOpener};
use rbm::{align16, BufferUsage, DebugLevel, Error, PixelFormat, Result};
use std::mem;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The refcount pipe service; the host releases one color-buffer reference
/// when a descriptor opened on it closes.
const REFCOUNT_SERVICE: &str = "refcount";

#[derive(Clone, Debug, Default)]
pub struct ExtendableType {
    pub name: String,
    pub value: i64,
}

/// A buffer allocation request as received from clients.
#[derive(Clone, Debug, Default)]
pub struct BufferDescriptorInfo {
    pub name: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub layer_count: i32,
    pub format: i32,
    pub usage: u64,
    pub reserved_size: i64,
    pub additional_options: Vec<ExtendableType>,
}

pub struct AllocationResult {
    pub stride: u32,
    pub buffers: Vec<RawHandle>,
}

pub struct RanchuAllocator {
    conn: HostConnection,
    space: Arc<dyn AddressSpaceAllocator>,
    pipes: Arc<dyn PipeOpener>,
    buffer_id_generator: AtomicU64,
    debug_level: DebugLevel,
}

impl RanchuAllocator {
    pub fn new(
        conn: HostConnection,
        space: Arc<dyn AddressSpaceAllocator>,
        pipes: Arc<dyn PipeOpener>,
    ) -> Self {
        Self {
            conn,
            space,
            pipes,
            buffer_id_generator: AtomicU64::new(0),
            debug_level: DebugLevel::from_env(),
        }
    }

    /// Connects to the host renderer and backs buffers with the default
    /// shared-memory allocator.
    pub fn with_default_backends() -> Result<Self> {
        let pipes: Arc<dyn PipeOpener> = Arc::new(rbm::pipe::QemuPipes);
        let encoder = rbm::host::wire::WireRenderControl::connect(pipes.as_ref())?;
        Ok(Self::new(
            HostConnection::new(Box::new(encoder)),
            Arc::new(rbm::address_space::MemfdAllocator::new()),
            pipes,
        ))
    }

    pub fn allocate2(&self, desc: &BufferDescriptorInfo, count: i32) -> Result<AllocationResult> {
        if count <= 0 {
            error!("BAD_DESCRIPTOR: count={count}");
            return Err(Error::BadDescriptor);
        }
        if desc.width <= 0 {
            error!("BAD_DESCRIPTOR: width={}", desc.width);
            return Err(Error::BadDescriptor);
        }
        if desc.height <= 0 {
            error!("BAD_DESCRIPTOR: height={}", desc.height);
            return Err(Error::BadDescriptor);
        }
        if BufferUsage::from_bits_retain(desc.usage).has_reserved_bits() {
            error!("BAD_DESCRIPTOR: usage={:#x}", desc.usage);
            return Err(Error::BadDescriptor);
        }
        if desc.layer_count != 1 {
            error!("BAD_DESCRIPTOR: layerCount={}", desc.layer_count);
            return Err(Error::BadDescriptor);
        }
        if desc.reserved_size < 0 {
            error!("BAD_DESCRIPTOR: reservedSize={}", desc.reserved_size);
            return Err(Error::BadDescriptor);
        }
        if !desc.additional_options.is_empty() {
            error!("BAD_DESCRIPTOR: additionalOptions are not supported");
            return Err(Error::BadDescriptor);
        }

        let req = AllocationRequest::resolve(desc)?;

        let mut session = self.conn.session();
        if self.debug_level >= DebugLevel::Alloc {
            let features = session.feature_info();
            debug!(
                "allocate2: count={count} sharedSlots={}",
                features.has_shared_slots_host_memory_allocator
            );
        }

        let mut cbs: Vec<BufferHandle> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let buffer_id = self.buffer_id_generator.fetch_add(1, Ordering::Relaxed) + 1;
            match self.allocate_impl(&req, &mut *session, buffer_id) {
                Ok(cb) => cbs.push(cb),
                Err(err) => {
                    error!("allocate2: batch failed: {err}");
                    // unwind earlier buffers in reverse order
                    while cbs.pop().is_some() {}
                    return Err(Error::NoResources);
                }
            }
        }
        drop(session);

        let mut buffers = Vec::with_capacity(cbs.len());
        for cb in &cbs {
            buffers.push(cb.to_raw().map_err(|_| Error::NoResources)?);
        }

        Ok(AllocationResult {
            stride: req.stride0,
            buffers,
        })
    }

    pub fn is_supported(&self, desc: &BufferDescriptorInfo) -> bool {
        if desc.width <= 0
            || desc.height <= 0
            || desc.layer_count != 1
            || desc.reserved_size < 0
            || !desc.additional_options.is_empty()
        {
            return false;
        }

        let usage = BufferUsage::from_bits_retain(desc.usage);
        if usage.has_reserved_bits() {
            return false;
        }

        let Some(format) = PixelFormat::from_raw(desc.format) else {
            return false;
        };
        match formats::info(format) {
            Ok(fmt_info) => fmt_info.gl.is_some() || !usage.needs_gpu_buffer(),
            Err(_) => false,
        }
    }

    pub fn imapper_library_suffix(&self) -> &'static str {
        "ranchu"
    }

    /// The legacy encoded-descriptor entry point.
    pub fn allocate(&self, _encoded_descriptor: &[u8], _count: i32) -> Result<AllocationResult> {
        Err(Error::Unsupported)
    }

    fn allocate_impl(
        &self,
        req: &AllocationRequest,
        rc: &mut dyn RenderControl,
        buffer_id: u64,
    ) -> Result<BufferHandle> {
        let image_size_aligned = align16(req.image_size);
        let total_size =
            image_size_aligned + mem::size_of::<ExternalMetadata>() as u64 + req.reserved_size;

        let block = match self.space.host_malloc(total_size) {
            Ok(block) => block,
            Err(err) => {
                error!("hostMalloc({total_size}) failed: {err}");
                return Err(Error::NoResources);
            }
        };

        let mut metadata = ExternalMetadata::new(buffer_id);
        metadata.set_name(&req.name);
        metadata.plane_layout_size = req.plane_count;
        if req.plane_count > 0 {
            metadata.plane_layout = req.planes;
            metadata.plane_layout_component = req.components;
        }
        metadata.reserved_region_size = req.reserved_size as u32;
        metadata.width = req.width;
        metadata.height = req.height;
        metadata.gl_format = req.gl_format;
        metadata.gl_type = req.gl_type;

        // SAFETY: the block covers image_size_aligned + sizeof(record) +
        // reserved bytes, and the record offset is 16-aligned
        unsafe {
            block
                .guest_ptr()
                .add(image_size_aligned as usize)
                .cast::<ExternalMetadata>()
                .write(metadata);
        }

        let mut host_handle = 0u32;
        let mut refcount_fd = None;
        if req.usage.needs_gpu_buffer() {
            let fd = match self.pipes.open(REFCOUNT_SERVICE) {
                Ok(fd) => fd,
                Err(err) => {
                    error!("refcount pipe open failed: {err}");
                    self.space.host_free(block);
                    return Err(Error::NoResources);
                }
            };

            host_handle = match rc.create_color_buffer_dma(
                req.width,
                req.height,
                req.rc_alloc_format,
                req.emu_fwk_format,
            ) {
                Ok(handle) if handle != 0 => handle,
                _ => {
                    error!("createColorBufferDMA({}x{}) failed", req.width, req.height);
                    self.space.host_free(block);
                    return Err(Error::NoResources);
                }
            };

            if let Err(err) = pipe::push_host_handle_ref(fd.as_fd(), host_handle) {
                error!("refcount push failed: {err}");
                rc.close_color_buffer(host_handle);
                self.space.host_free(block);
                return Err(Error::NoResources);
            }

            refcount_fd = Some(fd);
        }

        if self.debug_level >= DebugLevel::Alloc {
            debug!(
                "allocate: name={:?} id={buffer_id} {}x{} format={:#x} usage={:#x} \
                 hostHandle={host_handle:#x} imageSize={} mappedSize={} offset={:#x} reserved={}",
                String::from_utf8_lossy(&req.name),
                req.width,
                req.height,
                req.format.as_raw(),
                req.usage.bits(),
                req.image_size,
                block.size,
                block.offset,
                req.reserved_size,
            );
        }

        let AddressSpaceBlock {
            fd,
            mapping,
            offset,
            size,
            ..
        } = block;

        Ok(BufferHandle::new(
            fd,
            refcount_fd,
            host_handle,
            req.usage,
            req.format,
            req.drm_format,
            req.stride0,
            req.image_size,
            mapping,
            size,
            offset,
            image_size_aligned,
        ))
    }
}

struct AllocationRequest {
    name: Vec<u8>,
    planes: [PlaneLayout; 3],
    components: [PlaneLayoutComponent; 4],
    plane_count: u8,
    image_size: u64,
    reserved_size: u64,
    usage: BufferUsage,
    width: u32,
    height: u32,
    stride0: u32,
    drm_format: u32,
    format: PixelFormat,
    gl_format: i32,
    gl_type: i32,
    rc_alloc_format: i32,
    emu_fwk_format: EmulatorFrameworkFormat,
}

impl AllocationRequest {
    fn resolve(desc: &BufferDescriptorInfo) -> Result<Self> {
        let Some(format) = PixelFormat::from_raw(desc.format) else {
            error!(
                "unsupported format: format={:#x} usage={:#x}",
                desc.format, desc.usage
            );
            return Err(Error::Unsupported);
        };
        let fmt_info = formats::info(format)?;

        let usage = BufferUsage::from_bits_retain(desc.usage);
        if usage.needs_gpu_buffer() && fmt_info.gl.is_none() {
            error!(
                "format {:#x} cannot back a GPU buffer: usage={:#x}",
                desc.format, desc.usage
            );
            return Err(Error::Unsupported);
        }

        let width = desc.width as u32;
        let height = desc.height as u32;
        let resolved = formats::resolve_layout(fmt_info, width, height);

        // the name ends at the first NUL
        let name_len = desc
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(desc.name.len());

        let mut req = Self {
            name: desc.name[..name_len].to_vec(),
            planes: resolved.planes,
            components: resolved.components,
            plane_count: resolved.plane_count,
            image_size: resolved.image_size,
            reserved_size: desc.reserved_size as u64,
            usage,
            width,
            height,
            stride0: resolved.stride0,
            drm_format: fmt_info.drm_format,
            format,
            gl_format: -1,
            gl_type: -1,
            rc_alloc_format: -1,
            emu_fwk_format: EmulatorFrameworkFormat::GlCompatible,
        };

        if !usage.needs_cpu_buffer() {
            // no CPU image: nothing meaningful to describe in plane layouts
            req.image_size = 0;
            req.plane_count = 0;
            req.stride0 = 0;
        }

        if usage.needs_gpu_buffer() {
            // checked above
            let gl = fmt_info.gl.as_ref().ok_or(Error::Unsupported)?;
            req.gl_format = gl.format;
            req.gl_type = gl.ty;
            req.rc_alloc_format = gl.rc_alloc_format;
            req.emu_fwk_format = gl.emu_fwk_format;
        }

        Ok(req)
    }
}
