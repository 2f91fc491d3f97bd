// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The per-process mapper.
//!
//! Keeps the set of imported buffers, maps their shared regions, performs
//! lock/unlock coherency against the host color buffer and serves the
//! standard-metadata surface.  One instance lives for the whole process;
//! the stable-C table in [`crate::stablec`] trampolines into it.

use crate::metadata_codec::{
    MetadataReader, MetadataWriter, StandardMetadataType, CHROMA_SITING_TAG, COMPRESSION_TAG,
    INTERLACED_TAG, METADATA_TYPES, PLANE_LAYOUT_COMPONENT_TYPE_TAG, STANDARD_METADATA_TYPE_TAG,
};
use log::{debug, error};
use rbm::address_space::AddressSpaceAllocator;
use rbm::formats;
use rbm::handle::{BufferHandle, RawHandle};
use rbm::host::HostConnection;
use rbm::metadata::{Cta861_3, Smpte2086, XyColor};
use rbm::{wait_fence, BufferUsage, DebugLevel, Error, Result};
use std::collections::HashSet;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;
use std::slice;
use std::sync::Mutex;

const METADATA_BUFFER_INITIAL_SIZE: usize = 1024;

const COMPRESSION_NONE: i64 = 0;
const INTERLACED_NONE: i64 = 0;
const CHROMA_SITING_NONE: i64 = 1;
const CHROMA_SITING_SITED_INTERSTITIAL: i64 = 2;

/// Service-facing numeric error codes (negated on the metadata paths).
pub fn error_code(err: &Error) -> i32 {
    match err {
        Error::BadDescriptor => 1,
        Error::BadBuffer => 2,
        Error::BadValue => 3,
        Error::NoResources | Error::DeviceIo(_) => 5,
        _ => 7,
    }
}

/// Rectangle a lock intends to touch, in pixels.
#[derive(Clone, Copy, Debug)]
pub struct AccessRegion {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Opaque reference handed to clients; only pointers minted by
/// [`RanchuMapper::import_buffer`] validate.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct BufferRef(*mut BufferHandle);

// SAFETY: the pointee is owned by the mapper's imported set and is itself
// Send + Sync
unsafe impl Send for BufferRef {}
// SAFETY: see above
unsafe impl Sync for BufferRef {}

impl BufferRef {
    pub fn from_ptr(ptr: *mut BufferHandle) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut BufferHandle {
        self.0
    }
}

pub struct RanchuMapper {
    conn: HostConnection,
    imported: Mutex<HashSet<usize>>,
    phys_addr_to_offset: u64,
    debug_level: DebugLevel,
}

impl RanchuMapper {
    /// `space` is only probed once to learn the constant physical-address
    /// bias of mapped offsets.
    pub fn new(conn: HostConnection, space: &dyn AddressSpaceAllocator) -> Result<Self> {
        let probe = space.host_malloc(256)?;
        let phys_addr_to_offset = probe.phys_addr - probe.offset;
        space.host_free(probe);

        Ok(Self {
            conn,
            imported: Mutex::new(HashSet::new()),
            phys_addr_to_offset,
            debug_level: DebugLevel::from_env(),
        })
    }

    pub fn with_default_backends() -> Result<Self> {
        let pipes = rbm::pipe::QemuPipes;
        let encoder = rbm::host::wire::WireRenderControl::connect(&pipes)?;
        Self::new(
            HostConnection::new(Box::new(encoder)),
            &rbm::address_space::MemfdAllocator::new(),
        )
    }

    pub fn import_buffer(&self, raw: RawHandle) -> Result<BufferRef> {
        let mut cb = BufferHandle::from_raw(raw)?;

        if cb.mmaped_size > 0 {
            cb.map_into_process().map_err(|err| {
                error!("importBuffer: mapping failed: {err}");
                Error::NoResources
            })?;
        }

        if self.debug_level >= DebugLevel::Import {
            debug!("importBuffer: id={}", cb.external_metadata().buffer_id);
        }

        let ptr = Box::into_raw(Box::new(cb));
        let mut imported = self.imported.lock().unwrap();
        assert!(imported.insert(ptr as usize), "duplicate import entry");
        Ok(BufferRef(ptr))
    }

    pub fn free_buffer(&self, buffer: BufferRef) -> Result<()> {
        {
            let mut imported = self.imported.lock().unwrap();
            if !imported.remove(&(buffer.0 as usize)) {
                return Err(Error::BadBuffer);
            }
        }

        // SAFETY: the pointer came out of import_buffer and was still in
        // the set, so the box is live and now exclusively ours
        let cb = unsafe { Box::from_raw(buffer.0) };

        if self.debug_level >= DebugLevel::Import {
            debug!("freeBuffer: id={}", cb.external_metadata().buffer_id);
        }

        if cb.host_handle != 0 && cb.locked_usage().intersects(BufferUsage::CPU_WRITE_MASK) {
            self.flush_to_host(&cb);
        }

        // dropping unmaps the region and closes the descriptors
        Ok(())
    }

    fn validate(&self, buffer: BufferRef) -> Result<&BufferHandle> {
        let imported = self.imported.lock().unwrap();
        if imported.contains(&(buffer.0 as usize)) {
            // SAFETY: entries in the set are live boxes owned by the
            // mapper; callers must not race an operation against free
            Ok(unsafe { &*buffer.0 })
        } else {
            Err(Error::BadBuffer)
        }
    }

    pub fn get_transport_size(&self, buffer: BufferRef) -> Result<(u32, u32)> {
        let cb = self.validate(buffer)?;
        Ok((cb.num_fds(), cb.num_ints()))
    }

    pub fn lock(
        &self,
        buffer: BufferRef,
        unchecked_usage: u64,
        region: AccessRegion,
        acquire_fence: Option<BorrowedFd>,
    ) -> Result<NonNull<u8>> {
        let cb = self.validate(buffer)?;
        let metadata = cb.external_metadata();

        if !cb.locked_usage().is_empty() {
            error!("lock: BAD_BUFFER(lockedUsage): id={}", metadata.buffer_id);
            return Err(Error::BadBuffer);
        }

        if region.left < 0
            || region.top < 0
            || region.bottom < region.top
            || region.right < region.left
            || i64::from(region.right) > i64::from(metadata.width)
            || i64::from(region.bottom) > i64::from(metadata.height)
        {
            error!("lock: BAD_VALUE(accessRegion): id={}", metadata.buffer_id);
            return Err(Error::BadValue);
        }
        if region.right != 0 && region.left == region.right {
            error!("lock: BAD_VALUE(accessRegion): id={}", metadata.buffer_id);
            return Err(Error::BadValue);
        }
        if region.bottom != 0 && region.top == region.bottom {
            error!("lock: BAD_VALUE(accessRegion): id={}", metadata.buffer_id);
            return Err(Error::BadValue);
        }

        let cpu_usage = BufferUsage::from_bits_retain(unchecked_usage)
            & cb.usage
            & (BufferUsage::CPU_READ_MASK | BufferUsage::CPU_WRITE_MASK);
        if cpu_usage.is_empty() {
            error!("lock: BAD_VALUE(usage): id={}", metadata.buffer_id);
            return Err(Error::BadValue);
        }

        if let Some(fence) = acquire_fence {
            if let Err(err) = wait_fence(fence, "lock") {
                error!(
                    "lock: NO_RESOURCES(acquireFence): id={} {err}",
                    metadata.buffer_id
                );
                return Err(Error::NoResources);
            }
        }

        if self.debug_level >= DebugLevel::Lock {
            debug!(
                "lock: id={} usage={:#x} accessRegion={{ left={} top={} right={} bottom={} }}",
                metadata.buffer_id,
                cpu_usage.bits(),
                region.left,
                region.top,
                region.right,
                region.bottom,
            );
        }

        if cb.host_handle != 0 {
            self.read_from_host(cb)?;
        }

        cb.set_locked_usage(cpu_usage);
        cb.buffer_ptr()
            .and_then(NonNull::new)
            .ok_or(Error::BadBuffer)
    }

    /// Returns the release fence; always signalled.
    pub fn unlock(&self, buffer: BufferRef) -> Result<i32> {
        let cb = self.validate(buffer)?;
        if cb.locked_usage().is_empty() {
            error!(
                "unlock: BAD_BUFFER(lockedUsage): id={}",
                cb.external_metadata().buffer_id
            );
            return Err(Error::BadBuffer);
        }

        if self.debug_level >= DebugLevel::Lock {
            debug!("unlock: id={}", cb.external_metadata().buffer_id);
        }

        if cb.host_handle != 0 && cb.locked_usage().intersects(BufferUsage::CPU_WRITE_MASK) {
            self.flush_to_host(cb);
        }

        cb.set_locked_usage(BufferUsage::empty());
        Ok(-1)
    }

    pub fn flush_locked_buffer(&self, buffer: BufferRef) -> Result<()> {
        let cb = self.validate(buffer)?;
        if self.debug_level >= DebugLevel::Flush {
            debug!("flushLockedBuffer: id={}", cb.external_metadata().buffer_id);
        }
        if !cb.locked_usage().intersects(BufferUsage::CPU_WRITE_MASK) {
            error!(
                "flushLockedBuffer: BAD_BUFFER(lockedUsage): id={}",
                cb.external_metadata().buffer_id
            );
            return Err(Error::BadBuffer);
        }
        if cb.host_handle != 0 {
            self.flush_to_host(cb);
        }
        Ok(())
    }

    pub fn reread_locked_buffer(&self, buffer: BufferRef) -> Result<()> {
        let cb = self.validate(buffer)?;
        if self.debug_level >= DebugLevel::Flush {
            debug!(
                "rereadLockedBuffer: id={}",
                cb.external_metadata().buffer_id
            );
        }
        if !cb.locked_usage().intersects(BufferUsage::CPU_READ_MASK) {
            error!(
                "rereadLockedBuffer: BAD_BUFFER(lockedUsage): id={}",
                cb.external_metadata().buffer_id
            );
            return Err(Error::BadBuffer);
        }
        if cb.host_handle != 0 {
            self.read_from_host(cb)
        } else {
            Ok(())
        }
    }

    fn read_from_host(&self, cb: &BufferHandle) -> Result<()> {
        let metadata = cb.external_metadata();
        let mut session = self.conn.session();

        let res = session
            .color_buffer_cache_flush(cb.host_handle)
            .map_err(|_| Error::NoResources)?;
        if res < 0 {
            error!(
                "readFromHost: NO_RESOURCES: id={} res={res}",
                metadata.buffer_id
            );
            return Err(Error::NoResources);
        }

        let Some(ptr) = cb.buffer_ptr() else {
            return Err(Error::BadBuffer);
        };
        // SAFETY: buffer_size bytes of image precede the metadata record in
        // the mapping
        let dest = unsafe { slice::from_raw_parts_mut(ptr, cb.buffer_size as usize) };

        if cb.format.is_yuv() {
            assert!(
                session.feature_info().has_yuv_cache,
                "host YUV cache support is required"
            );
            session
                .read_color_buffer_yuv(cb.host_handle, 0, 0, metadata.width, metadata.height, dest)
                .map_err(|_| Error::NoResources)?;
        } else {
            assert!(
                session.feature_info().has_read_color_buffer_dma,
                "host DMA readback support is required"
            );
            session
                .bind_dma_directly(self.mmaped_phys_addr(cb.mmaped_offset))
                .map_err(|_| Error::NoResources)?;
            session
                .read_color_buffer_dma(
                    cb.host_handle,
                    0,
                    0,
                    metadata.width,
                    metadata.height,
                    metadata.gl_format,
                    metadata.gl_type,
                    dest,
                )
                .map_err(|_| Error::NoResources)?;
        }

        Ok(())
    }

    fn flush_to_host(&self, cb: &BufferHandle) {
        let metadata = cb.external_metadata();
        let mut session = self.conn.session();

        let Some(ptr) = cb.buffer_ptr() else {
            return;
        };
        // SAFETY: see read_from_host
        let src = unsafe { slice::from_raw_parts(ptr as *const u8, cb.buffer_size as usize) };

        let pushed = session
            .bind_dma_directly(self.mmaped_phys_addr(cb.mmaped_offset))
            .and_then(|_| {
                session.update_color_buffer_dma(
                    cb.host_handle,
                    0,
                    0,
                    metadata.width,
                    metadata.height,
                    metadata.gl_format,
                    metadata.gl_type,
                    src,
                )
            });
        if let Err(err) = pushed {
            error!("flushToHost: id={} {err}", metadata.buffer_id);
        }
    }

    pub fn get_metadata(&self, buffer: BufferRef, name: &str, ty: i64, dest: &mut [u8]) -> i32 {
        if name != STANDARD_METADATA_TYPE_TAG {
            error!("getMetadata: UNSUPPORTED: name={name}");
            return -error_code(&Error::Unsupported);
        }
        self.get_standard_metadata(buffer, ty, dest)
    }

    pub fn get_standard_metadata(&self, buffer: BufferRef, ty: i64, dest: &mut [u8]) -> i32 {
        let cb = match self.validate(buffer) {
            Ok(cb) => cb,
            Err(err) => return -error_code(&err),
        };

        // don't log dry runs
        if !dest.is_empty() && self.debug_level >= DebugLevel::Metadata {
            debug!(
                "getStandardMetadata: id={} type={ty}",
                cb.external_metadata().buffer_id
            );
        }

        let Some(ty) = StandardMetadataType::from_raw(ty) else {
            return -error_code(&Error::Unsupported);
        };
        self.get_standard_metadata_impl(cb, MetadataWriter::new(dest), ty)
    }

    fn get_standard_metadata_impl(
        &self,
        cb: &BufferHandle,
        mut writer: MetadataWriter,
        ty: StandardMetadataType,
    ) -> i32 {
        fn put_header<'a, 'b>(
            writer: &'a mut MetadataWriter<'b>,
            ty: StandardMetadataType,
        ) -> &'a mut MetadataWriter<'b> {
            writer
                .write_str(STANDARD_METADATA_TYPE_TAG.as_bytes())
                .write_i64(ty.as_raw())
        }

        let metadata = cb.external_metadata();
        match ty {
            StandardMetadataType::BufferId => {
                put_header(&mut writer, ty).write_u64(metadata.buffer_id);
            }

            StandardMetadataType::Name => {
                put_header(&mut writer, ty).write_str(metadata.name());
            }

            StandardMetadataType::Width => {
                put_header(&mut writer, ty).write_u64(u64::from(metadata.width));
            }

            StandardMetadataType::Height => {
                put_header(&mut writer, ty).write_u64(u64::from(metadata.height));
            }

            StandardMetadataType::LayerCount => {
                put_header(&mut writer, ty).write_u64(1);
            }

            StandardMetadataType::PixelFormatRequested => {
                put_header(&mut writer, ty).write_u32(cb.format.as_raw() as u32);
            }

            StandardMetadataType::PixelFormatFourcc => {
                put_header(&mut writer, ty).write_u32(cb.drm_format);
            }

            StandardMetadataType::PixelFormatModifier => {
                put_header(&mut writer, ty).write_u64(formats::DRM_FORMAT_MOD_LINEAR);
            }

            StandardMetadataType::Usage => {
                put_header(&mut writer, ty).write_u64(cb.usage.bits());
            }

            StandardMetadataType::AllocationSize => {
                put_header(&mut writer, ty).write_u64(cb.mmaped_size);
            }

            StandardMetadataType::ProtectedContent => {
                let protected = cb.usage.intersects(BufferUsage::PROTECTED);
                put_header(&mut writer, ty).write_u64(u64::from(protected));
            }

            StandardMetadataType::Compression => {
                put_header(&mut writer, ty)
                    .write_str(COMPRESSION_TAG.as_bytes())
                    .write_i64(COMPRESSION_NONE);
            }

            StandardMetadataType::Interlaced => {
                put_header(&mut writer, ty)
                    .write_str(INTERLACED_TAG.as_bytes())
                    .write_i64(INTERLACED_NONE);
            }

            StandardMetadataType::ChromaSiting => {
                let siting = if cb.format.is_yuv() {
                    CHROMA_SITING_SITED_INTERSTITIAL
                } else {
                    CHROMA_SITING_NONE
                };
                put_header(&mut writer, ty)
                    .write_str(CHROMA_SITING_TAG.as_bytes())
                    .write_i64(siting);
            }

            StandardMetadataType::PlaneLayouts => {
                let plane_count = usize::from(metadata.plane_layout_size);
                if plane_count == 0 {
                    return -error_code(&Error::Unsupported);
                }

                put_header(&mut writer, ty).write_i64(plane_count as i64);
                for plane in &metadata.plane_layout[..plane_count] {
                    let base = usize::from(plane.components_base);
                    let count = usize::from(plane.components_size);

                    writer.write_i64(count as i64);
                    for comp in &metadata.plane_layout_component[base..base + count] {
                        writer
                            .write_str(PLANE_LAYOUT_COMPONENT_TYPE_TAG.as_bytes())
                            .write_i64(i64::from(comp.component_type))
                            .write_i64(i64::from(comp.offset_in_bits))
                            .write_i64(i64::from(comp.size_in_bits));
                    }

                    let horizontal = 1u32 << plane.horizontal_subsampling_shift();
                    let vertical = 1u32 << plane.vertical_subsampling_shift();

                    writer
                        .write_i64(i64::from(plane.offset_in_bytes))
                        .write_i64(i64::from(plane.sample_increment_in_bytes) * 8)
                        .write_i64(i64::from(plane.stride_in_bytes))
                        .write_i64(i64::from(metadata.width / horizontal))
                        .write_i64(i64::from(metadata.height / vertical))
                        .write_i64(i64::from(plane.total_size_in_bytes))
                        .write_i64(i64::from(horizontal))
                        .write_i64(i64::from(vertical));
                }
            }

            StandardMetadataType::Crop => {
                let plane_count = usize::from(metadata.plane_layout_size);
                if plane_count == 0 {
                    return -error_code(&Error::Unsupported);
                }

                put_header(&mut writer, ty).write_u64(plane_count as u64);
                for _ in 0..plane_count {
                    // the platform parser consumes crop rects as int32
                    writer
                        .write_i32(0)
                        .write_i32(0)
                        .write_i32(metadata.width as i32)
                        .write_i32(metadata.height as i32);
                }
            }

            StandardMetadataType::Dataspace => {
                put_header(&mut writer, ty).write_i32(metadata.dataspace);
            }

            StandardMetadataType::BlendMode => {
                put_header(&mut writer, ty).write_i32(metadata.blend_mode);
            }

            StandardMetadataType::Smpte2086 => {
                if metadata.has_smpte2086 {
                    let smpte2086 = &metadata.smpte2086;
                    put_header(&mut writer, ty)
                        .write_f32(smpte2086.primary_red.x)
                        .write_f32(smpte2086.primary_red.y)
                        .write_f32(smpte2086.primary_green.x)
                        .write_f32(smpte2086.primary_green.y)
                        .write_f32(smpte2086.primary_blue.x)
                        .write_f32(smpte2086.primary_blue.y)
                        .write_f32(smpte2086.white_point.x)
                        .write_f32(smpte2086.white_point.y)
                        .write_f32(smpte2086.max_luminance)
                        .write_f32(smpte2086.min_luminance);
                }
            }

            StandardMetadataType::Cta861_3 => {
                if metadata.has_cta861_3 {
                    let cta861_3 = &metadata.cta861_3;
                    put_header(&mut writer, ty)
                        .write_f32(cta861_3.max_content_light_level)
                        .write_f32(cta861_3.max_frame_average_light_level);
                }
            }

            StandardMetadataType::Stride => {
                let value = if metadata.plane_layout_size == 1 {
                    metadata.plane_layout[0].stride_in_bytes
                        / u32::from(metadata.plane_layout[0].sample_increment_in_bytes)
                } else {
                    0
                };
                put_header(&mut writer, ty).write_u32(value);
            }
        }

        writer.desired_size()
    }

    pub fn set_metadata(
        &self,
        buffer: BufferRef,
        name: &str,
        ty: i64,
        payload: &[u8],
    ) -> Result<()> {
        if name != STANDARD_METADATA_TYPE_TAG {
            error!("setMetadata: UNSUPPORTED: name={name}");
            return Err(Error::Unsupported);
        }
        self.set_standard_metadata(buffer, ty, payload)
    }

    pub fn set_standard_metadata(&self, buffer: BufferRef, ty: i64, payload: &[u8]) -> Result<()> {
        let cb = self.validate(buffer)?;

        if self.debug_level >= DebugLevel::Metadata {
            debug!(
                "setStandardMetadata: id={} type={ty}",
                cb.external_metadata().buffer_id
            );
        }

        let Some(ty) = StandardMetadataType::from_raw(ty) else {
            return Err(Error::Unsupported);
        };
        self.set_standard_metadata_impl(cb, MetadataReader::new(payload), ty)
    }

    fn set_standard_metadata_impl(
        &self,
        cb: &BufferHandle,
        mut reader: MetadataReader,
        ty: StandardMetadataType,
    ) -> Result<()> {
        fn check_header(reader: &mut MetadataReader, ty: StandardMetadataType) -> bool {
            reader.read_str() == Some(STANDARD_METADATA_TYPE_TAG.as_bytes())
                && reader.read_i64() == Some(ty.as_raw())
                && reader.ok()
        }

        let metadata = cb.external_metadata_ptr();
        match ty {
            StandardMetadataType::Dataspace => {
                if !check_header(&mut reader, ty) {
                    return Err(Error::BadValue);
                }
                let Some(dataspace) = reader.read_i32() else {
                    return Err(Error::BadValue);
                };
                // SAFETY: metadata points at the live in-buffer record
                unsafe { (*metadata).dataspace = dataspace };
            }

            StandardMetadataType::BlendMode => {
                if !check_header(&mut reader, ty) {
                    return Err(Error::BadValue);
                }
                let Some(blend_mode) = reader.read_i32() else {
                    return Err(Error::BadValue);
                };
                // SAFETY: see above
                unsafe { (*metadata).blend_mode = blend_mode };
            }

            StandardMetadataType::Smpte2086 => {
                if reader.remaining() == 0 {
                    // SAFETY: see above
                    unsafe { (*metadata).has_smpte2086 = false };
                    return Ok(());
                }
                if !check_header(&mut reader, ty) {
                    return Err(Error::BadValue);
                }

                let mut read_xy = |reader: &mut MetadataReader| -> Option<XyColor> {
                    Some(XyColor {
                        x: reader.read_f32()?,
                        y: reader.read_f32()?,
                    })
                };
                let value = (|| {
                    Some(Smpte2086 {
                        primary_red: read_xy(&mut reader)?,
                        primary_green: read_xy(&mut reader)?,
                        primary_blue: read_xy(&mut reader)?,
                        white_point: read_xy(&mut reader)?,
                        max_luminance: reader.read_f32()?,
                        min_luminance: reader.read_f32()?,
                    })
                })();

                match value {
                    Some(value) if reader.ok() => {
                        // SAFETY: see above
                        unsafe {
                            (*metadata).smpte2086 = value;
                            (*metadata).has_smpte2086 = true;
                        }
                    }
                    _ => return Err(Error::BadValue),
                }
            }

            StandardMetadataType::Cta861_3 => {
                if reader.remaining() == 0 {
                    // SAFETY: see above
                    unsafe { (*metadata).has_cta861_3 = false };
                    return Ok(());
                }
                if !check_header(&mut reader, ty) {
                    return Err(Error::BadValue);
                }

                let value = (|| {
                    Some(Cta861_3 {
                        max_content_light_level: reader.read_f32()?,
                        max_frame_average_light_level: reader.read_f32()?,
                    })
                })();

                match value {
                    Some(value) if reader.ok() => {
                        // SAFETY: see above
                        unsafe {
                            (*metadata).cta861_3 = value;
                            (*metadata).has_cta861_3 = true;
                        }
                    }
                    _ => return Err(Error::BadValue),
                }
            }

            _ => {
                error!("setStandardMetadata: UNSUPPORTED: type={:?}", ty);
                return Err(Error::Unsupported);
            }
        }

        Ok(())
    }

    pub fn list_supported_metadata_types(&self) -> &'static [(StandardMetadataType, bool)] {
        METADATA_TYPES
    }

    pub fn dump_buffer(
        &self,
        buffer: BufferRef,
        emit: &mut dyn FnMut(StandardMetadataType, &[u8]),
    ) -> Result<()> {
        let cb = self.validate(buffer)?;

        if self.debug_level >= DebugLevel::Metadata {
            debug!("dumpBuffer: id={}", cb.external_metadata().buffer_id);
        }

        let mut scratch = vec![0u8; METADATA_BUFFER_INITIAL_SIZE];
        self.dump_buffer_impl(cb, emit, &mut scratch);
        Ok(())
    }

    fn dump_buffer_impl(
        &self,
        cb: &BufferHandle,
        emit: &mut dyn FnMut(StandardMetadataType, &[u8]),
        scratch: &mut Vec<u8>,
    ) {
        for &(ty, _) in METADATA_TYPES {
            let mut first_try = true;
            loop {
                let desired = self.get_standard_metadata_impl(cb, MetadataWriter::new(scratch), ty);
                if desired < 0 {
                    break;
                }
                if desired as usize <= scratch.len() {
                    emit(ty, &scratch[..desired as usize]);
                    break;
                }
                assert!(first_try, "metadata grew between encoding passes");
                scratch.resize(desired as usize, 0);
                first_try = false;
            }
        }
    }

    pub fn dump_all_buffers(
        &self,
        begin: &mut dyn FnMut(),
        emit: &mut dyn FnMut(StandardMetadataType, &[u8]),
    ) {
        let mut scratch = vec![0u8; METADATA_BUFFER_INITIAL_SIZE];

        let imported = self.imported.lock().unwrap();
        for &addr in imported.iter() {
            begin();
            // SAFETY: entries in the set are live boxes owned by the mapper
            let cb = unsafe { &*(addr as *const BufferHandle) };
            self.dump_buffer_impl(cb, emit, &mut scratch);
        }
    }

    /// Returns the reserved tail right after the metadata record.
    pub fn get_reserved_region(&self, buffer: BufferRef) -> Result<(Option<NonNull<u8>>, u64)> {
        let cb = self.validate(buffer)?;
        let metadata = cb.external_metadata();

        let size = u64::from(metadata.reserved_region_size);
        let ptr = if size > 0 {
            // SAFETY: the allocator reserved `size` bytes right after the
            // record
            NonNull::new(unsafe {
                (metadata as *const rbm::metadata::ExternalMetadata).add(1) as *mut u8
            })
        } else {
            None
        };
        Ok((ptr, size))
    }

    fn mmaped_phys_addr(&self, offset: u64) -> u64 {
        self.phys_addr_to_offset + offset
    }
}

impl Drop for RanchuMapper {
    fn drop(&mut self) {
        let imported = self.imported.get_mut().unwrap();
        for addr in imported.drain() {
            // SAFETY: remaining entries are live boxes nobody else owns
            drop(unsafe { Box::from_raw(addr as *mut BufferHandle) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RanchuAllocator;
    use crate::metadata_codec::MetadataReader;
    use crate::test_support::{self, descriptor, FakePipes};
    use rbm::address_space::MemfdAllocator;
    use rbm::BufferUsage as Usage;
    use rbm::PixelFormat;
    use std::os::fd::AsFd;
    use std::sync::Arc;

    const CPU_RW: u64 = 0x33;
    const REGION_FULL: AccessRegion = AccessRegion {
        left: 0,
        top: 0,
        right: 64,
        bottom: 64,
    };

    struct Fixture {
        allocator: RanchuAllocator,
        mapper: RanchuMapper,
        state: Arc<std::sync::Mutex<test_support::RendererState>>,
    }

    fn fixture() -> Fixture {
        let space = Arc::new(MemfdAllocator::new());
        let (alloc_conn, state) = test_support::fake_connection();
        let allocator = RanchuAllocator::new(alloc_conn, space.clone(), Arc::new(FakePipes::new()));

        let map_conn = test_support::fake_connection_with_state(&state);
        let mapper = RanchuMapper::new(map_conn, space.as_ref()).unwrap();

        Fixture {
            allocator,
            mapper,
            state,
        }
    }

    impl Fixture {
        fn allocate(&self, format: PixelFormat, usage: u64) -> RawHandle {
            let desc = descriptor("test", 64, 64, format, usage);
            self.allocator
                .allocate2(&desc, 1)
                .unwrap()
                .buffers
                .into_iter()
                .next()
                .unwrap()
        }

        fn import(&self, format: PixelFormat, usage: u64) -> BufferRef {
            self.mapper
                .import_buffer(self.allocate(format, usage))
                .unwrap()
        }
    }

    #[test]
    fn import_and_free() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Rgba8888, CPU_RW);

        let (num_fds, num_ints) = f.mapper.get_transport_size(buffer).unwrap();
        assert_eq!(num_fds, 1);
        assert_eq!(num_ints, 16);

        f.mapper.free_buffer(buffer).unwrap();
        assert!(matches!(
            f.mapper.free_buffer(buffer),
            Err(Error::BadBuffer)
        ));
        assert!(matches!(
            f.mapper.get_transport_size(buffer),
            Err(Error::BadBuffer)
        ));
    }

    #[test]
    fn import_rejects_garbage() {
        let f = fixture();
        let raw = RawHandle {
            fds: Vec::new(),
            ints: vec![0; 16],
        };
        assert!(matches!(
            f.mapper.import_buffer(raw),
            Err(Error::BadBuffer)
        ));
    }

    #[test]
    fn lock_state_machine() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Rgba8888, CPU_RW);

        // unlock before lock
        assert!(matches!(f.mapper.unlock(buffer), Err(Error::BadBuffer)));

        let ptr = f
            .mapper
            .lock(buffer, Usage::CPU_WRITE_MASK.bits(), REGION_FULL, None)
            .unwrap();
        assert!(!ptr.as_ptr().is_null());

        // double lock
        assert!(matches!(
            f.mapper
                .lock(buffer, Usage::CPU_READ_MASK.bits(), REGION_FULL, None),
            Err(Error::BadBuffer)
        ));

        assert_eq!(f.mapper.unlock(buffer).unwrap(), -1);
        assert!(matches!(f.mapper.unlock(buffer), Err(Error::BadBuffer)));

        f.mapper.free_buffer(buffer).unwrap();
    }

    #[test]
    fn lock_validates_region_and_usage() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Rgba8888, CPU_RW);

        for region in [
            AccessRegion {
                left: 0,
                top: 0,
                right: 65,
                bottom: 64,
            },
            AccessRegion {
                left: -1,
                top: 0,
                right: 64,
                bottom: 64,
            },
            AccessRegion {
                left: 10,
                top: 0,
                right: 10,
                bottom: 64,
            },
            AccessRegion {
                left: 0,
                top: 9,
                right: 64,
                bottom: 9,
            },
        ] {
            assert!(matches!(
                f.mapper
                    .lock(buffer, Usage::CPU_WRITE_MASK.bits(), region, None),
                Err(Error::BadValue)
            ));
        }

        // no usable CPU bits
        assert!(matches!(
            f.mapper
                .lock(buffer, Usage::GPU_TEXTURE.bits(), REGION_FULL, None),
            Err(Error::BadValue)
        ));

        f.mapper.free_buffer(buffer).unwrap();
    }

    #[test]
    fn lock_waits_for_signalled_fence() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Rgba8888, CPU_RW);

        let (rd, wr) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&wr, &[1u8]).unwrap();

        f.mapper
            .lock(
                buffer,
                Usage::CPU_WRITE_MASK.bits(),
                REGION_FULL,
                Some(rd.as_fd()),
            )
            .unwrap();
        f.mapper.unlock(buffer).unwrap();
        f.mapper.free_buffer(buffer).unwrap();
    }

    #[test]
    fn flush_and_reread_require_matching_bits() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Rgba8888, CPU_RW);

        // not locked at all
        assert!(matches!(
            f.mapper.flush_locked_buffer(buffer),
            Err(Error::BadBuffer)
        ));

        f.mapper
            .lock(buffer, Usage::CPU_READ_MASK.bits(), REGION_FULL, None)
            .unwrap();
        assert!(matches!(
            f.mapper.flush_locked_buffer(buffer),
            Err(Error::BadBuffer)
        ));
        f.mapper.reread_locked_buffer(buffer).unwrap();
        f.mapper.unlock(buffer).unwrap();

        f.mapper
            .lock(buffer, Usage::CPU_WRITE_MASK.bits(), REGION_FULL, None)
            .unwrap();
        f.mapper.flush_locked_buffer(buffer).unwrap();
        assert!(matches!(
            f.mapper.reread_locked_buffer(buffer),
            Err(Error::BadBuffer)
        ));
        f.mapper.unlock(buffer).unwrap();

        f.mapper.free_buffer(buffer).unwrap();
    }

    #[test]
    fn write_pattern_round_trips_through_host() {
        let f = fixture();
        let usage = CPU_RW | Usage::GPU_TEXTURE.bits();
        let raw_a = f.allocate(PixelFormat::Rgba8888, usage);

        // second wire copy of the same buffer, as another importer would get
        let second = BufferHandle::from_raw(raw_a).unwrap();
        let raw_b = second.to_raw().unwrap();
        let buffer_a = f
            .mapper
            .import_buffer(second.to_raw().unwrap())
            .unwrap();

        let pattern: Vec<u8> = (0..64u32 * 64 * 4).map(|i| (i % 251) as u8).collect();

        let ptr = f
            .mapper
            .lock(buffer_a, Usage::CPU_WRITE_MASK.bits(), REGION_FULL, None)
            .unwrap();
        unsafe {
            slice::from_raw_parts_mut(ptr.as_ptr(), pattern.len()).copy_from_slice(&pattern)
        };
        f.mapper.unlock(buffer_a).unwrap();
        f.mapper.free_buffer(buffer_a).unwrap();

        // the fake host kept the update
        assert_eq!(f.state.lock().unwrap().color_buffers.len(), 1);

        let buffer_b = f.mapper.import_buffer(raw_b).unwrap();
        let ptr = f
            .mapper
            .lock(buffer_b, Usage::CPU_READ_MASK.bits(), REGION_FULL, None)
            .unwrap();
        let read_back = unsafe { slice::from_raw_parts(ptr.as_ptr(), pattern.len()) }.to_vec();
        assert_eq!(read_back, pattern);
        f.mapper.unlock(buffer_b).unwrap();
        f.mapper.free_buffer(buffer_b).unwrap();
        drop(second);
    }

    #[test]
    fn standard_metadata_values() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Rgba8888, CPU_RW);
        let cb = unsafe { &*buffer.as_ptr() };

        let mut buf = vec![0u8; 256];

        let n = f
            .mapper
            .get_standard_metadata(buffer, StandardMetadataType::Width.as_raw(), &mut buf);
        assert!(n > 0);
        let mut reader = MetadataReader::new(&buf[..n as usize]);
        assert_eq!(
            reader.read_str().unwrap(),
            STANDARD_METADATA_TYPE_TAG.as_bytes()
        );
        assert_eq!(
            reader.read_i64().unwrap(),
            StandardMetadataType::Width.as_raw()
        );
        assert_eq!(reader.read_i64().unwrap(), 64);

        let n = f.mapper.get_standard_metadata(
            buffer,
            StandardMetadataType::AllocationSize.as_raw(),
            &mut buf,
        );
        let mut reader = MetadataReader::new(&buf[..n as usize]);
        reader.read_str().unwrap();
        reader.read_i64().unwrap();
        assert_eq!(reader.read_i64().unwrap() as u64, cb.mmaped_size);

        let n = f
            .mapper
            .get_standard_metadata(buffer, StandardMetadataType::Stride.as_raw(), &mut buf);
        let mut reader = MetadataReader::new(&buf[..n as usize]);
        reader.read_str().unwrap();
        reader.read_i64().unwrap();
        assert_eq!(reader.read_i32().unwrap(), 64);

        let n = f
            .mapper
            .get_standard_metadata(buffer, StandardMetadataType::Name.as_raw(), &mut buf);
        let mut reader = MetadataReader::new(&buf[..n as usize]);
        reader.read_str().unwrap();
        reader.read_i64().unwrap();
        assert_eq!(reader.read_str().unwrap(), b"test");

        // unknown type
        let n = f.mapper.get_standard_metadata(buffer, 21, &mut buf);
        assert_eq!(n, -error_code(&Error::Unsupported));

        f.mapper.free_buffer(buffer).unwrap();
    }

    #[test]
    fn metadata_dry_run_sizes_are_exact() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Yv12, CPU_RW);

        for &(ty, _) in METADATA_TYPES {
            let desired = f
                .mapper
                .get_standard_metadata(buffer, ty.as_raw(), &mut []);
            assert!(desired >= 0, "{ty:?}");

            let mut buf = vec![0u8; desired as usize];
            let written = f
                .mapper
                .get_standard_metadata(buffer, ty.as_raw(), &mut buf);
            assert_eq!(written, desired, "{ty:?}");

            // one byte short must not change the reported size
            if desired > 0 {
                let mut short = vec![0u8; desired as usize - 1];
                let reported = f
                    .mapper
                    .get_standard_metadata(buffer, ty.as_raw(), &mut short);
                assert_eq!(reported, desired, "{ty:?}");
            }
        }

        f.mapper.free_buffer(buffer).unwrap();
    }

    #[test]
    fn plane_layouts_for_yv12() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Yv12, CPU_RW);

        let desired = f.mapper.get_standard_metadata(
            buffer,
            StandardMetadataType::PlaneLayouts.as_raw(),
            &mut [],
        );
        let mut buf = vec![0u8; desired as usize];
        f.mapper.get_standard_metadata(
            buffer,
            StandardMetadataType::PlaneLayouts.as_raw(),
            &mut buf,
        );

        let mut reader = MetadataReader::new(&buf);
        reader.read_str().unwrap();
        reader.read_i64().unwrap();
        assert_eq!(reader.read_i64().unwrap(), 3);

        let mut subsampling = Vec::new();
        for _ in 0..3 {
            let components = reader.read_i64().unwrap();
            assert_eq!(components, 1);
            for _ in 0..components {
                assert_eq!(
                    reader.read_str().unwrap(),
                    PLANE_LAYOUT_COMPONENT_TYPE_TAG.as_bytes()
                );
                reader.read_i64().unwrap(); // component type
                reader.read_i64().unwrap(); // offset in bits
                reader.read_i64().unwrap(); // size in bits
            }
            reader.read_i64().unwrap(); // offset in bytes
            reader.read_i64().unwrap(); // sample increment in bits
            reader.read_i64().unwrap(); // stride
            reader.read_i64().unwrap(); // width in samples
            reader.read_i64().unwrap(); // height in samples
            reader.read_i64().unwrap(); // total size
            let horizontal = reader.read_i64().unwrap();
            let vertical = reader.read_i64().unwrap();
            subsampling.push((horizontal, vertical));
        }
        assert!(reader.ok());
        assert_eq!(subsampling, [(1, 1), (2, 2), (2, 2)]);

        f.mapper.free_buffer(buffer).unwrap();
    }

    #[test]
    fn settable_metadata() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Rgba8888, CPU_RW);

        // DATASPACE round trip
        let mut payload = vec![0u8; 128];
        let len = {
            let mut writer = MetadataWriter::new(&mut payload);
            writer
                .write_str(STANDARD_METADATA_TYPE_TAG.as_bytes())
                .write_i64(StandardMetadataType::Dataspace.as_raw())
                .write_i32(0x1234);
            writer.desired_size() as usize
        };
        f.mapper
            .set_standard_metadata(buffer, StandardMetadataType::Dataspace.as_raw(), &payload[..len])
            .unwrap();

        let mut buf = vec![0u8; 128];
        let n = f.mapper.get_standard_metadata(
            buffer,
            StandardMetadataType::Dataspace.as_raw(),
            &mut buf,
        );
        let mut reader = MetadataReader::new(&buf[..n as usize]);
        reader.read_str().unwrap();
        reader.read_i64().unwrap();
        assert_eq!(reader.read_i32().unwrap(), 0x1234);

        // absent HDR metadata encodes to nothing
        let n = f.mapper.get_standard_metadata(
            buffer,
            StandardMetadataType::Smpte2086.as_raw(),
            &mut buf,
        );
        assert_eq!(n, 0);

        // set, then clear with an empty payload
        let len = {
            let mut writer = MetadataWriter::new(&mut payload);
            writer
                .write_str(STANDARD_METADATA_TYPE_TAG.as_bytes())
                .write_i64(StandardMetadataType::Smpte2086.as_raw());
            for value in [0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 500.0, 0.01] {
                writer.write_f32(value);
            }
            writer.desired_size() as usize
        };
        f.mapper
            .set_standard_metadata(
                buffer,
                StandardMetadataType::Smpte2086.as_raw(),
                &payload[..len],
            )
            .unwrap();
        let n = f.mapper.get_standard_metadata(
            buffer,
            StandardMetadataType::Smpte2086.as_raw(),
            &mut buf,
        );
        assert!(n > 0);

        f.mapper
            .set_standard_metadata(buffer, StandardMetadataType::Smpte2086.as_raw(), &[])
            .unwrap();
        let n = f.mapper.get_standard_metadata(
            buffer,
            StandardMetadataType::Smpte2086.as_raw(),
            &mut buf,
        );
        assert_eq!(n, 0);

        // read-only types reject writes
        assert!(matches!(
            f.mapper
                .set_standard_metadata(buffer, StandardMetadataType::Width.as_raw(), &payload),
            Err(Error::Unsupported)
        ));

        // garbage payload
        assert!(matches!(
            f.mapper.set_standard_metadata(
                buffer,
                StandardMetadataType::Dataspace.as_raw(),
                &[1, 2, 3]
            ),
            Err(Error::BadValue)
        ));

        f.mapper.free_buffer(buffer).unwrap();
    }

    #[test]
    fn dump_covers_every_gettable_type() {
        let f = fixture();
        let buffer = f.import(PixelFormat::Rgba8888, CPU_RW);

        let mut seen = Vec::new();
        f.mapper
            .dump_buffer(buffer, &mut |ty, bytes| {
                seen.push((ty, bytes.len()));
            })
            .unwrap();
        assert_eq!(seen.len(), METADATA_TYPES.len());

        let mut begins = 0;
        let mut records = 0;
        f.mapper.dump_all_buffers(&mut || begins += 1, &mut |_, _| records += 1);
        assert_eq!(begins, 1);
        assert_eq!(records, METADATA_TYPES.len());

        f.mapper.free_buffer(buffer).unwrap();
    }

    #[test]
    fn reserved_region() {
        let f = fixture();

        let mut desc = descriptor("res", 16, 16, PixelFormat::Rgba8888, CPU_RW);
        desc.reserved_size = 64;
        let raw = f
            .allocator
            .allocate2(&desc, 1)
            .unwrap()
            .buffers
            .into_iter()
            .next()
            .unwrap();
        let buffer = f.mapper.import_buffer(raw).unwrap();

        let (ptr, size) = f.mapper.get_reserved_region(buffer).unwrap();
        assert_eq!(size, 64);
        let ptr = ptr.unwrap();
        // the tail is writable shared memory
        unsafe { ptr.as_ptr().write_bytes(0xab, 64) };
        f.mapper.free_buffer(buffer).unwrap();

        let buffer = f.import(PixelFormat::Rgba8888, CPU_RW);
        let (ptr, size) = f.mapper.get_reserved_region(buffer).unwrap();
        assert_eq!(size, 0);
        assert!(ptr.is_none());
        f.mapper.free_buffer(buffer).unwrap();
    }
}
