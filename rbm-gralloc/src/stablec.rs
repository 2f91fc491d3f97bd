// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The stable-C mapper ABI.
//!
//! Type definitions follow the platform's stable-C mapper header; the
//! loader entry point hands out a v5 function table whose entries
//! trampoline into the process-wide [`RanchuMapper`].

#![allow(non_camel_case_types, non_snake_case, non_upper_case_globals)]

use crate::mapper::{AccessRegion, BufferRef, RanchuMapper};
use crate::metadata_codec::{StandardMetadataType, METADATA_TYPES};
use rbm::handle::{BufferHandle, RawHandle};
use rbm::Error;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};
use std::sync::OnceLock;
use std::{mem, ptr, slice};

pub const AIMAPPER_VERSION_5: u32 = 5;

/// Version constant the platform loader checks before dlopening us.
#[no_mangle]
pub static ANDROID_HAL_MAPPER_VERSION: u32 = AIMAPPER_VERSION_5;

#[repr(C)]
pub struct native_handle_t {
    pub version: c_int,
    pub numFds: c_int,
    pub numInts: c_int,
    // data: [c_int; numFds + numInts]
}

pub type buffer_handle_t = *const native_handle_t;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ARect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AIMapper_Error {
    AIMAPPER_ERROR_NONE = 0,
    AIMAPPER_ERROR_BAD_DESCRIPTOR = 1,
    AIMAPPER_ERROR_BAD_BUFFER = 2,
    AIMAPPER_ERROR_BAD_VALUE = 3,
    AIMAPPER_ERROR_NO_RESOURCES = 5,
    AIMAPPER_ERROR_UNSUPPORTED = 7,
}

fn to_error(err: &Error) -> AIMapper_Error {
    match err {
        Error::BadDescriptor => AIMapper_Error::AIMAPPER_ERROR_BAD_DESCRIPTOR,
        Error::BadBuffer => AIMapper_Error::AIMAPPER_ERROR_BAD_BUFFER,
        Error::BadValue => AIMapper_Error::AIMAPPER_ERROR_BAD_VALUE,
        Error::NoResources | Error::DeviceIo(_) => AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES,
        _ => AIMapper_Error::AIMAPPER_ERROR_UNSUPPORTED,
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AIMapper_MetadataType {
    pub name: *const c_char,
    pub value: i64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AIMapper_MetadataTypeDescription {
    pub metadataType: AIMapper_MetadataType,
    pub description: *const c_char,
    pub isGettable: bool,
    pub isSettable: bool,
    pub reserved: [u64; 17],
}

pub type AIMapper_BeginDumpBufferCallback = Option<unsafe extern "C" fn(context: *mut c_void)>;
pub type AIMapper_DumpBufferCallback = Option<
    unsafe extern "C" fn(
        context: *mut c_void,
        metadataType: AIMapper_MetadataType,
        value: *const c_void,
        valueSize: usize,
    ),
>;

#[repr(C)]
pub struct AIMapperV5 {
    pub importBuffer: Option<
        unsafe extern "C" fn(
            handle: *const native_handle_t,
            outBufferHandle: *mut buffer_handle_t,
        ) -> AIMapper_Error,
    >,
    pub freeBuffer: Option<unsafe extern "C" fn(buffer: buffer_handle_t) -> AIMapper_Error>,
    pub getTransportSize: Option<
        unsafe extern "C" fn(
            buffer: buffer_handle_t,
            outNumFds: *mut u32,
            outNumInts: *mut u32,
        ) -> AIMapper_Error,
    >,
    pub lock: Option<
        unsafe extern "C" fn(
            buffer: buffer_handle_t,
            cpuUsage: u64,
            accessRegion: ARect,
            acquireFence: c_int,
            outData: *mut *mut c_void,
        ) -> AIMapper_Error,
    >,
    pub unlock: Option<
        unsafe extern "C" fn(buffer: buffer_handle_t, releaseFence: *mut c_int) -> AIMapper_Error,
    >,
    pub flushLockedBuffer: Option<unsafe extern "C" fn(buffer: buffer_handle_t) -> AIMapper_Error>,
    pub rereadLockedBuffer:
        Option<unsafe extern "C" fn(buffer: buffer_handle_t) -> AIMapper_Error>,
    pub getMetadata: Option<
        unsafe extern "C" fn(
            buffer: buffer_handle_t,
            metadataType: AIMapper_MetadataType,
            destBuffer: *mut c_void,
            destBufferSize: usize,
        ) -> i32,
    >,
    pub getStandardMetadata: Option<
        unsafe extern "C" fn(
            buffer: buffer_handle_t,
            standardMetadataType: i64,
            destBuffer: *mut c_void,
            destBufferSize: usize,
        ) -> i32,
    >,
    pub setMetadata: Option<
        unsafe extern "C" fn(
            buffer: buffer_handle_t,
            metadataType: AIMapper_MetadataType,
            metadata: *const c_void,
            metadataSize: usize,
        ) -> AIMapper_Error,
    >,
    pub setStandardMetadata: Option<
        unsafe extern "C" fn(
            buffer: buffer_handle_t,
            standardMetadataType: i64,
            metadata: *const c_void,
            metadataSize: usize,
        ) -> AIMapper_Error,
    >,
    pub listSupportedMetadataTypes: Option<
        unsafe extern "C" fn(
            outDescriptionList: *mut *const AIMapper_MetadataTypeDescription,
            outNumberOfDescriptions: *mut usize,
        ) -> AIMapper_Error,
    >,
    pub dumpBuffer: Option<
        unsafe extern "C" fn(
            buffer: buffer_handle_t,
            dumpBufferCallback: AIMapper_DumpBufferCallback,
            context: *mut c_void,
        ) -> AIMapper_Error,
    >,
    pub dumpAllBuffers: Option<
        unsafe extern "C" fn(
            beginDumpCallback: AIMapper_BeginDumpBufferCallback,
            dumpBufferCallback: AIMapper_DumpBufferCallback,
            context: *mut c_void,
        ) -> AIMapper_Error,
    >,
    pub getReservedRegion: Option<
        unsafe extern "C" fn(
            buffer: buffer_handle_t,
            outReservedRegion: *mut *mut c_void,
            outReservedSize: *mut u64,
        ) -> AIMapper_Error,
    >,
}

#[repr(C)]
pub struct AIMapper {
    pub version: u32,
    pub v5: AIMapperV5,
}

static STANDARD_METADATA_NAME: &CStr = c"android.hardware.graphics.common.StandardMetadataType";

static INSTANCE: OnceLock<RanchuMapper> = OnceLock::new();
static TABLE: OnceLock<AIMapper> = OnceLock::new();

struct DescriptionTable(Box<[AIMapper_MetadataTypeDescription]>);
// SAFETY: the raw pointers reference 'static string data
unsafe impl Send for DescriptionTable {}
// SAFETY: see above
unsafe impl Sync for DescriptionTable {}

static DESCRIPTIONS: OnceLock<DescriptionTable> = OnceLock::new();

fn mapper() -> Option<&'static RanchuMapper> {
    INSTANCE.get()
}

/// Duplicates the descriptors and copies the ints out of a native handle.
unsafe fn raw_handle_from_native(handle: *const native_handle_t) -> Option<RawHandle> {
    if handle.is_null() {
        return None;
    }

    let header = &*handle;
    if header.version != mem::size_of::<native_handle_t>() as c_int
        || header.numFds < 0
        || header.numInts < 0
    {
        return None;
    }

    let data = handle.cast::<c_int>().add(3);
    let mut fds = Vec::with_capacity(header.numFds as usize);
    for i in 0..header.numFds as usize {
        let raw_fd = data.add(i).read();
        let dup = nix::fcntl::fcntl(raw_fd, nix::fcntl::FcntlArg::F_DUPFD_CLOEXEC(0)).ok()?;
        // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor
        fds.push(OwnedFd::from_raw_fd(dup));
    }

    let ints_base = data.add(header.numFds as usize);
    let ints = (0..header.numInts as usize)
        .map(|i| ints_base.add(i).read() as u32)
        .collect();

    Some(RawHandle { fds, ints })
}

unsafe extern "C" fn import_buffer(
    handle: *const native_handle_t,
    outBufferHandle: *mut buffer_handle_t,
) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    let Some(raw) = raw_handle_from_native(handle) else {
        return AIMapper_Error::AIMAPPER_ERROR_BAD_BUFFER;
    };

    match mapper.import_buffer(raw) {
        Ok(buffer) => {
            *outBufferHandle = buffer.as_ptr() as buffer_handle_t;
            AIMapper_Error::AIMAPPER_ERROR_NONE
        }
        Err(err) => to_error(&err),
    }
}

unsafe extern "C" fn free_buffer(buffer: buffer_handle_t) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    match mapper.free_buffer(BufferRef::from_ptr(buffer as *mut BufferHandle)) {
        Ok(()) => AIMapper_Error::AIMAPPER_ERROR_NONE,
        Err(err) => to_error(&err),
    }
}

unsafe extern "C" fn get_transport_size(
    buffer: buffer_handle_t,
    outNumFds: *mut u32,
    outNumInts: *mut u32,
) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    match mapper.get_transport_size(BufferRef::from_ptr(buffer as *mut BufferHandle)) {
        Ok((num_fds, num_ints)) => {
            *outNumFds = num_fds;
            *outNumInts = num_ints;
            AIMapper_Error::AIMAPPER_ERROR_NONE
        }
        Err(err) => to_error(&err),
    }
}

unsafe extern "C" fn lock(
    buffer: buffer_handle_t,
    cpuUsage: u64,
    accessRegion: ARect,
    acquireFence: c_int,
    outData: *mut *mut c_void,
) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };

    let region = AccessRegion {
        left: accessRegion.left,
        top: accessRegion.top,
        right: accessRegion.right,
        bottom: accessRegion.bottom,
    };
    let fence = if acquireFence >= 0 {
        // SAFETY: the caller keeps the fence open for the duration of lock
        Some(BorrowedFd::borrow_raw(acquireFence))
    } else {
        None
    };

    match mapper.lock(
        BufferRef::from_ptr(buffer as *mut BufferHandle),
        cpuUsage,
        region,
        fence,
    ) {
        Ok(data) => {
            *outData = data.as_ptr().cast();
            AIMapper_Error::AIMAPPER_ERROR_NONE
        }
        Err(err) => to_error(&err),
    }
}

unsafe extern "C" fn unlock(buffer: buffer_handle_t, releaseFence: *mut c_int) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    match mapper.unlock(BufferRef::from_ptr(buffer as *mut BufferHandle)) {
        Ok(fence) => {
            *releaseFence = fence;
            AIMapper_Error::AIMAPPER_ERROR_NONE
        }
        Err(err) => to_error(&err),
    }
}

unsafe extern "C" fn flush_locked_buffer(buffer: buffer_handle_t) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    match mapper.flush_locked_buffer(BufferRef::from_ptr(buffer as *mut BufferHandle)) {
        Ok(()) => AIMapper_Error::AIMAPPER_ERROR_NONE,
        Err(err) => to_error(&err),
    }
}

unsafe extern "C" fn reread_locked_buffer(buffer: buffer_handle_t) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    match mapper.reread_locked_buffer(BufferRef::from_ptr(buffer as *mut BufferHandle)) {
        Ok(()) => AIMapper_Error::AIMAPPER_ERROR_NONE,
        Err(err) => to_error(&err),
    }
}

unsafe fn dest_slice<'a>(destBuffer: *mut c_void, destBufferSize: usize) -> &'a mut [u8] {
    if destBuffer.is_null() || destBufferSize == 0 {
        &mut []
    } else {
        slice::from_raw_parts_mut(destBuffer.cast(), destBufferSize)
    }
}

unsafe fn src_slice<'a>(metadata: *const c_void, metadataSize: usize) -> &'a [u8] {
    if metadata.is_null() || metadataSize == 0 {
        &[]
    } else {
        slice::from_raw_parts(metadata.cast(), metadataSize)
    }
}

unsafe extern "C" fn get_metadata(
    buffer: buffer_handle_t,
    metadataType: AIMapper_MetadataType,
    destBuffer: *mut c_void,
    destBufferSize: usize,
) -> i32 {
    let Some(mapper) = mapper() else {
        return -(AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES as i32);
    };
    let Ok(name) = CStr::from_ptr(metadataType.name).to_str() else {
        return -(AIMapper_Error::AIMAPPER_ERROR_UNSUPPORTED as i32);
    };
    mapper.get_metadata(
        BufferRef::from_ptr(buffer as *mut BufferHandle),
        name,
        metadataType.value,
        dest_slice(destBuffer, destBufferSize),
    )
}

unsafe extern "C" fn get_standard_metadata(
    buffer: buffer_handle_t,
    standardMetadataType: i64,
    destBuffer: *mut c_void,
    destBufferSize: usize,
) -> i32 {
    let Some(mapper) = mapper() else {
        return -(AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES as i32);
    };
    mapper.get_standard_metadata(
        BufferRef::from_ptr(buffer as *mut BufferHandle),
        standardMetadataType,
        dest_slice(destBuffer, destBufferSize),
    )
}

unsafe extern "C" fn set_metadata(
    buffer: buffer_handle_t,
    metadataType: AIMapper_MetadataType,
    metadata: *const c_void,
    metadataSize: usize,
) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    let Ok(name) = CStr::from_ptr(metadataType.name).to_str() else {
        return AIMapper_Error::AIMAPPER_ERROR_UNSUPPORTED;
    };
    match mapper.set_metadata(
        BufferRef::from_ptr(buffer as *mut BufferHandle),
        name,
        metadataType.value,
        src_slice(metadata, metadataSize),
    ) {
        Ok(()) => AIMapper_Error::AIMAPPER_ERROR_NONE,
        Err(err) => to_error(&err),
    }
}

unsafe extern "C" fn set_standard_metadata(
    buffer: buffer_handle_t,
    standardMetadataType: i64,
    metadata: *const c_void,
    metadataSize: usize,
) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    match mapper.set_standard_metadata(
        BufferRef::from_ptr(buffer as *mut BufferHandle),
        standardMetadataType,
        src_slice(metadata, metadataSize),
    ) {
        Ok(()) => AIMapper_Error::AIMAPPER_ERROR_NONE,
        Err(err) => to_error(&err),
    }
}

unsafe extern "C" fn list_supported_metadata_types(
    outDescriptionList: *mut *const AIMapper_MetadataTypeDescription,
    outNumberOfDescriptions: *mut usize,
) -> AIMapper_Error {
    let table = DESCRIPTIONS.get_or_init(|| {
        let list = METADATA_TYPES
            .iter()
            .map(|&(ty, settable)| AIMapper_MetadataTypeDescription {
                metadataType: AIMapper_MetadataType {
                    name: STANDARD_METADATA_NAME.as_ptr(),
                    value: ty.as_raw(),
                },
                description: ptr::null(),
                isGettable: true,
                isSettable: settable,
                reserved: [0; 17],
            })
            .collect();
        DescriptionTable(list)
    });

    *outDescriptionList = table.0.as_ptr();
    *outNumberOfDescriptions = table.0.len();
    AIMapper_Error::AIMAPPER_ERROR_NONE
}

unsafe extern "C" fn dump_buffer(
    buffer: buffer_handle_t,
    dumpBufferCallback: AIMapper_DumpBufferCallback,
    context: *mut c_void,
) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    let mut emit = |ty: StandardMetadataType, bytes: &[u8]| {
        if let Some(callback) = dumpBufferCallback {
            let metadata_type = AIMapper_MetadataType {
                name: STANDARD_METADATA_NAME.as_ptr(),
                value: ty.as_raw(),
            };
            callback(context, metadata_type, bytes.as_ptr().cast(), bytes.len());
        }
    };
    match mapper.dump_buffer(BufferRef::from_ptr(buffer as *mut BufferHandle), &mut emit) {
        Ok(()) => AIMapper_Error::AIMAPPER_ERROR_NONE,
        Err(err) => to_error(&err),
    }
}

unsafe extern "C" fn dump_all_buffers(
    beginDumpCallback: AIMapper_BeginDumpBufferCallback,
    dumpBufferCallback: AIMapper_DumpBufferCallback,
    context: *mut c_void,
) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    let mut begin = || {
        if let Some(callback) = beginDumpCallback {
            callback(context);
        }
    };
    let mut emit = |ty: StandardMetadataType, bytes: &[u8]| {
        if let Some(callback) = dumpBufferCallback {
            let metadata_type = AIMapper_MetadataType {
                name: STANDARD_METADATA_NAME.as_ptr(),
                value: ty.as_raw(),
            };
            callback(context, metadata_type, bytes.as_ptr().cast(), bytes.len());
        }
    };
    mapper.dump_all_buffers(&mut begin, &mut emit);
    AIMapper_Error::AIMAPPER_ERROR_NONE
}

unsafe extern "C" fn get_reserved_region(
    buffer: buffer_handle_t,
    outReservedRegion: *mut *mut c_void,
    outReservedSize: *mut u64,
) -> AIMapper_Error {
    let Some(mapper) = mapper() else {
        return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
    };
    match mapper.get_reserved_region(BufferRef::from_ptr(buffer as *mut BufferHandle)) {
        Ok((region, size)) => {
            *outReservedRegion = region.map_or(ptr::null_mut(), |p| p.as_ptr().cast());
            *outReservedSize = size;
            AIMapper_Error::AIMAPPER_ERROR_NONE
        }
        Err(err) => to_error(&err),
    }
}

/// Loader entry point: creates the process-wide mapper on first use and
/// returns the v5 function table.
///
/// # Safety
///
/// `outImplementation` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn AIMapper_loadIMapper(
    outImplementation: *mut *mut AIMapper,
) -> AIMapper_Error {
    if INSTANCE.get().is_none() {
        match RanchuMapper::with_default_backends() {
            Ok(instance) => {
                let _ = INSTANCE.set(instance);
            }
            Err(err) => {
                log::error!("failed to reach the host renderer: {err}");
                return AIMapper_Error::AIMAPPER_ERROR_NO_RESOURCES;
            }
        }
    }

    let table = TABLE.get_or_init(|| AIMapper {
        version: AIMAPPER_VERSION_5,
        v5: AIMapperV5 {
            importBuffer: Some(import_buffer),
            freeBuffer: Some(free_buffer),
            getTransportSize: Some(get_transport_size),
            lock: Some(lock),
            unlock: Some(unlock),
            flushLockedBuffer: Some(flush_locked_buffer),
            rereadLockedBuffer: Some(reread_locked_buffer),
            getMetadata: Some(get_metadata),
            getStandardMetadata: Some(get_standard_metadata),
            setMetadata: Some(set_metadata),
            setStandardMetadata: Some(set_standard_metadata),
            listSupportedMetadataTypes: Some(list_supported_metadata_types),
            dumpBuffer: Some(dump_buffer),
            dumpAllBuffers: Some(dump_all_buffers),
            getReservedRegion: Some(get_reserved_region),
        },
    });

    *outImplementation = table as *const AIMapper as *mut AIMapper;
    AIMapper_Error::AIMAPPER_ERROR_NONE
}
