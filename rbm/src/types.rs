// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

use std::{env, ffi, io, num, ptr, result};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("bad descriptor")]
    BadDescriptor,
    #[error("unsupported")]
    Unsupported,
    #[error("no resources")]
    NoResources,
    #[error("bad buffer")]
    BadBuffer,
    #[error("bad value")]
    BadValue,
    #[error("device io")]
    DeviceIo(#[from] io::Error),
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::from(io::Error::from(err))
    }
}

impl From<ffi::NulError> for Error {
    fn from(err: ffi::NulError) -> Self {
        Self::from(io::Error::from(err))
    }
}

impl From<num::TryFromIntError> for Error {
    fn from(_err: num::TryFromIntError) -> Self {
        Self::BadValue
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Pixel formats understood by the allocator.  The discriminants are the
/// platform's numeric format tags, so a raw descriptor value converts
/// losslessly.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(i32)]
pub enum PixelFormat {
    Rgba8888 = 1,
    Rgbx8888 = 2,
    Rgb888 = 3,
    Rgb565 = 4,
    Bgra8888 = 5,
    Ycrcb420Sp = 0x11,
    RgbaFp16 = 0x16,
    Raw16 = 0x20,
    Blob = 0x21,
    ImplementationDefined = 0x22,
    Ycbcr420_888 = 0x23,
    Rgba1010102 = 0x2b,
    YcbcrP010 = 0x36,
    Y16 = 0x2036_3159,
    Yv12 = 0x3231_5659,
}

impl PixelFormat {
    pub fn from_raw(raw: i32) -> Option<Self> {
        let fmt = match raw {
            1 => Self::Rgba8888,
            2 => Self::Rgbx8888,
            3 => Self::Rgb888,
            4 => Self::Rgb565,
            5 => Self::Bgra8888,
            0x11 => Self::Ycrcb420Sp,
            0x16 => Self::RgbaFp16,
            0x20 => Self::Raw16,
            0x21 => Self::Blob,
            0x22 => Self::ImplementationDefined,
            0x23 => Self::Ycbcr420_888,
            0x2b => Self::Rgba1010102,
            0x36 => Self::YcbcrP010,
            0x2036_3159 => Self::Y16,
            0x3231_5659 => Self::Yv12,
            _ => return None,
        };
        Some(fmt)
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn is_yuv(self) -> bool {
        matches!(
            self,
            Self::Ycrcb420Sp | Self::Yv12 | Self::Ycbcr420_888 | Self::YcbcrP010
        )
    }
}

bitflags::bitflags! {
    /// Intended accesses of a buffer.  Vendor bits are kept verbatim.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct BufferUsage: u64 {
        const CPU_READ_RARELY = 2;
        const CPU_READ_OFTEN = 3;
        const CPU_READ_MASK = 0xf;
        const CPU_WRITE_RARELY = 2 << 4;
        const CPU_WRITE_OFTEN = 3 << 4;
        const CPU_WRITE_MASK = 0xf << 4;
        const GPU_TEXTURE = 1 << 8;
        const GPU_RENDER_TARGET = 1 << 9;
        const COMPOSER_OVERLAY = 1 << 11;
        const COMPOSER_CLIENT_TARGET = 1 << 12;
        const PROTECTED = 1 << 14;
        const GPU_DATA_BUFFER = 1 << 24;

        // bits the platform never hands out
        const RESERVED = (1 << 10) | (1 << 13) | (1 << 19) | (1 << 21);

        const _ = !0;
    }
}

impl BufferUsage {
    /// The buffer needs a host color buffer for GPU access.
    pub fn needs_gpu_buffer(self) -> bool {
        self.intersects(
            Self::GPU_TEXTURE
                | Self::GPU_RENDER_TARGET
                | Self::COMPOSER_OVERLAY
                | Self::COMPOSER_CLIENT_TARGET
                | Self::GPU_DATA_BUFFER,
        )
    }

    /// The buffer needs a CPU-visible image.
    pub fn needs_cpu_buffer(self) -> bool {
        self.intersects(Self::CPU_READ_MASK | Self::CPU_WRITE_MASK)
    }

    pub fn has_reserved_bits(self) -> bool {
        self.intersects(Self::RESERVED)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Mapping {
    pub ptr: ptr::NonNull<ffi::c_void>,
    pub len: num::NonZeroUsize,
}

impl Mapping {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }
}

/// Log verbosity, from the `ro.boot.qemu.gralloc.debug_level` property.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum DebugLevel {
    Error = 0,
    Alloc = 1,
    Import = 2,
    Lock = 3,
    Flush = 4,
    Metadata = 5,
}

impl DebugLevel {
    pub const PROPERTY: &'static str = "ro.boot.qemu.gralloc.debug_level";

    pub fn from_env() -> Self {
        let raw = env::var(Self::PROPERTY)
            .ok()
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(0);

        match raw {
            1 => Self::Alloc,
            2 => Self::Import,
            3 => Self::Lock,
            4 => Self::Flush,
            5 => Self::Metadata,
            _ => Self::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_raw() {
        assert_eq!(PixelFormat::from_raw(1), Some(PixelFormat::Rgba8888));
        assert_eq!(PixelFormat::from_raw(0x3231_5659), Some(PixelFormat::Yv12));
        assert_eq!(PixelFormat::from_raw(0x7777), None);
        assert_eq!(PixelFormat::Y16.as_raw(), 0x2036_3159);
    }

    #[test]
    fn yuv_formats() {
        assert!(PixelFormat::Yv12.is_yuv());
        assert!(PixelFormat::YcbcrP010.is_yuv());
        assert!(!PixelFormat::Rgba8888.is_yuv());
        assert!(!PixelFormat::Blob.is_yuv());
    }

    #[test]
    fn usage_predicates() {
        let gpu = BufferUsage::GPU_TEXTURE;
        assert!(gpu.needs_gpu_buffer());
        assert!(!gpu.needs_cpu_buffer());

        let cpu = BufferUsage::CPU_READ_OFTEN | BufferUsage::CPU_WRITE_OFTEN;
        assert!(cpu.needs_cpu_buffer());
        assert!(!cpu.needs_gpu_buffer());

        assert!(BufferUsage::from_bits_retain(1 << 10).has_reserved_bits());
        assert!(BufferUsage::from_bits_retain(1 << 21).has_reserved_bits());
        assert!(!cpu.has_reserved_bits());

        // vendor bits survive the round trip
        let vendor = BufferUsage::from_bits_retain(1 << 60);
        assert_eq!(vendor.bits(), 1 << 60);
    }

    #[test]
    fn debug_level_order() {
        assert!(DebugLevel::Metadata > DebugLevel::Lock);
        assert!(DebugLevel::Alloc > DebugLevel::Error);
    }
}
