// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The pixel-format database.
//!
//! Each supported format fixes its plane geometry, component bit layout,
//! DRM fourcc and, when the format can live in a host color buffer, the
//! GL upload parameters.  The allocator and the mapper both key off this
//! table, so the plane math here is the single source of truth for buffer
//! layout.

use super::metadata::{PlaneLayout, PlaneLayoutComponent};
use super::types::{Error, PixelFormat, Result};
use super::utils;

// from drm_fourcc.h
mod consts {
    macro_rules! fourcc_code {
        ($a:literal, $b:literal, $c:literal, $d:literal) => {
            ($a as u32) | (($b as u32) << 8) | (($c as u32) << 16) | (($d as u32) << 24)
        };
    }

    pub const DRM_FORMAT_INVALID: u32 = 0;
    pub const DRM_FORMAT_R16: u32 = fourcc_code!('R', '1', '6', ' ');
    pub const DRM_FORMAT_BGR565: u32 = fourcc_code!('B', 'G', '1', '6');
    pub const DRM_FORMAT_BGR888: u32 = fourcc_code!('B', 'G', '2', '4');
    pub const DRM_FORMAT_ABGR8888: u32 = fourcc_code!('A', 'B', '2', '4');
    pub const DRM_FORMAT_XBGR8888: u32 = fourcc_code!('X', 'B', '2', '4');
    pub const DRM_FORMAT_ARGB8888: u32 = fourcc_code!('A', 'R', '2', '4');
    pub const DRM_FORMAT_ABGR2101010: u32 = fourcc_code!('A', 'B', '3', '0');
    pub const DRM_FORMAT_ABGR16161616F: u32 = fourcc_code!('A', 'B', '4', 'H');
    pub const DRM_FORMAT_YUV420: u32 = fourcc_code!('Y', 'U', '1', '2');
    pub const DRM_FORMAT_YVU420: u32 = fourcc_code!('Y', 'V', '1', '2');
    pub const DRM_FORMAT_YUV420_10BIT: u32 = fourcc_code!('Y', 'U', '1', '0');

    pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
}

pub use consts::{DRM_FORMAT_INVALID, DRM_FORMAT_MOD_LINEAR};

// GL enums used for host uploads
mod gl {
    pub const RGB: i32 = 0x1907;
    pub const RGBA: i32 = 0x1908;
    pub const UNSIGNED_BYTE: i32 = 0x1401;
    pub const RGB565: i32 = 0x8d62;
    pub const UNSIGNED_SHORT_5_6_5: i32 = 0x8363;
    pub const RGBA16F: i32 = 0x881a;
    pub const HALF_FLOAT: i32 = 0x140b;
    pub const RGB10_A2: i32 = 0x8059;
    pub const UNSIGNED_INT_2_10_10_10_REV: i32 = 0x8368;
}

/// Component type codes of the platform's plane-layout convention.
pub mod component {
    pub const Y: u32 = 1 << 0;
    pub const CB: u32 = 1 << 1;
    pub const CR: u32 = 1 << 2;
    pub const R: u32 = 1 << 10;
    pub const G: u32 = 1 << 11;
    pub const B: u32 = 1 << 12;
    pub const RAW: u32 = 1 << 20;
    pub const A: u32 = 1 << 30;
}

/// How the host framework interprets an uploaded color buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum EmulatorFrameworkFormat {
    #[default]
    GlCompatible = 0,
    Yv12 = 1,
    Yuv420_888 = 2,
}

/// GL upload parameters of a GPU-capable format.
#[derive(Clone, Copy, Debug)]
pub struct GlUpload {
    pub format: i32,
    pub ty: i32,
    /// Internal format passed to the host when creating the color buffer.
    pub rc_alloc_format: i32,
    pub emu_fwk_format: EmulatorFrameworkFormat,
}

#[derive(Clone, Copy, Debug)]
pub struct PlaneSpec {
    pub sample_increment: u8,
    pub alignment: u32,
    pub subsampling_shift: u8,
    pub components_base: u8,
    pub components_size: u8,
}

#[derive(Clone, Copy, Debug)]
pub struct ComponentSpec {
    pub component_type: u32,
    pub offset_in_bits: u16,
    pub size_in_bits: u16,
}

pub struct FormatInfo {
    pub drm_format: u32,
    pub gl: Option<GlUpload>,
    pub planes: &'static [PlaneSpec],
    pub components: &'static [ComponentSpec],
}

const fn plane(
    sample_increment: u8,
    alignment: u32,
    subsampling_shift: u8,
    components_base: u8,
    components_size: u8,
) -> PlaneSpec {
    PlaneSpec {
        sample_increment,
        alignment,
        subsampling_shift,
        components_base,
        components_size,
    }
}

const fn comp(component_type: u32, offset_in_bits: u16, size_in_bits: u16) -> ComponentSpec {
    ComponentSpec {
        component_type,
        offset_in_bits,
        size_in_bits,
    }
}

const fn upload(format: i32, ty: i32, rc_alloc_format: i32) -> Option<GlUpload> {
    Some(GlUpload {
        format,
        ty,
        rc_alloc_format,
        emu_fwk_format: EmulatorFrameworkFormat::GlCompatible,
    })
}

const fn upload_fwk(
    format: i32,
    ty: i32,
    rc_alloc_format: i32,
    emu_fwk_format: EmulatorFrameworkFormat,
) -> Option<GlUpload> {
    Some(GlUpload {
        format,
        ty,
        rc_alloc_format,
        emu_fwk_format,
    })
}

pub fn info(fmt: PixelFormat) -> Result<&'static FormatInfo> {
    const RGBA_8888: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_ABGR8888,
        gl: upload(gl::RGBA, gl::UNSIGNED_BYTE, gl::RGBA),
        planes: &[plane(4, 1, 0, 0, 4)],
        components: &[
            comp(component::R, 0, 8),
            comp(component::G, 8, 8),
            comp(component::B, 16, 8),
            comp(component::A, 24, 8),
        ],
    };
    const RGBX_8888: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_XBGR8888,
        gl: upload(gl::RGBA, gl::UNSIGNED_BYTE, gl::RGB),
        planes: &[plane(4, 1, 0, 0, 3)],
        components: &[
            comp(component::R, 0, 8),
            comp(component::G, 8, 8),
            comp(component::B, 16, 8),
        ],
    };
    const BGRA_8888: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_ARGB8888,
        gl: upload(gl::RGBA, gl::UNSIGNED_BYTE, gl::RGBA),
        planes: &[plane(4, 1, 0, 0, 4)],
        components: &[
            comp(component::B, 0, 8),
            comp(component::G, 8, 8),
            comp(component::R, 16, 8),
            comp(component::A, 24, 8),
        ],
    };
    const RGB_888: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_BGR888,
        gl: None,
        planes: &[plane(3, 1, 0, 0, 3)],
        components: &[
            comp(component::R, 0, 8),
            comp(component::G, 8, 8),
            comp(component::B, 16, 8),
        ],
    };
    const RGB_565: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_BGR565,
        gl: upload(gl::RGB565, gl::UNSIGNED_SHORT_5_6_5, gl::RGB565),
        planes: &[plane(2, 1, 0, 0, 3)],
        components: &[
            comp(component::R, 0, 5),
            comp(component::G, 5, 6),
            comp(component::B, 11, 5),
        ],
    };
    const RGBA_FP16: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_ABGR16161616F,
        gl: upload(gl::RGBA16F, gl::HALF_FLOAT, gl::RGBA16F),
        planes: &[plane(8, 1, 0, 0, 4)],
        components: &[
            comp(component::R, 0, 16),
            comp(component::G, 16, 16),
            comp(component::B, 32, 16),
            comp(component::A, 48, 16),
        ],
    };
    const RGBA_1010102: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_ABGR2101010,
        gl: upload(gl::RGB10_A2, gl::UNSIGNED_INT_2_10_10_10_REV, gl::RGB10_A2),
        planes: &[plane(4, 1, 0, 0, 4)],
        components: &[
            comp(component::R, 0, 10),
            comp(component::G, 10, 10),
            comp(component::B, 20, 10),
            comp(component::A, 30, 2),
        ],
    };
    const RAW16: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_R16,
        gl: None,
        planes: &[plane(2, 16, 0, 0, 1)],
        components: &[comp(component::RAW, 0, 16)],
    };
    const Y16: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_R16,
        gl: None,
        planes: &[plane(2, 16, 0, 0, 1)],
        components: &[comp(component::Y, 0, 16)],
    };
    const BLOB: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_INVALID,
        gl: None,
        planes: &[plane(1, 1, 0, 0, 1)],
        components: &[comp(component::RAW, 0, 8)],
    };
    // Y plane followed by interleaved CrCb
    const YCRCB_420_SP: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_YVU420,
        gl: None,
        planes: &[plane(1, 1, 0, 0, 1), plane(2, 1, 1, 1, 2)],
        components: &[
            comp(component::Y, 0, 8),
            comp(component::CB, 8, 8),
            comp(component::CR, 0, 8),
        ],
    };
    // Y, Cr, Cb planes, rows aligned to 16 bytes
    const YV12: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_YVU420,
        gl: upload_fwk(
            gl::RGBA,
            gl::UNSIGNED_BYTE,
            gl::RGBA,
            EmulatorFrameworkFormat::Yv12,
        ),
        planes: &[
            plane(1, 16, 0, 0, 1),
            plane(1, 16, 1, 1, 1),
            plane(1, 16, 1, 2, 1),
        ],
        components: &[
            comp(component::Y, 0, 8),
            comp(component::CR, 0, 8),
            comp(component::CB, 0, 8),
        ],
    };
    // Y, Cb, Cr planes
    const YCBCR_420_888: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_YUV420,
        gl: upload_fwk(
            gl::RGBA,
            gl::UNSIGNED_BYTE,
            gl::RGBA,
            EmulatorFrameworkFormat::Yuv420_888,
        ),
        planes: &[
            plane(1, 1, 0, 0, 1),
            plane(1, 1, 1, 1, 1),
            plane(1, 1, 1, 2, 1),
        ],
        components: &[
            comp(component::Y, 0, 8),
            comp(component::CB, 0, 8),
            comp(component::CR, 0, 8),
        ],
    };
    // Y plane followed by interleaved CbCr, two bytes per component
    const YCBCR_P010: FormatInfo = FormatInfo {
        drm_format: consts::DRM_FORMAT_YUV420_10BIT,
        gl: upload(gl::RGBA, gl::UNSIGNED_BYTE, gl::RGBA),
        planes: &[plane(2, 1, 0, 0, 1), plane(4, 1, 1, 1, 2)],
        components: &[
            comp(component::Y, 6, 10),
            comp(component::CB, 6, 10),
            comp(component::CR, 22, 10),
        ],
    };

    let fmt_info = match fmt {
        PixelFormat::Rgba8888 => &RGBA_8888,
        PixelFormat::Rgbx8888 => &RGBX_8888,
        PixelFormat::Bgra8888 => &BGRA_8888,
        PixelFormat::Rgb888 => &RGB_888,
        PixelFormat::Rgb565 => &RGB_565,
        PixelFormat::RgbaFp16 => &RGBA_FP16,
        PixelFormat::Rgba1010102 => &RGBA_1010102,
        PixelFormat::Raw16 => &RAW16,
        PixelFormat::Y16 => &Y16,
        PixelFormat::Blob => &BLOB,
        PixelFormat::Ycrcb420Sp => &YCRCB_420_SP,
        PixelFormat::Yv12 => &YV12,
        PixelFormat::Ycbcr420_888 => &YCBCR_420_888,
        PixelFormat::YcbcrP010 => &YCBCR_P010,
        PixelFormat::ImplementationDefined => return Err(Error::Unsupported),
    };

    Ok(fmt_info)
}

pub struct ResolvedLayout {
    pub planes: [PlaneLayout; 3],
    pub components: [PlaneLayoutComponent; 4],
    pub plane_count: u8,
    pub image_size: u64,
    /// Plane-0 stride in pixels for single-plane formats, 0 otherwise.
    pub stride0: u32,
}

/// Lays the planes of `fmt_info` out back-to-back for a `width` x `height`
/// sampling grid.
pub fn resolve_layout(fmt_info: &FormatInfo, width: u32, height: u32) -> ResolvedLayout {
    let mut planes = [PlaneLayout::default(); 3];
    let mut offset: u64 = 0;

    for (idx, spec) in fmt_info.planes.iter().enumerate() {
        let plane_width = u64::from(width >> spec.subsampling_shift);
        let plane_height = u64::from(height >> spec.subsampling_shift);
        let stride = utils::align(
            plane_width * u64::from(spec.sample_increment),
            u64::from(spec.alignment),
        );
        let total_size = stride * plane_height;

        let plane = &mut planes[idx];
        plane.offset_in_bytes = offset as u32;
        plane.stride_in_bytes = stride as u32;
        plane.total_size_in_bytes = total_size as u32;
        plane.sample_increment_in_bytes = spec.sample_increment;
        plane.set_subsampling_shifts(spec.subsampling_shift, spec.subsampling_shift);
        plane.components_base = spec.components_base;
        plane.components_size = spec.components_size;

        offset += total_size;
    }

    let mut components = [PlaneLayoutComponent::default(); 4];
    for (idx, spec) in fmt_info.components.iter().enumerate() {
        components[idx] = PlaneLayoutComponent {
            component_type: spec.component_type,
            offset_in_bits: spec.offset_in_bits,
            size_in_bits: spec.size_in_bits,
        };
    }

    let stride0 = if fmt_info.planes.len() == 1 {
        planes[0].stride_in_bytes / u32::from(planes[0].sample_increment_in_bytes)
    } else {
        0
    };

    ResolvedLayout {
        planes,
        components,
        plane_count: fmt_info.planes.len() as u8,
        image_size: offset,
        stride0,
    }
}
