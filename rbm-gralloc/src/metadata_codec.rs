// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Encoding of standard metadata records.
//!
//! Values are raw little-endian scalars; strings are an i64 length followed
//! by the bytes.  The writer keeps counting past the end of the destination
//! without ever writing out of bounds, so a dry run against an empty buffer
//! reports the exact size the encoded form will take.

pub const STANDARD_METADATA_TYPE_TAG: &str =
    "android.hardware.graphics.common.StandardMetadataType";
pub const CHROMA_SITING_TAG: &str = "android.hardware.graphics.common.ChromaSiting";
pub const COMPRESSION_TAG: &str = "android.hardware.graphics.common.Compression";
pub const INTERLACED_TAG: &str = "android.hardware.graphics.common.Interlaced";
pub const PLANE_LAYOUT_COMPONENT_TYPE_TAG: &str =
    "android.hardware.graphics.common.PlaneLayoutComponentType";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i64)]
pub enum StandardMetadataType {
    BufferId = 1,
    Name = 2,
    Width = 3,
    Height = 4,
    LayerCount = 5,
    PixelFormatRequested = 6,
    PixelFormatFourcc = 7,
    PixelFormatModifier = 8,
    Usage = 9,
    AllocationSize = 10,
    ProtectedContent = 11,
    Compression = 12,
    Interlaced = 13,
    ChromaSiting = 14,
    PlaneLayouts = 15,
    Crop = 16,
    Dataspace = 17,
    BlendMode = 18,
    Smpte2086 = 19,
    Cta861_3 = 20,
    Stride = 22,
}

impl StandardMetadataType {
    pub fn from_raw(raw: i64) -> Option<Self> {
        let ty = match raw {
            1 => Self::BufferId,
            2 => Self::Name,
            3 => Self::Width,
            4 => Self::Height,
            5 => Self::LayerCount,
            6 => Self::PixelFormatRequested,
            7 => Self::PixelFormatFourcc,
            8 => Self::PixelFormatModifier,
            9 => Self::Usage,
            10 => Self::AllocationSize,
            11 => Self::ProtectedContent,
            12 => Self::Compression,
            13 => Self::Interlaced,
            14 => Self::ChromaSiting,
            15 => Self::PlaneLayouts,
            16 => Self::Crop,
            17 => Self::Dataspace,
            18 => Self::BlendMode,
            19 => Self::Smpte2086,
            20 => Self::Cta861_3,
            22 => Self::Stride,
            _ => return None,
        };
        Some(ty)
    }

    pub fn as_raw(self) -> i64 {
        self as i64
    }
}

/// Every supported type with its settable flag.  All are gettable.
pub const METADATA_TYPES: &[(StandardMetadataType, bool)] = &[
    (StandardMetadataType::BufferId, false),
    (StandardMetadataType::Name, false),
    (StandardMetadataType::Width, false),
    (StandardMetadataType::Height, false),
    (StandardMetadataType::LayerCount, false),
    (StandardMetadataType::PixelFormatRequested, false),
    (StandardMetadataType::PixelFormatFourcc, false),
    (StandardMetadataType::PixelFormatModifier, false),
    (StandardMetadataType::Usage, false),
    (StandardMetadataType::AllocationSize, false),
    (StandardMetadataType::ProtectedContent, false),
    (StandardMetadataType::Compression, false),
    (StandardMetadataType::Interlaced, false),
    (StandardMetadataType::ChromaSiting, false),
    (StandardMetadataType::PlaneLayouts, false),
    (StandardMetadataType::Crop, false),
    (StandardMetadataType::Dataspace, true),
    (StandardMetadataType::BlendMode, true),
    (StandardMetadataType::Smpte2086, true),
    (StandardMetadataType::Cta861_3, true),
    (StandardMetadataType::Stride, false),
];

pub struct MetadataWriter<'a> {
    dest: &'a mut [u8],
    pos: usize,
}

impl<'a> MetadataWriter<'a> {
    pub fn new(dest: &'a mut [u8]) -> Self {
        Self { dest, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> &mut Self {
        if let Some(end) = self.pos.checked_add(bytes.len()) {
            if end <= self.dest.len() {
                self.dest[self.pos..end].copy_from_slice(bytes);
            }
            self.pos = end;
        }
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    pub fn write_str(&mut self, value: &[u8]) -> &mut Self {
        self.write_i64(value.len() as i64);
        self.put(value)
    }

    /// Bytes the fully encoded form takes, whether or not it fit.
    pub fn desired_size(&self) -> i32 {
        self.pos as i32
    }
}

pub struct MetadataReader<'a> {
    src: &'a [u8],
    pos: usize,
    ok: bool,
}

impl<'a> MetadataReader<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            pos: 0,
            ok: true,
        }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if !self.ok {
            return None;
        }
        match self.pos.checked_add(len) {
            Some(end) if end <= self.src.len() => {
                let bytes = &self.src[self.pos..end];
                self.pos = end;
                Some(bytes)
            }
            _ => {
                self.ok = false;
                None
            }
        }
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.take(4).map(|b| i32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        self.take(8).map(|b| i64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        self.take(4).map(|b| f32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_str(&mut self) -> Option<&'a [u8]> {
        let len = self.read_i64()?;
        let len = usize::try_from(len).ok().or_else(|| {
            self.ok = false;
            None
        })?;
        self.take(len)
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn remaining(&self) -> usize {
        self.src.len() - self.pos.min(self.src.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_reports_exact_size() {
        let mut empty: [u8; 0] = [];
        let mut writer = MetadataWriter::new(&mut empty);
        writer
            .write_str(STANDARD_METADATA_TYPE_TAG.as_bytes())
            .write_i64(StandardMetadataType::Width.as_raw())
            .write_u64(1920);
        let desired = writer.desired_size();
        assert_eq!(
            desired as usize,
            8 + STANDARD_METADATA_TYPE_TAG.len() + 8 + 8
        );

        let mut exact = vec![0u8; desired as usize];
        let mut writer = MetadataWriter::new(&mut exact);
        writer
            .write_str(STANDARD_METADATA_TYPE_TAG.as_bytes())
            .write_i64(StandardMetadataType::Width.as_raw())
            .write_u64(1920);
        assert_eq!(writer.desired_size(), desired);

        let mut reader = MetadataReader::new(&exact);
        assert_eq!(
            reader.read_str().unwrap(),
            STANDARD_METADATA_TYPE_TAG.as_bytes()
        );
        assert_eq!(
            reader.read_i64().unwrap(),
            StandardMetadataType::Width.as_raw()
        );
        assert_eq!(reader.read_i64().unwrap(), 1920);
        assert!(reader.ok());
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn small_buffer_is_never_overrun() {
        let mut small = [0u8; 4];
        let mut writer = MetadataWriter::new(&mut small);
        writer.write_u64(0xffff_ffff_ffff_ffff);
        assert_eq!(writer.desired_size(), 8);
        // nothing was written
        assert_eq!(small, [0u8; 4]);
    }

    #[test]
    fn truncated_reads_clear_ok() {
        let mut reader = MetadataReader::new(&[1, 2, 3]);
        assert!(reader.read_i64().is_none());
        assert!(!reader.ok());
        // once failed, every further read fails
        assert!(reader.read_i32().is_none());
    }

    #[test]
    fn type_table() {
        assert_eq!(METADATA_TYPES.len(), 21);
        let settable: Vec<_> = METADATA_TYPES
            .iter()
            .filter(|(_, settable)| *settable)
            .map(|(ty, _)| *ty)
            .collect();
        assert_eq!(
            settable,
            [
                StandardMetadataType::Dataspace,
                StandardMetadataType::BlendMode,
                StandardMetadataType::Smpte2086,
                StandardMetadataType::Cta861_3,
            ]
        );
        assert_eq!(StandardMetadataType::from_raw(21), None);
        assert_eq!(
            StandardMetadataType::from_raw(22),
            Some(StandardMetadataType::Stride)
        );
    }
}
