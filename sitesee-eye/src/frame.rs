//! Raw frames delivered by the video transport and the semi-planar YUV view

use crate::error::{Result, VisionError};
use bytes::Bytes;

/// One frame copied out of the transport callback.
///
/// The transport reclaims its buffer as soon as the callback returns, so the
/// pixel bytes and metadata blob are copied into owned storage here.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    data: Bytes,
    metadata: Option<Bytes>,
}

impl RawFrame {
    /// Copy a borrowed transport buffer into an owned frame
    pub fn copy_from(
        seq: u64,
        data: &[u8],
        width: u32,
        height: u32,
        metadata: Option<&[u8]>,
    ) -> Self {
        Self {
            seq,
            width,
            height,
            data: Bytes::copy_from_slice(data),
            metadata: metadata.map(Bytes::copy_from_slice),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Attached metadata blob. Its content is opaque; only presence is checked.
    pub fn metadata(&self) -> Result<&[u8]> {
        match &self.metadata {
            Some(blob) if !blob.is_empty() => Ok(&blob[..]),
            Some(_) => Err(VisionError::DecodeFailure(format!(
                "frame {} carries an empty metadata blob",
                self.seq
            ))),
            None => Err(VisionError::DecodeFailure(format!(
                "frame {} has no metadata attached",
                self.seq
            ))),
        }
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata().is_ok()
    }

    /// Borrow the pixel bytes as a validated semi-planar 4:2:0 buffer
    pub fn as_yuv(&self) -> Result<PlanarYuvBuffer<'_>> {
        PlanarYuvBuffer::new(&self.data, self.width, self.height)
    }
}

/// Semi-planar YUV 4:2:0 view: a full-resolution Y plane followed by one
/// interleaved UV plane at half resolution in both directions.
#[derive(Debug, Clone, Copy)]
pub struct PlanarYuvBuffer<'a> {
    bytes: &'a [u8],
    width: usize,
    height: usize,
    luma_size: usize,
}

impl<'a> PlanarYuvBuffer<'a> {
    pub fn new(bytes: &'a [u8], width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(VisionError::invalid_buffer(format!(
                "frame dimensions {}x{} must be non-zero",
                width, height
            )));
        }

        // Each U/V pair covers two columns, so the chroma stride is the width.
        if width % 2 != 0 {
            return Err(VisionError::invalid_buffer(format!(
                "frame width {} must be even for 4:2:0 chroma",
                width
            )));
        }

        let width = width as usize;
        let height = height as usize;
        let luma_size = width
            .checked_mul(height)
            .ok_or_else(|| VisionError::invalid_buffer("luma plane size overflows"))?;

        // At least one chroma pair must follow the luma plane.
        let minimum = luma_size + 2;
        if bytes.len() < minimum {
            return Err(VisionError::invalid_buffer(format!(
                "{} bytes is less than the {} required for a {}x{} frame",
                bytes.len(),
                minimum,
                width,
                height
            )));
        }

        Ok(Self {
            bytes,
            width,
            height,
            luma_size,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn luma_size(&self) -> usize {
        self.luma_size
    }

    /// Offset of the U sample shared by the 2x2 block containing (row, col).
    /// V sits one byte later.
    #[inline]
    pub fn chroma_offset(&self, row: usize, col: usize) -> usize {
        self.luma_size + (row / 2) * self.width + (col & !1)
    }

    /// Bytes needed to convert `rows` x `cols` starting at (top, left)
    pub fn required_len(&self, top: usize, left: usize, rows: usize, cols: usize) -> Option<usize> {
        if rows == 0 || cols == 0 {
            return Some(self.luma_size + 2);
        }
        let last_row = top.checked_add(rows)?.checked_sub(1)?;
        let last_col = left.checked_add(cols)?.checked_sub(1)?;
        let luma_end = last_row.checked_mul(self.width)?.checked_add(last_col)?.checked_add(1)?;
        let chroma_end = self
            .luma_size
            .checked_add((last_row / 2).checked_mul(self.width)?)?
            .checked_add(last_col & !1)?
            .checked_add(2)?;
        Some(luma_end.max(chroma_end))
    }

    #[inline]
    pub fn luma(&self, row: usize, col: usize) -> u8 {
        self.bytes[row * self.width + col]
    }

    /// (U, V) pair for the pixel at (row, col)
    #[inline]
    pub fn chroma(&self, row: usize, col: usize) -> (u8, u8) {
        let uv = self.chroma_offset(row, col);
        (self.bytes[uv], self.bytes[uv + 1])
    }

    pub(crate) fn luma_row(&self, row: usize) -> &'a [u8] {
        let start = row * self.width;
        &self.bytes[start..start + self.width]
    }

    pub(crate) fn chroma_row(&self, row: usize) -> &'a [u8] {
        let start = self.luma_size + (row / 2) * self.width;
        let end = (start + self.width).min(self.bytes.len());
        &self.bytes[start..end]
    }
}
