//! Semi-planar YUV 4:2:0 to interleaved RGB conversion
//!
//! Only a region of interest of the luma plane is converted, and the result
//! is centred inside the square raster the detector expects. Colour
//! conversion uses the integer BT.601 approximation below, bit for bit.

use crate::config::PipelineConfig;
use crate::error::{Result, VisionError};
use crate::frame::{PlanarYuvBuffer, RawFrame};
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

/// Bytes per output pixel: one reserved byte followed by R, G, B
pub const BYTES_PER_PIXEL: usize = 4;

/// Largest raster side the converter will allocate
pub const MAX_TARGET_SIDE: u32 = 4096;

/// Rectangle of the source luma plane, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub top: u32,
    pub left: u32,
    pub rows: u32,
    pub cols: u32,
}

impl Roi {
    pub fn new(top: u32, left: u32, rows: u32, cols: u32) -> Self {
        Self { top, left, rows, cols }
    }

    /// The first `rows` rows and `cols` columns of the frame
    pub fn top_left(rows: u32, cols: u32) -> Self {
        Self::new(0, 0, rows, cols)
    }
}

/// Square interleaved raster handed to the detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbRaster {
    side: u32,
    data: Vec<u8>,
}

impl RgbRaster {
    /// Zero-filled (black) raster, at most [`MAX_TARGET_SIDE`] pixels across
    pub fn new(side: u32) -> Result<Self> {
        if side > MAX_TARGET_SIDE {
            return Err(VisionError::Processing(format!(
                "Raster side {} exceeds the maximum of {}",
                side, MAX_TARGET_SIDE
            )));
        }
        let len = (side as usize)
            .checked_mul(side as usize)
            .and_then(|n| n.checked_mul(BYTES_PER_PIXEL))
            .ok_or_else(|| VisionError::Processing(format!("Raster side {} overflows", side)))?;
        Ok(Self {
            side,
            data: vec![0; len],
        })
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn row_stride(&self) -> usize {
        self.side as usize * BYTES_PER_PIXEL
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.row_stride();
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    /// Raw 4-byte pixel at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let o = (y as usize * self.side as usize + x as usize) * BYTES_PER_PIXEL;
        [self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]]
    }

    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let [_, r, g, b] = self.pixel(x, y);
        [r, g, b]
    }

    /// Drop the reserved byte and build an `image` buffer
    pub fn to_rgb_image(&self) -> image::RgbImage {
        let mut packed = Vec::with_capacity(self.data.len() / BYTES_PER_PIXEL * 3);
        for px in self.data.chunks_exact(BYTES_PER_PIXEL) {
            packed.extend_from_slice(&px[1..]);
        }
        // Length is side * side * 3 by construction.
        image::RgbImage::from_raw(self.side, self.side, packed)
            .unwrap_or_else(|| image::RgbImage::new(self.side, self.side))
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        self.to_rgb_image()
            .save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }
}

#[inline]
pub fn clamp_channel(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Fixed-point BT.601 YCbCr to RGB
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;

    let r = y + ((5743 * v) >> 12);
    let g = y - ((1409 * u) >> 12) - ((2925 * v) >> 12);
    let b = y + ((7258 * u) >> 12);

    [clamp_channel(r), clamp_channel(g), clamp_channel(b)]
}

/// Blank rows (or columns) before the converted region
pub fn padding(target_side: u32, extent: u32) -> u32 {
    target_side.saturating_sub(extent) / 2
}

/// Convert `roi` of `buffer` into a `target_side` x `target_side` raster.
///
/// The region is centred; rows and columns outside it stay zero.
pub fn convert(buffer: &PlanarYuvBuffer<'_>, roi: Roi, target_side: u32) -> Result<RgbRaster> {
    if target_side == 0 || target_side > MAX_TARGET_SIDE {
        return Err(VisionError::Processing(format!(
            "Target side {} must be between 1 and {}",
            target_side, MAX_TARGET_SIDE
        )));
    }

    if roi.rows == 0 || roi.cols == 0 {
        return Err(VisionError::Processing("Region of interest is empty".to_string()));
    }

    if roi.rows > target_side || roi.cols > target_side {
        return Err(VisionError::Processing(format!(
            "Region of interest {}x{} exceeds target side {}",
            roi.cols, roi.rows, target_side
        )));
    }

    let (top, left) = (roi.top as usize, roi.left as usize);
    let (rows, cols) = (roi.rows as usize, roi.cols as usize);

    if top + rows > buffer.height() || left + cols > buffer.width() {
        return Err(VisionError::invalid_buffer(format!(
            "region {}x{} at ({}, {}) lies outside the {}x{} frame",
            cols,
            rows,
            left,
            top,
            buffer.width(),
            buffer.height()
        )));
    }

    let required = buffer
        .required_len(top, left, rows, cols)
        .ok_or_else(|| VisionError::invalid_buffer("region size overflows"))?;
    if buffer.len() < required {
        return Err(VisionError::invalid_buffer(format!(
            "{} bytes is less than the {} required for the region of interest",
            buffer.len(),
            required
        )));
    }

    let pad_rows = padding(target_side, roi.rows) as usize;
    let pad_cols = padding(target_side, roi.cols) as usize;

    let mut raster = RgbRaster::new(target_side)?;
    let stride = raster.row_stride();

    raster
        .data
        .par_chunks_mut(stride)
        .enumerate()
        .skip(pad_rows)
        .take(rows)
        .for_each(|(out_row, line)| {
            let src_row = top + (out_row - pad_rows);
            let luma = buffer.luma_row(src_row);
            let chroma = buffer.chroma_row(src_row);

            for c in 0..cols {
                let src_col = left + c;
                let uv = src_col & !1;
                let [r, g, b] = yuv_to_rgb(luma[src_col], chroma[uv], chroma[uv + 1]);

                let o = (pad_cols + c) * BYTES_PER_PIXEL;
                line[o] = 0;
                line[o + 1] = r;
                line[o + 2] = g;
                line[o + 3] = b;
            }
        });

    debug!(
        "Converted {}x{} region into {}x{} raster (padding {} rows, {} cols)",
        cols, rows, target_side, target_side, pad_rows, pad_cols
    );

    Ok(raster)
}

/// Converter bound to one pipeline configuration
#[derive(Debug, Clone, Copy)]
pub struct FrameConverter {
    roi: Roi,
    target_side: u32,
}

impl FrameConverter {
    pub fn new(roi: Roi, target_side: u32) -> Self {
        Self { roi, target_side }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.roi.into(), config.target_side)
    }

    pub fn roi(&self) -> Roi {
        self.roi
    }

    pub fn target_side(&self) -> u32 {
        self.target_side
    }

    pub fn convert_frame(&self, frame: &RawFrame) -> Result<RgbRaster> {
        let buffer = frame.as_yuv()?;
        convert(&buffer, self.roi, self.target_side)
    }
}
