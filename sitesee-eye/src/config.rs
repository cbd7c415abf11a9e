//! Configuration for sitesee-eye

use crate::convert::{Roi, MAX_TARGET_SIDE};
use crate::error::VisionError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Region of the luma plane that gets converted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    pub top: u32,
    pub left: u32,
    pub rows: u32,
    pub cols: u32,
}

impl Default for RoiConfig {
    fn default() -> Self {
        // Top half of a 1280x720 frame, first 640 columns.
        Self {
            top: 0,
            left: 0,
            rows: 360,
            cols: 640,
        }
    }
}

impl From<RoiConfig> for Roi {
    fn from(cfg: RoiConfig) -> Self {
        Roi::new(cfg.top, cfg.left, cfg.rows, cfg.cols)
    }
}

/// Frame pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Luma plane width delivered by the video transport
    pub frame_width: u32,
    /// Luma plane height delivered by the video transport
    pub frame_height: u32,
    /// Converted region of interest
    pub roi: RoiConfig,
    /// Side of the square raster handed to the detector
    pub target_side: u32,
    /// Only every Nth delivered frame is eligible for admission
    pub admission_divisor: u32,
    /// Drop frames that arrive without their metadata blob
    pub require_metadata: bool,
    /// Detections below this confidence are discarded
    pub min_confidence: f32,
    /// Convert detector boxes from bottom-left to top-left origin
    pub flip_vertical: bool,
    /// Write every converted raster as PNG into this directory
    pub debug_dump_dir: Option<PathBuf>,
    /// Capacity of the pipeline event channel
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_width: 1280,
            frame_height: 720,
            roi: RoiConfig::default(),
            target_side: 640,
            admission_divisor: 1,
            require_metadata: true,
            min_confidence: 0.0,
            flip_vertical: true,
            debug_dump_dir: None,
            event_capacity: 64,
        }
    }
}

impl PipelineConfig {
    /// Directory used by `--dump` when no explicit path is given
    pub fn default_dump_dir() -> PathBuf {
        dirs::home_dir()
            .map(|mut p| {
                p.push(".sitesee");
                p.push("frames");
                p
            })
            .unwrap_or_else(|| PathBuf::from("./frames"))
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(raw: &str) -> Result<Self, VisionError> {
        let config: PipelineConfig = toml::from_str(raw)?;
        config.validate().map_err(VisionError::Config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, VisionError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err("Frame dimensions must be non-zero".to_string());
        }

        if self.frame_width > 7680 || self.frame_height > 4320 {
            return Err("Frame too large (max 8K)".to_string());
        }

        if self.frame_width % 2 != 0 || self.frame_height % 2 != 0 {
            return Err("Frame dimensions must be even for 4:2:0 chroma".to_string());
        }

        self.frame_width
            .checked_mul(self.frame_height)
            .ok_or_else(|| "Frame dimensions would cause integer overflow".to_string())?;

        if self.target_side == 0 || self.target_side > MAX_TARGET_SIDE {
            return Err(format!("Target side must be between 1 and {}", MAX_TARGET_SIDE));
        }

        let roi = &self.roi;
        if roi.rows == 0 || roi.cols == 0 {
            return Err("Region of interest must be non-empty".to_string());
        }

        let bottom = roi.top.checked_add(roi.rows)
            .ok_or_else(|| "Region of interest rows overflow".to_string())?;
        let right = roi.left.checked_add(roi.cols)
            .ok_or_else(|| "Region of interest columns overflow".to_string())?;
        if bottom > self.frame_height || right > self.frame_width {
            return Err(format!(
                "Region of interest {}x{} at ({}, {}) exceeds frame {}x{}",
                roi.cols, roi.rows, roi.left, roi.top, self.frame_width, self.frame_height
            ));
        }

        if roi.rows > self.target_side || roi.cols > self.target_side {
            return Err(format!(
                "Region of interest {}x{} does not fit target side {}",
                roi.cols, roi.rows, self.target_side
            ));
        }

        if self.admission_divisor == 0 {
            return Err("Admission divisor must be at least 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err("Minimum confidence must be within [0, 1]".to_string());
        }

        if self.event_capacity == 0 {
            return Err("Event capacity must be non-zero".to_string());
        }

        Ok(())
    }
}
