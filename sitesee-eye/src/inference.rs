//! Inference dispatch
//!
//! The detector itself is opaque: anything that turns a square raster into
//! at most one detection can sit behind [`Detector`].

use crate::convert::RgbRaster;
use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Normalized box, all components relative to the raster side
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn max_y(&self) -> f32 {
        self.y + self.height
    }

    /// Swap between bottom-left and top-left origin: `y' = 1 - maxY`
    pub fn flip_vertical(&self) -> Self {
        Self {
            x: self.x,
            y: 1.0 - self.max_y(),
            width: self.width,
            height: self.height,
        }
    }

    pub fn is_normalized(&self) -> bool {
        let parts = [self.x, self.y, self.width, self.height];
        parts.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v))
            && self.x + self.width <= 1.0 + f32::EPSILON
            && self.max_y() <= 1.0 + f32::EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub label: Option<String>,
}

/// Object detector consuming one converted raster
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the underlying model is loaded and able to run
    fn is_ready(&self) -> bool {
        true
    }

    /// Boxes are returned in the detector's own origin convention
    fn detect(&self, raster: &RgbRaster) -> Result<Option<Detection>>;
}

/// Run `detector` on `raster` and normalise its answer for consumers.
///
/// Detections under `min_confidence` are discarded. Boxes outside the unit
/// square are logged and forwarded as reported. With `flip` set the box is
/// converted from bottom-left to top-left origin.
pub fn dispatch(
    detector: &dyn Detector,
    raster: &RgbRaster,
    min_confidence: f32,
    flip: bool,
) -> Result<Option<Detection>> {
    if !detector.is_ready() {
        return Err(VisionError::InferenceUnavailable(format!(
            "detector '{}' is not ready",
            detector.name()
        )));
    }

    let detection = match detector.detect(raster)? {
        Some(d) => d,
        None => return Ok(None),
    };

    if !detection.confidence.is_finite() || detection.confidence < min_confidence {
        debug!(
            "Discarding detection with confidence {} (min {})",
            detection.confidence, min_confidence
        );
        return Ok(None);
    }

    if !detection.bbox.is_normalized() {
        warn!(
            "Detector '{}' reported a box outside the unit square: {:?}",
            detector.name(),
            detection.bbox
        );
    }

    let bbox = if flip {
        detection.bbox.flip_vertical()
    } else {
        detection.bbox
    };

    Ok(Some(Detection { bbox, ..detection }))
}

/// Reference detector: bounding box of every pixel brighter than a threshold.
///
/// Reports boxes with a bottom-left origin, like the vision models the
/// pipeline was built for.
pub struct LumaThresholdDetector {
    threshold: u8,
    label: String,
    ready: AtomicBool,
}

impl LumaThresholdDetector {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            label: "bright".to_string(),
            ready: AtomicBool::new(true),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

#[inline]
fn luma_of(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}

impl Detector for LumaThresholdDetector {
    fn name(&self) -> &str {
        "luma-threshold"
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn detect(&self, raster: &RgbRaster) -> Result<Option<Detection>> {
        let side = raster.side();
        if side == 0 {
            return Ok(None);
        }

        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        let mut hits = 0u64;

        for y in 0..side {
            for (x, px) in raster.row(y).chunks_exact(4).enumerate() {
                if luma_of(px[1], px[2], px[3]) > self.threshold {
                    let x = x as u32;
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                    hits += 1;
                }
            }
        }

        if hits == 0 {
            return Ok(None);
        }

        let side_f = side as f32;
        let box_w = (max_x - min_x + 1) as f32;
        let box_h = (max_y - min_y + 1) as f32;
        let top_left = BoundingBox::new(
            min_x as f32 / side_f,
            min_y as f32 / side_f,
            box_w / side_f,
            box_h / side_f,
        );

        Ok(Some(Detection {
            bbox: top_left.flip_vertical(),
            confidence: (hits as f32 / (box_w * box_h)).min(1.0),
            label: Some(self.label.clone()),
        }))
    }
}
