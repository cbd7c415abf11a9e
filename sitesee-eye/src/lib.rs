//! sitesee-eye: live video frame pipeline for on-board object detection
//!
//! Takes raw semi-planar YUV 4:2:0 frames from a video transport, admits at
//! most one at a time, converts a region of interest into a square RGB
//! raster off the delivery thread and hands it to a detector.

pub mod config;
pub mod convert;
pub mod dump;
pub mod error;
pub mod frame;
pub mod gate;
pub mod inference;
pub mod pipeline;

pub use config::{PipelineConfig, RoiConfig};
pub use convert::{convert, yuv_to_rgb, FrameConverter, RgbRaster, Roi};
pub use error::VisionError;
pub use frame::{PlanarYuvBuffer, RawFrame};
pub use gate::{Admission, AdmissionGate, GateStats, SlotPermit};
pub use inference::{BoundingBox, Detection, Detector, LumaThresholdDetector};
pub use pipeline::{FrameDecision, FramePipeline, PipelineEvent, PipelineStats};
