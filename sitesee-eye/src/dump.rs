//! Debug-only PNG dump of converted rasters

use crate::convert::RgbRaster;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct DebugDumper {
    dir: PathBuf,
}

impl DebugDumper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("frame_{:06}.png", seq))
    }

    /// Write `raster` as `frame_<seq>.png`, creating the directory on demand
    pub fn save(&self, raster: &RgbRaster, seq: u64) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(seq);
        raster.save_png(&path)?;
        debug!("Dumped frame {} to {:?}", seq, path);
        Ok(path)
    }

    /// Like `save`, but failures are only logged
    pub fn save_quietly(&self, raster: &RgbRaster, seq: u64) -> Option<PathBuf> {
        match self.save(raster, seq) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Failed to dump frame {}: {}", seq, e);
                None
            }
        }
    }
}
