//! Frame pipeline: admission, conversion and inference off the delivery path

use crate::config::PipelineConfig;
use crate::convert::FrameConverter;
use crate::dump::DebugDumper;
use crate::error::{Result, VisionError};
use crate::frame::RawFrame;
use crate::gate::{Admission, AdmissionGate, GateStats, SlotPermit};
use crate::inference::{dispatch, Detection, Detector};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

/// What happened to a delivered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Copied and handed to a worker under this sequence number
    Admitted(u64),
    /// A previous frame still holds the slot
    Dropped,
    /// Filtered by the admission-rate divisor
    Skipped,
}

impl FrameDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, FrameDecision::Admitted(_))
    }
}

/// Emitted once per admitted frame, after its slot has been released
/// and its outcome counted in [`PipelineStats`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Completed {
        seq: u64,
        detection: Option<Detection>,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Failed {
        seq: u64,
        error: String,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn seq(&self) -> u64 {
        match self {
            PipelineEvent::Completed { seq, .. } | PipelineEvent::Failed { seq, .. } => *seq,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PipelineEvent::Failed { .. })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub gate: GateStats,
    pub completed: u64,
    pub failed: u64,
    pub detections: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    detections: AtomicU64,
}

/// Everything a worker needs, shared between jobs
struct WorkerContext {
    config: Arc<PipelineConfig>,
    converter: FrameConverter,
    detector: Arc<dyn Detector>,
    dumper: Option<DebugDumper>,
    events: broadcast::Sender<PipelineEvent>,
    counters: Counters,
    last_detection: RwLock<Option<Detection>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl WorkerContext {
    /// Count a finished frame. Runs before the frame's slot is released.
    fn record(&self, result: &Result<Option<Detection>>) {
        match result {
            Ok(detection) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                if let Some(d) = detection {
                    self.counters.detections.fetch_add(1, Ordering::Relaxed);
                    *self.last_detection.write() = Some(d.clone());
                }
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Marks one admitted frame as in flight until its event has been sent
struct InFlight(Arc<WorkerContext>);

impl InFlight {
    fn start(ctx: Arc<WorkerContext>) -> Self {
        ctx.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(ctx)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct FramePipeline {
    gate: Arc<AdmissionGate>,
    ctx: Arc<WorkerContext>,
    next_seq: AtomicU64,
    runtime: Handle,
}

impl FramePipeline {
    /// Create a pipeline that schedules work on the current tokio runtime
    pub fn new(config: PipelineConfig, detector: Arc<dyn Detector>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            VisionError::Config(format!("Frame pipeline needs a tokio runtime: {}", e))
        })?;
        Self::with_runtime(config, detector, runtime)
    }

    /// Create a pipeline that schedules work on `runtime`
    pub fn with_runtime(
        config: PipelineConfig,
        detector: Arc<dyn Detector>,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate().map_err(VisionError::Config)?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let dumper = config.debug_dump_dir.clone().map(DebugDumper::new);
        let gate = Arc::new(AdmissionGate::with_divisor(config.admission_divisor));

        info!(
            "Frame pipeline ready: {}x{} frames, region {}x{} at ({}, {}), target {} px, detector '{}'",
            config.frame_width,
            config.frame_height,
            config.roi.cols,
            config.roi.rows,
            config.roi.left,
            config.roi.top,
            config.target_side,
            detector.name()
        );

        let ctx = WorkerContext {
            converter: FrameConverter::from_config(&config),
            config: Arc::new(config),
            detector,
            dumper,
            events,
            counters: Counters::default(),
            last_detection: RwLock::new(None),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        };

        Ok(Self {
            gate,
            ctx: Arc::new(ctx),
            next_seq: AtomicU64::new(0),
            runtime,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    /// Frame delivery callback.
    ///
    /// Decides synchronously, copies the borrowed bytes only when the frame
    /// is admitted, and returns without waiting for the conversion.
    pub fn on_frame(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        metadata: Option<&[u8]>,
    ) -> FrameDecision {
        let permit = match self.gate.offer_permit() {
            (_, Some(permit)) => permit,
            (Admission::Skipped, None) => return FrameDecision::Skipped,
            (_, None) => {
                debug!("Pipeline busy, dropping frame");
                return FrameDecision::Dropped;
            }
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let frame = RawFrame::copy_from(seq, data, width, height, metadata);
        debug!("Admitted frame {} ({} bytes)", seq, frame.len());

        let in_flight = InFlight::start(self.ctx.clone());
        self.runtime.spawn(run_job(in_flight, frame, permit));

        FrameDecision::Admitted(seq)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.ctx.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    pub fn last_detection(&self) -> Option<Detection> {
        self.ctx.last_detection.read().clone()
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.ctx.counters;
        PipelineStats {
            gate: self.gate.stats(),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            detections: counters.detections.load(Ordering::Relaxed),
        }
    }

    /// Wait until every admitted frame has been counted and its event sent,
    /// or the timeout expires
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ctx.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a wakeup in between is not lost.
            notified.as_mut().enable();

            if self.ctx.in_flight.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.ctx.in_flight.load(Ordering::Acquire) == 0;
            }
        }
    }
}

async fn run_job(in_flight: InFlight, frame: RawFrame, permit: SlotPermit) {
    let ctx = in_flight.0.clone();
    let seq = frame.seq;
    let started = Instant::now();

    let worker_ctx = ctx.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let result = process_frame(&worker_ctx, &frame);
        worker_ctx.record(&result);
        drop(permit);
        result
    })
    .await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let timestamp = Utc::now();

    let event = match outcome {
        Ok(Ok(detection)) => {
            debug!("Frame {} done in {} ms", seq, elapsed_ms);
            PipelineEvent::Completed {
                seq,
                detection,
                elapsed_ms,
                timestamp,
            }
        }
        Ok(Err(e)) => {
            warn!("Frame {} dropped: {}", seq, e);
            PipelineEvent::Failed {
                seq,
                error: e.to_string(),
                elapsed_ms,
                timestamp,
            }
        }
        Err(join_err) => {
            // The permit was dropped while unwinding.
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!("Frame {} worker panicked: {}", seq, join_err);
            PipelineEvent::Failed {
                seq,
                error: format!("worker panicked: {}", join_err),
                elapsed_ms,
                timestamp,
            }
        }
    };

    // No subscribers is fine.
    let _ = ctx.events.send(event);
    drop(in_flight);
}

fn process_frame(ctx: &WorkerContext, frame: &RawFrame) -> Result<Option<Detection>> {
    if ctx.config.require_metadata {
        frame.metadata()?;
    }

    if frame.width != ctx.config.frame_width || frame.height != ctx.config.frame_height {
        debug!(
            "Frame {} is {}x{}, configured for {}x{}",
            frame.seq, frame.width, frame.height, ctx.config.frame_width, ctx.config.frame_height
        );
    }

    let raster = ctx.converter.convert_frame(frame)?;

    if let Some(dumper) = &ctx.dumper {
        dumper.save_quietly(&raster, frame.seq);
    }

    dispatch(
        ctx.detector.as_ref(),
        &raster,
        ctx.config.min_confidence,
        ctx.config.flip_vertical,
    )
}
