// Replay a recorded frame through the pipeline as if it came from the drone stream

use anyhow::Context;
use sitesee_eye::inference::LumaThresholdDetector;
use sitesee_eye::{FrameDecision, FramePipeline, PipelineConfig, PipelineEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const REPLAY_METADATA: &[u8] = b"sitesee-replay";

pub struct ReplayOptions {
    pub frames: u32,
    pub interval_ms: u64,
    pub threshold: u8,
    pub with_metadata: bool,
}

pub async fn run(input: &Path, config: PipelineConfig, options: ReplayOptions) -> anyhow::Result<()> {
    let data = std::fs::read(input).with_context(|| format!("Failed to read {:?}", input))?;
    let (width, height) = (config.frame_width, config.frame_height);

    let detector = Arc::new(LumaThresholdDetector::new(options.threshold));
    let pipeline = FramePipeline::new(config, detector)?;
    let mut events = pipeline.subscribe();

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Missed {} pipeline events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(
        "Replaying {:?} ({} bytes) {} times every {} ms",
        input,
        data.len(),
        options.frames,
        options.interval_ms
    );

    let metadata = options.with_metadata.then_some(REPLAY_METADATA);
    let interval = Duration::from_millis(options.interval_ms);
    let (mut admitted, mut dropped, mut skipped) = (0u32, 0u32, 0u32);

    for _ in 0..options.frames {
        match pipeline.on_frame(&data, width, height, metadata) {
            FrameDecision::Admitted(_) => admitted += 1,
            FrameDecision::Dropped => dropped += 1,
            FrameDecision::Skipped => skipped += 1,
        }
        tokio::time::sleep(interval).await;
    }

    if !pipeline.wait_idle(Duration::from_secs(30)).await {
        warn!("Pipeline still busy after replay finished");
    }

    let stats = pipeline.stats();

    // The printer stops once the pipeline's event sender is gone.
    drop(pipeline);
    let _ = printer.await;

    info!("Delivered {}: admitted {}, dropped {}, skipped {}", options.frames, admitted, dropped, skipped);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Completed { seq, detection: None, elapsed_ms, .. } => {
            info!("Frame {} processed in {} ms, nothing detected", seq, elapsed_ms);
        }
        PipelineEvent::Failed { seq, error, .. } => {
            warn!("Frame {} failed: {}", seq, error);
        }
        PipelineEvent::Completed { .. } => {
            println!("{}", event.to_json());
        }
    }
}
