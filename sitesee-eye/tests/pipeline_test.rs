//! End-to-end pipeline behaviour: admission, failure containment, release

mod common;

use common::{uniform_nv12, METADATA};
use parking_lot::Mutex;
use sitesee_eye::convert::RgbRaster;
use sitesee_eye::error::Result;
use sitesee_eye::inference::{BoundingBox, Detection, Detector, LumaThresholdDetector};
use sitesee_eye::pipeline::{FrameDecision, FramePipeline, PipelineEvent};
use sitesee_eye::PipelineConfig;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Blocks inside `detect` until the test lets it go
struct GatedDetector {
    proceed: Mutex<mpsc::Receiver<()>>,
}

impl GatedDetector {
    fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (Self { proceed: Mutex::new(rx) }, tx)
    }
}

impl Detector for GatedDetector {
    fn name(&self) -> &str {
        "gated"
    }

    fn detect(&self, _raster: &RgbRaster) -> Result<Option<Detection>> {
        let _ = self.proceed.lock().recv_timeout(Duration::from_secs(10));
        Ok(Some(Detection {
            bbox: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
            confidence: 0.9,
            label: Some("drone".to_string()),
        }))
    }
}

struct PanickingDetector;

impl Detector for PanickingDetector {
    fn name(&self) -> &str {
        "panicking"
    }

    fn detect(&self, _raster: &RgbRaster) -> Result<Option<Detection>> {
        panic!("model crashed");
    }
}

async fn next_event(rx: &mut broadcast::Receiver<PipelineEvent>) -> PipelineEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for pipeline event")
        .expect("event channel closed")
}

fn white_frame() -> Vec<u8> {
    uniform_nv12(WIDTH as usize, HEIGHT as usize, 255, 128, 128)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_back_to_back_frames_drop_second() {
    let (detector, proceed) = GatedDetector::new();
    let pipeline = FramePipeline::new(PipelineConfig::default(), Arc::new(detector)).unwrap();
    let mut events = pipeline.subscribe();
    let frame = white_frame();

    let first = pipeline.on_frame(&frame, WIDTH, HEIGHT, Some(METADATA));
    assert_eq!(first, FrameDecision::Admitted(0));
    let second = pipeline.on_frame(&frame, WIDTH, HEIGHT, Some(METADATA));
    assert_eq!(second, FrameDecision::Dropped);
    assert!(pipeline.is_busy());

    proceed.send(()).unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.seq(), 0);
    assert!(!event.is_failure());

    let third = pipeline.on_frame(&frame, WIDTH, HEIGHT, Some(METADATA));
    assert_eq!(third, FrameDecision::Admitted(1));
    proceed.send(()).unwrap();
    next_event(&mut events).await;

    let stats = pipeline.stats();
    assert_eq!(stats.gate.admitted, 2);
    assert_eq!(stats.gate.dropped_busy, 1);
    assert_eq!(stats.gate.released, 2);
    assert_eq!(stats.completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detection_is_flipped_before_emitting() {
    let (detector, proceed) = GatedDetector::new();
    let pipeline = FramePipeline::new(PipelineConfig::default(), Arc::new(detector)).unwrap();
    let mut events = pipeline.subscribe();

    proceed.send(()).unwrap();
    pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, Some(METADATA));

    match next_event(&mut events).await {
        PipelineEvent::Completed { detection: Some(d), .. } => {
            assert!((d.bbox.y - 0.7).abs() < 1e-6);
            assert_eq!(d.label.as_deref(), Some("drone"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(pipeline.last_detection().is_some());
    assert_eq!(pipeline.stats().detections, 1);
}

#[tokio::test]
async fn test_short_buffer_fails_and_releases() {
    let pipeline = FramePipeline::new(
        PipelineConfig::default(),
        Arc::new(LumaThresholdDetector::new(200)),
    )
    .unwrap();
    let mut events = pipeline.subscribe();

    let short = vec![128u8; (WIDTH * HEIGHT) as usize + 1];
    assert!(pipeline.on_frame(&short, WIDTH, HEIGHT, Some(METADATA)).is_admitted());

    match next_event(&mut events).await {
        PipelineEvent::Failed { error, .. } => assert!(error.contains("Invalid buffer")),
        other => panic!("unexpected event {:?}", other),
    }

    assert!(!pipeline.is_busy());
    let stats = pipeline.stats();
    assert_eq!(stats.gate.released, 1);
    assert_eq!(stats.failed, 1);

    assert!(pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, Some(METADATA)).is_admitted());
    assert!(!next_event(&mut events).await.is_failure());
}

#[tokio::test]
async fn test_missing_metadata_is_decode_failure() {
    let pipeline = FramePipeline::new(
        PipelineConfig::default(),
        Arc::new(LumaThresholdDetector::new(200)),
    )
    .unwrap();
    let mut events = pipeline.subscribe();

    pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, None);
    match next_event(&mut events).await {
        PipelineEvent::Failed { error, .. } => assert!(error.contains("Decode failure")),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(pipeline.stats().gate.released, 1);
}

#[tokio::test]
async fn test_metadata_optional_when_not_required() {
    let mut config = PipelineConfig::default();
    config.require_metadata = false;
    let pipeline = FramePipeline::new(config, Arc::new(LumaThresholdDetector::new(200))).unwrap();
    let mut events = pipeline.subscribe();

    pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, None);
    match next_event(&mut events).await {
        PipelineEvent::Completed { detection: Some(d), .. } => {
            // Converted band is rows 140..500 of 640.
            assert!((d.bbox.y - 140.0 / 640.0).abs() < 1e-5);
            assert!((d.bbox.height - 360.0 / 640.0).abs() < 1e-5);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_unready_detector_reports_inference_unavailable() {
    let detector = Arc::new(LumaThresholdDetector::new(200));
    detector.set_ready(false);
    let pipeline = FramePipeline::new(PipelineConfig::default(), detector.clone()).unwrap();
    let mut events = pipeline.subscribe();

    pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, Some(METADATA));
    match next_event(&mut events).await {
        PipelineEvent::Failed { error, .. } => assert!(error.contains("Inference unavailable")),
        other => panic!("unexpected event {:?}", other),
    }

    detector.set_ready(true);
    pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, Some(METADATA));
    assert!(!next_event(&mut events).await.is_failure());
}

#[tokio::test]
async fn test_panicking_detector_still_releases() {
    let pipeline = FramePipeline::new(PipelineConfig::default(), Arc::new(PanickingDetector)).unwrap();
    let mut events = pipeline.subscribe();

    pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, Some(METADATA));
    match next_event(&mut events).await {
        PipelineEvent::Failed { error, .. } => assert!(error.contains("panicked")),
        other => panic!("unexpected event {:?}", other),
    }

    assert!(!pipeline.is_busy());
    assert_eq!(pipeline.stats().gate.released, 1);
    assert!(pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, Some(METADATA)).is_admitted());
}

#[tokio::test]
async fn test_divisor_skips_frames() {
    let mut config = PipelineConfig::default();
    config.admission_divisor = 2;
    let pipeline = FramePipeline::new(config, Arc::new(LumaThresholdDetector::new(200))).unwrap();
    let mut events = pipeline.subscribe();
    let frame = white_frame();

    assert!(pipeline.on_frame(&frame, WIDTH, HEIGHT, Some(METADATA)).is_admitted());
    next_event(&mut events).await;
    assert_eq!(pipeline.on_frame(&frame, WIDTH, HEIGHT, Some(METADATA)), FrameDecision::Skipped);
    assert!(pipeline.on_frame(&frame, WIDTH, HEIGHT, Some(METADATA)).is_admitted());
    next_event(&mut events).await;

    assert_eq!(pipeline.stats().gate.skipped_divisor, 1);
}

#[tokio::test]
async fn test_every_admitted_frame_releases_once() {
    let pipeline = FramePipeline::new(
        PipelineConfig::default(),
        Arc::new(LumaThresholdDetector::new(200)),
    )
    .unwrap();
    let frame = white_frame();
    let short = vec![0u8; 16];

    for i in 0..50 {
        let data: &[u8] = if i % 3 == 0 { &short } else { &frame };
        let metadata = if i % 5 == 0 { None } else { Some(METADATA) };
        pipeline.on_frame(data, WIDTH, HEIGHT, metadata);
        tokio::task::yield_now().await;
    }

    assert!(pipeline.wait_idle(Duration::from_secs(10)).await);

    let stats = pipeline.stats();
    assert_eq!(stats.gate.arrivals, 50);
    assert_eq!(stats.gate.admitted, stats.gate.released);
    assert_eq!(stats.gate.admitted, stats.completed + stats.failed);
    assert_eq!(stats.gate.admitted + stats.gate.dropped_busy, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stats_settled_when_idle() {
    let pipeline = FramePipeline::new(
        PipelineConfig::default(),
        Arc::new(LumaThresholdDetector::new(200)),
    )
    .unwrap();
    let frame = white_frame();

    for i in 0..20u64 {
        assert_eq!(
            pipeline.on_frame(&frame, WIDTH, HEIGHT, Some(METADATA)),
            FrameDecision::Admitted(i)
        );
        assert!(pipeline.wait_idle(Duration::from_secs(10)).await);

        let stats = pipeline.stats();
        assert_eq!(stats.completed, i + 1);
        assert_eq!(stats.detections, i + 1);
        assert_eq!(stats.gate.released, i + 1);
        assert!(pipeline.last_detection().is_some());
    }
}

#[tokio::test]
async fn test_wait_idle_times_out_while_detector_blocks() {
    let (detector, proceed) = GatedDetector::new();
    let pipeline = FramePipeline::new(PipelineConfig::default(), Arc::new(detector)).unwrap();

    assert!(pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, Some(METADATA)).is_admitted());
    assert!(!pipeline.wait_idle(Duration::from_millis(50)).await);

    proceed.send(()).unwrap();
    assert!(pipeline.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(pipeline.stats().completed, 1);
}

#[tokio::test]
async fn test_wait_idle_without_frames_returns_immediately() {
    let pipeline = FramePipeline::new(
        PipelineConfig::default(),
        Arc::new(LumaThresholdDetector::new(200)),
    )
    .unwrap();
    assert!(pipeline.wait_idle(Duration::ZERO).await);
}

#[tokio::test]
async fn test_debug_dump_writes_png() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::default();
    config.debug_dump_dir = Some(tmp.path().to_path_buf());
    let pipeline = FramePipeline::new(config, Arc::new(LumaThresholdDetector::new(200))).unwrap();
    let mut events = pipeline.subscribe();

    pipeline.on_frame(&white_frame(), WIDTH, HEIGHT, Some(METADATA));
    assert!(!next_event(&mut events).await.is_failure());
    assert!(tmp.path().join("frame_000000.png").exists());
}
