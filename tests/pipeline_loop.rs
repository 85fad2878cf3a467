use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbImage;

use ppe_monitor::api::{ApiError, DetectionApi, FrameSubmission};
use ppe_monitor::detect::DetectFrameResponse;
use ppe_monitor::ingest::{SyntheticConfig, SyntheticSource};
use ppe_monitor::pipeline::{DetectionPipeline, FrameSink, OutcomeCallback, PipelineOptions};
use ppe_monitor::DetectionOutcome;

/// Slow fake backend that records how many calls overlap.
struct SlowApi {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
    body: &'static str,
}

impl SlowApi {
    fn new(delay: Duration, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            body,
        })
    }
}

impl DetectionApi for SlowApi {
    fn detect_frame(&self, submission: &FrameSubmission) -> Result<DetectFrameResponse, ApiError> {
        assert!(submission.jpeg.starts_with(&[0xFF, 0xD8]), "frame is not a JPEG");
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);
        serde_json::from_str(self.body).map_err(|e| ApiError::Network(e.to_string()))
    }
}

struct CountingSink {
    presented: Arc<AtomicUsize>,
    size: Arc<Mutex<Option<(u32, u32)>>>,
}

impl FrameSink for CountingSink {
    fn present(&mut self, image: &RgbImage) -> Result<()> {
        self.presented.fetch_add(1, Ordering::SeqCst);
        *self.size.lock().unwrap() = Some(image.dimensions());
        Ok(())
    }
}

fn source(width: u32, height: u32) -> Box<SyntheticSource> {
    Box::new(SyntheticSource::new(SyntheticConfig {
        url: "stub://dock".into(),
        target_fps: 50,
        width,
        height,
    }))
}

fn options(interval_ms: u64) -> PipelineOptions {
    PipelineOptions {
        interval: Duration::from_millis(interval_ms),
        render_fps: 30,
        camera_id: Some("dock-1".into()),
        ..PipelineOptions::default()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

const VIOLATION: &str = r#"{"success":true,
    "detections":[{"person_id":3,"bbox":[4,4,40,44],"missing_ppe":["hardhat"],
                   "ppe_detected":[{"type":"vest","confidence":0.8}]}],
    "violations_recorded":[{"id":77,"person_id":3,"violation_type":"no_hardhat","severity":"high"}]}"#;

#[test]
fn never_more_than_one_request_in_flight() {
    let api = SlowApi::new(Duration::from_millis(120), r#"{"success":true,"detections":[]}"#);
    let outcomes = Arc::new(AtomicUsize::new(0));
    let counter = outcomes.clone();
    let on_result: OutcomeCallback = Arc::new(move |_outcome: DetectionOutcome| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let detector: Arc<dyn DetectionApi> = api.clone();
    let pipeline = DetectionPipeline::new(detector, options(20), on_result).expect("pipeline");
    let handle = pipeline.start(source(32, 24), None).expect("start");

    assert!(wait_until(Duration::from_secs(3), || {
        api.calls.load(Ordering::SeqCst) >= 3
    }));
    let pipeline = handle.pipeline().clone();
    handle.stop().expect("stop");

    assert_eq!(api.max_active.load(Ordering::SeqCst), 1);
    let stats = pipeline.stats();
    assert!(stats.ticks_dropped > 0, "{:?}", stats);
    assert!(stats.responses_applied >= 2);
    assert!(outcomes.load(Ordering::SeqCst) >= 2);
}

#[test]
fn violations_produce_snapshot_and_overlay_frames() {
    let api = SlowApi::new(Duration::from_millis(5), VIOLATION);
    let snapshots: Arc<Mutex<Vec<DetectionOutcome>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = snapshots.clone();
    let on_result: OutcomeCallback = Arc::new(move |outcome: DetectionOutcome| {
        seen.lock().unwrap().push(outcome);
    });

    let presented = Arc::new(AtomicUsize::new(0));
    let size = Arc::new(Mutex::new(None));
    let sink = CountingSink {
        presented: presented.clone(),
        size: size.clone(),
    };

    let detector: Arc<dyn DetectionApi> = api;
    let pipeline = DetectionPipeline::new(detector, options(50), on_result).expect("pipeline");
    let handle = pipeline
        .start(source(64, 48), Some(Box::new(sink)))
        .expect("start");

    assert!(wait_until(Duration::from_secs(3), || {
        !snapshots.lock().unwrap().is_empty() && presented.load(Ordering::SeqCst) > 0
    }));
    let overlay = handle.overlay();
    handle.stop().expect("stop");

    assert_eq!(*size.lock().unwrap(), Some((64, 48)));
    assert_eq!(overlay.detections.len(), 1);
    assert_eq!((overlay.frame_width, overlay.frame_height), (64, 48));

    let outcomes = snapshots.lock().unwrap();
    let first = &outcomes[0];
    assert_eq!(first.violation_count(), 1);
    assert_eq!(first.violations_recorded[0].id, "77");
    let det = &first.detections[0];
    assert!(!det.compliance());
    assert!(det.missing_ppe().contains("hardhat"));
    let jpeg = first.frame_snapshot.as_ref().expect("snapshot for recorded violation");
    assert!(jpeg.starts_with(&[0xFF, 0xD8]));
}

#[test]
fn stop_releases_threads_and_drops_late_responses() {
    let api = SlowApi::new(Duration::from_millis(300), VIOLATION);
    let applied_after_stop = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let (flag, gate) = (applied_after_stop.clone(), stopped.clone());
    let on_result: OutcomeCallback = Arc::new(move |_outcome: DetectionOutcome| {
        if gate.load(Ordering::SeqCst) {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let detector: Arc<dyn DetectionApi> = api.clone();
    let pipeline = DetectionPipeline::new(detector, options(20), on_result).expect("pipeline");
    let handle = pipeline.start(source(16, 16), None).expect("start");
    assert!(wait_until(Duration::from_secs(2), || {
        handle.pipeline().is_in_flight()
    }));

    let pipeline = handle.pipeline().clone();
    let latest = handle.latest_frame();
    assert!(latest.is_some());
    let started = Instant::now();
    handle.stop().expect("stop");
    stopped.store(true, Ordering::SeqCst);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!pipeline.is_mounted());

    // The in-flight worker finishes on its own; its result must not land.
    assert!(wait_until(Duration::from_secs(2), || !pipeline.is_in_flight()));
    assert!(!applied_after_stop.load(Ordering::SeqCst));
    assert_eq!(pipeline.stats().responses_discarded, 1);
    assert!(pipeline.overlay().detections.is_empty());
}
