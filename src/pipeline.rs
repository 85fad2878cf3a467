//! Detection/overlay pipeline.
//!
//! Three loops share one `FrameSlot`:
//! - capture: pulls frames from the `FrameSource` and keeps the latest
//! - ticker: every `interval`, submits the latest frame for inference unless
//!   a request is already in flight (the tick is then dropped, not queued)
//! - render: every `1/render_fps`, paints the current overlay onto the
//!   latest frame and hands it to an optional `FrameSink`
//!
//! Inference requests run on short-lived worker threads guarded by an
//! `InFlightGate`. A response that arrives after `stop()` is discarded.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::api::{ApiError, DetectionApi, FrameSubmission};
use crate::detect::{map_detections, DetectFrameResponse, DetectionOutcome, DEFAULT_REQUIRED_PPE};
use crate::frame::{Frame, FrameSlot};
use crate::ingest::FrameSource;
use crate::overlay::{draw_detections, encode_jpeg, render_overlay, OverlayState};

const CAPTURE_RETRY: Duration = Duration::from_millis(500);
const LOOP_SLICE: Duration = Duration::from_millis(10);
pub const MAX_RENDER_FPS: u32 = 120;

pub type OutcomeCallback = Arc<dyn Fn(DetectionOutcome) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub interval: Duration,
    pub render_fps: u32,
    pub confidence: f32,
    pub camera_id: Option<String>,
    pub domain_id: Option<String>,
    pub required_ppe: Vec<String>,
    pub jpeg_quality: u8,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            render_fps: 15,
            confidence: 0.5,
            camera_id: None,
            domain_id: None,
            required_ppe: DEFAULT_REQUIRED_PPE.iter().map(|k| k.to_string()).collect(),
            jpeg_quality: 80,
        }
    }
}

impl PipelineOptions {
    /// Time between render ticks, never shorter than one tick at
    /// `MAX_RENDER_FPS`.
    pub fn render_period(&self) -> Duration {
        let fps = self.render_fps.clamp(1, MAX_RENDER_FPS);
        Duration::from_secs(1) / fps
    }
}

/// Receives rendered overlay frames from the render loop.
pub trait FrameSink: Send {
    fn present(&mut self, image: &RgbImage) -> Result<()>;
}

/// At-most-one-in-flight guard for inference requests.
#[derive(Clone, Debug, Default)]
pub struct InFlightGate {
    busy: Arc<AtomicBool>,
}

impl InFlightGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while another request holds the gate.
    pub fn try_acquire(&self) -> Option<InFlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the gate on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Submitted,
    /// A request was already in flight.
    Dropped,
    /// No frame, a zero-sized frame, or the pipeline is stopped.
    Skipped,
    /// The frame could not be encoded or the worker could not start.
    Failed,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    ticks_submitted: AtomicU64,
    ticks_dropped: AtomicU64,
    ticks_skipped: AtomicU64,
    responses_applied: AtomicU64,
    responses_failed: AtomicU64,
    responses_discarded: AtomicU64,
    frames_rendered: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineCounts {
    pub ticks_submitted: u64,
    pub ticks_dropped: u64,
    pub ticks_skipped: u64,
    pub responses_applied: u64,
    pub responses_failed: u64,
    pub responses_discarded: u64,
    pub frames_rendered: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineCounts {
        PipelineCounts {
            ticks_submitted: self.ticks_submitted.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            responses_applied: self.responses_applied.load(Ordering::Relaxed),
            responses_failed: self.responses_failed.load(Ordering::Relaxed),
            responses_discarded: self.responses_discarded.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Clone)]
pub struct DetectionPipeline {
    api: Arc<dyn DetectionApi>,
    options: Arc<PipelineOptions>,
    on_result: OutcomeCallback,
    gate: InFlightGate,
    mounted: Arc<AtomicBool>,
    overlay: Arc<RwLock<OverlayState>>,
    stats: Arc<PipelineStats>,
}

impl DetectionPipeline {
    pub fn new(
        api: Arc<dyn DetectionApi>,
        options: PipelineOptions,
        on_result: OutcomeCallback,
    ) -> Result<Self> {
        if options.interval.is_zero() {
            return Err(anyhow!("detection interval must be non-zero"));
        }
        if !(0.0..=1.0).contains(&options.confidence) {
            return Err(anyhow!(
                "confidence must be within 0.0..=1.0 (got {})",
                options.confidence
            ));
        }
        if !(1..=MAX_RENDER_FPS).contains(&options.render_fps) {
            return Err(anyhow!(
                "render fps must be within 1..={} (got {})",
                MAX_RENDER_FPS,
                options.render_fps
            ));
        }
        Ok(Self {
            api,
            options: Arc::new(options),
            on_result,
            gate: InFlightGate::new(),
            mounted: Arc::new(AtomicBool::new(true)),
            overlay: Arc::new(RwLock::new(OverlayState::default())),
            stats: Arc::new(PipelineStats::default()),
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn overlay(&self) -> OverlayState {
        self.overlay
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn overlay_generation(&self) -> u64 {
        self.overlay.read().map(|guard| guard.generation).unwrap_or(0)
    }

    pub fn stats(&self) -> PipelineCounts {
        self.stats.snapshot()
    }

    pub fn is_in_flight(&self) -> bool {
        self.gate.is_busy()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Stop applying responses. Requests already in flight finish but their
    /// results are dropped.
    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::SeqCst);
    }

    /// One inference tick against `frame`.
    pub fn tick(&self, frame: Option<Arc<Frame>>) -> TickOutcome {
        let Some(frame) = frame.filter(|f| f.has_dimensions()) else {
            bump(&self.stats.ticks_skipped);
            return TickOutcome::Skipped;
        };
        if !self.is_mounted() {
            bump(&self.stats.ticks_skipped);
            return TickOutcome::Skipped;
        }
        let Some(guard) = self.gate.try_acquire() else {
            bump(&self.stats.ticks_dropped);
            log::trace!("detection tick dropped; request in flight");
            return TickOutcome::Dropped;
        };

        let jpeg = match frame
            .to_image()
            .and_then(|image| encode_jpeg(&image, self.options.jpeg_quality))
        {
            Ok(jpeg) => jpeg,
            Err(e) => {
                log::warn!("detection tick: encode frame: {:#}", e);
                bump(&self.stats.responses_failed);
                return TickOutcome::Failed;
            }
        };
        let submission = FrameSubmission {
            jpeg,
            confidence: self.options.confidence,
            camera_id: self.options.camera_id.clone(),
            domain_id: self.options.domain_id.clone(),
        };

        let pipeline = self.clone();
        let spawned = std::thread::Builder::new()
            .name("ppe-detect".to_string())
            .spawn(move || {
                let result = pipeline.api.detect_frame(&submission);
                pipeline.complete(&frame, result);
                drop(guard);
            });
        match spawned {
            Ok(_) => {
                bump(&self.stats.ticks_submitted);
                TickOutcome::Submitted
            }
            Err(e) => {
                log::warn!("detection tick: spawn worker: {}", e);
                bump(&self.stats.responses_failed);
                TickOutcome::Failed
            }
        }
    }

    fn complete(&self, frame: &Frame, result: Result<DetectFrameResponse, ApiError>) {
        if !self.is_mounted() {
            bump(&self.stats.responses_discarded);
            log::debug!("discarding detection response received after stop");
            return;
        }
        let response = match result {
            Ok(response) if response.success => response,
            Ok(response) => {
                bump(&self.stats.responses_failed);
                log::warn!(
                    "detection rejected by server: {}",
                    response.message.as_deref().unwrap_or("no message")
                );
                return;
            }
            Err(e) => {
                bump(&self.stats.responses_failed);
                log::warn!("detection request failed: {}", e);
                return;
            }
        };

        let detections = map_detections(
            &response.detections,
            frame.width,
            frame.height,
            &self.options.required_ppe,
        );
        if let Ok(mut overlay) = self.overlay.write() {
            overlay.replace(detections.clone(), frame.width, frame.height);
        }
        bump(&self.stats.responses_applied);

        let frame_snapshot = if response.violations_recorded.is_empty() {
            None
        } else {
            match render_overlay(frame, &detections)
                .and_then(|image| encode_jpeg(&image, self.options.jpeg_quality))
            {
                Ok(jpeg) => Some(jpeg),
                Err(e) => {
                    log::warn!("overlay snapshot: {:#}", e);
                    None
                }
            }
        };

        (self.on_result)(DetectionOutcome {
            detections,
            violations_recorded: response.violations_recorded,
            recording_stats: response.recording_stats,
            frame_snapshot,
        });
    }

    /// Paint the current overlay onto `frame`.
    pub fn render(&self, frame: &Frame) -> Result<RgbImage> {
        let mut canvas = frame.to_image()?;
        if let Ok(overlay) = self.overlay.read() {
            draw_detections(&mut canvas, &overlay.detections);
        }
        Ok(canvas)
    }

    /// Connect `source` and run the capture, ticker and render loops.
    pub fn start(
        self,
        mut source: Box<dyn FrameSource>,
        sink: Option<Box<dyn FrameSink>>,
    ) -> Result<PipelineHandle> {
        source
            .connect()
            .with_context(|| format!("connect frame source {}", source.describe()))?;
        log::info!(
            "detection pipeline started: source {}, interval {:?}, confidence {:.2}",
            source.describe(),
            self.options.interval,
            self.options.confidence
        );

        let slot = FrameSlot::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut joins = Vec::new();

        joins.push(spawn_named("ppe-capture", {
            let slot = slot.clone();
            let shutdown = shutdown.clone();
            move || capture_loop(source, slot, shutdown)
        })?);

        joins.push(spawn_named("ppe-ticker", {
            let pipeline = self.clone();
            let slot = slot.clone();
            let shutdown = shutdown.clone();
            move || ticker_loop(pipeline, slot, shutdown)
        })?);

        if let Some(sink) = sink {
            joins.push(spawn_named("ppe-render", {
                let pipeline = self.clone();
                let slot = slot.clone();
                let shutdown = shutdown.clone();
                move || render_loop(pipeline, slot, sink, shutdown)
            })?);
        }

        Ok(PipelineHandle {
            pipeline: self,
            slot,
            shutdown,
            joins,
        })
    }
}

fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .with_context(|| format!("spawn {} thread", name))
}

fn capture_loop(mut source: Box<dyn FrameSource>, slot: FrameSlot, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        match source.next_frame() {
            Ok(frame) => slot.store(frame),
            Err(e) => {
                log::warn!("capture from {} failed: {:#}", source.describe(), e);
                std::thread::sleep(CAPTURE_RETRY);
                if !source.is_healthy() && !shutdown.load(Ordering::SeqCst) {
                    source.release();
                    if let Err(e) = source.connect() {
                        log::warn!("reconnect {} failed: {:#}", source.describe(), e);
                    }
                }
            }
        }
    }
    log::info!(
        "capture stopped after {} frames from {}",
        source.frames_captured(),
        source.describe()
    );
    source.release();
}

fn ticker_loop(pipeline: DetectionPipeline, slot: FrameSlot, shutdown: Arc<AtomicBool>) {
    let interval = pipeline.options.interval;
    let mut next_tick = Instant::now() + interval;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next_tick {
            pipeline.tick(slot.latest());
            next_tick += interval;
            if next_tick < now {
                next_tick = now + interval;
            }
        }
        std::thread::sleep(LOOP_SLICE.min(next_tick.saturating_duration_since(Instant::now())));
    }
}

fn render_loop(
    pipeline: DetectionPipeline,
    slot: FrameSlot,
    mut sink: Box<dyn FrameSink>,
    shutdown: Arc<AtomicBool>,
) {
    let period = pipeline.options.render_period();
    let mut last_rendered: Option<(Instant, u64)> = None;
    while !shutdown.load(Ordering::SeqCst) {
        let started = Instant::now();
        if let Some(frame) = slot.latest() {
            // Redraw only when the frame or the overlay changed.
            let key = (frame.captured_at, pipeline.overlay_generation());
            if last_rendered != Some(key) {
                match pipeline.render(&frame).and_then(|image| sink.present(&image)) {
                    Ok(()) => bump(&pipeline.stats.frames_rendered),
                    Err(e) => log::warn!("render: {:#}", e),
                }
                last_rendered = Some(key);
            }
        }
        let elapsed = started.elapsed();
        if elapsed < period {
            std::thread::sleep(period - elapsed);
        }
    }
}

/// Running pipeline. `stop()` cancels all loops and releases the source.
pub struct PipelineHandle {
    pipeline: DetectionPipeline,
    slot: FrameSlot,
    shutdown: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn pipeline(&self) -> &DetectionPipeline {
        &self.pipeline
    }

    pub fn overlay(&self) -> OverlayState {
        self.pipeline.overlay()
    }

    pub fn stats(&self) -> PipelineCounts {
        self.pipeline.stats()
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.slot.latest()
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<()> {
        self.pipeline.unmount();
        self.shutdown.store(true, Ordering::SeqCst);
        let mut panicked = false;
        for join in self.joins.drain(..) {
            panicked |= join.join().is_err();
        }
        self.slot.clear();
        if panicked {
            return Err(anyhow!("pipeline thread panicked"));
        }
        log::info!("detection pipeline stopped");
        Ok(())
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if !self.joins.is_empty() {
            let _ = self.shutdown_and_join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex;

    fn frame(width: u32, height: u32) -> Arc<Frame> {
        Arc::new(Frame::new(vec![0; (width * height * 3) as usize], width, height).unwrap())
    }

    fn response(json: &str) -> DetectFrameResponse {
        serde_json::from_str(json).unwrap()
    }

    /// Holds each request until the test releases it.
    struct GatedApi {
        release: Mutex<mpsc::Receiver<Result<DetectFrameResponse, ApiError>>>,
        calls: AtomicU64,
    }

    impl DetectionApi for GatedApi {
        fn detect_frame(&self, _s: &FrameSubmission) -> Result<DetectFrameResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release
                .lock()
                .unwrap()
                .recv()
                .unwrap_or_else(|_| Err(ApiError::Network("closed".into())))
        }
    }

    fn gated() -> (Arc<GatedApi>, mpsc::Sender<Result<DetectFrameResponse, ApiError>>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(GatedApi {
                release: Mutex::new(rx),
                calls: AtomicU64::new(0),
            }),
            tx,
        )
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn collector() -> (OutcomeCallback, Arc<Mutex<Vec<DetectionOutcome>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (
            Arc::new(move |outcome| sink.lock().unwrap().push(outcome)),
            seen,
        )
    }

    const ONE_PERSON: &str = r#"{"success":true,"detections":[{"person_id":1,
        "bbox":{"x":1200,"y":50,"w":150,"h":400},"missing_ppe":["vest"],
        "ppe_detected":[{"type":"hardhat","confidence":0.9}]}]}"#;

    #[test]
    fn gate_allows_one_holder() {
        let gate = InFlightGate::new();
        let guard = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(guard);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn render_period_is_never_zero() {
        let mut options = PipelineOptions::default();
        assert_eq!(options.render_period(), Duration::from_secs(1) / 15);
        options.render_fps = 5000;
        assert_eq!(options.render_period(), Duration::from_secs(1) / MAX_RENDER_FPS);
        assert!(!options.render_period().is_zero());

        let (api, _release) = gated();
        let (callback, _) = collector();
        assert!(DetectionPipeline::new(api, options, callback).is_err());
    }

    #[test]
    fn ticks_while_in_flight_are_dropped() {
        let (api, release) = gated();
        let (callback, seen) = collector();
        let pipeline = DetectionPipeline::new(api.clone(), PipelineOptions::default(), callback).unwrap();
        let f = frame(1280, 720);

        assert_eq!(pipeline.tick(Some(f.clone())), TickOutcome::Submitted);
        assert_eq!(pipeline.tick(Some(f.clone())), TickOutcome::Dropped);
        assert_eq!(pipeline.tick(Some(f.clone())), TickOutcome::Dropped);
        wait_until(|| api.calls.load(Ordering::SeqCst) == 1);

        release.send(Ok(response(ONE_PERSON))).unwrap();
        wait_until(|| !pipeline.is_in_flight());
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.stats().ticks_dropped, 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let det = &seen[0].detections[0];
        assert_eq!((det.bbox.x, det.bbox.w), (1200.0, 80.0));
        assert!(!det.compliance());
        assert!(seen[0].frame_snapshot.is_none());
    }

    #[test]
    fn skips_missing_or_empty_frames() {
        let (api, _release) = gated();
        let (callback, _) = collector();
        let pipeline = DetectionPipeline::new(api, PipelineOptions::default(), callback).unwrap();
        assert_eq!(pipeline.tick(None), TickOutcome::Skipped);
        assert_eq!(pipeline.tick(Some(frame(0, 0))), TickOutcome::Skipped);
        assert!(!pipeline.is_in_flight());
    }

    #[test]
    fn failure_keeps_previous_overlay() {
        let (api, release) = gated();
        let (callback, seen) = collector();
        let pipeline = DetectionPipeline::new(api, PipelineOptions::default(), callback).unwrap();
        let f = frame(1280, 720);

        pipeline.tick(Some(f.clone()));
        release.send(Ok(response(ONE_PERSON))).unwrap();
        wait_until(|| !pipeline.is_in_flight());
        let before = pipeline.overlay();
        assert_eq!(before.detections.len(), 1);

        pipeline.tick(Some(f.clone()));
        release
            .send(Err(ApiError::Server {
                status: 503,
                message: "busy".into(),
            }))
            .unwrap();
        wait_until(|| !pipeline.is_in_flight());
        let after = pipeline.overlay();
        assert_eq!(after.generation, before.generation);
        assert_eq!(after.detections, before.detections);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(pipeline.stats().responses_failed, 1);
    }

    #[test]
    fn recorded_violations_produce_snapshot() {
        let (api, release) = gated();
        let (callback, seen) = collector();
        let pipeline = DetectionPipeline::new(api, PipelineOptions::default(), callback).unwrap();
        pipeline.tick(Some(frame(64, 48)));
        release
            .send(Ok(response(
                r#"{"detections":[{"bbox":[4,4,20,30],"missing_ppe":["hardhat"]}],
                    "violations_recorded":[{"id":9,"violation_type":"no_hardhat"}],
                    "recording_stats":{"recorded":1,"skipped":0}}"#,
            )))
            .unwrap();
        wait_until(|| !seen.lock().unwrap().is_empty());
        let seen = seen.lock().unwrap();
        let snapshot = seen[0].frame_snapshot.as_ref().unwrap();
        assert_eq!(&snapshot[..2], &[0xFF, 0xD8]);
        assert_eq!(seen[0].violations_recorded.len(), 1);
    }

    #[test]
    fn late_response_after_unmount_is_discarded() {
        let (api, release) = gated();
        let (callback, seen) = collector();
        let pipeline = DetectionPipeline::new(api, PipelineOptions::default(), callback).unwrap();
        pipeline.tick(Some(frame(32, 32)));
        pipeline.unmount();
        release.send(Ok(response(ONE_PERSON))).unwrap();
        wait_until(|| !pipeline.is_in_flight());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(pipeline.overlay().generation, 0);
        assert_eq!(pipeline.stats().responses_discarded, 1);
    }

    #[test]
    fn rejects_bad_options() {
        let (api, _release) = gated();
        let (callback, _) = collector();
        let options = PipelineOptions {
            confidence: 1.5,
            ..PipelineOptions::default()
        };
        assert!(DetectionPipeline::new(api, options, callback).is_err());
    }
}
