//! ppe_live - live PPE detection against one camera.
//!
//! 1. Loads `MonitorConfig` (file + `PPE_*` env), then applies CLI overrides
//! 2. Verifies the signed-in role may run detection
//! 3. Runs the capture/inference/render pipeline until Ctrl-C
//! 4. Logs each detection outcome and writes overlay snapshots for recorded
//!    violations
//!
//! The session is ended on the first 401; the daemon then exits.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ppe_monitor::api::{ApiClient, ApiErrorKind, DetectionApi};
use ppe_monitor::config::MonitorConfig;
use ppe_monitor::overlay::encode_jpeg;
use ppe_monitor::pipeline::{DetectionPipeline, FrameSink, OutcomeCallback};
use ppe_monitor::roles::Capability;
use ppe_monitor::session::{
    FileTokenStore, MemoryTokenStore, SessionEvent, SessionEvents, TokenStore,
};
use ppe_monitor::{open_source, DetectionOutcome};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run live PPE detection against a camera")]
struct Args {
    /// Camera URL (`stub://name`, or an http(s) MJPEG/JPEG endpoint).
    #[arg(long)]
    camera_url: Option<String>,

    /// Camera identifier sent with each frame.
    #[arg(long)]
    camera_id: Option<String>,

    /// Domain identifier sent with each frame.
    #[arg(long)]
    domain_id: Option<String>,

    /// Detection confidence threshold (0.0-1.0).
    #[arg(long)]
    confidence: Option<f32>,

    /// Milliseconds between inference ticks.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Directory for overlay snapshots of recorded violations.
    #[arg(long, env = "PPE_SNAPSHOT_DIR")]
    snapshot_dir: Option<PathBuf>,

    /// Continuously rewrite this JPEG with the latest overlay frame.
    #[arg(long)]
    preview: Option<PathBuf>,

    /// Skip the role check against /api/v1/auth/me.
    #[arg(long)]
    skip_role_check: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = MonitorConfig::load()?;
    if let Some(url) = args.camera_url {
        cfg.camera.url = url;
    }
    if let Some(id) = args.camera_id {
        ppe_monitor::validate_id("camera", &id)?;
        cfg.camera.camera_id = Some(id);
    }
    if let Some(id) = args.domain_id {
        ppe_monitor::validate_id("domain", &id)?;
        cfg.camera.domain_id = Some(id);
    }
    if let Some(confidence) = args.confidence {
        cfg.detection.confidence = confidence;
    }
    if let Some(ms) = args.interval_ms {
        cfg.detection.interval = Duration::from_millis(ms);
    }

    let tokens: Arc<dyn TokenStore> = match &cfg.token_path {
        Some(path) => Arc::new(FileTokenStore::new(path)),
        None => Arc::new(MemoryTokenStore::new()),
    };
    let session = SessionEvents::new();
    let logout = session.subscribe();
    let api = Arc::new(
        ApiClient::new(&cfg.api_url, tokens.clone(), session)?.with_timeout(cfg.request_timeout),
    );

    if !args.skip_role_check && tokens.token().is_some() {
        match api.current_user() {
            Ok(user) => {
                user.role.require(Capability::RunDetection)?;
                log::info!("signed in as {} ({:?})", user.username, user.role);
            }
            Err(e) if e.kind() == ApiErrorKind::Unauthorized => {
                return Err(anyhow!("session expired; sign in again"));
            }
            Err(e) => log::warn!("could not verify role: {}", e),
        }
    }

    if let Some(dir) = &args.snapshot_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
    }
    let snapshot_dir = args.snapshot_dir.clone();
    let on_result: OutcomeCallback = Arc::new(move |outcome: DetectionOutcome| {
        report_outcome(&outcome);
        if let (Some(dir), Some(jpeg)) = (&snapshot_dir, &outcome.frame_snapshot) {
            if let Err(e) = write_snapshot(dir, &outcome, jpeg) {
                log::warn!("snapshot not written: {:#}", e);
            }
        }
    });

    let source = open_source(&cfg.camera)?;
    let sink: Option<Box<dyn FrameSink>> = args.preview.map(|path| {
        Box::new(PreviewFile::new(path, Duration::from_secs(1), cfg.detection.jpeg_quality))
            as Box<dyn FrameSink>
    });
    let detector: Arc<dyn DetectionApi> = api;
    let pipeline = DetectionPipeline::new(detector, cfg.pipeline_options(), on_result)?;
    let handle = pipeline.start(source, sink)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("ppe_live running against {} (Ctrl-C to stop)", cfg.camera.url);
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping pipeline...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if let Ok(SessionEvent::LoggedOut { redirect_to }) = logout.try_recv() {
            log::error!("session ended by server; sign in again at {}", redirect_to);
            break;
        }
    }

    let pipeline = handle.pipeline().clone();
    handle.stop()?;
    let stats = pipeline.stats();
    log::info!(
        "pipeline stopped: {} submitted, {} dropped, {} applied, {} failed",
        stats.ticks_submitted,
        stats.ticks_dropped,
        stats.responses_applied,
        stats.responses_failed
    );
    Ok(())
}

fn report_outcome(outcome: &DetectionOutcome) {
    let people = outcome.detections.len();
    let violating = outcome.violation_count();
    if violating == 0 {
        log::debug!("{} people, all compliant", people);
        return;
    }
    for det in outcome.detections.iter().filter(|d| !d.compliance()) {
        let missing: Vec<&str> = det.missing_ppe().iter().map(|k| k.as_str()).collect();
        log::info!("{} missing {}", det.person_id, missing.join(", "));
    }
    for recorded in &outcome.violations_recorded {
        log::warn!(
            "violation {} recorded ({}, {})",
            recorded.id,
            recorded.violation_type.as_deref().unwrap_or("ppe"),
            recorded.severity
        );
    }
    if let Some(stats) = &outcome.recording_stats {
        log::debug!(
            "recording: {} recorded, {} skipped, cooldown {}",
            stats.recorded,
            stats.skipped,
            stats.cooldown_active
        );
    }
}

fn write_snapshot(dir: &Path, outcome: &DetectionOutcome, jpeg: &[u8]) -> Result<()> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let ids: Vec<&str> = outcome
        .violations_recorded
        .iter()
        .map(|v| v.id.as_str())
        .collect();
    let path = dir.join(format!("violation-{}-{}.jpg", stamp, ids.join("_")));
    std::fs::write(&path, jpeg).with_context(|| format!("write {}", path.display()))?;
    log::info!("snapshot written to {}", path.display());
    Ok(())
}

/// Rewrites one JPEG at most once per `every`.
struct PreviewFile {
    path: PathBuf,
    every: Duration,
    quality: u8,
    last_write: Option<Instant>,
}

impl PreviewFile {
    fn new(path: PathBuf, every: Duration, quality: u8) -> Self {
        Self {
            path,
            every,
            quality,
            last_write: None,
        }
    }
}

impl FrameSink for PreviewFile {
    fn present(&mut self, image: &RgbImage) -> Result<()> {
        if self.last_write.is_some_and(|at| at.elapsed() < self.every) {
            return Ok(());
        }
        let jpeg = encode_jpeg(image, self.quality)?;
        let tmp = self.path.with_extension("jpg.tmp");
        std::fs::write(&tmp, jpeg).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        self.last_write = Some(Instant::now());
        Ok(())
    }
}
