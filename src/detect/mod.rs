mod mapping;
mod result;
mod wire;

pub use mapping::{map_detections, normalize_ppe_kind, DEFAULT_REQUIRED_PPE};
pub use result::{BBox, Detection, DetectionOutcome, PpeItemStatus};
pub use wire::{DetectFrameResponse, RawDetection, RecordedViolation, RecordingStats, WireBox, WirePpeItem};
