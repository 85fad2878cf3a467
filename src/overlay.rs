//! Overlay rendering.
//!
//! Draws detection boxes (green compliant, red violation) and one status
//! badge per equipment kind onto a copy of the frame. Drawing is clipped to
//! the raster, and boxes are clamped again at draw time so an overlay built
//! for a different frame size still stays in bounds.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::time::Instant;

use crate::detect::{BBox, Detection};
use crate::frame::Frame;

pub const COMPLIANT_COLOR: Rgb<u8> = Rgb([0, 200, 83]);
pub const VIOLATION_COLOR: Rgb<u8> = Rgb([229, 57, 53]);
const BADGE_BORDER: Rgb<u8> = Rgb([255, 255, 255]);

const STROKE_PX: u32 = 3;
const BADGE_PX: u32 = 10;
const BADGE_GAP_PX: u32 = 3;

/// Detections currently painted over the live feed.
///
/// Replaced wholesale on each successful inference; left untouched when a
/// tick fails so the overlay goes stale rather than blank.
#[derive(Clone, Debug, Default)]
pub struct OverlayState {
    pub detections: Vec<Detection>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub updated_at: Option<Instant>,
    pub generation: u64,
}

impl OverlayState {
    pub fn replace(&mut self, detections: Vec<Detection>, frame_width: u32, frame_height: u32) {
        self.detections = detections;
        self.frame_width = frame_width;
        self.frame_height = frame_height;
        self.updated_at = Some(Instant::now());
        self.generation += 1;
    }

    pub fn violation_count(&self) -> usize {
        self.detections.iter().filter(|d| !d.compliance()).count()
    }
}

/// Render `detections` over `frame`.
pub fn render_overlay(frame: &Frame, detections: &[Detection]) -> Result<RgbImage> {
    let mut canvas = frame.to_image()?;
    draw_detections(&mut canvas, detections);
    Ok(canvas)
}

pub fn draw_detections(canvas: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = canvas.dimensions();
    for det in detections {
        let color = if det.compliance() {
            COMPLIANT_COLOR
        } else {
            VIOLATION_COLOR
        };
        let bbox = det.bbox.clamp_to(width, height);
        if bbox.is_empty() {
            continue;
        }
        stroke_rect(canvas, bbox, STROKE_PX, color);

        let badge_y = (bbox.y as i64) - (BADGE_PX + BADGE_GAP_PX) as i64;
        let badge_y = if badge_y < 0 {
            bbox.y as i64 + STROKE_PX as i64 + BADGE_GAP_PX as i64
        } else {
            badge_y
        };
        let mut badge_x = bbox.x as i64 + STROKE_PX as i64;
        for status in det.ppe_status.values() {
            let badge_color = if status.detected {
                COMPLIANT_COLOR
            } else {
                VIOLATION_COLOR
            };
            fill_rect(canvas, badge_x, badge_y, BADGE_PX, BADGE_PX, BADGE_BORDER);
            fill_rect(
                canvas,
                badge_x + 1,
                badge_y + 1,
                BADGE_PX - 2,
                BADGE_PX - 2,
                badge_color,
            );
            badge_x += (BADGE_PX + BADGE_GAP_PX) as i64;
        }
    }
}

fn stroke_rect(canvas: &mut RgbImage, bbox: BBox, stroke: u32, color: Rgb<u8>) {
    let x0 = bbox.x.floor() as i64;
    let y0 = bbox.y.floor() as i64;
    let w = bbox.w.round() as u32;
    let h = bbox.h.round() as u32;
    if w == 0 || h == 0 {
        return;
    }
    let sw = stroke.min(w);
    let sh = stroke.min(h);
    fill_rect(canvas, x0, y0, w, sh, color);
    fill_rect(canvas, x0, y0 + h as i64 - sh as i64, w, sh, color);
    fill_rect(canvas, x0, y0, sw, h, color);
    fill_rect(canvas, x0 + w as i64 - sw as i64, y0, sw, h, color);
}

fn fill_rect(canvas: &mut RgbImage, x: i64, y: i64, w: u32, h: u32, color: Rgb<u8>) {
    let (cw, ch) = canvas.dimensions();
    let x_start = x.max(0);
    let y_start = y.max(0);
    let x_end = (x + w as i64).min(cw as i64);
    let y_end = (y + h as i64).min(ch as i64);
    for py in y_start..y_end {
        for px in x_start..x_end {
            canvas.put_pixel(px as u32, py as u32, color);
        }
    }
}

/// Encode a raster as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode_image(image).context("encode jpeg")?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::PpeItemStatus;
    use std::collections::{BTreeMap, BTreeSet};

    fn detection(bbox: BBox, missing: &[&str]) -> Detection {
        let mut status = BTreeMap::new();
        for kind in ["hardhat", "vest"] {
            status.insert(
                kind.to_string(),
                PpeItemStatus {
                    detected: !missing.contains(&kind),
                    confidence: 0.9,
                },
            );
        }
        let missing: BTreeSet<String> = missing.iter().map(|s| s.to_string()).collect();
        Detection::new("1".into(), None, bbox, status, missing)
    }

    fn black_frame(w: u32, h: u32) -> Frame {
        Frame::new(vec![0; (w * h * 3) as usize], w, h).unwrap()
    }

    #[test]
    fn compliant_box_is_green_and_violation_red() {
        let frame = black_frame(100, 100);
        let dets = vec![
            detection(BBox::new(10.0, 30.0, 20.0, 20.0), &[]),
            detection(BBox::new(60.0, 30.0, 20.0, 20.0), &["vest"]),
        ];
        let out = render_overlay(&frame, &dets).unwrap();
        assert_eq!(*out.get_pixel(10, 40), COMPLIANT_COLOR);
        assert_eq!(*out.get_pixel(60, 40), VIOLATION_COLOR);
        // interior untouched
        assert_eq!(*out.get_pixel(20, 40), Rgb([0, 0, 0]));
    }

    #[test]
    fn badges_follow_item_status() {
        let frame = black_frame(100, 100);
        let dets = vec![detection(BBox::new(20.0, 40.0, 40.0, 40.0), &["vest"])];
        let out = render_overlay(&frame, &dets).unwrap();
        let badge_y = 40 - (BADGE_PX + BADGE_GAP_PX) + BADGE_PX / 2;
        let first = 20 + STROKE_PX + BADGE_PX / 2;
        let second = first + BADGE_PX + BADGE_GAP_PX;
        // BTreeMap order: hardhat, vest
        assert_eq!(*out.get_pixel(first, badge_y), COMPLIANT_COLOR);
        assert_eq!(*out.get_pixel(second, badge_y), VIOLATION_COLOR);
    }

    #[test]
    fn out_of_frame_boxes_do_not_panic() {
        let frame = black_frame(16, 8);
        let dets = vec![
            detection(BBox::new(12.0, 6.0, 500.0, 500.0), &["hardhat"]),
            detection(BBox::new(-40.0, -40.0, 10.0, 10.0), &[]),
        ];
        let out = render_overlay(&frame, &dets).unwrap();
        assert_eq!(out.dimensions(), (16, 8));
    }

    #[test]
    fn boxes_past_the_edge_paint_nothing() {
        let frame = black_frame(32, 32);
        let dets = vec![
            detection(BBox::new(40.0, 10.0, 20.0, 20.0), &["vest"]),
            detection(BBox::new(4.0, -60.0, 20.0, 20.0), &[]),
        ];
        let out = render_overlay(&frame, &dets).unwrap();
        assert!(out.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn encodes_jpeg_with_soi_marker() {
        let image = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let bytes = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn overlay_state_generation_advances() {
        let mut state = OverlayState::default();
        state.replace(vec![detection(BBox::default(), &["vest"])], 10, 10);
        assert_eq!(state.generation, 1);
        assert_eq!(state.violation_count(), 1);
    }
}
