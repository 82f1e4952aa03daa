// src/overlay.rs
//
// Rendering of detection results onto RGB frames: region shapes,
// outlines, bounding boxes, prediction circles, drift markers and event
// id labels. All operations are pure render-to-buffer with an opacity
// parameter, and rescale the stored masks when the target canvas size
// differs from the region's origin image size.

use crate::region::ConnectedRegion;
use crate::track::{Category, Track};
use crate::types::{Point, PointF, RgbFrame};
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::debug;

pub const COLOR_INTERESTING: [u8; 3] = [0, 255, 0];
pub const COLOR_CANDIDATE: [u8; 3] = [255, 255, 0];
pub const COLOR_PREDICTION: [u8; 3] = [64, 160, 255];
pub const COLOR_DRIFT: [u8; 3] = [255, 64, 64];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    None,
    Shape,
    Outline,
    BoundingBox,
}

#[derive(Debug, Clone)]
pub struct OverlayOptions {
    pub mode: DrawMode,
    pub opacity: f32,
    pub show_labels: bool,
    /// Render BORING events too (candidate color).
    pub show_boring: bool,
    pub min_event_frames: u32,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            mode: DrawMode::Outline,
            opacity: 1.0,
            show_labels: true,
            show_boring: true,
            min_event_frames: 5,
        }
    }
}

#[inline]
fn blend(dst: [u8; 3], color: [u8; 3], opacity: f32) -> [u8; 3] {
    let a = opacity.clamp(0.0, 1.0);
    [
        (color[0] as f32 * a + dst[0] as f32 * (1.0 - a)) as u8,
        (color[1] as f32 * a + dst[1] as f32 * (1.0 - a)) as u8,
        (color[2] as f32 * a + dst[2] as f32 * (1.0 - a)) as u8,
    ]
}

fn put(frame: &mut RgbFrame, x: i32, y: i32, color: [u8; 3], opacity: f32) {
    if x < 0 || y < 0 || x >= frame.width as i32 || y >= frame.height as i32 {
        return;
    }
    let dst = frame.pixel(x as usize, y as usize);
    frame.set_pixel(x as usize, y as usize, blend(dst, color, opacity));
}

/// Scale factors from the region's origin image to the target canvas.
fn region_scale(frame: &RgbFrame, region: &ConnectedRegion) -> (f32, f32) {
    let (iw, ih) = region.image_dims();
    (
        frame.width as f32 / iw as f32,
        frame.height as f32 / ih as f32,
    )
}

/// Draw a region according to `mode`, rescaling onto the target canvas.
pub fn draw_region(
    frame: &mut RgbFrame,
    region: &ConnectedRegion,
    mode: DrawMode,
    color: [u8; 3],
    opacity: f32,
) {
    if !region.is_valid() || mode == DrawMode::None {
        return;
    }
    let (sw, sh) = region_scale(frame, region);
    let bbox = region.bounding_box();
    let tx0 = (bbox.left as f32 * sw).floor() as i32;
    let ty0 = (bbox.top as f32 * sh).floor() as i32;
    let tx1 = ((bbox.right() + 1) as f32 * sw).ceil() as i32 - 1;
    let ty1 = ((bbox.bottom() + 1) as f32 * sh).ceil() as i32 - 1;

    match mode {
        DrawMode::None => {}
        DrawMode::Shape | DrawMode::Outline => {
            for ty in ty0..=ty1 {
                for tx in tx0..=tx1 {
                    // nearest-neighbor map back into the origin image
                    let sx = (tx as f32 / sw) as i32;
                    let sy = (ty as f32 / sh) as i32;
                    if !region.contains_image_pixel(sx, sy) {
                        continue;
                    }
                    if mode == DrawMode::Outline {
                        let interior = region.contains_image_pixel(sx - 1, sy)
                            && region.contains_image_pixel(sx + 1, sy)
                            && region.contains_image_pixel(sx, sy - 1)
                            && region.contains_image_pixel(sx, sy + 1);
                        if interior {
                            continue;
                        }
                    }
                    put(frame, tx, ty, color, opacity);
                }
            }
        }
        DrawMode::BoundingBox => {
            for tx in tx0..=tx1 {
                put(frame, tx, ty0, color, opacity);
                put(frame, tx, ty1, color, opacity);
            }
            for ty in ty0..=ty1 {
                put(frame, tx0, ty, color, opacity);
                put(frame, tx1, ty, color, opacity);
            }
        }
    }
}

/// Blank everything outside the region to `background`.
pub fn draw_masked_background(frame: &mut RgbFrame, region: &ConnectedRegion, background: [u8; 3]) {
    let (sw, sh) = region_scale(frame, region);
    for ty in 0..frame.height as i32 {
        for tx in 0..frame.width as i32 {
            let sx = (tx as f32 / sw) as i32;
            let sy = (ty as f32 / sh) as i32;
            if !region.contains_image_pixel(sx, sy) {
                frame.set_pixel(tx as usize, ty as usize, background);
            }
        }
    }
}

pub fn draw_circle(frame: &mut RgbFrame, center: Point, radius: i32, color: [u8; 3], opacity: f32) {
    let r = radius.max(1) as f32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let dist = ((dx * dx + dy * dy) as f32).sqrt();
            if (dist - r).abs() < 0.8 {
                put(frame, center.x + dx, center.y + dy, color, opacity);
            }
        }
    }
}

pub fn draw_disk(frame: &mut RgbFrame, center: Point, radius: i32, color: [u8; 3], opacity: f32) {
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put(frame, center.x + dx, center.y + dy, color, opacity);
            }
        }
    }
}

// 3x5 digit glyphs, rows top to bottom, 3 bits per row.
const DIGITS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111], // 0
    [0b010, 0b110, 0b010, 0b010, 0b111], // 1
    [0b111, 0b001, 0b111, 0b100, 0b111], // 2
    [0b111, 0b001, 0b111, 0b001, 0b111], // 3
    [0b101, 0b101, 0b111, 0b001, 0b001], // 4
    [0b111, 0b100, 0b111, 0b001, 0b111], // 5
    [0b111, 0b100, 0b111, 0b101, 0b111], // 6
    [0b111, 0b001, 0b010, 0b010, 0b010], // 7
    [0b111, 0b101, 0b111, 0b101, 0b111], // 8
    [0b111, 0b101, 0b111, 0b001, 0b111], // 9
];

/// Event id label in a 2x-scaled 3x5 pixel font.
pub fn draw_label(frame: &mut RgbFrame, origin: Point, number: u32, color: [u8; 3]) {
    const SCALE: i32 = 2;
    let digits: Vec<usize> = number
        .to_string()
        .bytes()
        .map(|b| (b - b'0') as usize)
        .collect();
    for (di, &d) in digits.iter().enumerate() {
        let gx = origin.x + di as i32 * 4 * SCALE;
        for (row, bits) in DIGITS[d].iter().enumerate() {
            for col in 0..3 {
                if bits & (0b100 >> col) != 0 {
                    for sy in 0..SCALE {
                        for sx in 0..SCALE {
                            put(
                                frame,
                                gx + col * SCALE + sx,
                                origin.y + row as i32 * SCALE + sy,
                                color,
                                1.0,
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Label position above the bounding box, shifted inside the canvas.
fn label_position(frame: &RgbFrame, region: &ConnectedRegion) -> Point {
    let (sw, sh) = region_scale(frame, region);
    let bbox = region.bounding_box();
    let mut x = (bbox.left as f32 * sw) as i32;
    let mut y = (bbox.top as f32 * sh) as i32 - 13;
    if y < 0 {
        y = (bbox.bottom() as f32 * sh) as i32 + 3;
    }
    x = x.clamp(0, frame.width as i32 - 1);
    Point::new(x, y)
}

/// Render every track observed at `frame_number` onto the frame, plus
/// the drift marker of the newest token that carries one.
pub fn render_tokens(
    frame: &mut RgbFrame,
    tracks: &[&Track],
    frame_number: u32,
    options: &OverlayOptions,
) {
    let mut drift: Option<PointF> = None;
    for track in tracks {
        let Some(token) = track.token_for_frame(frame_number) else {
            continue;
        };
        let category = track.category(options.min_event_frames);
        if category == Category::Boring && !options.show_boring {
            continue;
        }
        let color = match category {
            Category::Interesting => COLOR_INTERESTING,
            Category::Boring => COLOR_CANDIDATE,
        };

        if token.region.is_valid() {
            draw_region(frame, &token.region, options.mode, color, options.opacity);
        } else {
            debug!(id = track.id(), frame_number, "token region invalid, drawing marker");
            draw_circle(frame, token.location.round(), 6, color, options.opacity);
        }
        if let Some(prediction) = token.prediction {
            draw_circle(
                frame,
                prediction.round(),
                4,
                COLOR_PREDICTION,
                options.opacity,
            );
        }
        if options.show_labels {
            let pos = label_position(frame, &token.region);
            draw_label(frame, pos, track.id(), color);
        }
        if token.drift.is_some() {
            drift = token.drift;
        }
    }
    if let Some(foe) = drift {
        draw_disk(frame, foe.round(), 2, COLOR_DRIFT, 1.0);
    }
}

/// Writes annotated frames as PNG files.
pub struct OverlaySink {
    dir: PathBuf,
}

impl OverlaySink {
    pub fn new(dir: &str) -> Result<Self> {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating overlay directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn save(&self, frame: &RgbFrame, frame_number: u32) -> Result<()> {
        let path = self.dir.join(format!("overlay_{frame_number:06}.png"));
        let img: image::RgbImage = image::ImageBuffer::from_raw(
            frame.width as u32,
            frame.height as u32,
            frame.data.clone(),
        )
        .context("overlay frame buffer has the wrong length")?;
        img.save(&path)
            .with_context(|| format!("writing overlay {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GrayFrame;

    fn square_region(left: i32, top: i32, size: i32, img: usize) -> ConnectedRegion {
        let mut mask = GrayFrame::zeros(img, img);
        for y in top..top + size {
            for x in left..left + size {
                mask.set_pixel(x as usize, y as usize, 255);
            }
        }
        ConnectedRegion::from_seed(&mask, Point::new(left, top), 1).unwrap()
    }

    fn count_colored(frame: &RgbFrame, color: [u8; 3]) -> usize {
        let mut n = 0;
        for y in 0..frame.height {
            for x in 0..frame.width {
                if frame.pixel(x, y) == color {
                    n += 1;
                }
            }
        }
        n
    }

    #[test]
    fn test_shape_fill_at_full_opacity() {
        let region = square_region(10, 10, 5, 64);
        let mut frame = RgbFrame::filled(64, 64, [0, 0, 0]);
        draw_region(&mut frame, &region, DrawMode::Shape, [0, 255, 0], 1.0);
        assert_eq!(count_colored(&frame, [0, 255, 0]), 25);
    }

    #[test]
    fn test_outline_is_subset_of_shape() {
        let region = square_region(10, 10, 6, 64);
        let mut frame = RgbFrame::filled(64, 64, [0, 0, 0]);
        draw_region(&mut frame, &region, DrawMode::Outline, [0, 255, 0], 1.0);
        // 6x6 square ring: 36 - 16 interior
        assert_eq!(count_colored(&frame, [0, 255, 0]), 20);
    }

    #[test]
    fn test_bounding_box_corners() {
        let region = square_region(8, 8, 4, 32);
        let mut frame = RgbFrame::filled(32, 32, [0, 0, 0]);
        draw_region(&mut frame, &region, DrawMode::BoundingBox, [255, 0, 0], 1.0);
        assert_eq!(frame.pixel(8, 8), [255, 0, 0]);
        assert_eq!(frame.pixel(11, 11), [255, 0, 0]);
        assert_eq!(frame.pixel(9, 9), [0, 0, 0]);
    }

    #[test]
    fn test_rescale_doubles_extent() {
        // region extracted at 32x32, rendered onto 64x64
        let region = square_region(8, 8, 4, 32);
        let mut frame = RgbFrame::filled(64, 64, [0, 0, 0]);
        draw_region(&mut frame, &region, DrawMode::Shape, [0, 255, 0], 1.0);
        assert_eq!(count_colored(&frame, [0, 255, 0]), 64);
        assert_eq!(frame.pixel(16, 16), [0, 255, 0]);
        assert_eq!(frame.pixel(23, 23), [0, 255, 0]);
    }

    #[test]
    fn test_opacity_blend() {
        assert_eq!(blend([0, 0, 0], [255, 255, 255], 0.5), [127, 127, 127]);
        assert_eq!(blend([100, 0, 0], [255, 0, 0], 0.0), [100, 0, 0]);
    }

    #[test]
    fn test_masked_background() {
        let region = square_region(4, 4, 4, 16);
        let mut frame = RgbFrame::filled(16, 16, [9, 9, 9]);
        draw_masked_background(&mut frame, &region, [0, 0, 0]);
        assert_eq!(frame.pixel(5, 5), [9, 9, 9]);
        assert_eq!(frame.pixel(0, 0), [0, 0, 0]);
        assert_eq!(frame.pixel(12, 12), [0, 0, 0]);
    }

    #[test]
    fn test_label_draws_digits() {
        let mut frame = RgbFrame::filled(32, 32, [0, 0, 0]);
        draw_label(&mut frame, Point::new(2, 2), 42, [255, 255, 255]);
        assert!(count_colored(&frame, [255, 255, 255]) > 10);
    }

    #[test]
    fn test_region_scale_identity() {
        let region = square_region(4, 4, 4, 16);
        let frame = RgbFrame::filled(16, 16, [0, 0, 0]);
        assert_eq!(region_scale(&frame, &region), (1.0, 1.0));
    }
}
