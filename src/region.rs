// src/region.rs
//
// Connected foreground region extracted from a binary mask: area,
// sub-pixel centroid, tight bounding box, lazily computed second-moment
// shape descriptors, and optional intensity statistics. The building
// block every token of every track is made of.
//
// Invariant: a valid region has area > 0 and a bounding box that exactly
// encloses the nonzero pixels of its local mask (no empty border row or
// column). A violation after extraction is a defect in the extraction
// algorithm and is surfaced as a fatal error.

use crate::error::{CoreError, CoreResult};
use crate::types::{GrayFrame, Point, PointF, Rect};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

/// Normalized central second moments and the ellipse fit derived from
/// them. Orientation is measured clockwise from the horizontal axis in
/// degrees, [0, 180); degenerate fits clamp to 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapeMoments {
    pub uxx: f32,
    pub uyy: f32,
    pub uxy: f32,
    pub major_axis: f32,
    pub minor_axis: f32,
    pub elongation: f32,
    pub orientation: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityStats {
    pub max: f32,
    pub min: f32,
    pub avg: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedRegion {
    /// Binary mask local to the bounding box; nonzero = object.
    mask: GrayFrame,
    /// Bounding box in image coordinates.
    bbox: Rect,
    /// Centroid in image coordinates, sub-pixel.
    centroid: PointF,
    area: u32,
    /// Dimensions of the image the region was extracted from.
    image_width: usize,
    image_height: usize,
    /// Saliency strength (or other score), settable post-construction and
    /// propagated from token to token during tracking.
    score: f32,
    intensity: Option<IntensityStats>,
    #[serde(skip, default)]
    moments: OnceCell<ShapeMoments>,
}

impl ConnectedRegion {
    /// Flood-fill from `seed`; any pixel >= `threshold` is foreground.
    /// Fails with `EmptyRegion` when the seed lies on background.
    pub fn from_seed(img: &GrayFrame, seed: Point, threshold: u8) -> CoreResult<Self> {
        let (w, h) = img.dims();
        if seed.x < 0 || seed.y < 0 || seed.x >= w as i32 || seed.y >= h as i32 {
            return Err(CoreError::EmptyRegion);
        }
        if img.pixel(seed.x as usize, seed.y as usize) < threshold || threshold == 0 {
            return Err(CoreError::EmptyRegion);
        }

        let mut visited = vec![false; w * h];
        let mut stack = vec![(seed.x, seed.y)];
        visited[seed.y as usize * w + seed.x as usize] = true;
        let mut pixels: Vec<(i32, i32)> = Vec::new();

        while let Some((x, y)) = stack.pop() {
            pixels.push((x, y));
            for dy in -1..=1i32 {
                for dx in -1..=1i32 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= w as i32 || ny >= h as i32 {
                        continue;
                    }
                    let idx = ny as usize * w + nx as usize;
                    if !visited[idx] && img.data[idx] >= threshold {
                        visited[idx] = true;
                        stack.push((nx, ny));
                    }
                }
            }
        }

        let region = Self::from_pixels(&pixels, (w, h))?;
        region.verify_tight_bbox()?;
        Ok(region)
    }

    /// Treat the whole input as one pre-selected object: every nonzero
    /// pixel belongs to it, connected or not. Fails when the mask is
    /// empty.
    pub fn from_labeled_mask(img: &GrayFrame) -> CoreResult<Self> {
        let (w, h) = img.dims();
        let mut pixels: Vec<(i32, i32)> = Vec::new();
        for y in 0..h {
            for x in 0..w {
                if img.pixel(x, y) != 0 {
                    pixels.push((x as i32, y as i32));
                }
            }
        }
        Self::from_pixels(&pixels, (w, h))
    }

    fn from_pixels(pixels: &[(i32, i32)], image_dims: (usize, usize)) -> CoreResult<Self> {
        if pixels.is_empty() {
            return Err(CoreError::EmptyRegion);
        }

        let mut min_x = i32::MAX;
        let mut max_x = i32::MIN;
        let mut min_y = i32::MAX;
        let mut max_y = i32::MIN;
        let mut sum_x = 0i64;
        let mut sum_y = 0i64;
        for &(x, y) in pixels {
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
            sum_x += x as i64;
            sum_y += y as i64;
        }

        let bbox = Rect::from_corners(min_x, min_y, max_x, max_y);
        let mut mask = GrayFrame::zeros(bbox.width as usize, bbox.height as usize);
        for &(x, y) in pixels {
            mask.set_pixel((x - min_x) as usize, (y - min_y) as usize, 1);
        }

        let area = pixels.len() as u32;
        let centroid = PointF::new(
            sum_x as f32 / area as f32,
            sum_y as f32 / area as f32,
        );

        Ok(Self {
            mask,
            bbox,
            centroid,
            area,
            image_width: image_dims.0,
            image_height: image_dims.1,
            score: 0.0,
            intensity: None,
            moments: OnceCell::new(),
        })
    }

    /// The bounding box must touch nonzero pixels on all four edges of
    /// the local mask.
    fn verify_tight_bbox(&self) -> CoreResult<()> {
        let (w, h) = self.mask.dims();
        let row_occupied = |y: usize| (0..w).any(|x| self.mask.pixel(x, y) != 0);
        let col_occupied = |x: usize| (0..h).any(|y| self.mask.pixel(x, y) != 0);
        if row_occupied(0) && row_occupied(h - 1) && col_occupied(0) && col_occupied(w - 1) {
            Ok(())
        } else {
            Err(CoreError::InvariantViolation {
                detail: format!(
                    "bounding box {:?} does not tightly enclose the extracted mask",
                    self.bbox
                ),
            })
        }
    }

    pub fn is_valid(&self) -> bool {
        self.area > 0 && self.bbox.is_valid()
    }

    pub fn area(&self) -> u32 {
        self.area
    }

    pub fn centroid(&self) -> PointF {
        self.centroid
    }

    pub fn bounding_box(&self) -> Rect {
        self.bbox
    }

    /// Width/height of the bounding box.
    pub fn object_dims(&self) -> (i32, i32) {
        (self.bbox.width, self.bbox.height)
    }

    pub fn origin(&self) -> Point {
        Point::new(self.bbox.left, self.bbox.top)
    }

    /// Dimensions of the image this region was extracted from, used by
    /// the overlay renderer to rescale onto a different canvas.
    pub fn image_dims(&self) -> (usize, usize) {
        (self.image_width, self.image_height)
    }

    pub fn local_mask(&self) -> &GrayFrame {
        &self.mask
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn set_score(&mut self, score: f32) {
        self.score = score;
    }

    /// Object membership test in image coordinates.
    pub fn contains_image_pixel(&self, x: i32, y: i32) -> bool {
        if !self.bbox.contains(Point::new(x, y)) {
            return false;
        }
        self.mask
            .pixel((x - self.bbox.left) as usize, (y - self.bbox.top) as usize)
            != 0
    }

    /// Pixel-exact intersection test: bounding boxes first, then the two
    /// local masks ANDed over the overlap. Symmetric.
    pub fn intersects(&self, other: &ConnectedRegion) -> bool {
        self.overlap_area(other) > 0
    }

    /// Number of pixels shared with `other`; 0 when disjoint or when
    /// either region is invalid.
    pub fn overlap_area(&self, other: &ConnectedRegion) -> u32 {
        if !self.is_valid() || !other.is_valid() {
            return 0;
        }
        let Some(overlap) = self.bbox.intersect(&other.bbox) else {
            return 0;
        };
        let mut count = 0u32;
        for y in overlap.top..=overlap.bottom() {
            for x in overlap.left..=overlap.right() {
                let a = self
                    .mask
                    .pixel((x - self.bbox.left) as usize, (y - self.bbox.top) as usize);
                let b = other
                    .mask
                    .pixel((x - other.bbox.left) as usize, (y - other.bbox.top) as usize);
                if a != 0 && b != 0 {
                    count += 1;
                }
            }
        }
        count
    }

    /// Second-moment shape descriptors, computed on first use and cached.
    pub fn second_moments(&self) -> &ShapeMoments {
        self.moments.get_or_init(|| self.compute_second_moments())
    }

    fn compute_second_moments(&self) -> ShapeMoments {
        let (w, h) = self.mask.dims();
        // centroid in object coordinates
        let cen_x = self.centroid.x - self.bbox.left as f32;
        let cen_y = self.centroid.y - self.bbox.top as f32;

        let mut uxx = 0.0f32;
        let mut uyy = 0.0f32;
        let mut uxy = 0.0f32;
        for y in 0..h {
            let dy = y as f32 - cen_y;
            for x in 0..w {
                if self.mask.pixel(x, y) != 0 {
                    let dx = x as f32 - cen_x;
                    uxx += dx * dx;
                    uyy += dy * dy;
                    uxy += dx * dy;
                }
            }
        }
        let area = self.area as f32;
        uxx /= area;
        uyy /= area;
        uxy /= area;

        // ellipse d*x^2 + 2*e*x*y + f*y^2 <= 1
        let det = uxx * uyy - uxy * uxy;
        let coeff = if det > 0.0 { 1.0 / (4.0 * det) } else { 0.0 };
        let d = coeff * uyy;
        let e = -coeff * uxy;
        let f = coeff * uxx;

        // rotate so x is the main axis
        let expr = (4.0 * e * e + (d - f) * (d - f)).sqrt();
        let d2 = 0.5 * (d + f + expr);
        let f2 = 0.5 * (d + f - expr);

        // clockwise from horizontal: "--" 0, "\" 45, "|" 90, "/" 135
        let mut orientation = if d != f {
            90.0 * (2.0 * e / (d - f)).atan() / std::f32::consts::PI
        } else {
            0.0
        };
        if uyy > uxx {
            orientation += 90.0;
        }
        if orientation < 0.0 {
            orientation += 180.0;
        }
        if orientation.is_nan() {
            orientation = 0.0;
        }

        let major_axis = if f2 > 0.0 { 2.0 / f2.sqrt() } else { 0.0 };
        let minor_axis = if d2 > 0.0 { 2.0 / d2.sqrt() } else { 0.0 };
        let elongation = if minor_axis != 0.0 {
            major_axis / minor_axis
        } else {
            0.0
        };

        ShapeMoments {
            uxx,
            uyy,
            uxy,
            major_axis,
            minor_axis,
            elongation,
            orientation,
        }
    }

    /// Measure max/min/avg intensity over the object shape in `img`,
    /// which must have the dimensions the region was extracted at.
    pub fn measure_intensity(&mut self, img: &GrayFrame) -> CoreResult<()> {
        if img.dims() != (self.image_width, self.image_height) {
            return Err(CoreError::DimensionMismatch {
                detail: format!(
                    "intensity source is {}x{}, region origin image is {}x{}",
                    img.width, img.height, self.image_width, self.image_height
                ),
            });
        }
        let mut max = f32::MIN;
        let mut min = f32::MAX;
        let mut sum = 0.0f32;
        for y in 0..self.mask.height {
            for x in 0..self.mask.width {
                if self.mask.pixel(x, y) != 0 {
                    let v = img.pixel(
                        x + self.bbox.left as usize,
                        y + self.bbox.top as usize,
                    ) as f32;
                    max = max.max(v);
                    min = min.min(v);
                    sum += v;
                }
            }
        }
        self.intensity = Some(IntensityStats {
            max,
            min,
            avg: sum / self.area as f32,
        });
        Ok(())
    }

    pub fn intensity(&self) -> Option<IntensityStats> {
        self.intensity
    }
}

/// Extract every connected component inside `window` whose area falls in
/// `[min_area, max_area]`. Components are clipped at the window edges;
/// returned regions are in full-image coordinates.
pub fn extract_regions(
    img: &GrayFrame,
    window: &Rect,
    min_area: u32,
    max_area: u32,
) -> Vec<ConnectedRegion> {
    let Some(window) = window.clip_to(img.width, img.height) else {
        return Vec::new();
    };
    let crop = img.crop(&window);
    let (w, h) = crop.dims();

    let mut visited = vec![false; w * h];
    let mut out = Vec::new();

    for start_y in 0..h {
        for start_x in 0..w {
            let start_idx = start_y * w + start_x;
            if visited[start_idx] || crop.data[start_idx] == 0 {
                continue;
            }
            // flood this component, collecting full-image coordinates
            let mut pixels: Vec<(i32, i32)> = Vec::new();
            let mut stack = vec![(start_x as i32, start_y as i32)];
            visited[start_idx] = true;
            while let Some((x, y)) = stack.pop() {
                pixels.push((x + window.left, y + window.top));
                for dy in -1..=1i32 {
                    for dx in -1..=1i32 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let (nx, ny) = (x + dx, y + dy);
                        if nx < 0 || ny < 0 || nx >= w as i32 || ny >= h as i32 {
                            continue;
                        }
                        let idx = ny as usize * w + nx as usize;
                        if !visited[idx] && crop.data[idx] != 0 {
                            visited[idx] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }

            let area = pixels.len() as u32;
            if area < min_area || area > max_area {
                continue;
            }
            if let Ok(region) = ConnectedRegion::from_pixels(&pixels, img.dims()) {
                out.push(region);
            }
        }
    }
    out
}
