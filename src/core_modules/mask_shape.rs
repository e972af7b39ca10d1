// THEORY:
// `MaskShape` is the raster implementation of `RegionShape`. A region is stored
// as a tight binary bitmap (`image::GrayImage`, 255 = foreground) plus the
// global image coordinate of the bitmap's top-left corner. Keeping the bitmap
// cropped to the region's bounding box makes boolean operations between two
// nuclei cost proportional to the nuclei, not to the whole frame.
//
// Measurement conventions follow the usual microscopy tooling:
// - a pixel `(x, y)` covers the unit square `[x, x+1) x [y, y+1)`, so centroids
//   are computed from pixel centres `(x + 0.5, y + 0.5)`;
// - the major axis is that of the ellipse having the same second central
//   moments as the region (each pixel contributing its own 1/12 variance);
// - the perimeter counts pixel edges exposed to the background.

use crate::core_modules::region::{Feret, RegionShape};
use image::{GrayImage, Luma};

const FOREGROUND: u8 = 255;
const FERET_ANGLE_STEP_DEG: f64 = 0.5;

/// A region shape backed by a cropped binary mask.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskShape {
    /// Global coordinate of the top-left pixel of `mask`.
    origin: (u32, u32),
    /// Tight bitmap of the region.
    mask: GrayImage,
    /// Number of foreground pixels.
    area: usize,
    /// 1-based frame index.
    frame: usize,
}

impl MaskShape {
    /// Builds a shape from a set of global pixel coordinates.
    /// Returns `None` when the set is empty.
    pub fn from_pixels<I>(pixels: I, frame: usize) -> Option<Self>
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let pixels: Vec<(u32, u32)> = pixels.into_iter().collect();
        if pixels.is_empty() {
            return None;
        }

        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0;
        let mut max_y = 0;
        for &(x, y) in &pixels {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let mut mask = GrayImage::new(max_x - min_x + 1, max_y - min_y + 1);
        let mut area = 0;
        for (x, y) in pixels {
            let pixel = mask.get_pixel_mut(x - min_x, y - min_y);
            if pixel[0] != FOREGROUND {
                *pixel = Luma([FOREGROUND]);
                area += 1;
            }
        }

        Some(Self {
            origin: (min_x, min_y),
            mask,
            area,
            frame,
        })
    }

    /// Builds a shape from a bitmap placed at `origin`. Any non-zero pixel is foreground.
    pub fn from_mask(origin: (u32, u32), mask: &GrayImage, frame: usize) -> Option<Self> {
        let pixels = mask
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] != 0)
            .map(|(x, y, _)| (origin.0 + x, origin.1 + y));
        Self::from_pixels(pixels, frame)
    }

    /// Axis-aligned rectangle of `width` x `height` pixels.
    pub fn rect(x: u32, y: u32, width: u32, height: u32, frame: usize) -> Option<Self> {
        let pixels = (y..y + height).flat_map(|py| (x..x + width).map(move |px| (px, py)));
        Self::from_pixels(pixels, frame)
    }

    /// Every pixel whose centre lies within `radius` of `(cx, cy)`.
    pub fn disk(cx: f64, cy: f64, radius: f64, frame: usize) -> Option<Self> {
        let x0 = (cx - radius).floor().max(0.0) as u32;
        let y0 = (cy - radius).floor().max(0.0) as u32;
        let x1 = (cx + radius).ceil().max(0.0) as u32;
        let y1 = (cy + radius).ceil().max(0.0) as u32;
        let r2 = radius * radius;
        let pixels = (y0..=y1)
            .flat_map(|py| (x0..=x1).map(move |px| (px, py)))
            .filter(|&(px, py)| {
                let dx = px as f64 + 0.5 - cx;
                let dy = py as f64 + 0.5 - cy;
                dx * dx + dy * dy <= r2
            });
        Self::from_pixels(pixels, frame)
    }

    pub fn origin(&self) -> (u32, u32) {
        self.origin
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Exclusive bounds `(x0, y0, x1, y1)` in global coordinates.
    pub fn bounds(&self) -> (u32, u32, u32, u32) {
        (
            self.origin.0,
            self.origin.1,
            self.origin.0 + self.mask.width(),
            self.origin.1 + self.mask.height(),
        )
    }

    pub fn pixel_count(&self) -> usize {
        self.area
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        let (x0, y0, x1, y1) = self.bounds();
        if x < x0 || y < y0 || x >= x1 || y >= y1 {
            return false;
        }
        self.mask.get_pixel(x - x0, y - y0)[0] == FOREGROUND
    }

    /// Iterates the global coordinates of every foreground pixel.
    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let (ox, oy) = self.origin;
        self.mask
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] == FOREGROUND)
            .map(move |(x, y, _)| (ox + x, oy + y))
    }

    fn is_boundary(&self, x: u32, y: u32) -> bool {
        let (x, y) = (x as i64, y as i64);
        [(0, 1), (0, -1), (1, 0), (-1, 0)]
            .iter()
            .any(|(dx, dy)| !self.contains_point(x + dx, y + dy))
    }

    /// Pixel-wise combination of two shapes over the given window.
    fn combine<F>(&self, other: &Self, window: (u32, u32, u32, u32), keep: F) -> Option<Self>
    where
        F: Fn(bool, bool) -> bool,
    {
        let (x0, y0, x1, y1) = window;
        let pixels = (y0..y1)
            .flat_map(|y| (x0..x1).map(move |x| (x, y)))
            .filter(|&(x, y)| keep(self.contains(x, y), other.contains(x, y)));
        Self::from_pixels(pixels, self.frame)
    }

    /// Second central moments `(uxx, uyy, uxy)`.
    fn central_moments(&self) -> (f64, f64, f64) {
        let (cx, cy) = self.centroid();
        let n = self.area as f64;
        let (mut xx, mut yy, mut xy) = (0.0, 0.0, 0.0);
        for (x, y) in self.pixels() {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            xx += dx * dx;
            yy += dy * dy;
            xy += dx * dy;
        }
        (xx / n + 1.0 / 12.0, yy / n + 1.0 / 12.0, xy / n)
    }

    /// Corners of every boundary pixel, deduplicated.
    fn boundary_corners(&self) -> Vec<(f64, f64)> {
        let mut corners: Vec<(u32, u32)> = Vec::new();
        for (x, y) in self.pixels() {
            if self.is_boundary(x, y) {
                corners.extend_from_slice(&[(x, y), (x + 1, y), (x, y + 1), (x + 1, y + 1)]);
            }
        }
        corners.sort_unstable();
        corners.dedup();
        corners
            .into_iter()
            .map(|(x, y)| (x as f64, y as f64))
            .collect()
    }
}

impl RegionShape for MaskShape {
    fn area(&self) -> f64 {
        self.area as f64
    }

    fn centroid(&self) -> (f64, f64) {
        let n = self.area as f64;
        let (sx, sy) = self
            .pixels()
            .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x as f64, sy + y as f64));
        (sx / n + 0.5, sy / n + 0.5)
    }

    fn major_axis_length(&self) -> f64 {
        let (xx, yy, xy) = self.central_moments();
        let half_trace = (xx + yy) / 2.0;
        let spread = (((xx - yy) / 2.0).powi(2) + xy * xy).sqrt();
        4.0 * (half_trace + spread).sqrt()
    }

    fn perimeter(&self) -> f64 {
        let mut edges = 0usize;
        for (x, y) in self.pixels() {
            let (x, y) = (x as i64, y as i64);
            for (dx, dy) in [(0, 1), (0, -1), (1, 0), (-1, 0)] {
                if !self.contains_point(x + dx, y + dy) {
                    edges += 1;
                }
            }
        }
        edges as f64
    }

    fn intersect(&self, other: &Self) -> Option<Self> {
        let (ax0, ay0, ax1, ay1) = self.bounds();
        let (bx0, by0, bx1, by1) = other.bounds();
        let window = (ax0.max(bx0), ay0.max(by0), ax1.min(bx1), ay1.min(by1));
        if window.0 >= window.2 || window.1 >= window.3 {
            return None;
        }
        self.combine(other, window, |a, b| a && b)
    }

    fn union(&self, other: &Self) -> Option<Self> {
        let (ax0, ay0, ax1, ay1) = self.bounds();
        let (bx0, by0, bx1, by1) = other.bounds();
        let window = (ax0.min(bx0), ay0.min(by0), ax1.max(bx1), ay1.max(by1));
        self.combine(other, window, |a, b| a || b)
    }

    fn difference(&self, other: &Self) -> Option<Self> {
        self.combine(other, self.bounds(), |a, b| a && !b)
    }

    fn contains_point(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 || x > u32::MAX as i64 || y > u32::MAX as i64 {
            return false;
        }
        self.contains(x as u32, y as u32)
    }

    fn feret_diameters(&self) -> Feret {
        let corners = self.boundary_corners();

        let mut max = 0.0;
        let mut angle = 0.0;
        for (i, a) in corners.iter().enumerate() {
            for b in &corners[i + 1..] {
                let d = ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
                if d > max {
                    max = d;
                    // Image rows grow downwards; report the angle in a y-up frame.
                    angle = (-(b.1 - a.1)).atan2(b.0 - a.0).to_degrees().rem_euclid(180.0);
                }
            }
        }

        let mut min = f64::MAX;
        let mut theta: f64 = 0.0;
        while theta < 180.0 {
            let (sin, cos) = theta.to_radians().sin_cos();
            let (lo, hi) = corners.iter().fold((f64::MAX, f64::MIN), |(lo, hi), c| {
                let p = c.0 * cos + c.1 * sin;
                (lo.min(p), hi.max(p))
            });
            min = f64::min(min, hi - lo);
            theta += FERET_ANGLE_STEP_DEG;
        }

        Feret { max, angle, min }
    }

    fn frame(&self) -> usize {
        self.frame
    }

    fn set_frame(&mut self, frame: usize) {
        self.frame = frame;
    }
}
