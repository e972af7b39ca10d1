// THEORY:
// Splitting an undersegmented cluster is delegated to a watershed collaborator.
// The tracker only relies on its contract:
// - input: the frame index, one marker point per cluster parent, and the
//   cluster shape acting as the mask;
// - output: one child shape per marker, in marker order, `None` where the
//   marker's region could not be resolved;
// - deterministic for identical inputs, synchronous, and any error is fatal
//   for the frame pair.
//
// `MarkerWatershed` is the bundled implementation. It floods an elevation map
// from the markers with a priority queue, restricted to the cluster mask and
// using 4-connectivity. The elevation map is:
// - the external morphological gradient of the frame's intensity image
//   (Gaussian blur, dilation minus image, then erosion, with a disk of radius
//   sigma) when intensity frames are available. The gradient of a frame is
//   computed once and reused for every cluster of that frame;
// - otherwise the inverted chamfer distance transform of the mask, which splits
//   touching convex blobs along their neck.

use crate::core_modules::mask_shape::MaskShape;
use crate::error::{TrackError, TrackResult};
use image::{GrayImage, Luma, imageops};
use log::debug;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A watershed seed in global pixel coordinates.
pub type Marker = (u32, u32);

/// The watershed-split collaborator.
pub trait WatershedSplitter<S> {
    /// Splits `cluster` into one optional child per marker, in marker order.
    fn split(&mut self, frame: usize, markers: &[Marker], cluster: &S)
    -> TrackResult<Vec<Option<S>>>;
}

const CHAMFER_ORTHOGONAL: u32 = 3;
const CHAMFER_DIAGONAL: u32 = 4;
const NEIGHBOURS_4: [(i64, i64); 4] = [(0, 1), (0, -1), (1, 0), (-1, 0)];

/// Marker-controlled watershed over `MaskShape` clusters.
#[derive(Debug, Clone)]
pub struct MarkerWatershed {
    sigma: f32,
    /// Intensity image of every frame, `intensity[f - 1]` for frame f.
    intensity: Vec<GrayImage>,
    /// Gradient images already computed, by frame.
    gradients: HashMap<usize, GrayImage>,
}

impl MarkerWatershed {
    /// Shape-only watershed, flooding the distance transform of the cluster.
    pub fn new(sigma: f32) -> Self {
        Self {
            sigma,
            intensity: Vec::new(),
            gradients: HashMap::new(),
        }
    }

    /// Intensity-driven watershed, flooding the gradient of each frame.
    pub fn with_intensity(sigma: f32, intensity: Vec<GrayImage>) -> Self {
        Self {
            sigma,
            intensity,
            gradients: HashMap::new(),
        }
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    fn gradient(&mut self, frame: usize) -> TrackResult<&GrayImage> {
        if !self.gradients.contains_key(&frame) {
            let image = frame
                .checked_sub(1)
                .and_then(|i| self.intensity.get(i))
                .ok_or_else(|| TrackError::Watershed {
                    frame,
                    reason: "no intensity image for this frame".to_string(),
                })?;
            debug!("computing watershed gradient for frame {frame}");
            let gradient = external_gradient(image, self.sigma);
            self.gradients.insert(frame, gradient);
        }
        Ok(&self.gradients[&frame])
    }

    /// Elevation of every pixel of the cluster's bounding box, row-major.
    fn elevation(&mut self, frame: usize, cluster: &MaskShape) -> TrackResult<Vec<u32>> {
        let (x0, y0, x1, y1) = cluster.bounds();
        if self.intensity.is_empty() {
            return Ok(inverted_distance(cluster));
        }

        let gradient = self.gradient(frame)?;
        if x1 > gradient.width() || y1 > gradient.height() {
            return Err(TrackError::Watershed {
                frame,
                reason: format!(
                    "cluster bounds ({x0}, {y0})-({x1}, {y1}) exceed the {}x{} image",
                    gradient.width(),
                    gradient.height()
                ),
            });
        }
        let mut elevation = Vec::with_capacity(((x1 - x0) * (y1 - y0)) as usize);
        for y in y0..y1 {
            for x in x0..x1 {
                elevation.push(gradient.get_pixel(x, y)[0] as u32);
            }
        }
        Ok(elevation)
    }
}

impl WatershedSplitter<MaskShape> for MarkerWatershed {
    fn split(
        &mut self,
        frame: usize,
        markers: &[Marker],
        cluster: &MaskShape,
    ) -> TrackResult<Vec<Option<MaskShape>>> {
        let elevation = self.elevation(frame, cluster)?;
        let (x0, y0, x1, y1) = cluster.bounds();
        let width = (x1 - x0) as usize;
        let height = (y1 - y0) as usize;
        let local = |(x, y): Marker| (y - y0) as usize * width + (x - x0) as usize;

        // --- 1. Seeding ---
        let mut labels = vec![0u32; width * height];
        // A marker landing on a pixel already seeded by an earlier marker gets no label.
        for (i, &marker) in markers.iter().enumerate() {
            if cluster.contains(marker.0, marker.1) && labels[local(marker)] == 0 {
                labels[local(marker)] = i as u32 + 1;
            }
        }

        // --- 2. Priority flood ---
        let mut heap = BinaryHeap::new();
        let mut sequence = 0u64;
        for (idx, &label) in labels.iter().enumerate() {
            if label != 0 {
                heap.push(Reverse((elevation[idx], sequence, idx)));
                sequence += 1;
            }
        }
        while let Some(Reverse((_, _, idx))) = heap.pop() {
            let (x, y) = ((idx % width) as i64, (idx / width) as i64);
            for (dx, dy) in NEIGHBOURS_4 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                    continue;
                }
                let n = ny as usize * width + nx as usize;
                if labels[n] != 0 || !cluster.contains(x0 + nx as u32, y0 + ny as u32) {
                    continue;
                }
                labels[n] = labels[idx];
                heap.push(Reverse((elevation[n], sequence, n)));
                sequence += 1;
            }
        }

        // --- 3. One child per marker ---
        let children = markers
            .iter()
            .enumerate()
            .map(|(i, &marker)| {
                if !cluster.contains(marker.0, marker.1) {
                    return None;
                }
                let label = labels[local(marker)];
                if label != i as u32 + 1 {
                    return None;
                }
                let region = connected_region(&labels, width, height, local(marker), label);
                if region.len() <= 1 {
                    return None;
                }
                let pixels = region
                    .into_iter()
                    .map(|i| (x0 + (i % width) as u32, y0 + (i / width) as u32));
                MaskShape::from_pixels(pixels, frame)
            })
            .collect();
        Ok(children)
    }
}

/// Pixels 4-connected to `start` that carry `label`.
fn connected_region(labels: &[u32], width: usize, height: usize, start: usize, label: u32) -> Vec<usize> {
    let mut visited = vec![false; labels.len()];
    let mut stack = vec![start];
    let mut region = Vec::new();
    visited[start] = true;
    while let Some(idx) = stack.pop() {
        region.push(idx);
        let (x, y) = ((idx % width) as i64, (idx / width) as i64);
        for (dx, dy) in NEIGHBOURS_4 {
            let (nx, ny) = (x + dx, y + dy);
            if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                continue;
            }
            let n = ny as usize * width + nx as usize;
            if !visited[n] && labels[n] == label {
                visited[n] = true;
                stack.push(n);
            }
        }
    }
    region
}

/// Chamfer (3-4) distance to the background, inverted so that the centres of
/// blobs are the lowest points. Pixels outside the bounding box count as background.
fn inverted_distance(cluster: &MaskShape) -> Vec<u32> {
    let (x0, y0, x1, y1) = cluster.bounds();
    let width = (x1 - x0) as usize;
    let height = (y1 - y0) as usize;
    let far = u32::MAX / 2;
    let mut dist: Vec<u32> = (0..width * height)
        .map(|i| {
            let (x, y) = (x0 + (i % width) as u32, y0 + (i / width) as u32);
            if cluster.contains(x, y) { far } else { 0 }
        })
        .collect();

    let at = |dist: &[u32], x: i64, y: i64| -> u32 {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            0
        } else {
            dist[y as usize * width + x as usize]
        }
    };

    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let i = y as usize * width + x as usize;
            if dist[i] == 0 {
                continue;
            }
            let best = [
                at(&dist[..], x - 1, y) + CHAMFER_ORTHOGONAL,
                at(&dist[..], x, y - 1) + CHAMFER_ORTHOGONAL,
                at(&dist[..], x - 1, y - 1) + CHAMFER_DIAGONAL,
                at(&dist[..], x + 1, y - 1) + CHAMFER_DIAGONAL,
            ]
            .into_iter()
            .min()
            .unwrap_or(far);
            dist[i] = dist[i].min(best);
        }
    }
    for y in (0..height as i64).rev() {
        for x in (0..width as i64).rev() {
            let i = y as usize * width + x as usize;
            if dist[i] == 0 {
                continue;
            }
            let best = [
                at(&dist[..], x + 1, y) + CHAMFER_ORTHOGONAL,
                at(&dist[..], x, y + 1) + CHAMFER_ORTHOGONAL,
                at(&dist[..], x + 1, y + 1) + CHAMFER_DIAGONAL,
                at(&dist[..], x - 1, y + 1) + CHAMFER_DIAGONAL,
            ]
            .into_iter()
            .min()
            .unwrap_or(far);
            dist[i] = dist[i].min(best);
        }
    }

    let peak = dist.iter().copied().max().unwrap_or(0);
    dist.into_iter().map(|d| peak - d).collect()
}

fn disk_offsets(radius: i64) -> Vec<(i64, i64)> {
    let mut offsets = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

/// Grey-level min or max filter over a disk.
fn rank_filter(image: &GrayImage, offsets: &[(i64, i64)], take_max: bool) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let values = offsets.iter().filter_map(|&(dx, dy)| {
            let (nx, ny) = (x as i64 + dx, y as i64 + dy);
            if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                None
            } else {
                Some(image.get_pixel(nx as u32, ny as u32)[0])
            }
        });
        let value = if take_max { values.max() } else { values.min() };
        Luma([value.unwrap_or(0)])
    })
}

/// Blur, external gradient (dilation - image), then erosion, all with a disk of radius `sigma`.
pub fn external_gradient(image: &GrayImage, sigma: f32) -> GrayImage {
    let blurred = imageops::blur(image, sigma);
    let offsets = disk_offsets((sigma.round() as i64).max(1));
    let dilated = rank_filter(&blurred, &offsets, true);
    let (width, height) = blurred.dimensions();
    let gradient = GrayImage::from_fn(width, height, |x, y| {
        Luma([dilated.get_pixel(x, y)[0].saturating_sub(blurred.get_pixel(x, y)[0])])
    });
    rank_filter(&gradient, &offsets, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::region::RegionShape;

    fn dumbbell() -> MaskShape {
        let left = MaskShape::disk(20.0, 20.0, 10.0, 2).unwrap();
        let right = MaskShape::disk(38.0, 20.0, 10.0, 2).unwrap();
        left.union(&right).unwrap()
    }

    #[test]
    fn splits_touching_disks_along_the_neck() {
        let cluster = dumbbell();
        let mut splitter = MarkerWatershed::new(2.0);
        let children = splitter.split(2, &[(20, 20), (38, 20)], &cluster).unwrap();

        assert_eq!(children.len(), 2);
        let left = children[0].as_ref().unwrap();
        let right = children[1].as_ref().unwrap();
        assert!(left.intersect(right).is_none());
        assert_eq!(left.area() + right.area(), cluster.area());
        assert!(left.centroid().0 < right.centroid().0);
        assert!((left.area() - right.area()).abs() < 0.2 * cluster.area());
        assert_eq!(left.frame(), 2);
    }

    #[test]
    fn marker_outside_the_cluster_yields_none() {
        let cluster = dumbbell();
        let mut splitter = MarkerWatershed::new(2.0);
        let children = splitter.split(2, &[(20, 20), (90, 90)], &cluster).unwrap();
        assert!(children[0].is_some());
        assert!(children[1].is_none());
        // The single remaining marker floods the whole cluster.
        assert_eq!(children[0].as_ref().unwrap().area(), cluster.area());
    }

    #[test]
    fn shared_marker_pixel_yields_one_child() {
        let cluster = MaskShape::disk(20.0, 20.0, 10.0, 2).unwrap();
        let mut splitter = MarkerWatershed::new(2.0);
        let children = splitter.split(2, &[(20, 20), (20, 20)], &cluster).unwrap();

        assert_eq!(children.len(), 2);
        assert_eq!(children[0].as_ref().unwrap().area(), cluster.area());
        assert!(children[1].is_none());
    }

    #[test]
    fn intensity_mode_requires_the_frame_image() {
        let cluster = dumbbell();
        let mut splitter = MarkerWatershed::with_intensity(2.0, vec![GrayImage::new(64, 64)]);
        let err = splitter.split(2, &[(20, 20)], &cluster).unwrap_err();
        assert!(matches!(err, TrackError::Watershed { frame: 2, .. }));
    }

    #[test]
    fn intensity_mode_floods_from_every_marker() {
        let cluster = dumbbell();
        let image = GrayImage::from_fn(64, 64, |x, y| {
            if cluster.contains(x, y) { Luma([200]) } else { Luma([10]) }
        });
        let mut splitter = MarkerWatershed::with_intensity(1.0, vec![image.clone(), image]);
        let children = splitter.split(2, &[(20, 20), (38, 20)], &cluster).unwrap();
        let left = children[0].as_ref().unwrap();
        let right = children[1].as_ref().unwrap();
        assert!(left.intersect(right).is_none());
        assert!(left.contains(20, 20));
        assert!(right.contains(38, 20));
        assert_eq!(splitter.gradients.len(), 1);
    }

    #[test]
    fn gradient_is_zero_on_flat_images() {
        let flat = GrayImage::from_pixel(16, 16, Luma([80]));
        let gradient = external_gradient(&flat, 2.0);
        assert!(gradient.pixels().all(|p| p[0] == 0));
    }
}
