// THEORY:
// `label_regions` turns one segmented frame into the list of regions the
// tracker consumes. It is a stateless utility with no memory of other frames,
// in the same way a blob detector only sees the frame it is given.
//
// The input is a label image: 0 is background, any other value is foreground.
// A region is a 4-connected set of pixels sharing the same non-zero value, so a
// binary mask (0/255) and an instance label map (1, 2, 3, ...) both work.
// Regions are grown iteratively from the first unvisited pixel in raster order,
// which also fixes the output order. Regions smaller than `min_area` pixels are
// dropped (particle-size filter).

use crate::core_modules::mask_shape::MaskShape;
use image::GrayImage;
use log::debug;
use std::collections::VecDeque;

/// Splits `labels` into one `MaskShape` per connected component.
pub fn label_regions(labels: &GrayImage, frame: usize, min_area: usize) -> Vec<MaskShape> {
    let (width, height) = labels.dimensions();
    let mut visited = vec![false; (width * height) as usize];
    let mut regions = Vec::new();
    let mut dropped = 0;

    for y in 0..height {
        for x in 0..width {
            let value = labels.get_pixel(x, y)[0];
            if value == 0 || visited[(y * width + x) as usize] {
                continue;
            }

            let pixels = grow_region(labels, &mut visited, (x, y), value);
            if pixels.len() < min_area.max(1) {
                dropped += 1;
                continue;
            }
            if let Some(shape) = MaskShape::from_pixels(pixels, frame) {
                regions.push(shape);
            }
        }
    }

    debug!("frame {frame}: {} regions, {dropped} below {min_area} px", regions.len());
    regions
}

/// Breadth-first region growing over pixels equal to `value`.
fn grow_region(
    labels: &GrayImage,
    visited: &mut [bool],
    start: (u32, u32),
    value: u8,
) -> Vec<(u32, u32)> {
    let (width, height) = labels.dimensions();
    let mut pixels = Vec::new();
    let mut queue = VecDeque::new();
    visited[(start.1 * width + start.0) as usize] = true;
    queue.push_back(start);

    while let Some((x, y)) = queue.pop_front() {
        pixels.push((x, y));

        let neighbors = [
            (x.wrapping_sub(1), y),
            (x + 1, y),
            (x, y.wrapping_sub(1)),
            (x, y + 1),
        ];
        for (nx, ny) in neighbors {
            if nx >= width || ny >= height {
                continue;
            }
            let index = (ny * width + nx) as usize;
            if !visited[index] && labels.get_pixel(nx, ny)[0] == value {
                visited[index] = true;
                queue.push_back((nx, ny));
            }
        }
    }

    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::region::RegionShape;
    use image::Luma;

    fn fill(image: &mut GrayImage, x: u32, y: u32, w: u32, h: u32, value: u8) {
        for yy in y..y + h {
            for xx in x..x + w {
                image.put_pixel(xx, yy, Luma([value]));
            }
        }
    }

    #[test]
    fn splits_binary_mask_into_components() {
        let mut image = GrayImage::new(40, 20);
        fill(&mut image, 2, 2, 5, 5, 255);
        fill(&mut image, 20, 10, 4, 3, 255);

        let regions = label_regions(&image, 3, 1);

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].area(), 25.0);
        assert_eq!(regions[1].area(), 12.0);
        assert_eq!(regions[1].frame(), 3);
        assert!(regions[1].contains_point(21, 11));
    }

    #[test]
    fn touching_labels_stay_separate() {
        let mut image = GrayImage::new(20, 10);
        fill(&mut image, 0, 0, 5, 5, 1);
        fill(&mut image, 5, 0, 5, 5, 2);

        let regions = label_regions(&image, 1, 1);
        assert_eq!(regions.len(), 2);
        assert!(regions.iter().all(|r| r.area() == 25.0));
    }

    #[test]
    fn diagonal_pixels_are_not_connected() {
        let mut image = GrayImage::new(4, 4);
        image.put_pixel(0, 0, Luma([9]));
        image.put_pixel(1, 1, Luma([9]));
        assert_eq!(label_regions(&image, 1, 1).len(), 2);
    }

    #[test]
    fn small_regions_are_dropped() {
        let mut image = GrayImage::new(20, 20);
        fill(&mut image, 0, 0, 2, 2, 255);
        fill(&mut image, 10, 10, 5, 5, 255);

        let regions = label_regions(&image, 1, 10);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area(), 25.0);
    }
}
