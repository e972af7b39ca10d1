// THEORY:
// The `region` module defines the contract every region shape must honour to be
// tracked. The tracking engine never looks inside a shape: it only asks for a
// handful of geometric measurements and boolean combinations. This keeps the
// engine independent of how a segmentation represents its regions (raster
// masks, polygons, run-length encodings...).
//
// Boolean operations return `None` when the result is empty. An empty shape is
// never a valid region, so there is no "empty shape" value to carry around.

use std::fmt::Debug;

/// Feret (caliper) measurements of a shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feret {
    /// Largest caliper distance.
    pub max: f64,
    /// Angle of the largest caliper, in degrees within `[0, 180)`.
    pub angle: f64,
    /// Smallest caliper width.
    pub min: f64,
}

/// The capability set the tracker consumes from a region shape.
pub trait RegionShape: Clone + Debug {
    fn area(&self) -> f64;

    /// Centroid `(x, y)` in image coordinates.
    fn centroid(&self) -> (f64, f64);

    /// Major axis length of the ellipse with the same second moments.
    fn major_axis_length(&self) -> f64;

    fn perimeter(&self) -> f64;

    fn intersect(&self, other: &Self) -> Option<Self>;

    fn union(&self, other: &Self) -> Option<Self>;

    fn difference(&self, other: &Self) -> Option<Self>;

    fn contains_point(&self, x: i64, y: i64) -> bool;

    fn feret_diameters(&self) -> Feret;

    /// 1-based frame this shape belongs to.
    fn frame(&self) -> usize;

    fn set_frame(&mut self, frame: usize);
}

/// Euclidean distance between two centroids.
pub fn centroid_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}
