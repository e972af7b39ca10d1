// THEORY:
// This file is the entry point of the `nuclei_tracker` library crate. The public
// API is the `TrackingPipeline` (and its async twin `ParallelPipeline`) together
// with `TrackingConfig` and the trajectories it produces.
//
// The layers live in `core_modules`, leaf first:
// - `region` / `mask_shape`: the region-shape capability set and its raster implementation.
// - `labeling`: per-frame segmentation output turned into regions.
// - `node` / `frame_graph`: the arena node graph and its candidate edges.
// - `matcher`: stable matching over overlap or distance preferences.
// - `watershed` / `corrector`: repair of under- and oversegmentation.
// - `trajectory`: chains of matched nodes handed to a cell store.

pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod parallel_pipeline;

pub use error::{TrackError, TrackResult};
pub use pipeline::{TrackingConfig, TrackingPipeline, TrackingReport};
