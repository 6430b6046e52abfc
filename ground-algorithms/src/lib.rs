#![warn(clippy::all)]
//! Ground classification of point clouds.
//!
//! The engine partitions a point cloud into a quadtree of tiles, selects low, trustworthy seed points per
//! tile, removes seed outliers with a RANSAC plane fit, triangulates the remaining seeds into a TIN,
//! optionally densifies that TIN with accepted points and finally classifies every point as ground or
//! non-ground by testing it against the nearest TIN triangle.
//! [GroundDetector](detector::GroundDetector) runs all phases in order.

// Accelerator abstraction: one per-point test, sequential and data-parallel executors.
pub mod accelerator;
// Bounding box of a set of positions.
pub mod bounds;
// Per-point ground test and per-tile classification.
pub mod classifier;
pub mod densification;
pub mod detector;
pub mod error;
// Estimates slope and height thresholds from the geometry of the seed TIN.
pub mod estimation;
// Single-threaded load/save queue in front of the point source.
pub mod loader;
// Removes seed points that do not fit a locally estimated ground plane.
pub mod outliers;
pub mod params;
pub mod progress;
pub mod quadtree;
// Ransac plane segmentation in serial and parallel, with deterministic random number generators.
pub mod segmentation;
// Seed point selection from the elevation profile of a tile.
pub mod seeds;
pub mod statistics;
// Delaunay triangulation of seed points and triangle geometry.
pub mod surface;

pub use self::error::{GroundDetectionError, Result};
