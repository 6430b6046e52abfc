#![warn(clippy::all)]

//! Core data structures for point cloud ground classification
//!
//! `ground-core` defines the vocabulary shared by the classification engine and its collaborators:
//! bounding boxes and query regions ([math]), per-point ground classes ([classification]), the
//! buffers a tile holds while it is being processed ([containers]) and the [PointSource](source::PointSource)
//! trait through which the engine reads points and writes classification results back.

pub extern crate nalgebra;

/// Per-point classification results
pub mod classification;
pub mod containers;
/// Useful mathematical tools when working with point cloud footprints
pub mod math;
/// Access to the underlying point cloud store
pub mod source;
