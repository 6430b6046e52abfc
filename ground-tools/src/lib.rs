#![warn(clippy::all)]
//! Shared helpers of the ground classification command line tools

/// Reading and writing point clouds as whitespace separated ASCII text
pub mod xyz;
