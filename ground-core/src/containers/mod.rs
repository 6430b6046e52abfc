//! Buffers that hold the points of one tile while the tile is being processed.
//!
//! A [TileBuffer] is filled by a [PointSource](crate::source::PointSource) query and stores its data
//! in columnar form: one vector per channel (positions, visibility, classification) plus the
//! source-specific identifier of every point, which the source uses to write the classification back.

mod tile_buffer;
pub use self::tile_buffer::*;
