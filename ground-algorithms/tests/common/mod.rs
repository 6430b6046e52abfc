use anyhow::{bail, Result};
use ground_core::{
    containers::TileBuffer,
    math::{QueryRegion, AABB},
    nalgebra::Point3,
    source::{Channels, InMemoryPointSource, PointSource},
};

/// Side length of the terrain grid
pub const TERRAIN_SIZE: usize = 40;
/// Height of the box that stands on the terrain
pub const BUILDING_HEIGHT: f64 = 5.0;

/// A regular grid of `size` x `size` points with unit spacing at elevation zero
pub fn flat_grid(size: usize) -> Vec<Point3<f64>> {
    (0..size * size)
        .map(|i| Point3::new((i % size) as f64, (i / size) as f64, 0.0))
        .collect()
}

fn terrain_elevation(x: f64, y: f64) -> f64 {
    0.05 * x + 0.5 * (y / 6.0).sin()
}

/// True for grid positions covered by the building
pub fn is_building(x: f64, y: f64) -> bool {
    (10.0..=14.0).contains(&x) && (10.0..=14.0).contains(&y)
}

/// Gently rolling terrain on a regular grid with a 5 x 5 building on it
pub fn terrain_with_building() -> Vec<Point3<f64>> {
    (0..TERRAIN_SIZE * TERRAIN_SIZE)
        .map(|i| {
            let x = (i % TERRAIN_SIZE) as f64;
            let y = (i / TERRAIN_SIZE) as f64;
            let z = terrain_elevation(x, y) + if is_building(x, y) { BUILDING_HEIGHT } else { 0.0 };
            Point3::new(x, y, z)
        })
        .collect()
}

/// A point source that refuses to store classification results
pub struct ReadOnlySource {
    pub inner: InMemoryPointSource,
    /// Number of refused submissions
    pub rejected: usize,
}

impl ReadOnlySource {
    pub fn new(inner: InMemoryPointSource) -> Self {
        Self { inner, rejected: 0 }
    }
}

impl PointSource for ReadOnlySource {
    fn bounds(&self) -> Option<AABB<f64>> {
        self.inner.bounds()
    }

    fn query_points(&mut self, region: &QueryRegion, channels: Channels) -> Result<TileBuffer> {
        self.inner.query_points(region, channels)
    }

    fn submit_classification(&mut self, tile_id: usize, _buffer: &TileBuffer) -> Result<()> {
        self.rejected += 1;
        bail!("source is read-only, cannot store tile {}", tile_id)
    }
}
