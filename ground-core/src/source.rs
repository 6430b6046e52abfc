use anyhow::{bail, Result};
use nalgebra::Point3;

use crate::{
    classification::PointClass,
    containers::TileBuffer,
    math::{QueryRegion, AABB},
};

/// Channels that a [PointSource] query should fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channels {
    pub position: bool,
    pub classification: bool,
    pub visibility: bool,
}

impl Channels {
    /// All channels, as needed for classifying a tile
    pub const ALL: Channels = Channels {
        position: true,
        classification: true,
        visibility: true,
    };
    /// Positions and visibility, enough for counting and seeding
    pub const GEOMETRY: Channels = Channels {
        position: true,
        classification: false,
        visibility: true,
    };
}

/// Base trait for the point cloud store the ground detection reads from and writes to.
///
/// Implementations are only ever accessed by one thread at a time: the engine funnels all calls
/// through a single owner, so a source does not need to be `Sync`.
pub trait PointSource {
    /// Bounding box of all points in this source, or `None` if the source is empty
    fn bounds(&self) -> Option<AABB<f64>>;

    /// Reads all points whose XY position lies inside `region`. Channels that were not requested may
    /// be filled with default values (all visible, never classified)
    fn query_points(&mut self, region: &QueryRegion, channels: Channels) -> Result<TileBuffer>;

    /// Writes the classification channel of `buffer` back into the source. `tile_id` identifies
    /// the tile the buffer was loaded for
    fn submit_classification(&mut self, tile_id: usize, buffer: &TileBuffer) -> Result<()>;

    /// Number of visible points inside `region`
    fn count_points(&mut self, region: &QueryRegion) -> Result<usize> {
        Ok(self.query_points(region, Channels::GEOMETRY)?.visible_count())
    }
}

/// A [PointSource] that keeps all points in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryPointSource {
    positions: Vec<Point3<f64>>,
    visibility: Vec<bool>,
    classification: Vec<PointClass>,
    submitted_tiles: Vec<usize>,
    query_count: usize,
}

impl InMemoryPointSource {
    /// Creates a source where all points are visible and unclassified
    pub fn new(positions: Vec<Point3<f64>>) -> Self {
        let count = positions.len();
        Self {
            positions,
            visibility: vec![true; count],
            classification: vec![PointClass::NeverClassified; count],
            submitted_tiles: vec![],
            query_count: 0,
        }
    }

    /// Creates a source with an explicit visibility mask. Fails if the mask length does not match
    pub fn with_visibility(positions: Vec<Point3<f64>>, visibility: Vec<bool>) -> Result<Self> {
        if positions.len() != visibility.len() {
            bail!(
                "Visibility mask has {} entries but there are {} points",
                visibility.len(),
                positions.len()
            );
        }
        let mut source = Self::new(positions);
        source.visibility = visibility;
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Point3<f64>] {
        &self.positions
    }

    pub fn visibility(&self) -> &[bool] {
        &self.visibility
    }

    pub fn classification(&self) -> &[PointClass] {
        &self.classification
    }

    /// Tile identifiers in the order in which their classification was submitted
    pub fn submitted_tiles(&self) -> &[usize] {
        &self.submitted_tiles
    }

    /// Number of `query_points` calls served so far
    pub fn query_count(&self) -> usize {
        self.query_count
    }
}

impl PointSource for InMemoryPointSource {
    fn bounds(&self) -> Option<AABB<f64>> {
        AABB::from_points(self.positions.iter().copied())
    }

    fn query_points(&mut self, region: &QueryRegion, channels: Channels) -> Result<TileBuffer> {
        self.query_count += 1;
        let mut buffer = TileBuffer::new();
        for (idx, position) in self.positions.iter().enumerate() {
            if !region.contains(position) {
                continue;
            }
            let visible = !channels.visibility || self.visibility[idx];
            let class = if channels.classification {
                self.classification[idx]
            } else {
                PointClass::NeverClassified
            };
            buffer.push(idx, *position, visible, class);
        }
        Ok(buffer)
    }

    fn submit_classification(&mut self, tile_id: usize, buffer: &TileBuffer) -> Result<()> {
        for (point_id, class) in buffer.point_ids().iter().zip(buffer.classification()) {
            match self.classification.get_mut(*point_id) {
                Some(slot) => *slot = *class,
                None => bail!("Tile {} references unknown point {}", tile_id, point_id),
            }
        }
        self.submitted_tiles.push(tile_id);
        Ok(())
    }
}
