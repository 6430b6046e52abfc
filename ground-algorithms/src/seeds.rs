use ground_core::{containers::TileBuffer, math::AABB, nalgebra::Point3};
use log::debug;

use crate::{
    error::GroundDetectionError,
    params::{ExtraSeedPolicy, GroundDetectionParameters, HISTOGRAM_PRECISION},
    quadtree::{NodeId, QuadNode},
    statistics::Sample,
};

/// Smallest number of seed points a non-empty tile asks for
pub const MIN_SEEDS_PER_TILE: usize = 3;

/// Candidate ground points of one quadtree tile
#[derive(Debug, Clone, PartialEq)]
pub struct Seed {
    tile: NodeId,
    points: Vec<Point3<f64>>,
    density: f64,
    trustworthiness: f64,
    tolerance: f64,
    min_elevation: f64,
    verified: bool,
}

impl Seed {
    /// A seed without points for a tile that has no visible points
    pub fn empty(tile: NodeId) -> Self {
        Self {
            tile,
            points: vec![],
            density: 0.0,
            trustworthiness: 0.0,
            tolerance: HISTOGRAM_PRECISION,
            min_elevation: 0.0,
            verified: false,
        }
    }

    pub fn tile(&self) -> NodeId {
        self.tile
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points per unit length in the tile
    pub fn density(&self) -> f64 {
        self.density
    }

    /// How reliable the elevation profile of the tile is, in `[0, 1]`
    pub fn trustworthiness(&self) -> f64 {
        self.trustworthiness
    }

    /// Elevation change between nearby points that is still considered terrain
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn min_elevation(&self) -> f64 {
        self.min_elevation
    }

    /// True once the outlier excluder has processed this seed
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub(crate) fn clear(&mut self) {
        self.points.clear();
    }

    /// Removes the points at the given indices
    pub(crate) fn remove_points(&mut self, indices: &[usize]) {
        let mut idx = 0;
        self.points.retain(|_| {
            let keep = !indices.contains(&idx);
            idx += 1;
            keep
        });
    }

    pub(crate) fn mark_verified(&mut self) {
        self.verified = true;
    }
}

/// Elevation profile of one cell of the seed grid
#[derive(Debug, Clone, Copy)]
struct Cell {
    /// Buffer index of the lowest point
    lowest: usize,
    min: f64,
    max: f64,
}

/// Picks seed points for the tiles of a quadtree
pub struct SeedSelector<'a> {
    params: &'a GroundDetectionParameters,
    tree_depth: usize,
}

impl<'a> SeedSelector<'a> {
    /// `tree_depth` is the depth of the deepest node of the quadtree the tiles belong to
    pub fn new(params: &'a GroundDetectionParameters, tree_depth: usize) -> Self {
        Self { params, tree_depth }
    }

    /// Selects the seed points of the tile `node` (with id `tile`) from its loaded `buffer`. Only visible
    /// points are considered
    pub fn select(&self, tile: NodeId, node: &QuadNode, buffer: &TileBuffer) -> Seed {
        let visible: Vec<(usize, Point3<f64>)> = buffer
            .visible_positions()
            .map(|(idx, pos)| (idx, *pos))
            .collect();
        if visible.is_empty() {
            debug!("Tile {} has no visible points", tile.index());
            return Seed::empty(tile);
        }
        let footprint = node.bounds();
        let grid_size = self.params.seed_grid_size.max(1);
        let cells = self.histogram(footprint, grid_size, &visible);

        let tile_min = visible.iter().map(|(_, p)| p.z).fold(f64::INFINITY, f64::min);
        let tile_max = visible.iter().map(|(_, p)| p.z).fold(f64::NEG_INFINITY, f64::max);
        let extent = footprint.extent();
        let cell_size = {
            let size = (extent.x / grid_size as f64).max(extent.y / grid_size as f64);
            if size > f64::EPSILON {
                size
            } else {
                1.0
            }
        };

        let variations = Sample::new(neighbour_variations(&cells, grid_size));
        let (tolerance, trustworthiness) = match self.profile_statistics(
            tile,
            &cells,
            &variations,
            tile_min,
            tile_max,
            cell_size,
        ) {
            Ok(stats) => stats,
            Err(why) => {
                debug!("{}", why);
                (HISTOGRAM_PRECISION, 0.0)
            }
        };
        let tolerance = if trustworthiness < self.params.min_trustworthiness {
            tolerance * self.params.unreliable_tolerance_factor
        } else {
            tolerance
        };

        let position = |idx: usize| buffer.positions()[idx];
        let mut candidates: Vec<usize> = visible
            .iter()
            .filter(|(_, pos)| pos.z - tile_min <= tolerance)
            .map(|(idx, _)| *idx)
            .collect();
        candidates.sort_by(|a, b| position(*a).z.total_cmp(&position(*b).z).then(a.cmp(b)));
        let mut selected = vec![];
        farthest_point_sampling(&candidates, &mut selected, self.seed_budget(node, visible.len()), &position);

        if trustworthiness > self.params.extra_seed_threshold && variations.len() >= 2 {
            let mut represented = vec![false; cells.len()];
            for idx in &selected {
                represented[cell_of(footprint, grid_size, &position(*idx))] = true;
            }
            let extra: Vec<usize> = cells
                .iter()
                .enumerate()
                .filter(|(cell_idx, _)| !represented[*cell_idx])
                .filter_map(|(_, cell)| cell.as_ref())
                .filter(|cell| self.accepts_extra_seed(cell.min - tile_min, &variations))
                .map(|cell| cell.lowest)
                .collect();
            let budget = selected.len() + self.params.max_extra_seeds;
            farthest_point_sampling(&extra, &mut selected, budget, &position);
        }

        let density = if self.params.point_density > 0.0 {
            self.params.point_density
        } else if footprint.footprint_area() > f64::EPSILON {
            (visible.len() as f64 / footprint.footprint_area()).sqrt()
        } else {
            1.0
        };

        Seed {
            tile,
            points: selected.into_iter().map(position).collect(),
            density,
            trustworthiness,
            tolerance,
            min_elevation: tile_min,
            verified: false,
        }
    }

    fn histogram(
        &self,
        footprint: &AABB<f64>,
        grid_size: usize,
        visible: &[(usize, Point3<f64>)],
    ) -> Vec<Option<Cell>> {
        let mut cells: Vec<Option<Cell>> = vec![None; grid_size * grid_size];
        for (idx, pos) in visible {
            let cell = &mut cells[cell_of(footprint, grid_size, pos)];
            match cell {
                None => {
                    *cell = Some(Cell {
                        lowest: *idx,
                        min: pos.z,
                        max: pos.z,
                    })
                }
                Some(cell) => {
                    if pos.z < cell.min {
                        cell.min = pos.z;
                        cell.lowest = *idx;
                    }
                    cell.max = cell.max.max(pos.z);
                }
            }
        }
        cells
    }

    /// Computes the selection tolerance and the trustworthiness of a tile from the elevation profile of its cells
    fn profile_statistics(
        &self,
        tile: NodeId,
        cells: &[Option<Cell>],
        variations: &Sample,
        tile_min: f64,
        tile_max: f64,
        cell_size: f64,
    ) -> Result<(f64, f64), GroundDetectionError> {
        if variations.len() < 2 {
            return Err(GroundDetectionError::DegenerateStatistics {
                tile: tile.index(),
                reason: format!("{} elevation variations between cells", variations.len()),
            });
        }
        let degenerate = |reason: &str| GroundDetectionError::DegenerateStatistics {
            tile: tile.index(),
            reason: reason.to_owned(),
        };
        let (_, q3) = variations.quartiles().ok_or_else(|| degenerate("no quartiles"))?;
        let iqr = variations.iqr().ok_or_else(|| degenerate("no quartiles"))?;
        let median = variations.median().ok_or_else(|| degenerate("no median"))?;

        let tolerance = (q3 + self.params.iqr_tolerance_factor * iqr).max(HISTOGRAM_PRECISION);

        let low_spread = cells
            .iter()
            .flatten()
            .map(|cell| cell.min - tile_min)
            .fold(0.0, f64::max);
        let total_spread = tile_max - tile_min;
        let low_share = if total_spread <= HISTOGRAM_PRECISION {
            1.0
        } else {
            (low_spread / total_spread).clamp(0.0, 1.0)
        };
        let smoothness = 1.0 / (1.0 + median / cell_size);
        let consistency = 1.0 / (1.0 + iqr / cell_size);
        Ok((tolerance, (low_share + smoothness + consistency) / 3.0))
    }

    /// Number of seed points a tile with `count` visible points gets. Deep tiles get fewer seeds
    fn seed_budget(&self, node: &QuadNode, count: usize) -> usize {
        let base = count
            .div_ceil(self.params.points_per_seed.max(1))
            .max(MIN_SEEDS_PER_TILE);
        if self.tree_depth == 0 {
            return base;
        }
        let relative_depth = node.depth() as f64 / self.tree_depth as f64;
        let reduction = self.params.depth_seed_correction.clamp(0.0, 1.0) * relative_depth;
        ((base as f64 * (1.0 - reduction)).floor() as usize).max(MIN_SEEDS_PER_TILE)
    }

    fn accepts_extra_seed(&self, rise: f64, variations: &Sample) -> bool {
        match self.params.extra_seed_policy {
            ExtraSeedPolicy::PercentileRatio { max_ratio } => {
                let (p25, p75) = match variations.quartiles() {
                    Some(q) => q,
                    None => return false,
                };
                let ratio = if p25 > HISTOGRAM_PRECISION {
                    p75 / p25
                } else if p75 <= HISTOGRAM_PRECISION {
                    1.0
                } else {
                    f64::INFINITY
                };
                rise <= p75 && ratio <= max_ratio
            }
            ExtraSeedPolicy::AverageIqr { iqr_factor } => {
                match (variations.mean(), variations.iqr()) {
                    (Some(mean), Some(iqr)) => rise <= mean + iqr_factor * iqr,
                    _ => false,
                }
            }
        }
    }
}

/// Row-major index of the seed grid cell that contains `pos`
fn cell_of(footprint: &AABB<f64>, grid_size: usize, pos: &Point3<f64>) -> usize {
    let extent = footprint.extent();
    let axis_index = |value: f64, min: f64, length: f64| -> usize {
        if length <= f64::EPSILON {
            return 0;
        }
        let idx = ((value - min) / length * grid_size as f64).floor();
        (idx.max(0.0) as usize).min(grid_size - 1)
    };
    let column = axis_index(pos.x, footprint.min().x, extent.x);
    let row = axis_index(pos.y, footprint.min().y, extent.y);
    row * grid_size + column
}

/// Absolute differences between the lowest elevations of horizontally and vertically adjacent cells
fn neighbour_variations(cells: &[Option<Cell>], grid_size: usize) -> Vec<f64> {
    let mut variations = vec![];
    for row in 0..grid_size {
        for column in 0..grid_size {
            let current = match &cells[row * grid_size + column] {
                Some(cell) => cell,
                None => continue,
            };
            if column + 1 < grid_size {
                if let Some(right) = &cells[row * grid_size + column + 1] {
                    variations.push((current.min - right.min).abs());
                }
            }
            if row + 1 < grid_size {
                if let Some(up) = &cells[(row + 1) * grid_size + column] {
                    variations.push((current.min - up.min).abs());
                }
            }
        }
    }
    variations
}

fn xy_distance_squared(a: &Point3<f64>, b: &Point3<f64>) -> f64 {
    (a.x - b.x).powi(2) + (a.y - b.y).powi(2)
}

/// Extends `selected` with points from `candidates` until it holds `budget` points. If nothing is selected
/// yet, starts with the lowest candidate. Then repeatedly takes the candidate farthest (in XY) from all
/// selected points. Ties go to the candidate that comes first in `candidates`
fn farthest_point_sampling<F: Fn(usize) -> Point3<f64>>(
    candidates: &[usize],
    selected: &mut Vec<usize>,
    budget: usize,
    position: &F,
) {
    let mut remaining: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|c| !selected.contains(c))
        .collect();

    if selected.is_empty() && budget > 0 {
        let lowest = remaining
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| position(**a).z.total_cmp(&position(**b).z))
            .map(|(slot, _)| slot);
        if let Some(slot) = lowest {
            selected.push(remaining.remove(slot));
        }
    }

    // Squared XY distance of every remaining candidate to its closest selected point
    let mut distances: Vec<f64> = remaining
        .iter()
        .map(|candidate| {
            let p = position(*candidate);
            selected
                .iter()
                .map(|s| xy_distance_squared(&p, &position(*s)))
                .fold(f64::INFINITY, f64::min)
        })
        .collect();

    while selected.len() < budget && !remaining.is_empty() {
        let mut best_slot = 0;
        for (slot, distance) in distances.iter().enumerate().skip(1) {
            if *distance > distances[best_slot] {
                best_slot = slot;
            }
        }
        let chosen = remaining.remove(best_slot);
        distances.remove(best_slot);
        selected.push(chosen);

        let p = position(chosen);
        for (candidate, distance) in remaining.iter().zip(distances.iter_mut()) {
            *distance = distance.min(xy_distance_squared(&position(*candidate), &p));
        }
    }
}
