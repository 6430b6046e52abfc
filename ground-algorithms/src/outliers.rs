use std::collections::HashMap;

use ground_core::nalgebra::Point3;
use log::{debug, info};
use rayon::prelude::*;

use crate::{
    params::{GroundDetectionParameters, HISTOGRAM_PRECISION},
    quadtree::{NodeId, Quadtree},
    segmentation::{ransac_plane_par, ransac_plane_serial},
    seeds::Seed,
};

/// An ancestor whose gathered seed elevations spread less than this multiple of the tile tolerance is
/// taken to be a plausible local ground plane
pub const PLAUSIBLE_PLANE_FACTOR: f64 = 4.0;

/// What happens to the seed points of one tile
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Keep,
    Clear,
    Remove(Vec<usize>),
}

/// Result of one outlier exclusion pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExclusionSummary {
    /// Tiles whose seeds were dropped because the tile is too sparse
    pub cleared_tiles: usize,
    /// Seed points removed as plane outliers
    pub removed_points: usize,
}

/// Removes seed points that do not fit a plane fitted to the seeds around their tile
pub struct OutlierExcluder<'a> {
    params: &'a GroundDetectionParameters,
}

impl<'a> OutlierExcluder<'a> {
    pub fn new(params: &'a GroundDetectionParameters) -> Self {
        Self { params }
    }

    /// Runs the exclusion over `seeds`, which must belong to the leaves of `tree`. Every decision is made
    /// on the seed points as they were when the pass started, so the result does not depend on the order of
    /// the seeds. Seeds that were already processed by an earlier pass are left alone
    pub fn exclude(&self, tree: &Quadtree, seeds: &mut [Seed]) -> ExclusionSummary {
        let densities: Vec<f64> = seeds
            .iter()
            .map(Seed::density)
            .filter(|d| *d > 0.0)
            .collect();
        if densities.is_empty() {
            return ExclusionSummary::default();
        }
        let average_density = densities.iter().sum::<f64>() / densities.len() as f64;
        let sparse_limit = self.params.sparse_density_ratio * average_density;

        let snapshot: Vec<Vec<Point3<f64>>> = seeds
            .iter()
            .map(|seed| {
                if self.is_sparse(seed, sparse_limit) {
                    vec![]
                } else {
                    seed.points().to_vec()
                }
            })
            .collect();
        let by_tile: HashMap<NodeId, usize> = seeds
            .iter()
            .enumerate()
            .map(|(idx, seed)| (seed.tile(), idx))
            .collect();

        let decide = |(idx, seed): (usize, &Seed)| -> Decision {
            if seed.is_verified() {
                Decision::Keep
            } else if self.is_sparse(seed, sparse_limit) {
                Decision::Clear
            } else {
                self.decide_outliers(tree, seed, idx, &snapshot, &by_tile)
            }
        };
        let decisions: Vec<Decision> = if self.params.use_multithread {
            seeds.par_iter().enumerate().map(decide).collect()
        } else {
            seeds.iter().enumerate().map(decide).collect()
        };

        let mut summary = ExclusionSummary::default();
        for (seed, decision) in seeds.iter_mut().zip(decisions) {
            match decision {
                Decision::Keep => {}
                Decision::Clear => {
                    debug!("Clearing seeds of sparse tile {}", seed.tile().index());
                    summary.cleared_tiles += 1;
                    seed.clear();
                }
                Decision::Remove(indices) => {
                    summary.removed_points += indices.len();
                    seed.remove_points(&indices);
                }
            }
            seed.mark_verified();
        }
        info!(
            "Outlier exclusion cleared {} tiles and removed {} seed points",
            summary.cleared_tiles, summary.removed_points
        );
        summary
    }

    fn is_sparse(&self, seed: &Seed, sparse_limit: f64) -> bool {
        !seed.is_verified() && seed.density() > 0.0 && seed.density() < sparse_limit
    }

    fn decide_outliers(
        &self,
        tree: &Quadtree,
        seed: &Seed,
        seed_idx: usize,
        snapshot: &[Vec<Point3<f64>>],
        by_tile: &HashMap<NodeId, usize>,
    ) -> Decision {
        let own = &snapshot[seed_idx];
        if own.is_empty() {
            return Decision::Keep;
        }
        let neighborhood = self.gather_neighborhood(tree, seed, snapshot, by_tile);
        let distance_threshold = seed.tolerance().max(HISTOGRAM_PRECISION);
        let random_seed = self.params.random_seed ^ seed.tile().index() as u64;
        let fit = if self.params.use_multithread {
            ransac_plane_par
        } else {
            ransac_plane_serial
        };
        let (_, inliers) = match fit(
            &neighborhood,
            distance_threshold,
            self.params.ransac_iterations,
            random_seed,
        ) {
            Some(model) => model,
            None => return Decision::Keep,
        };

        // The tile's own points come first in the neighborhood
        let mut is_inlier = vec![false; neighborhood.len()];
        for idx in &inliers {
            is_inlier[*idx] = true;
        }
        let outliers: Vec<usize> = (0..own.len()).filter(|idx| !is_inlier[*idx]).collect();
        if outliers.is_empty() {
            return Decision::Keep;
        }
        if self.params.keep_trustworthy_seeds
            && seed.trustworthiness() >= self.params.trustworthy_ceiling
        {
            return Decision::Keep;
        }

        let remaining = neighborhood.len() - outliers.len();
        let ratio = inliers.len() as f64 / remaining.max(1) as f64;
        let required = self.params.ransac_inlier_threshold
            + self.params.ransac_correction_factor * seed.trustworthiness();
        if ratio >= required {
            debug!(
                "Tile {}: removing {} of {} seeds (inlier ratio {:.3})",
                seed.tile().index(),
                outliers.len(),
                own.len(),
                ratio
            );
            Decision::Remove(outliers)
        } else {
            Decision::Keep
        }
    }

    /// Collects the seed points around the tile of `seed`, starting with the tile's own points. Walks up the
    /// tree until enough points were gathered or the gathered elevations look like a plane
    fn gather_neighborhood(
        &self,
        tree: &Quadtree,
        seed: &Seed,
        snapshot: &[Vec<Point3<f64>>],
        by_tile: &HashMap<NodeId, usize>,
    ) -> Vec<Point3<f64>> {
        let tile = seed.tile();
        let own = &snapshot[by_tile[&tile]];
        let mut neighborhood = own.clone();
        let plane_spread = seed.tolerance() * PLAUSIBLE_PLANE_FACTOR;

        for ancestor in tree.ancestors(tile) {
            neighborhood.truncate(own.len());
            for leaf in tree.leaves_below(ancestor) {
                if leaf == tile {
                    continue;
                }
                if let Some(idx) = by_tile.get(&leaf) {
                    neighborhood.extend_from_slice(&snapshot[*idx]);
                }
            }
            if neighborhood.len() >= self.params.min_neighborhood_points {
                break;
            }
            if neighborhood.len() > own.len() && elevation_spread(&neighborhood) <= plane_spread {
                break;
            }
        }
        neighborhood
    }
}

fn elevation_spread(points: &[Point3<f64>]) -> f64 {
    let (min, max) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), p| {
            (min.min(p.z), max.max(p.z))
        });
    max - min
}
