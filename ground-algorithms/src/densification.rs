//! Iterative densification of the ground surface.
//!
//! Every iteration looks at the points below each surface triangle that is still coarse and picks the one
//! closest to the triangle centroid that passes the ground test. All picked points are added to the surface,
//! which is then triangulated again. Automatic thresholds are estimated again from the denser surface until
//! they stop changing. The loop ends when nothing is added, when the number of triangles stays the same or
//! after [GroundDetectionParameters::densification_iterations] iterations.

use ground_core::{
    nalgebra::{Point2, Point3},
    source::{Channels, PointSource},
};
use log::{debug, info};

use crate::{
    classifier::{evaluate_point, PointTestParams, PointVerdict},
    error::{GroundDetectionError, Result},
    estimation::{estimate_thresholds, Thresholds},
    params::GroundDetectionParameters,
    progress::ProgressMonitor,
    quadtree::{NodeId, Quadtree},
    seeds::Seed,
    surface::{contains_xy, Surface, DUPLICATE_EPSILON},
};

/// Number of consecutive iterations with unchanged thresholds after which they are no longer estimated
pub const THRESHOLD_STRIKES: usize = 2;

/// Returns `false` once at least two edges of `triangle` are shorter than `edge_threshold`
pub fn requires_densification(triangle: &[Point3<f64>; 3], edge_threshold: f64) -> bool {
    let [a, b, c] = triangle;
    let short_edges = [(a, b), (b, c), (c, a)]
        .iter()
        .filter(|(p, q)| (q.coords - p.coords).norm() < edge_threshold)
        .count();
    short_edges < 2
}

fn centroid(triangle: &[Point3<f64>; 3]) -> Point3<f64> {
    let [a, b, c] = triangle;
    Point3::from((a.coords + b.coords + c.coords) / 3.0)
}

fn is_corner(triangle: &[Point3<f64>; 3], point: &Point3<f64>) -> bool {
    triangle
        .iter()
        .any(|v| (v.x - point.x).abs() <= DUPLICATE_EPSILON && (v.y - point.y).abs() <= DUPLICATE_EPSILON)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DensificationSummary {
    pub iterations: usize,
    pub added_points: usize,
}

/// The surface after densification, with the thresholds estimated from it
#[derive(Debug, Clone)]
pub struct DensifiedSurface {
    pub surface: Surface,
    pub thresholds: Thresholds,
    pub summary: DensificationSummary,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f64,
    point: Point3<f64>,
}

/// Grows the ground surface from the points of the seed tiles
pub struct Densifier<'a> {
    params: &'a GroundDetectionParameters,
    tiles: &'a [NodeId],
    seeds: &'a [Seed],
}

impl<'a> Densifier<'a> {
    /// `seeds[i]` has to be the seed of `tiles[i]`
    pub fn new(params: &'a GroundDetectionParameters, tiles: &'a [NodeId], seeds: &'a [Seed]) -> Self {
        Self {
            params,
            tiles,
            seeds,
        }
    }

    /// Densifies `surface`, which was triangulated from `points`. `tree` must have the triangles of `surface`
    /// indexed. It is indexed again for every new surface. Every tile handled counts as one unit of work
    /// of `monitor`
    pub fn densify<S: PointSource + ?Sized>(
        &self,
        tree: &mut Quadtree,
        source: &mut S,
        mut points: Vec<Point3<f64>>,
        mut surface: Surface,
        mut thresholds: Thresholds,
        monitor: &ProgressMonitor,
    ) -> Result<DensifiedSurface> {
        let mut summary = DensificationSummary::default();
        let mut strikes = 0;
        while summary.iterations < self.params.densification_iterations {
            let open: Vec<bool> = surface
                .triangle_corners()
                .iter()
                .map(|triangle| requires_densification(triangle, self.params.triangle_edge_threshold))
                .collect();
            if !open.iter().any(|open| *open) {
                debug!("No triangle left to densify");
                break;
            }

            let added = self.collect_points(tree, source, &surface, &open, &thresholds, monitor)?;
            summary.iterations += 1;
            if added.is_empty() {
                debug!("Densification iteration {} found no point to add", summary.iterations);
                break;
            }
            let previous_triangles = surface.triangle_count();
            summary.added_points += added.len();
            points.extend(added.iter().copied());
            surface = Surface::triangulate(&points);
            tree.index_triangles(&surface);
            info!(
                "Densification iteration {}: {} points added, {} triangles",
                summary.iterations,
                added.len(),
                surface.triangle_count()
            );
            if surface.triangle_count() == previous_triangles {
                break;
            }

            if strikes < THRESHOLD_STRIKES {
                let estimated = estimate_thresholds(&surface, self.params);
                if estimated == thresholds {
                    strikes += 1;
                } else {
                    strikes = 0;
                }
                thresholds = estimated;
            }
        }
        Ok(DensifiedSurface {
            surface,
            thresholds,
            summary,
        })
    }

    /// For every open triangle, the accepted point below it that is closest to its centroid. Equal
    /// distances go to the lower point, then to the point seen first
    fn collect_points<S: PointSource + ?Sized>(
        &self,
        tree: &Quadtree,
        source: &mut S,
        surface: &Surface,
        open: &[bool],
        thresholds: &Thresholds,
        monitor: &ProgressMonitor,
    ) -> Result<Vec<Point3<f64>>> {
        let mut best: Vec<Option<Candidate>> = vec![None; surface.triangle_count()];
        for (tile, seed) in self.tiles.iter().zip(self.seeds) {
            if !monitor.check_continue() {
                return Err(GroundDetectionError::UserAborted { tiles_completed: 0 });
            }
            let buffer = source.query_points(tree.node(*tile).region(), Channels::GEOMETRY)?;
            let (trustworthiness, density) = if seed.density() > 0.0 {
                (seed.trustworthiness(), seed.density())
            } else {
                (1.0, 1.0)
            };
            let test = PointTestParams::for_tile(
                thresholds.slope,
                thresholds.height,
                trustworthiness,
                density,
                self.params,
            );

            for (_, point) in buffer.visible_positions() {
                let triangle_idx = match tree.find_triangle(point, surface) {
                    Some(idx) if open[idx] => idx,
                    _ => continue,
                };
                let triangle = surface.triangle(triangle_idx);
                if !contains_xy(&triangle, &Point2::new(point.x, point.y)) || is_corner(&triangle, point) {
                    continue;
                }
                if evaluate_point(point, &[triangle], &test) != PointVerdict::Ground {
                    continue;
                }
                let distance = (point - centroid(&triangle)).norm();
                let slot = &mut best[triangle_idx];
                let better = match slot {
                    None => true,
                    Some(current) => distance
                        .total_cmp(&current.distance)
                        .then(point.z.total_cmp(&current.point.z))
                        .is_lt(),
                };
                if better {
                    *slot = Some(Candidate {
                        distance,
                        point: *point,
                    });
                }
            }
            monitor.work_completed(1);
        }
        Ok(best.into_iter().flatten().map(|candidate| candidate.point).collect())
    }
}

#[cfg(test)]
mod tests {
    use ground_core::source::InMemoryPointSource;

    use super::*;
    use crate::{params::Threshold, progress::NoProgress, quadtree::SplitLimits};

    fn grid(size: usize, elevation: impl Fn(usize, usize) -> f64) -> Vec<Point3<f64>> {
        let mut points = vec![];
        for y in 0..size {
            for x in 0..size {
                points.push(Point3::new(x as f64, y as f64, elevation(x, y)));
            }
        }
        points
    }

    fn corners() -> Vec<Point3<f64>> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(9.0, 0.0, 0.0),
            Point3::new(0.0, 9.0, 0.0),
            Point3::new(9.0, 9.0, 0.0),
        ]
    }

    fn flat_thresholds() -> Thresholds {
        Thresholds {
            slope: 45.0,
            height: 0.5,
            classification_height: 0.5,
        }
    }

    fn densify(points: Vec<Point3<f64>>, params: &GroundDetectionParameters) -> DensifiedSurface {
        let mut source = InMemoryPointSource::new(points);
        let bounds = source.bounds().unwrap();
        let limits = SplitLimits {
            tile_size: 20.0,
            max_data_size: 1000,
            max_depth: 16,
        };
        let (mut tree, tiles) = Quadtree::build(bounds, &mut source, limits).unwrap();
        let seeds: Vec<Seed> = tiles.iter().map(|tile| Seed::empty(*tile)).collect();
        let surface = Surface::triangulate(&corners());
        tree.index_triangles(&surface);
        let monitor = ProgressMonitor::new(&NoProgress, 1);
        Densifier::new(params, &tiles, &seeds)
            .densify(&mut tree, &mut source, corners(), surface, flat_thresholds(), &monitor)
            .unwrap()
    }

    #[test]
    fn test_short_edges_end_densification() {
        let coarse = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(0.0, 5.0, 0.0),
        ];
        assert!(requires_densification(&coarse, 1.0));
        let thin = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.5, 0.0, 0.0),
            Point3::new(0.0, 5.0, 0.0),
        ];
        assert!(requires_densification(&thin, 1.0));
        let small = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.5, 0.0, 0.0),
            Point3::new(0.0, 0.5, 0.0),
        ];
        assert!(!requires_densification(&small, 1.0));
    }

    #[test]
    fn test_one_point_per_triangle_closest_to_the_centroid() {
        let params = GroundDetectionParameters::default()
            .with_densification(1)
            .with_slope_threshold(Threshold::Value(45.0))
            .with_height_threshold(Threshold::Value(0.5));
        let densified = densify(grid(10, |_, _| 0.0), &params);
        assert_eq!(densified.summary.iterations, 1);
        assert_eq!(densified.summary.added_points, 2);
        // Both triangles of the square have their centroids on grid points
        let added = &densified.surface.points()[4..];
        for point in added {
            assert!(point.x == 3.0 || point.x == 6.0);
            assert!(point.y == 3.0 || point.y == 6.0);
        }
        assert!(densified.surface.triangle_count() > 2);
    }

    #[test]
    fn test_raised_points_are_never_added() {
        let params = GroundDetectionParameters::default().with_densification(5);
        let raised = grid(10, |x, y| if (x == 0 || x == 9) && (y == 0 || y == 9) { 0.0 } else { 50.0 });
        let densified = densify(raised, &params);
        assert_eq!(densified.summary.iterations, 1);
        assert_eq!(densified.summary.added_points, 0);
        assert_eq!(densified.surface.triangle_count(), 2);
        assert_eq!(densified.thresholds, flat_thresholds());
    }

    #[test]
    fn test_iterations_are_bounded() {
        let params = GroundDetectionParameters::default()
            .with_densification(3)
            .with_slope_threshold(Threshold::Value(45.0))
            .with_height_threshold(Threshold::Value(0.5));
        let densified = densify(grid(10, |_, _| 0.0), &params);
        assert_eq!(densified.summary.iterations, 3);
        assert!(densified.summary.added_points > 2);
        assert_eq!(
            densified.surface.points().len(),
            4 + densified.summary.added_points
        );
    }
}
