//! The ground test for single points and its application to whole tiles.
//!
//! [evaluate_point] is the one definition of the per-point test, [evaluate_point_indexed] runs the same test
//! with the triangle lookup going through a [TriangleIndex]. Every [Accelerator](crate::accelerator::Accelerator)
//! runs one of these, which keeps sequential and data-parallel execution in agreement.

use ground_core::{
    classification::PointClass,
    containers::TileBuffer,
    nalgebra::Point3,
};
use log::debug;

use crate::{
    accelerator::AcceleratorDispatch,
    error::{GroundDetectionError, Result},
    estimation::Thresholds,
    params::GroundDetectionParameters,
    quadtree::{NodeId, Quadtree},
    seeds::Seed,
    surface::{nearest_triangle, project_onto_plane, Surface, TriangleIndex},
};

/// Vectors shorter than this are treated as zero when measuring angles
const ANGLE_EPSILON: f64 = 1e-12;

/// Outcome of the ground test for a single point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointVerdict {
    Ground,
    /// The point is too far away from the surface
    HeightNotValid,
    /// The point rises too steeply from one of the triangle corners
    SlopeNotValid,
    /// There is no triangle to test the point against
    TriangleNotFound,
    /// The point is filtered out and was not tested
    Invisible,
}

impl PointVerdict {
    /// The class a point with this verdict gets. `None` for points that keep their current class
    pub fn class(self) -> Option<PointClass> {
        match self {
            PointVerdict::Ground => Some(PointClass::Ground),
            PointVerdict::Invisible => None,
            _ => Some(PointClass::NonGround),
        }
    }
}

/// Thresholds of the per-point test for one tile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointTestParams {
    /// Maximum angle in degrees
    pub slope_threshold: f64,
    /// Maximum distance between a point and its projection onto the triangle plane
    pub effective_height: f64,
}

impl PointTestParams {
    /// Scales `height` by the trustworthiness and density of a tile:
    /// `height * clamp(trust, min, max) / density`
    pub fn for_tile(
        slope_threshold: f64,
        height: f64,
        trustworthiness: f64,
        density: f64,
        params: &GroundDetectionParameters,
    ) -> Self {
        let trust_factor = trustworthiness.clamp(params.trust_factor_min, params.trust_factor_max);
        let density = if density > 0.0 { density } else { 1.0 };
        Self {
            slope_threshold,
            effective_height: height * trust_factor / density,
        }
    }
}

/// Tests a single point against the nearest of `triangles`.
///
/// The point is projected onto the plane of its nearest triangle. It fails the height test if the squared
/// distance to its projection exceeds the squared effective height. It fails the slope test if, at any
/// triangle corner `v`, the angle between `v -> point` and `v -> projection` exceeds the slope threshold.
/// Height is tested first.
pub fn evaluate_point(
    point: &Point3<f64>,
    triangles: &[[Point3<f64>; 3]],
    params: &PointTestParams,
) -> PointVerdict {
    match nearest_triangle(point, triangles) {
        Some(idx) => test_against(point, &triangles[idx], params),
        None => PointVerdict::TriangleNotFound,
    }
}

/// Same as [evaluate_point], finding the nearest triangle through `index`, which must be built from
/// `triangles`
pub fn evaluate_point_indexed(
    point: &Point3<f64>,
    triangles: &[[Point3<f64>; 3]],
    index: &TriangleIndex,
    params: &PointTestParams,
) -> PointVerdict {
    match index.nearest(point, triangles) {
        Some(idx) => test_against(point, &triangles[idx], params),
        None => PointVerdict::TriangleNotFound,
    }
}

fn test_against(point: &Point3<f64>, triangle: &[Point3<f64>; 3], params: &PointTestParams) -> PointVerdict {
    let proj = match project_onto_plane(point, triangle) {
        Some(proj) => proj,
        None => return PointVerdict::TriangleNotFound,
    };
    let offset = point - proj;
    if offset.norm_squared() > params.effective_height * params.effective_height {
        return PointVerdict::HeightNotValid;
    }
    if offset.norm() <= ANGLE_EPSILON {
        return PointVerdict::Ground;
    }
    for vertex in triangle {
        let to_point = point - vertex;
        let to_proj = proj - vertex;
        let (a, b) = (to_point.norm(), to_proj.norm());
        if a <= ANGLE_EPSILON || b <= ANGLE_EPSILON {
            continue;
        }
        let angle = (to_point.dot(&to_proj) / (a * b))
            .clamp(-1.0, 1.0)
            .acos()
            .to_degrees();
        if angle > params.slope_threshold {
            return PointVerdict::SlopeNotValid;
        }
    }
    PointVerdict::Ground
}

/// Everything needed to classify the points of one tile
#[derive(Debug, Clone)]
pub struct TileContext {
    pub tile: NodeId,
    /// Corners of the tile-local triangulation
    pub triangles: Vec<[Point3<f64>; 3]>,
    pub test: PointTestParams,
}

/// Verdicts of one classified tile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileVerdicts {
    pub verdicts: Vec<PointVerdict>,
}

impl TileVerdicts {
    pub fn count(&self, verdict: PointVerdict) -> usize {
        self.verdicts.iter().filter(|v| **v == verdict).count()
    }

    /// Writes the classes of all tested points into `buffer`. Untested points keep their class
    pub fn apply(&self, buffer: &mut TileBuffer) {
        for (class, verdict) in buffer.classification_mut().iter_mut().zip(&self.verdicts) {
            if let Some(new_class) = verdict.class() {
                *class = new_class;
            }
        }
    }
}

/// Classifies the points of quadtree tiles against the global ground surface
pub struct TileClassifier<'a> {
    tree: &'a Quadtree,
    surface: &'a Surface,
    thresholds: Thresholds,
    params: &'a GroundDetectionParameters,
}

impl<'a> TileClassifier<'a> {
    /// `tree` must have the triangles of `surface` indexed
    pub fn new(
        tree: &'a Quadtree,
        surface: &'a Surface,
        thresholds: Thresholds,
        params: &'a GroundDetectionParameters,
    ) -> Self {
        Self {
            tree,
            surface,
            thresholds,
            params,
        }
    }

    /// Builds the local triangulation of `tile` from the vertices of all surface triangles overlapping the
    /// tile footprint. Fails with [GroundDetectionError::EmptyRegion] if this yields no triangle
    pub fn prepare(&self, tile: NodeId, seed: Option<&Seed>) -> Result<TileContext> {
        let footprint = self.tree.node(tile).bounds();
        let overlapping = self.tree.triangles_overlapping(footprint, self.surface);
        let local = Surface::triangulate(&self.surface.vertices_of(&overlapping));
        if local.is_empty() {
            return Err(GroundDetectionError::EmptyRegion {
                tile: tile.index(),
                what: "surface triangles",
            });
        }
        let (trustworthiness, density) = match seed {
            Some(seed) if seed.density() > 0.0 => (seed.trustworthiness(), seed.density()),
            _ => (1.0, 1.0),
        };
        debug!(
            "Tile {}: {} local triangles from {} surface triangles",
            tile.index(),
            local.triangle_count(),
            overlapping.len()
        );
        Ok(TileContext {
            tile,
            triangles: local.triangle_corners(),
            test: PointTestParams::for_tile(
                self.thresholds.slope,
                self.thresholds.classification_height,
                trustworthiness,
                density,
                self.params,
            ),
        })
    }

    /// Tests every visible point of `buffer` against the local triangulation in `context`
    pub fn classify(
        &self,
        context: &TileContext,
        buffer: &TileBuffer,
        dispatch: &AcceleratorDispatch,
    ) -> TileVerdicts {
        let (indices, points): (Vec<usize>, Vec<Point3<f64>>) =
            buffer.visible_positions().map(|(idx, p)| (idx, *p)).unzip();
        let results = dispatch.evaluate(context.tile, &points, &context.triangles, &context.test);

        let mut verdicts = vec![PointVerdict::Invisible; buffer.len()];
        for (idx, verdict) in indices.into_iter().zip(results) {
            verdicts[idx] = verdict;
        }
        TileVerdicts { verdicts }
    }

    /// Verdicts for a tile that has no local triangulation: every visible point is non-ground
    pub fn unresolved(buffer: &TileBuffer) -> TileVerdicts {
        TileVerdicts {
            verdicts: buffer
                .visibility()
                .iter()
                .map(|visible| {
                    if *visible {
                        PointVerdict::TriangleNotFound
                    } else {
                        PointVerdict::Invisible
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_triangle() -> [Point3<f64>; 3] {
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(10.0, 0.0, 0.0),
            Point3::new(0.0, 10.0, 0.0),
        ]
    }

    fn test_params(slope: f64, height: f64) -> PointTestParams {
        PointTestParams {
            slope_threshold: slope,
            effective_height: height,
        }
    }

    #[test]
    fn test_point_on_surface_is_ground() {
        let verdict = evaluate_point(&Point3::new(2.0, 2.0, 0.0), &[flat_triangle()], &test_params(1.0, 0.0));
        assert_eq!(verdict, PointVerdict::Ground);
    }

    #[test]
    fn test_height_is_tested_first() {
        let verdict = evaluate_point(&Point3::new(0.1, 0.1, 50.0), &[flat_triangle()], &test_params(1.0, 1.0));
        assert_eq!(verdict, PointVerdict::HeightNotValid);
    }

    #[test]
    fn test_slope_near_corner() {
        // 0.5 above the surface, 1.0 away from the corner at the origin: ~26.6 degrees
        let point = Point3::new(1.0, 0.0, 0.5);
        let verdict = evaluate_point(&point, &[flat_triangle()], &test_params(20.0, 1.0));
        assert_eq!(verdict, PointVerdict::SlopeNotValid);
        let verdict = evaluate_point(&point, &[flat_triangle()], &test_params(30.0, 1.0));
        assert_eq!(verdict, PointVerdict::Ground);
    }

    #[test]
    fn test_no_triangles() {
        let verdict = evaluate_point(&Point3::origin(), &[], &test_params(10.0, 1.0));
        assert_eq!(verdict, PointVerdict::TriangleNotFound);
        assert_eq!(verdict.class(), Some(PointClass::NonGround));
        assert_eq!(PointVerdict::Invisible.class(), None);
    }

    #[test]
    fn test_larger_height_never_removes_ground() {
        let triangles = [flat_triangle()];
        let points: Vec<Point3<f64>> = (0..50)
            .map(|i| Point3::new(1.0 + (i % 7) as f64, 1.0 + (i % 5) as f64, (i as f64) * 0.05))
            .collect();
        let mut previous: Vec<bool> = vec![false; points.len()];
        for height in [0.1, 0.5, 1.0, 2.0, 5.0] {
            let current: Vec<bool> = points
                .iter()
                .map(|p| evaluate_point(p, &triangles, &test_params(60.0, height)) == PointVerdict::Ground)
                .collect();
            for (before, now) in previous.iter().zip(&current) {
                assert!(!before || *now);
            }
            previous = current;
        }
    }

    #[test]
    fn test_indexed_test_gives_the_same_verdicts() {
        let mut triangles = vec![];
        for y in 0..6 {
            for x in 0..6 {
                let (x0, y0) = (x as f64 * 2.0, y as f64 * 2.0);
                let z = |dx: f64, dy: f64| 0.2 * (x0 + dx) + 0.1 * (y0 + dy);
                triangles.push([
                    Point3::new(x0, y0, z(0.0, 0.0)),
                    Point3::new(x0 + 2.0, y0, z(2.0, 0.0)),
                    Point3::new(x0, y0 + 2.0, z(0.0, 2.0)),
                ]);
                triangles.push([
                    Point3::new(x0 + 2.0, y0, z(2.0, 0.0)),
                    Point3::new(x0 + 2.0, y0 + 2.0, z(2.0, 2.0)),
                    Point3::new(x0, y0 + 2.0, z(0.0, 2.0)),
                ]);
            }
        }
        let index = TriangleIndex::new(&triangles);
        let params = test_params(10.0, 0.4);
        let verdicts: Vec<(PointVerdict, PointVerdict)> = (0..900)
            .map(|i| {
                let x = (i % 30) as f64 * 0.5 - 1.5;
                let y = (i / 30) as f64 * 0.5 - 1.5;
                let point = Point3::new(x, y, 0.2 * x + 0.1 * y + ((i * 31) % 11) as f64 * 0.05);
                (
                    evaluate_point(&point, &triangles, &params),
                    evaluate_point_indexed(&point, &triangles, &index, &params),
                )
            })
            .collect();
        assert!(verdicts.iter().all(|(plain, indexed)| plain == indexed));
        assert!(verdicts.iter().any(|(plain, _)| *plain == PointVerdict::Ground));
        assert!(verdicts.iter().any(|(plain, _)| *plain != PointVerdict::Ground));
    }

    #[test]
    fn test_effective_height_scales_with_trust_and_density() {
        let params = GroundDetectionParameters::default();
        let test = PointTestParams::for_tile(10.0, 1.0, 2.0, 2.0, &params);
        assert_eq!(test.effective_height, 1.5 / 2.0);
        let test = PointTestParams::for_tile(10.0, 1.0, 0.1, 0.0, &params);
        assert_eq!(test.effective_height, 0.5);
    }
}
