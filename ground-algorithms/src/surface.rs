use std::{cmp::Ordering, collections::HashMap};

use ground_core::{
    math::AABB,
    nalgebra::{Point2, Point3, Vector2, Vector3},
};

use crate::bounds::calculate_bounds;

/// Points closer than this in XY are merged before triangulating
pub const DUPLICATE_EPSILON: f64 = 1e-9;
/// Slack on barycentric coordinates when testing if a point lies inside a triangle
const CONTAINMENT_EPSILON: f64 = 1e-9;
/// Upper bound for the cells per axis of a [TriangleIndex]
const MAX_INDEX_CELLS_PER_AXIS: usize = 256;

/// A triangulated irregular network over a set of 3D points. The triangulation is computed on the XY
/// projection of the points, elevation is carried along
#[derive(Debug, Clone, Default)]
pub struct Surface {
    points: Vec<Point3<f64>>,
    triangles: Vec<[usize; 3]>,
}

impl Surface {
    /// Computes the Delaunay triangulation of `points`. Points that coincide in XY (up to
    /// [DUPLICATE_EPSILON]) are merged, keeping the lowest one. Fewer than three distinct or only collinear
    /// points result in a surface without triangles
    /// ```
    /// # use ground_algorithms::surface::Surface;
    /// # use ground_core::nalgebra::Point3;
    /// let surface = Surface::triangulate(&[
    ///     Point3::new(0.0, 0.0, 0.0),
    ///     Point3::new(1.0, 0.0, 0.0),
    ///     Point3::new(0.0, 1.0, 0.0),
    ///     Point3::new(0.0, 1.0, 5.0),
    /// ]);
    /// assert_eq!(surface.points().len(), 3);
    /// assert_eq!(surface.triangles().len(), 1);
    /// ```
    pub fn triangulate(points: &[Point3<f64>]) -> Self {
        let points = merge_duplicates(points);
        if points.len() < 3 {
            return Self {
                points,
                triangles: vec![],
            };
        }
        let coords: Vec<delaunator::Point> = points
            .iter()
            .map(|p| delaunator::Point { x: p.x, y: p.y })
            .collect();
        let triangulation = delaunator::triangulate(&coords);
        let triangles = triangulation
            .triangles
            .chunks(3)
            .map(|c| [c[0], c[1], c[2]])
            .filter(|t| plane_normal(&corners(&points, t)).is_some())
            .collect();
        Self { points, triangles }
    }

    /// Bounding box of the surface vertices, `None` for an empty surface
    pub fn bounds(&self) -> Option<AABB<f64>> {
        calculate_bounds(&self.points)
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// The three corner positions of triangle `idx`
    pub fn triangle(&self, idx: usize) -> [Point3<f64>; 3] {
        corners(&self.points, &self.triangles[idx])
    }

    /// Bounding box of triangle `idx`
    pub fn triangle_bounds(&self, idx: usize) -> AABB<f64> {
        let [a, b, c] = self.triangle(idx);
        let bounds = AABB::from_min_max_unchecked(a, a);
        AABB::extend_with_point(&AABB::extend_with_point(&bounds, &b), &c)
    }

    /// All triangles as corner positions, in triangle index order
    pub fn triangle_corners(&self) -> Vec<[Point3<f64>; 3]> {
        (0..self.triangles.len()).map(|idx| self.triangle(idx)).collect()
    }

    /// All unique edges of the triangulation as pairs of point indices `(low, high)`
    pub fn edges(&self) -> Vec<(usize, usize)> {
        let mut edges: Vec<(usize, usize)> = self
            .triangles
            .iter()
            .flat_map(|[a, b, c]| [(*a, *b), (*b, *c), (*c, *a)])
            .map(|(a, b)| (a.min(b), a.max(b)))
            .collect();
        edges.sort_unstable();
        edges.dedup();
        edges
    }

    /// Distinct corner positions of the given triangles, in order of first appearance
    pub fn vertices_of(&self, triangles: &[usize]) -> Vec<Point3<f64>> {
        let mut seen = vec![false; self.points.len()];
        let mut vertices = vec![];
        for idx in triangles {
            for &vertex in &self.triangles[*idx] {
                if !seen[vertex] {
                    seen[vertex] = true;
                    vertices.push(self.points[vertex]);
                }
            }
        }
        vertices
    }

    /// The triangle of this surface that is nearest to `point`, see [nearest_triangle]
    pub fn nearest_triangle(&self, point: &Point3<f64>) -> Option<usize> {
        nearest_triangle(point, &self.triangle_corners())
    }

    /// Like [nearest_triangle](Surface::nearest_triangle), but only considers the triangles in `candidates`
    pub fn nearest_among<I: IntoIterator<Item = usize>>(
        &self,
        point: &Point3<f64>,
        candidates: I,
    ) -> Option<usize> {
        let mut selection = NearestSelection::default();
        for idx in candidates {
            selection.offer(point, idx, &self.triangle(idx));
        }
        selection.best()
    }
}

/// Finds the triangle in `triangles` that `point` should be tested against.
///
/// Triangles whose XY footprint contains the point win over all others. Among those, the one with the
/// smallest signed height of `point` above its plane is chosen. If no triangle contains the point, the
/// triangle with the smallest XY distance is chosen. Remaining ties go to the lowest triangle index.
pub fn nearest_triangle(point: &Point3<f64>, triangles: &[[Point3<f64>; 3]]) -> Option<usize> {
    let mut selection = NearestSelection::default();
    for (idx, triangle) in triangles.iter().enumerate() {
        selection.offer(point, idx, triangle);
    }
    selection.best()
}

/// A uniform grid over the XY extent of a set of triangles. Each cell lists the triangles whose bounding box
/// overlaps it, so the triangles that can contain a point are found without looking at all of them.
///
/// Lookups give the same answer as [nearest_triangle] on the indexed triangles.
#[derive(Debug, Clone)]
pub struct TriangleIndex {
    origin: Point2<f64>,
    cell_size: Vector2<f64>,
    columns: usize,
    rows: usize,
    cells: Vec<Vec<usize>>,
}

impl TriangleIndex {
    pub fn new(triangles: &[[Point3<f64>; 3]]) -> Self {
        let boxes: Vec<(Point2<f64>, Point2<f64>)> = triangles.iter().map(padded_bounds_xy).collect();
        let (min, max) = match boxes.first() {
            Some(first) => boxes.iter().fold(*first, |(min, max), (lo, hi)| {
                (
                    Point2::new(min.x.min(lo.x), min.y.min(lo.y)),
                    Point2::new(max.x.max(hi.x), max.y.max(hi.y)),
                )
            }),
            None => {
                return Self {
                    origin: Point2::origin(),
                    cell_size: Vector2::zeros(),
                    columns: 0,
                    rows: 0,
                    cells: vec![],
                }
            }
        };
        let per_axis = ((triangles.len() as f64).sqrt().ceil() as usize).clamp(1, MAX_INDEX_CELLS_PER_AXIS);
        let extent = max - min;
        let mut index = Self {
            origin: min,
            cell_size: Vector2::new(
                (extent.x / per_axis as f64).max(f64::MIN_POSITIVE),
                (extent.y / per_axis as f64).max(f64::MIN_POSITIVE),
            ),
            columns: per_axis,
            rows: per_axis,
            cells: vec![vec![]; per_axis * per_axis],
        };
        for (idx, (lo, hi)) in boxes.iter().enumerate() {
            let (first_column, last_column) = (index.column(lo.x), index.column(hi.x));
            let (first_row, last_row) = (index.row(lo.y), index.row(hi.y));
            for row in first_row..=last_row {
                for column in first_column..=last_column {
                    index.cells[row * index.columns + column].push(idx);
                }
            }
        }
        index
    }

    fn column(&self, x: f64) -> usize {
        (((x - self.origin.x) / self.cell_size.x).max(0.0) as usize).min(self.columns - 1)
    }

    fn row(&self, y: f64) -> usize {
        (((y - self.origin.y) / self.cell_size.y).max(0.0) as usize).min(self.rows - 1)
    }

    /// Cell holding `point`, `None` outside of the indexed extent
    fn cell_of(&self, point: &Point3<f64>) -> Option<usize> {
        if self.cells.is_empty() {
            return None;
        }
        let end = self.origin
            + Vector2::new(
                self.cell_size.x * self.columns as f64,
                self.cell_size.y * self.rows as f64,
            );
        let inside = point.x >= self.origin.x && point.y >= self.origin.y && point.x <= end.x && point.y <= end.y;
        inside.then(|| self.row(point.y) * self.columns + self.column(point.x))
    }

    /// The triangle of `triangles` that is nearest to `point`, see [nearest_triangle]. `triangles` must be
    /// the slice this index was built from
    pub fn nearest(&self, point: &Point3<f64>, triangles: &[[Point3<f64>; 3]]) -> Option<usize> {
        if let Some(cell) = self.cell_of(point) {
            let mut selection = NearestSelection::default();
            for &idx in &self.cells[cell] {
                selection.offer(point, idx, &triangles[idx]);
            }
            if let Some(idx) = selection.containing() {
                return Some(idx);
            }
        }
        // Only a triangle containing the point can be found through its cell
        nearest_triangle(point, triangles)
    }
}

/// XY bounding box of `triangle`, grown so that every point accepted by [contains_xy] lies inside
fn padded_bounds_xy(triangle: &[Point3<f64>; 3]) -> (Point2<f64>, Point2<f64>) {
    let [a, b, c] = triangle;
    let min = Point2::new(a.x.min(b.x).min(c.x), a.y.min(b.y).min(c.y));
    let max = Point2::new(a.x.max(b.x).max(c.x), a.y.max(b.y).max(c.y));
    let extent = max - min;
    let pad = (extent.x + extent.y) * CONTAINMENT_EPSILON * 1e3 + f64::EPSILON;
    (
        Point2::new(min.x - pad, min.y - pad),
        Point2::new(max.x + pad, max.y + pad),
    )
}

#[derive(Default)]
struct NearestSelection {
    containing: Option<(f64, usize)>,
    closest: Option<(f64, usize)>,
}

impl NearestSelection {
    fn offer(&mut self, point: &Point3<f64>, idx: usize, triangle: &[Point3<f64>; 3]) {
        let normal = match plane_normal(triangle) {
            Some(n) => n,
            None => return,
        };
        let xy = Point2::new(point.x, point.y);
        if contains_xy(triangle, &xy) {
            let height = (point - triangle[0]).dot(&normal);
            keep_smaller(&mut self.containing, (height, idx));
        } else {
            keep_smaller(&mut self.closest, (distance_xy(triangle, &xy), idx));
        }
    }

    fn containing(&self) -> Option<usize> {
        self.containing.map(|(_, idx)| idx)
    }

    fn best(&self) -> Option<usize> {
        self.containing.or(self.closest).map(|(_, idx)| idx)
    }
}

fn keep_smaller(current: &mut Option<(f64, usize)>, candidate: (f64, usize)) {
    let replace = match current {
        None => true,
        Some((value, idx)) => match candidate.0.total_cmp(value) {
            Ordering::Less => true,
            Ordering::Equal => candidate.1 < *idx,
            Ordering::Greater => false,
        },
    };
    if replace {
        *current = Some(candidate);
    }
}

/// Unit normal of the plane through the triangle, oriented upwards. `None` if the triangle is degenerate
pub fn plane_normal(triangle: &[Point3<f64>; 3]) -> Option<Vector3<f64>> {
    let [a, b, c] = triangle;
    let normal = (b - a).cross(&(c - a));
    let norm = normal.norm();
    if norm <= f64::EPSILON {
        return None;
    }
    let normal = normal / norm;
    Some(if normal.z < 0.0 { -normal } else { normal })
}

/// Orthogonal projection of `point` onto the plane of `triangle`
pub fn project_onto_plane(point: &Point3<f64>, triangle: &[Point3<f64>; 3]) -> Option<Point3<f64>> {
    let normal = plane_normal(triangle)?;
    let distance = (point - triangle[0]).dot(&normal);
    Some(point - normal * distance)
}

/// Inclination of the triangle plane against the horizontal, in degrees
pub fn triangle_slope(triangle: &[Point3<f64>; 3]) -> Option<f64> {
    plane_normal(triangle).map(|n| n.z.clamp(-1.0, 1.0).acos().to_degrees())
}

/// Returns true if the XY projection of `triangle` contains `point` (boundary included)
pub fn contains_xy(triangle: &[Point3<f64>; 3], point: &Point2<f64>) -> bool {
    let [a, b, c] = triangle;
    let det = (b.y - c.y) * (a.x - c.x) + (c.x - b.x) * (a.y - c.y);
    if det.abs() < f64::EPSILON {
        return false;
    }
    let u = ((b.y - c.y) * (point.x - c.x) + (c.x - b.x) * (point.y - c.y)) / det;
    let v = ((c.y - a.y) * (point.x - c.x) + (a.x - c.x) * (point.y - c.y)) / det;
    let w = 1.0 - u - v;
    u >= -CONTAINMENT_EPSILON && v >= -CONTAINMENT_EPSILON && w >= -CONTAINMENT_EPSILON
}

/// Smallest XY distance between `point` and the edges of `triangle`
pub fn distance_xy(triangle: &[Point3<f64>; 3], point: &Point2<f64>) -> f64 {
    let [a, b, c] = triangle;
    segment_distance(a, b, point)
        .min(segment_distance(b, c, point))
        .min(segment_distance(c, a, point))
}

fn segment_distance(a: &Point3<f64>, b: &Point3<f64>, p: &Point2<f64>) -> f64 {
    let a = Point2::new(a.x, a.y);
    let b = Point2::new(b.x, b.y);
    let ab = b - a;
    let length_sq = ab.norm_squared();
    if length_sq <= f64::EPSILON {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / length_sq).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

fn corners(points: &[Point3<f64>], triangle: &[usize; 3]) -> [Point3<f64>; 3] {
    [
        points[triangle[0]],
        points[triangle[1]],
        points[triangle[2]],
    ]
}

fn merge_duplicates(points: &[Point3<f64>]) -> Vec<Point3<f64>> {
    let mut merged: Vec<Point3<f64>> = Vec::with_capacity(points.len());
    let mut cells: HashMap<(i64, i64), usize> = HashMap::with_capacity(points.len());
    for point in points.iter().filter(|p| p.coords.iter().all(|c| c.is_finite())) {
        let key = (
            (point.x / DUPLICATE_EPSILON).round() as i64,
            (point.y / DUPLICATE_EPSILON).round() as i64,
        );
        match cells.get(&key) {
            Some(&existing) => {
                if point.z < merged[existing].z {
                    merged[existing] = *point;
                }
            }
            None => {
                cells.insert(key, merged.len());
                merged.push(*point);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;

    fn unit_square(z: f64) -> Vec<Point3<f64>> {
        vec![
            Point3::new(0.0, 0.0, z),
            Point3::new(1.0, 0.0, z),
            Point3::new(0.0, 1.0, z),
            Point3::new(1.0, 1.0, z),
        ]
    }

    #[test]
    fn test_triangulate_square() {
        let surface = Surface::triangulate(&unit_square(0.0));
        assert_eq!(surface.triangle_count(), 2);
        assert_eq!(surface.edges().len(), 5);
        assert_eq!(surface.vertices_of(&[0, 1]).len(), 4);
    }

    #[test]
    fn test_collinear_points_have_no_triangles() {
        let points: Vec<_> = (0..5).map(|i| Point3::new(i as f64, i as f64, 0.0)).collect();
        assert!(Surface::triangulate(&points).is_empty());
        assert!(Surface::triangulate(&points[..2]).is_empty());
    }

    #[test]
    fn test_projection_and_slope() {
        let triangle = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 1.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        assert_approx_eq!(triangle_slope(&triangle).unwrap(), 45.0);
        let proj = project_onto_plane(&Point3::new(0.0, 0.5, 1.0), &triangle).unwrap();
        assert_approx_eq!(proj.x, 0.5);
        assert_approx_eq!(proj.z, 0.5);
        let flat = [
            Point3::new(0.0, 0.0, 2.0),
            Point3::new(1.0, 0.0, 2.0),
            Point3::new(0.0, 1.0, 2.0),
        ];
        let proj = project_onto_plane(&Point3::new(0.2, 0.2, 7.0), &flat).unwrap();
        assert_approx_eq!(proj.z, 2.0);
    }

    #[test]
    fn test_nearest_triangle_prefers_containing() {
        let surface = Surface::triangulate(&unit_square(0.0));
        let inside = surface.nearest_triangle(&Point3::new(0.9, 0.1, 3.0)).unwrap();
        assert!(contains_xy(&surface.triangle(inside), &Point2::new(0.9, 0.1)));

        let outside = Point3::new(2.0, 0.5, 0.0);
        let nearest = surface.nearest_triangle(&outside).unwrap();
        assert_approx_eq!(distance_xy(&surface.triangle(nearest), &Point2::new(2.0, 0.5)), 1.0);
    }

    #[test]
    fn test_nearest_triangle_tie_goes_to_lowest_index() {
        let triangle = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let triangles = [triangle, triangle, triangle];
        assert_eq!(nearest_triangle(&Point3::new(0.2, 0.2, 1.0), &triangles), Some(0));
        assert_eq!(nearest_triangle(&Point3::new(0.2, 0.2, 1.0), &[]), None);
    }

    #[test]
    fn test_index_agrees_with_full_search() {
        let mut rng = SmallRng::seed_from_u64(42);
        let vertices: Vec<Point3<f64>> = (0..300)
            .map(|_| Point3::new(rng.gen_range(0.0..50.0), rng.gen_range(0.0..50.0), rng.gen_range(0.0..2.0)))
            .collect();
        let triangles = Surface::triangulate(&vertices).triangle_corners();
        let index = TriangleIndex::new(&triangles);
        // Points inside, on vertices and outside of the triangulation
        let queries = (0..2000)
            .map(|_| Point3::new(rng.gen_range(-10.0..60.0), rng.gen_range(-10.0..60.0), rng.gen_range(-1.0..3.0)))
            .chain(vertices.iter().copied());
        for point in queries {
            assert_eq!(index.nearest(&point, &triangles), nearest_triangle(&point, &triangles), "{:?}", point);
        }
    }

    #[test]
    fn test_empty_index() {
        let index = TriangleIndex::new(&[]);
        assert_eq!(index.nearest(&Point3::origin(), &[]), None);
    }
}
