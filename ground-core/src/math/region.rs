use nalgebra::Point3;

use super::AABB;

/// The footprint a tile covers when querying points from a [PointSource](crate::source::PointSource).
///
/// Regions are half-open on their maximum X and Y edges so that the four quadrants of a split region
/// never share a point. The outer edges of the root region are closed, which is tracked through
/// `closed_max_x` and `closed_max_y`. Elevation never restricts a region: a point belongs to a region
/// if its XY position lies inside the footprint.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryRegion {
    bounds: AABB<f64>,
    closed_max_x: bool,
    closed_max_y: bool,
}

impl QueryRegion {
    /// Creates a region covering all of `bounds`, including its maximum edges
    pub fn closed(bounds: AABB<f64>) -> Self {
        Self {
            bounds,
            closed_max_x: true,
            closed_max_y: true,
        }
    }

    pub fn new(bounds: AABB<f64>, closed_max_x: bool, closed_max_y: bool) -> Self {
        Self {
            bounds,
            closed_max_x,
            closed_max_y,
        }
    }

    pub fn bounds(&self) -> &AABB<f64> {
        &self.bounds
    }

    /// Returns true if the XY position of `point` lies inside this region
    /// ```
    /// # use ground_core::math::{AABB, QueryRegion};
    /// # use nalgebra::Point3;
    /// let bounds = AABB::from_min_max(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 0.0));
    /// let open = QueryRegion::new(bounds, false, false);
    /// assert!(open.contains(&Point3::new(0.0, 0.5, 42.0)));
    /// assert!(!open.contains(&Point3::new(1.0, 0.5, 0.0)));
    /// assert!(QueryRegion::closed(bounds).contains(&Point3::new(1.0, 1.0, 0.0)));
    /// ```
    pub fn contains(&self, point: &Point3<f64>) -> bool {
        let min = self.bounds.min();
        let max = self.bounds.max();
        let inside_x = point.x >= min.x
            && (point.x < max.x || (self.closed_max_x && point.x == max.x));
        let inside_y = point.y >= min.y
            && (point.y < max.y || (self.closed_max_y && point.y == max.y));
        inside_x && inside_y
    }

    /// Splits this region into four quadrant regions at `pivot`, in the order used by
    /// [AABB::split_quadrants]. Quadrants adjacent to a closed maximum edge inherit its closedness
    pub fn split_quadrants(&self, pivot: &Point3<f64>) -> [QueryRegion; 4] {
        let [q0, q1, q2, q3] = self.bounds.split_quadrants(pivot);
        [
            QueryRegion::new(q0, false, false),
            QueryRegion::new(q1, self.closed_max_x, false),
            QueryRegion::new(q2, false, self.closed_max_y),
            QueryRegion::new(q3, self.closed_max_x, self.closed_max_y),
        ]
    }
}
