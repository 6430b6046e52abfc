use nalgebra::{ClosedSub, Point2, Point3, Scalar, Vector3};

/// 3D axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AABB<T: Scalar + PartialOrd> {
    min: Point3<T>,
    max: Point3<T>,
}

impl<T: Scalar + ClosedSub + PartialOrd + Copy> AABB<T> {
    /// Creates a new AABB from the given minimum and maximum coordinates. Panics if the minimum position is
    /// not less than or equal to the maximum position
    /// ```
    /// # use ground_core::math::AABB;
    /// let bounds = AABB::from_min_max(nalgebra::Point3::new(0.0, 0.0, 0.0), nalgebra::Point3::new(1.0, 1.0, 1.0));
    /// ```
    pub fn from_min_max(min: Point3<T>, max: Point3<T>) -> Self {
        if min.x > max.x || min.y > max.y || min.z > max.z {
            panic!("AABB::from_min_max: Minimum position must be <= maximum position!");
        }
        Self { min, max }
    }

    /// Creates a new AABB from the given minimum and maximum coordinates without checking that min <= max
    pub fn from_min_max_unchecked(min: Point3<T>, max: Point3<T>) -> Self {
        Self { min, max }
    }

    /// Returns the minimum point of this AABB
    pub fn min(&self) -> &Point3<T> {
        &self.min
    }

    /// Returns the maximum point of this AABB
    pub fn max(&self) -> &Point3<T> {
        &self.max
    }

    /// Returns the extent of this AABB. The extent is the size between the minimum and maximum position of this AABB
    /// ```
    /// # use ground_core::math::AABB;
    /// let bounds = AABB::from_min_max_unchecked(nalgebra::Point3::new(0.0, 0.0, 0.0), nalgebra::Point3::new(1.0, 2.0, 3.0));
    /// assert_eq!(bounds.extent(), nalgebra::Vector3::new(1.0, 2.0, 3.0));
    /// ```
    pub fn extent(&self) -> Vector3<T> {
        self.max - self.min
    }

    /// Performs an intersection test between this AABB and the given AABB. Touching boxes and boxes that
    /// fully contain each other count as intersecting
    pub fn intersects(&self, other: &AABB<T>) -> bool {
        (self.min.x <= other.max.x && self.max.x >= other.min.x)
            && (self.min.y <= other.max.y && self.max.y >= other.min.y)
            && (self.min.z <= other.max.z && self.max.z >= other.min.z)
    }

    /// Like [intersects](AABB::intersects), but only looks at the XY footprint of both boxes
    pub fn intersects_footprint(&self, other: &AABB<T>) -> bool {
        (self.min.x <= other.max.x && self.max.x >= other.min.x)
            && (self.min.y <= other.max.y && self.max.y >= other.min.y)
    }

    /// Returns true if the given point is contained within this AABB. Points right on the boundary
    /// of this AABB (e.g. point.x == self.max.x or self.min.x) will return true as well.
    /// ```
    /// # use ground_core::math::AABB;
    /// let bounds = AABB::from_min_max_unchecked(nalgebra::Point3::new(0.0, 0.0, 0.0), nalgebra::Point3::new(1.0, 1.0, 1.0));
    /// assert!(bounds.contains(&nalgebra::Point3::new(0.5, 0.5, 0.5)));
    /// assert!(!bounds.contains(&nalgebra::Point3::new(0.5, 0.5, 1.5)));
    /// ```
    pub fn contains(&self, point: &Point3<T>) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Computes the smallest AABB that fully contains both `a` and `b`
    pub fn union(a: &AABB<T>, b: &AABB<T>) -> Self {
        let min_x = if a.min.x < b.min.x { a.min.x } else { b.min.x };
        let min_y = if a.min.y < b.min.y { a.min.y } else { b.min.y };
        let min_z = if a.min.z < b.min.z { a.min.z } else { b.min.z };

        let max_x = if a.max.x > b.max.x { a.max.x } else { b.max.x };
        let max_y = if a.max.y > b.max.y { a.max.y } else { b.max.y };
        let max_z = if a.max.z > b.max.z { a.max.z } else { b.max.z };

        Self {
            min: Point3::new(min_x, min_y, min_z),
            max: Point3::new(max_x, max_y, max_z),
        }
    }

    /// Extends the given AABB so that it contains the given point.
    /// ```
    /// # use ground_core::math::AABB;
    /// let bounds = AABB::from_min_max_unchecked(nalgebra::Point3::new(0.0, 0.0, 0.0), nalgebra::Point3::new(1.0, 1.0, 1.0));
    /// let extended_bounds = AABB::extend_with_point(&bounds, &nalgebra::Point3::new(2.0, -1.0, 2.0));
    /// assert_eq!(*extended_bounds.min(), nalgebra::Point3::new(0.0, -1.0, 0.0));
    /// assert_eq!(*extended_bounds.max(), nalgebra::Point3::new(2.0, 1.0, 2.0));
    /// ```
    pub fn extend_with_point(bounds: &AABB<T>, point: &Point3<T>) -> AABB<T> {
        let pick_min = |a: T, b: T| if a < b { a } else { b };
        let pick_max = |a: T, b: T| if a > b { a } else { b };
        Self {
            min: Point3::new(
                pick_min(bounds.min.x, point.x),
                pick_min(bounds.min.y, point.y),
                pick_min(bounds.min.z, point.z),
            ),
            max: Point3::new(
                pick_max(bounds.max.x, point.x),
                pick_max(bounds.max.y, point.y),
                pick_max(bounds.max.z, point.z),
            ),
        }
    }
}

impl AABB<f64> {
    /// Computes the bounding box of the given positions. Returns `None` for an empty iterator
    /// ```
    /// # use ground_core::math::AABB;
    /// # use nalgebra::Point3;
    /// let bounds = AABB::from_points([Point3::new(1.0, 5.0, 0.0), Point3::new(-1.0, 2.0, 3.0)]).unwrap();
    /// assert_eq!(*bounds.min(), Point3::new(-1.0, 2.0, 0.0));
    /// assert_eq!(*bounds.max(), Point3::new(1.0, 5.0, 3.0));
    /// ```
    pub fn from_points<I: IntoIterator<Item = Point3<f64>>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bounds = Self::from_min_max_unchecked(first, first);
        for point in iter {
            bounds = Self::extend_with_point(&bounds, &point);
        }
        Some(bounds)
    }

    /// Returns the center point of this AABB
    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    /// Area of the XY footprint of this AABB
    pub fn footprint_area(&self) -> f64 {
        let extent = self.extent();
        extent.x * extent.y
    }

    /// The larger of the two horizontal edge lengths
    pub fn max_footprint_edge(&self) -> f64 {
        let extent = self.extent();
        extent.x.max(extent.y)
    }

    /// Returns true if the XY position of `point` lies within the footprint of this AABB (boundary included)
    pub fn contains_footprint(&self, point: &Point2<f64>) -> bool {
        point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
    }

    /// Grows the footprint of this AABB by `margin` on every side. The Z range is unchanged
    pub fn expand_footprint(&self, margin: f64) -> Self {
        Self {
            min: Point3::new(self.min.x - margin, self.min.y - margin, self.min.z),
            max: Point3::new(self.max.x + margin, self.max.y + margin, self.max.z),
        }
    }

    /// Splits the footprint of this AABB at `pivot` into four quadrants. The Z range of every quadrant
    /// equals the Z range of this AABB. Quadrants are returned in the order
    /// `[low-x/low-y, high-x/low-y, low-x/high-y, high-x/high-y]`
    /// ```
    /// # use ground_core::math::AABB;
    /// # use nalgebra::Point3;
    /// let bounds = AABB::from_min_max(Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 2.0, 1.0));
    /// let quadrants = bounds.split_quadrants(&bounds.center());
    /// assert_eq!(*quadrants[3].min(), Point3::new(1.0, 1.0, 0.0));
    /// assert_eq!(*quadrants[3].max(), Point3::new(2.0, 2.0, 1.0));
    /// ```
    pub fn split_quadrants(&self, pivot: &Point3<f64>) -> [AABB<f64>; 4] {
        let (min, max) = (self.min, self.max);
        [
            Self::from_min_max_unchecked(min, Point3::new(pivot.x, pivot.y, max.z)),
            Self::from_min_max_unchecked(
                Point3::new(pivot.x, min.y, min.z),
                Point3::new(max.x, pivot.y, max.z),
            ),
            Self::from_min_max_unchecked(
                Point3::new(min.x, pivot.y, min.z),
                Point3::new(pivot.x, max.y, max.z),
            ),
            Self::from_min_max_unchecked(Point3::new(pivot.x, pivot.y, min.z), max),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadrants_partition_parent() {
        let bounds = AABB::from_min_max(Point3::new(-4.0, 0.0, 1.0), Point3::new(4.0, 2.0, 3.0));
        let quadrants = bounds.split_quadrants(&bounds.center());
        let area: f64 = quadrants.iter().map(|q| q.footprint_area()).sum();
        assert_eq!(area, bounds.footprint_area());
        for quadrant in &quadrants {
            assert_eq!(quadrant.min().z, 1.0);
            assert_eq!(quadrant.max().z, 3.0);
        }
        assert_eq!(*quadrants[1].min(), Point3::new(0.0, 0.0, 1.0));
        assert_eq!(*quadrants[2].max(), Point3::new(0.0, 2.0, 3.0));
    }

    #[test]
    fn test_footprint_ops() {
        let bounds = AABB::from_min_max(Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 1.0, 10.0));
        assert_eq!(bounds.max_footprint_edge(), 3.0);
        assert!(bounds.contains_footprint(&Point2::new(3.0, 0.5)));
        assert!(!bounds.contains_footprint(&Point2::new(3.1, 0.5)));
        let grown = bounds.expand_footprint(1.0);
        assert_eq!(*grown.min(), Point3::new(-1.0, -1.0, 0.0));
        assert!(grown.intersects_footprint(&bounds));
    }

    #[test]
    fn test_from_points_empty() {
        assert!(AABB::from_points(std::iter::empty()).is_none());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_roundtrip() {
        let bounds = AABB::from_min_max(Point3::new(0.0, 1.0, 2.0), Point3::new(3.0, 4.0, 5.0));
        let json = serde_json::to_string(&bounds).unwrap();
        let parsed: AABB<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, bounds);
    }
}
