use nalgebra::Point3;

use crate::classification::PointClass;

/// Columnar storage for the points of a single tile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileBuffer {
    positions: Vec<Point3<f64>>,
    visibility: Vec<bool>,
    classification: Vec<PointClass>,
    point_ids: Vec<usize>,
}

impl TileBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            visibility: Vec::with_capacity(capacity),
            classification: Vec::with_capacity(capacity),
            point_ids: Vec::with_capacity(capacity),
        }
    }

    /// Appends a point. `point_id` is the identifier the owning point source uses for this point
    pub fn push(&mut self, point_id: usize, position: Point3<f64>, visible: bool, class: PointClass) {
        self.point_ids.push(point_id);
        self.positions.push(position);
        self.visibility.push(visible);
        self.classification.push(class);
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

    pub fn classification_mut(&mut self) -> &mut [PointClass] {
        &mut self.classification
    }

    pub fn point_ids(&self) -> &[usize] {
        &self.point_ids
    }

    /// Number of points whose visibility flag is set
    pub fn visible_count(&self) -> usize {
        self.visibility.iter().filter(|visible| **visible).count()
    }

    /// Iterates over the positions of all visible points, together with their index in this buffer
    /// ```
    /// # use ground_core::containers::TileBuffer;
    /// # use ground_core::classification::PointClass;
    /// # use nalgebra::Point3;
    /// let mut buffer = TileBuffer::new();
    /// buffer.push(7, Point3::new(0.0, 0.0, 0.0), true, PointClass::NeverClassified);
    /// buffer.push(8, Point3::new(1.0, 0.0, 0.0), false, PointClass::NeverClassified);
    /// let visible: Vec<_> = buffer.visible_positions().map(|(idx, _)| idx).collect();
    /// assert_eq!(visible, vec![0]);
    /// ```
    pub fn visible_positions(&self) -> impl Iterator<Item = (usize, &Point3<f64>)> + '_ {
        self.positions
            .iter()
            .zip(self.visibility.iter())
            .enumerate()
            .filter(|(_, (_, visible))| **visible)
            .map(|(idx, (position, _))| (idx, position))
    }

    /// Overwrites the classification channel. Panics if `classes` does not have one entry per point
    pub fn set_classification(&mut self, classes: Vec<PointClass>) {
        if classes.len() != self.positions.len() {
            panic!(
                "TileBuffer::set_classification: expected {} classes, got {}",
                self.positions.len(),
                classes.len()
            );
        }
        self.classification = classes;
    }
}
