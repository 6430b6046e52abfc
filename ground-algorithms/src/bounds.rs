use ground_core::{math::AABB, nalgebra::Point3};

/// Calculate the bounding box of the given `positions`. Returns `None` if there are zero positions
pub fn calculate_bounds(positions: &[Point3<f64>]) -> Option<AABB<f64>> {
    if positions.is_empty() {
        return None;
    }
    let mut pos_min = Point3::new(f64::MAX, f64::MAX, f64::MAX);
    let mut pos_max = Point3::new(f64::MIN, f64::MIN, f64::MIN);
    for pos in positions {
        if pos.x < pos_min.x {
            pos_min.x = pos.x;
        }
        if pos.y < pos_min.y {
            pos_min.y = pos.y;
        }
        if pos.z < pos_min.z {
            pos_min.z = pos.z;
        }
        if pos.x > pos_max.x {
            pos_max.x = pos.x;
        }
        if pos.y > pos_max.y {
            pos_max.y = pos.y;
        }
        if pos.z > pos_max.z {
            pos_max.z = pos.z;
        }
    }
    Some(AABB::from_min_max_unchecked(pos_min, pos_max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_bounds() {
        assert!(calculate_bounds(&[]).is_none());
        let bounds = calculate_bounds(&[
            Point3::new(1.0, -2.0, 3.0),
            Point3::new(-1.0, 4.0, 0.5),
        ])
        .unwrap();
        assert_eq!(*bounds.min(), Point3::new(-1.0, -2.0, 0.5));
        assert_eq!(*bounds.max(), Point3::new(1.0, 4.0, 3.0));
    }
}
