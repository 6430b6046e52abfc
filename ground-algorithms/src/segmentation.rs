use ground_core::nalgebra::{Point3, Vector3};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rayon::prelude::*;

/// Represents a plane in coordinate-form: ax + by + cz + d = 0
/// the ranking shows how many points of the pointcloud are inliers for this specific plane
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    ranking: usize,
}

impl Plane {
    /// Normal vector (not normalized) of this plane
    pub fn normal(&self) -> Vector3<f64> {
        Vector3::new(self.a, self.b, self.c)
    }

    /// Number of inliers this plane was ranked with
    pub fn ranking(&self) -> usize {
        self.ranking
    }
}

/// calculates the distance between a point and a plane
pub fn distance_point_plane(point: &Point3<f64>, plane: &Plane) -> f64 {
    let d = (plane.a * point.x + plane.b * point.y + plane.c * point.z + plane.d).abs();
    let e = (plane.a * plane.a + plane.b * plane.b + plane.c * plane.c).sqrt();
    if e <= f64::EPSILON {
        return f64::INFINITY;
    }
    d / e
}

/// Random number generator for one iteration, derived from the seed of the whole run
fn iteration_rng(seed: u64, iteration: usize) -> SmallRng {
    SmallRng::seed_from_u64(seed ^ (iteration as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

/// generates a random plane from three points of the buffer
fn generate_rng_plane(points: &[Point3<f64>], rng: &mut SmallRng) -> Plane {
    // choose three random points from the pointcloud
    let rand1 = rng.gen_range(0..points.len());
    let mut rand2 = rng.gen_range(0..points.len());
    while rand1 == rand2 {
        rand2 = rng.gen_range(0..points.len());
    }
    let mut rand3 = rng.gen_range(0..points.len());
    // make sure we have 3 unique random numbers to generate the plane model
    while rand2 == rand3 || rand1 == rand3 {
        rand3 = rng.gen_range(0..points.len());
    }
    let p_a = points[rand1];
    let p_b = points[rand2];
    let p_c = points[rand3];

    // compute plane from the three positions
    let vec1 = p_b - p_a;
    let vec2 = p_c - p_a;
    let normal = vec1.cross(&vec2);
    let d = -normal.dot(&p_a.coords);
    Plane {
        a: normal.x,
        b: normal.y,
        c: normal.z,
        d,
        ranking: 0,
    }
}

fn generate_plane_model(
    points: &[Point3<f64>],
    distance_threshold: f64,
    seed: u64,
    iteration: usize,
) -> (Plane, Vec<usize>, usize) {
    let mut rng = iteration_rng(seed, iteration);
    // generate random plane from three points in the buffer
    let mut curr_hypo = generate_rng_plane(points, &mut rng);
    // find all points that belong to the plane
    let mut curr_positions = vec![];

    for (index, p) in points.iter().enumerate() {
        let distance = distance_point_plane(p, &curr_hypo);
        if distance < distance_threshold {
            // we found a point that belongs to the plane
            curr_hypo.ranking += 1;
            curr_positions.push(index);
        }
    }
    (curr_hypo, curr_positions, iteration)
}

/// Orders models by ranking. Equal rankings prefer the earlier iteration, so the result does not depend on
/// the order in which the iterations were evaluated
fn better_model(
    x: &(Plane, Vec<usize>, usize),
    a: &(Plane, Vec<usize>, usize),
) -> std::cmp::Ordering {
    x.0.ranking.cmp(&a.0.ranking).then(a.2.cmp(&x.2))
}

/// Ransac Plane Segmentation in parallel.
/// Returns the plane with the highest rating/most inliers and the associated indices of the inliers.
/// Iterates over all `points`.
/// The `distance_threshold` sets the maximum distance to the plane that a point is counted as an inlier from.
/// With `num_of_iterations` the number of iterations that the algorithm performs can be chosen.
/// Every iteration draws its sample from a generator derived from `seed`, so the result is the same as
/// with [ransac_plane_serial] for the same `seed`.
///
/// # Examples
///
/// ```
/// # use ground_core::nalgebra::Point3;
/// # use ground_algorithms::segmentation::ransac_plane_par;
/// let mut points = vec![];
/// // generate some inliers
/// for i in 0..200 {
///     points.push(Point3::new(0.0, f64::from(i), f64::from(i * i)));
/// }
/// // generate an outlier
/// points.push(Point3::new(9.0, 0.0, 0.0));
/// let (_plane, inliers) = ransac_plane_par(&points, 0.5, 10, 42).unwrap();
/// for i in 0..199 {
///     // inliers are in the plane
///     assert!(inliers.contains(&i));
/// }
/// // outlier is not in the plane
/// assert!(!inliers.contains(&200));
/// ```
///
/// Returns `None` if there are less than 3 points.
pub fn ransac_plane_par(
    points: &[Point3<f64>],
    distance_threshold: f64,
    num_of_iterations: usize,
    seed: u64,
) -> Option<(Plane, Vec<usize>)> {
    if points.len() < 3 {
        return None;
    }
    // iterate in parallel over num_of_iterations
    (0..num_of_iterations.max(1))
        .into_par_iter()
        .map(|iteration| {
            // generate one model for the current iteration
            generate_plane_model(points, distance_threshold, seed, iteration)
        })
        // get the best plane-model from all iterations (highest ranking)
        .max_by(better_model)
        .map(|(plane, inliers, _)| (plane, inliers))
}

/// Ransac Plane Segmentation in serial (for maximum speed use ransac_plane_par).
/// Returns the plane with the highest rating/most inliers and the associated indices of the inliers.
/// Iterates over all `points`.
/// The `distance_threshold` sets the maximum distance to the plane that a point is counted as an inlier from.
/// With `num_of_iterations` the number of iterations that the algorithm performs can be chosen.
///
/// Returns `None` if there are less than 3 points.
pub fn ransac_plane_serial(
    points: &[Point3<f64>],
    distance_threshold: f64,
    num_of_iterations: usize,
    seed: u64,
) -> Option<(Plane, Vec<usize>)> {
    if points.len() < 3 {
        return None;
    }
    (0..num_of_iterations.max(1))
        .map(|iteration|
            // generate one model for the current iteration
            generate_plane_model(points, distance_threshold, seed, iteration))
        // get the best plane-model from all iterations (highest ranking)
        .max_by(better_model)
        .map(|(plane, inliers, _)| (plane, inliers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_point_cloud() -> Vec<Point3<f64>> {
        let mut points = vec![];
        for i in 0..100 {
            if i % 4 == 0 {
                points.push(Point3::new(0.0, f64::from(i), f64::from(i * i)));
            } else {
                points.push(Point3::new(f64::from(i % 10), f64::from(i % 7), 5.0));
            }
        }
        points
    }

    #[test]
    fn test_ransac_plane_par() {
        let points = setup_point_cloud();
        let (plane, inliers) = ransac_plane_par(&points, 0.1, 50, 7).unwrap();
        assert_eq!(plane.ranking(), inliers.len());
        assert_eq!(inliers.len(), 75);
        for idx in inliers {
            assert!(idx % 4 != 0);
        }
    }

    #[test]
    fn test_ransac_plane_serial_matches_par() {
        let points = setup_point_cloud();
        let serial = ransac_plane_serial(&points, 0.1, 50, 7).unwrap();
        let par = ransac_plane_par(&points, 0.1, 50, 7).unwrap();
        assert_eq!(serial, par);
    }

    #[test]
    fn test_ransac_needs_three_points() {
        let points = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        assert!(ransac_plane_serial(&points, 0.1, 10, 0).is_none());
        assert!(ransac_plane_par(&points, 0.1, 10, 0).is_none());
    }

    #[test]
    fn test_distance_to_degenerate_plane() {
        let plane = Plane {
            a: 0.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            ranking: 0,
        };
        assert_eq!(distance_point_plane(&Point3::origin(), &plane), f64::INFINITY);
    }
}
