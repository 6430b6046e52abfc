use log::info;

use crate::{
    params::{GroundDetectionParameters, Threshold, HISTOGRAM_PRECISION},
    statistics::Sample,
    surface::{triangle_slope, Surface},
};

/// Slope threshold used when it should be estimated but the surface has no triangles
pub const DEFAULT_SLOPE_THRESHOLD: f64 = 15.0;
/// Height threshold used when it should be estimated but the surface has no triangles
pub const DEFAULT_HEIGHT_THRESHOLD: f64 = 0.5;
const MIN_SLOPE_THRESHOLD: f64 = 1.0;
const MAX_SLOPE_THRESHOLD: f64 = 90.0;

/// The thresholds a classification run works with, after resolving [Threshold::Auto]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Maximum slope in degrees
    pub slope: f64,
    /// Height threshold, either given or estimated
    pub height: f64,
    /// Height the per-point test uses. Equals `height` unless a classification tolerance was given
    pub classification_height: f64,
}

/// Resolves the slope and height thresholds of `params`. Thresholds set to [Threshold::Auto] are estimated
/// from the geometry of `surface`: the slope threshold is a percentile of the triangle slopes, the height
/// threshold a percentile of the elevation differences along the triangle edges
pub fn estimate_thresholds(surface: &Surface, params: &GroundDetectionParameters) -> Thresholds {
    let slope = match params.slope_threshold {
        Threshold::Value(value) => value,
        Threshold::Auto => estimate_slope(surface, params.slope_percentile),
    };
    let height = match params.height_threshold {
        Threshold::Value(value) => value,
        Threshold::Auto => estimate_height(surface, params.height_percentile),
    };
    let classification_height = params.classification_tolerance.value().unwrap_or(height);
    if params.slope_threshold.is_auto() || params.height_threshold.is_auto() {
        info!(
            "Estimated thresholds from {} triangles: slope {:.2} deg, height {:.3}",
            surface.triangle_count(),
            slope,
            height
        );
    }
    Thresholds {
        slope,
        height,
        classification_height,
    }
}

fn estimate_slope(surface: &Surface, percentile: f64) -> f64 {
    let slopes = Sample::new(surface.triangle_corners().iter().filter_map(triangle_slope));
    slopes
        .percentile(percentile)
        .map(|slope| slope.clamp(MIN_SLOPE_THRESHOLD, MAX_SLOPE_THRESHOLD))
        .unwrap_or(DEFAULT_SLOPE_THRESHOLD)
}

fn estimate_height(surface: &Surface, percentile: f64) -> f64 {
    let points = surface.points();
    let rises = Sample::new(
        surface
            .edges()
            .into_iter()
            .map(|(a, b)| (points[a].z - points[b].z).abs()),
    );
    rises
        .percentile(percentile)
        .map(|height| height.max(HISTOGRAM_PRECISION))
        .unwrap_or(DEFAULT_HEIGHT_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;
    use ground_core::nalgebra::Point3;

    use super::*;

    #[test]
    fn test_flat_surface_hits_lower_bounds() {
        let surface = Surface::triangulate(&[
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
        ]);
        let thresholds = estimate_thresholds(&surface, &GroundDetectionParameters::default());
        assert_approx_eq!(thresholds.slope, MIN_SLOPE_THRESHOLD);
        assert_approx_eq!(thresholds.height, HISTOGRAM_PRECISION);
        assert_approx_eq!(thresholds.classification_height, HISTOGRAM_PRECISION);
    }

    #[test]
    fn test_inclined_surface() {
        let surface = Surface::triangulate(&[
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 1.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(1.0, 1.0, 1.0),
        ]);
        let thresholds = estimate_thresholds(&surface, &GroundDetectionParameters::default());
        assert_approx_eq!(thresholds.slope, 45.0);
        assert_approx_eq!(thresholds.height, 1.0);
    }

    #[test]
    fn test_explicit_values_and_defaults() {
        let params = GroundDetectionParameters::default()
            .with_slope_threshold(Threshold::Value(30.0))
            .with_classification_tolerance(Threshold::Value(0.2));
        let thresholds = estimate_thresholds(&Surface::default(), &params);
        assert_eq!(thresholds.slope, 30.0);
        assert_eq!(thresholds.height, DEFAULT_HEIGHT_THRESHOLD);
        assert_eq!(thresholds.classification_height, 0.2);
    }
}
