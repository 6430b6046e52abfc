//! Configuration of a ground detection run.
//!
//! [GroundDetectionParameters] is built once (through [Default], the `with_*` setters or the token
//! string form) and shared read-only by every component and worker of a run.

use std::{fmt, str::FromStr};

use log::warn;
use ground_core::nalgebra::Point3;

use crate::error::{GroundDetectionError, Result};

/// Elevation precision of the seed histograms. Tolerances never drop below this value
pub const HISTOGRAM_PRECISION: f64 = 0.01;

/// A threshold that is either given explicitly or estimated from the data
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    Auto,
    Value(f64),
}

impl Threshold {
    pub fn value(&self) -> Option<f64> {
        match self {
            Threshold::Auto => None,
            Threshold::Value(v) => Some(*v),
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Threshold::Auto)
    }
}

impl FromStr for Threshold {
    type Err = GroundDetectionError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Threshold::Auto);
        }
        let value = parse_f64(s)?;
        if value < 0.0 {
            return Err(GroundDetectionError::Configuration(format!(
                "threshold must not be negative, got {}",
                value
            )));
        }
        Ok(Threshold::Value(value))
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Auto => write!(f, "auto"),
            Threshold::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Where the per-point classification test is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStrategy {
    /// Sequential evaluation on the calling worker thread
    Cpu,
    /// Data-parallel evaluation using every available lane
    AnyAccelerator,
    /// Data-parallel evaluation that leaves one lane free for the display/host
    NonDisplayAccelerator,
}

impl FromStr for ProcessingStrategy {
    type Err = GroundDetectionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "cpu" => Ok(ProcessingStrategy::Cpu),
            "1" | "any" | "any-accelerator" => Ok(ProcessingStrategy::AnyAccelerator),
            "2" | "non-display" | "non-display-accelerator" => {
                Ok(ProcessingStrategy::NonDisplayAccelerator)
            }
            other => Err(GroundDetectionError::Configuration(format!(
                "unknown processing strategy '{}'",
                other
            ))),
        }
    }
}

/// Acceptance rule for extra seed points drawn from under-represented histogram cells
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtraSeedPolicy {
    /// Accept a cell minimum if its rise above the tile minimum is at most the 75th percentile of the
    /// neighbour variations, and the ratio P75 / P25 of those variations is at most `max_ratio`
    PercentileRatio { max_ratio: f64 },
    /// Accept a cell minimum if its rise is at most `mean + iqr_factor * IQR` of the neighbour variations
    AverageIqr { iqr_factor: f64 },
}

/// Immutable configuration of one ground detection run
#[derive(Debug, Clone, PartialEq)]
pub struct GroundDetectionParameters {
    /// Maximum slope (degrees) between a point and the surface
    pub slope_threshold: Threshold,
    /// Maximum height of a ground point above or below the surface
    pub height_threshold: Threshold,
    /// Height used when classifying. `Auto` follows `height_threshold`
    pub classification_tolerance: Threshold,
    /// Footprint of the largest non-ground structure. Tiles are never split below this edge length
    pub max_structure_size: f64,
    /// Expected points per unit length. `0` estimates the density per tile
    pub point_density: f64,
    pub processing_strategy: ProcessingStrategy,
    pub use_multithread: bool,

    /// Maximum number of visible points in a quadtree leaf
    pub max_points_per_tile: usize,
    pub max_tree_depth: usize,

    /// Number of histogram cells per tile axis used by the seed selector
    pub seed_grid_size: usize,
    pub points_per_seed: usize,
    /// Fraction of the seed budget removed for the deepest tiles of the tree
    pub depth_seed_correction: f64,
    pub min_trustworthiness: f64,
    pub unreliable_tolerance_factor: f64,
    pub iqr_tolerance_factor: f64,
    pub extra_seed_threshold: f64,
    pub extra_seed_policy: ExtraSeedPolicy,
    pub max_extra_seeds: usize,

    /// Tiles whose density is below this fraction of the average lose their seeds
    pub sparse_density_ratio: f64,
    pub min_neighborhood_points: usize,
    pub ransac_iterations: usize,
    pub ransac_inlier_threshold: f64,
    pub ransac_correction_factor: f64,
    pub keep_trustworthy_seeds: bool,
    pub trustworthy_ceiling: f64,
    pub random_seed: u64,

    pub trust_factor_min: f64,
    pub trust_factor_max: f64,
    pub slope_percentile: f64,
    pub height_percentile: f64,

    /// Upper bound for the densification iterations run before classifying. `0` classifies against the
    /// seed surface
    pub densification_iterations: usize,
    /// Triangles with at least two edges shorter than this are not densified any further
    pub triangle_edge_threshold: f64,

    /// Points that are added to the seed surface as-is
    pub additional_seed_points: Vec<Point3<f64>>,
}

impl Default for GroundDetectionParameters {
    fn default() -> Self {
        Self {
            slope_threshold: Threshold::Auto,
            height_threshold: Threshold::Auto,
            classification_tolerance: Threshold::Auto,
            max_structure_size: 20.0,
            point_density: 0.0,
            processing_strategy: ProcessingStrategy::AnyAccelerator,
            use_multithread: true,
            max_points_per_tile: 10_000,
            max_tree_depth: 16,
            seed_grid_size: 4,
            points_per_seed: 50,
            depth_seed_correction: 0.25,
            min_trustworthiness: 0.3,
            unreliable_tolerance_factor: 2.0,
            iqr_tolerance_factor: 1.5,
            extra_seed_threshold: 0.7,
            extra_seed_policy: ExtraSeedPolicy::PercentileRatio { max_ratio: 4.0 },
            max_extra_seeds: 4,
            sparse_density_ratio: 0.1,
            min_neighborhood_points: 500,
            ransac_iterations: 100,
            ransac_inlier_threshold: 0.6,
            ransac_correction_factor: 0.2,
            keep_trustworthy_seeds: true,
            trustworthy_ceiling: 0.95,
            random_seed: 0x5eed,
            trust_factor_min: 0.5,
            trust_factor_max: 1.5,
            slope_percentile: 90.0,
            height_percentile: 90.0,
            densification_iterations: 0,
            triangle_edge_threshold: 1.0,
            additional_seed_points: vec![],
        }
    }
}

/// Number of tokens of the short override form
const SHORT_TOKEN_COUNT: usize = 6;
/// Number of tokens of the extended override form
const EXTENDED_TOKEN_COUNT: usize = 12;

impl GroundDetectionParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slope_threshold(mut self, value: Threshold) -> Self {
        self.slope_threshold = value;
        self
    }

    pub fn with_height_threshold(mut self, value: Threshold) -> Self {
        self.height_threshold = value;
        self
    }

    pub fn with_classification_tolerance(mut self, value: Threshold) -> Self {
        self.classification_tolerance = value;
        self
    }

    pub fn with_max_structure_size(mut self, value: f64) -> Self {
        self.max_structure_size = value;
        self
    }

    pub fn with_point_density(mut self, value: f64) -> Self {
        self.point_density = value;
        self
    }

    pub fn with_processing_strategy(mut self, value: ProcessingStrategy) -> Self {
        self.processing_strategy = value;
        self
    }

    pub fn with_multithread(mut self, value: bool) -> Self {
        self.use_multithread = value;
        self
    }

    pub fn with_max_points_per_tile(mut self, value: usize) -> Self {
        self.max_points_per_tile = value;
        self
    }

    pub fn with_extra_seed_policy(mut self, value: ExtraSeedPolicy) -> Self {
        self.extra_seed_policy = value;
        self
    }

    pub fn with_additional_seed_points(mut self, points: Vec<Point3<f64>>) -> Self {
        self.additional_seed_points = points;
        self
    }

    pub fn with_random_seed(mut self, value: u64) -> Self {
        self.random_seed = value;
        self
    }

    pub fn with_densification(mut self, iterations: usize) -> Self {
        self.densification_iterations = iterations;
        self
    }

    pub fn with_triangle_edge_threshold(mut self, value: f64) -> Self {
        self.triangle_edge_threshold = value;
        self
    }

    /// Edge length below which quadtree nodes are not split any further
    pub fn tile_size(&self) -> f64 {
        self.max_structure_size
    }

    /// Parses the ordered token form
    /// `slope height max_structure_size point_density strategy multithread` into a parameter set.
    /// The extended form appends
    /// `seed_grid_size points_per_seed min_trustworthiness extra_seed_threshold ransac_inlier_threshold ransac_correction_factor`.
    /// All fields not covered by the tokens keep their default value.
    ///
    /// ```
    /// # use ground_algorithms::params::{GroundDetectionParameters, ProcessingStrategy, Threshold};
    /// let params = GroundDetectionParameters::from_tokens(&["12.5", "auto", "30", "0", "cpu", "false"]).unwrap();
    /// assert_eq!(params.slope_threshold, Threshold::Value(12.5));
    /// assert!(params.height_threshold.is_auto());
    /// assert_eq!(params.processing_strategy, ProcessingStrategy::Cpu);
    /// assert!(!params.use_multithread);
    /// assert!(GroundDetectionParameters::from_tokens(&["12.5", "auto"]).is_err());
    /// ```
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        Self::default().apply_tokens(tokens)
    }

    /// Like [GroundDetectionParameters::from_tokens], but fields not covered by the tokens keep the
    /// value they have in `self`
    pub fn apply_tokens<S: AsRef<str>>(mut self, tokens: &[S]) -> Result<Self> {
        if tokens.len() != SHORT_TOKEN_COUNT && tokens.len() != EXTENDED_TOKEN_COUNT {
            return Err(GroundDetectionError::Configuration(format!(
                "expected {} or {} tokens, got {}",
                SHORT_TOKEN_COUNT,
                EXTENDED_TOKEN_COUNT,
                tokens.len()
            )));
        }
        let t = |idx: usize| tokens[idx].as_ref();

        let slope_threshold: Threshold = t(0).parse()?;
        if let Threshold::Value(slope) = slope_threshold {
            if slope > 90.0 {
                return Err(GroundDetectionError::Configuration(format!(
                    "slope threshold must be at most 90 degrees, got {}",
                    slope
                )));
            }
        }
        self.slope_threshold = slope_threshold;
        self.height_threshold = t(1).parse()?;
        self.max_structure_size = parse_positive(t(2))?;
        self.point_density = parse_f64(t(3))?.max(0.0);
        self.processing_strategy = t(4).parse()?;
        self.use_multithread = parse_bool(t(5))?;

        if tokens.len() == EXTENDED_TOKEN_COUNT {
            self.seed_grid_size = parse_usize(t(6))?.max(1);
            self.points_per_seed = parse_usize(t(7))?.max(1);
            self.min_trustworthiness = parse_unit(t(8))?;
            self.extra_seed_threshold = parse_unit(t(9))?;
            self.ransac_inlier_threshold = parse_unit(t(10))?;
            self.ransac_correction_factor = parse_f64(t(11))?;
        }
        Ok(self)
    }

    /// Applies a whitespace separated override string on top of `self`. A malformed string is logged
    /// and ignored, leaving `self` unchanged
    pub fn with_override_string(self, overrides: &str) -> Self {
        let tokens: Vec<&str> = overrides.split_whitespace().collect();
        match self.clone().apply_tokens(&tokens) {
            Ok(params) => params,
            Err(why) => {
                warn!("Ignoring parameter override '{}': {}", overrides, why);
                self
            }
        }
    }
}

impl FromStr for GroundDetectionParameters {
    type Err = GroundDetectionError;

    fn from_str(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        Self::from_tokens(&tokens)
    }
}

fn parse_f64(token: &str) -> Result<f64> {
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(GroundDetectionError::Configuration(format!(
            "'{}' is not a finite number",
            token
        ))),
    }
}

fn parse_positive(token: &str) -> Result<f64> {
    let value = parse_f64(token)?;
    if value <= 0.0 {
        return Err(GroundDetectionError::Configuration(format!(
            "expected a positive number, got {}",
            value
        )));
    }
    Ok(value)
}

fn parse_unit(token: &str) -> Result<f64> {
    let value = parse_f64(token)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(GroundDetectionError::Configuration(format!(
            "expected a value in [0, 1], got {}",
            value
        )));
    }
    Ok(value)
}

fn parse_usize(token: &str) -> Result<usize> {
    token.parse::<usize>().map_err(|_| {
        GroundDetectionError::Configuration(format!("'{}' is not a non-negative integer", token))
    })
}

fn parse_bool(token: &str) -> Result<bool> {
    match token.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GroundDetectionError::Configuration(format!(
            "'{}' is not a boolean",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_form() {
        let params = GroundDetectionParameters::from_tokens(&[
            "auto", "0.5", "10", "2", "2", "1", "8", "20", "0.4", "0.8", "0.7", "0.1",
        ])
        .unwrap();
        assert_eq!(params.height_threshold, Threshold::Value(0.5));
        assert_eq!(
            params.processing_strategy,
            ProcessingStrategy::NonDisplayAccelerator
        );
        assert_eq!(params.seed_grid_size, 8);
        assert_eq!(params.points_per_seed, 20);
        assert_eq!(params.min_trustworthiness, 0.4);
        assert_eq!(params.ransac_correction_factor, 0.1);
    }

    #[test]
    fn test_malformed_tokens_are_rejected() {
        assert!("1 2 3".parse::<GroundDetectionParameters>().is_err());
        assert!("x auto 10 0 cpu true"
            .parse::<GroundDetectionParameters>()
            .is_err());
        assert!("10 auto 10 0 gpu true"
            .parse::<GroundDetectionParameters>()
            .is_err());
        assert!("10 auto 10 0 cpu maybe"
            .parse::<GroundDetectionParameters>()
            .is_err());
        assert!("95 auto 10 0 cpu true"
            .parse::<GroundDetectionParameters>()
            .is_err());
        assert!("10 -1 10 0 cpu true"
            .parse::<GroundDetectionParameters>()
            .is_err());
    }

    #[test]
    fn test_override_string_keeps_defaults_on_error() {
        let params = GroundDetectionParameters::default()
            .with_max_structure_size(7.0)
            .with_override_string("1 2 3 4");
        assert_eq!(params.max_structure_size, 7.0);
        assert!(params.slope_threshold.is_auto());

        let params = GroundDetectionParameters::default()
            .with_additional_seed_points(vec![Point3::new(1.0, 2.0, 3.0)])
            .with_override_string("20 0.25 15 0 cpu false");
        assert_eq!(params.slope_threshold, Threshold::Value(20.0));
        assert_eq!(params.max_structure_size, 15.0);
        assert_eq!(params.additional_seed_points.len(), 1);
    }
    #[test]
    fn test_override_string_keeps_fields_it_does_not_name() {
        let params = GroundDetectionParameters::default()
            .with_max_points_per_tile(500)
            .with_random_seed(7)
            .with_classification_tolerance(Threshold::Value(0.2))
            .with_extra_seed_policy(ExtraSeedPolicy::AverageIqr { iqr_factor: 1.0 })
            .with_override_string("20 0.25 15 0 cpu false");
        assert_eq!(params.slope_threshold, Threshold::Value(20.0));
        assert_eq!(params.height_threshold, Threshold::Value(0.25));
        assert_eq!(params.max_structure_size, 15.0);
        assert!(!params.use_multithread);
        assert_eq!(params.max_points_per_tile, 500);
        assert_eq!(params.random_seed, 7);
        assert_eq!(params.classification_tolerance, Threshold::Value(0.2));
        assert_eq!(
            params.extra_seed_policy,
            ExtraSeedPolicy::AverageIqr { iqr_factor: 1.0 }
        );
    }
}
