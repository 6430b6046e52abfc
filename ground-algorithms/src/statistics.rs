//! Order statistics over small samples of elevations and elevation differences.

/// A sorted sample of finite values
#[derive(Debug, Clone, Default)]
pub struct Sample {
    sorted: Vec<f64>,
}

impl Sample {
    /// Builds a sample from arbitrary values. Non-finite values are dropped
    pub fn new<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        Self { sorted }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// The `p`-th percentile (`p` in `[0, 100]`), linearly interpolated between closest ranks.
    /// Returns `None` for an empty sample
    ///
    /// ```
    /// # use ground_algorithms::statistics::Sample;
    /// let sample = Sample::new([4.0, 1.0, 3.0, 2.0]);
    /// assert_eq!(sample.percentile(0.0), Some(1.0));
    /// assert_eq!(sample.percentile(50.0), Some(2.5));
    /// assert_eq!(sample.percentile(100.0), Some(4.0));
    /// ```
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        let rank = (p.clamp(0.0, 100.0) / 100.0) * (self.sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        let weight = rank - lower as f64;
        Some(self.sorted[lower] * (1.0 - weight) + self.sorted[upper] * weight)
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// First and third quartile
    pub fn quartiles(&self) -> Option<(f64, f64)> {
        Some((self.percentile(25.0)?, self.percentile(75.0)?))
    }

    /// Inter-quartile range
    pub fn iqr(&self) -> Option<f64> {
        self.quartiles().map(|(q1, q3)| q3 - q1)
    }

    pub fn mean(&self) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        Some(self.sorted.iter().sum::<f64>() / self.sorted.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.sorted.first().copied()
    }

    pub fn max(&self) -> Option<f64> {
        self.sorted.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;

    use super::*;

    #[test]
    fn test_quartiles_and_iqr() {
        let sample = Sample::new((1..=9).map(f64::from));
        let (q1, q3) = sample.quartiles().unwrap();
        assert_approx_eq!(q1, 3.0);
        assert_approx_eq!(q3, 7.0);
        assert_approx_eq!(sample.iqr().unwrap(), 4.0);
        assert_approx_eq!(sample.mean().unwrap(), 5.0);
    }

    #[test]
    fn test_non_finite_values_are_dropped() {
        let sample = Sample::new([f64::NAN, 2.0, f64::INFINITY]);
        assert_eq!(sample.len(), 1);
        assert_eq!(sample.median(), Some(2.0));
    }

    #[test]
    fn test_empty_sample() {
        let sample = Sample::new(std::iter::empty());
        assert!(sample.percentile(50.0).is_none());
        assert!(sample.iqr().is_none());
        assert!(sample.mean().is_none());
    }
}
