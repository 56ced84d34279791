use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative accuracy of quantile estimates (1%)
pub const DEFAULT_RELATIVE_ACCURACY: f64 = 0.01;

/// Values at or below this land in the zero bucket
const MIN_INDEXABLE_VALUE: f64 = 1e-6;

/// Mergeable quantile sketch over logarithmic buckets
///
/// Each bucket `i` covers `(gamma^(i-1), gamma^i]` with
/// `gamma = (1 + a) / (1 - a)`, so any estimate is within relative error `a`
/// of a value actually inserted. Bucket counts are plain sums, which makes the
/// sketch independent of insertion order and safe to merge.
///
/// # Examples
///
/// ```
/// use processor::aggregation::LatencySketch;
///
/// let mut sketch = LatencySketch::default();
/// for latency in [100.0, 200.0, 300.0] {
///     sketch.insert(latency);
/// }
/// let p50 = sketch.quantile(0.5).unwrap();
/// assert!((p50 - 200.0).abs() / 200.0 <= 0.01);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySketch {
    relative_accuracy: f64,
    zero_count: u64,
    bins: BTreeMap<i32, u64>,
    count: u64,
}

impl LatencySketch {
    pub fn new(relative_accuracy: f64) -> Self {
        let relative_accuracy = if relative_accuracy > 0.0 && relative_accuracy < 1.0 {
            relative_accuracy
        } else {
            DEFAULT_RELATIVE_ACCURACY
        };
        Self {
            relative_accuracy,
            zero_count: 0,
            bins: BTreeMap::new(),
            count: 0,
        }
    }

    fn gamma(&self) -> f64 {
        (1.0 + self.relative_accuracy) / (1.0 - self.relative_accuracy)
    }

    fn index(&self, value: f64) -> i32 {
        (value.ln() / self.gamma().ln()).ceil() as i32
    }

    fn bucket_value(&self, index: i32) -> f64 {
        let gamma = self.gamma();
        2.0 * gamma.powi(index) / (gamma + 1.0)
    }

    /// Adds one observation; non-finite and negative values are ignored
    pub fn insert(&mut self, value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }
        if value <= MIN_INDEXABLE_VALUE {
            self.zero_count += 1;
        } else {
            *self.bins.entry(self.index(value)).or_insert(0) += 1;
        }
        self.count += 1;
    }

    /// Folds another sketch with the same accuracy into this one
    pub fn merge(&mut self, other: &LatencySketch) {
        debug_assert_eq!(self.relative_accuracy, other.relative_accuracy);
        self.zero_count += other.zero_count;
        for (index, count) in &other.bins {
            *self.bins.entry(*index).or_insert(0) += count;
        }
        self.count += other.count;
    }

    /// Estimated value at quantile `q` in `[0, 1]`, using rank `q * (count - 1)`
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let rank = q.clamp(0.0, 1.0) * (self.count - 1) as f64;

        let mut seen = self.zero_count;
        if seen as f64 > rank {
            return Some(0.0);
        }
        for (index, count) in &self.bins {
            seen += count;
            if seen as f64 > rank {
                return Some(self.bucket_value(*index));
            }
        }
        // rounding can leave rank at count - 1; answer with the top bucket
        self.bins
            .keys()
            .next_back()
            .map(|index| self.bucket_value(*index))
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.bins.len() + usize::from(self.zero_count > 0)
    }
}

impl Default for LatencySketch {
    fn default() -> Self {
        Self::new(DEFAULT_RELATIVE_ACCURACY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn within(estimate: f64, expected: f64, tolerance: f64) -> bool {
        (estimate - expected).abs() <= expected * tolerance
    }

    #[test]
    fn test_empty_sketch() {
        let sketch = LatencySketch::default();
        assert!(sketch.is_empty());
        assert_eq!(sketch.quantile(0.5), None);
    }

    #[test]
    fn test_three_values_median() {
        let mut sketch = LatencySketch::default();
        for v in [100.0, 200.0, 300.0] {
            sketch.insert(v);
        }
        assert_eq!(sketch.count(), 3);
        assert!(within(sketch.quantile(0.0).unwrap(), 100.0, 0.01));
        assert!(within(sketch.quantile(0.5).unwrap(), 200.0, 0.01));
        assert!(within(sketch.quantile(1.0).unwrap(), 300.0, 0.01));
    }

    #[test]
    fn test_relative_accuracy_on_uniform_data() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut values: Vec<f64> = (0..10_000).map(|_| rng.gen_range(1.0..5_000.0)).collect();

        let mut sketch = LatencySketch::default();
        for v in &values {
            sketch.insert(*v);
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());

        for q in [0.5, 0.95, 0.99] {
            let rank = (q * (values.len() - 1) as f64).floor() as usize;
            let exact = values[rank];
            let estimate = sketch.quantile(q).unwrap();
            assert!(within(estimate, exact, 0.011), "q={q} exact={exact} estimate={estimate}");
        }
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut values: Vec<f64> = (0..500).map(|_| rng.gen_range(0.0..1_000.0)).collect();

        let mut forward = LatencySketch::default();
        values.iter().for_each(|v| forward.insert(*v));
        values.shuffle(&mut rng);
        let mut shuffled = LatencySketch::default();
        values.iter().for_each(|v| shuffled.insert(*v));

        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_merge_matches_single_sketch() {
        let mut all = LatencySketch::default();
        let mut left = LatencySketch::default();
        let mut right = LatencySketch::default();
        for i in 0..200 {
            let v = i as f64 * 3.5;
            all.insert(v);
            if i % 2 == 0 {
                left.insert(v);
            } else {
                right.insert(v);
            }
        }
        left.merge(&right);
        assert_eq!(left, all);
    }

    #[test]
    fn test_zero_and_invalid_values() {
        let mut sketch = LatencySketch::default();
        sketch.insert(0.0);
        sketch.insert(0.0);
        sketch.insert(f64::NAN);
        sketch.insert(-5.0);
        sketch.insert(50.0);
        assert_eq!(sketch.count(), 3);
        assert_eq!(sketch.quantile(0.5), Some(0.0));
        assert_eq!(sketch.bucket_count(), 2);
    }
}
