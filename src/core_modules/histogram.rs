// THEORY:
// The `Histogram` is the numeric backbone of every statistic the trigger keeps
// over time: the calibrator's peak-intensity distribution, the per-block pixel
// background and the precalibration cell maps all reduce to "count integer
// values into bins".
//
// Key architectural principles:
// 1.  **Signed weights**: `fill` takes a signed weight so a rolling window can
//     undo an old sample with `remove` instead of rebuilding from scratch.
// 2.  **Out-of-range is never lost**: values below zero land in an underflow
//     bin and values at or past `nbins` land in an overflow bin. Those two bins
//     are reported separately and never contribute to the integral, mean or
//     variance.
// 3.  **Lazy statistics**: mean and variance are memoized and invalidated on
//     every mutation. The first read after a change costs O(nbins), every read
//     after that is O(1).

use serde::{Deserialize, Serialize};
use std::cell::Cell;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    values: Vec<i64>,
    underflow: i64,
    overflow: i64,
    /// Sum of in-range weights.
    integral: i64,
    /// Net number of fills (removals count negative).
    entries: i64,
    #[serde(skip)]
    mean_cache: Cell<Option<f64>>,
    #[serde(skip)]
    variance_cache: Cell<Option<f64>>,
}

impl Histogram {
    pub fn new(nbins: usize) -> Self {
        Self {
            values: vec![0; nbins],
            underflow: 0,
            overflow: 0,
            integral: 0,
            entries: 0,
            mean_cache: Cell::new(None),
            variance_cache: Cell::new(None),
        }
    }

    /// Builds a histogram whose bins are a copy of `values` (under/overflow empty).
    pub fn from_bins(values: &[i64]) -> Self {
        let mut hist = Self::new(values.len());
        for (bin, &weight) in values.iter().enumerate() {
            if weight != 0 {
                hist.fill_weighted(bin as i64, weight);
            }
        }
        hist
    }

    pub fn nbins(&self) -> usize {
        self.values.len()
    }

    pub fn fill(&mut self, value: i64) {
        self.fill_weighted(value, 1);
    }

    pub fn fill_weighted(&mut self, value: i64, weight: i64) {
        if value < 0 {
            self.underflow += weight;
        } else if value as usize >= self.values.len() {
            self.overflow += weight;
        } else {
            self.values[value as usize] += weight;
            self.integral += weight;
        }
        self.entries += weight.signum();
        self.invalidate();
    }

    /// Undoes a previous `fill(value)`.
    pub fn remove(&mut self, value: i64) {
        self.fill_weighted(value, -1);
    }

    pub fn merge(&mut self, other: &Histogram) {
        let shared = self.values.len().min(other.values.len());
        for bin in 0..shared {
            self.values[bin] += other.values[bin];
            self.integral += other.values[bin];
        }
        // Bins past our range are overflow from our point of view.
        let spilled: i64 = other.values[shared..].iter().sum();
        self.overflow += other.overflow + spilled;
        self.underflow += other.underflow;
        self.entries += other.entries;
        self.invalidate();
    }

    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0);
        self.underflow = 0;
        self.overflow = 0;
        self.integral = 0;
        self.entries = 0;
        self.invalidate();
    }

    pub fn integral(&self) -> i64 {
        self.integral
    }

    pub fn entries(&self) -> i64 {
        self.entries
    }

    pub fn underflow(&self) -> i64 {
        self.underflow
    }

    pub fn overflow(&self) -> i64 {
        self.overflow
    }

    pub fn bin_value(&self, bin: i64) -> i64 {
        if bin < 0 || bin as usize >= self.values.len() {
            0
        } else {
            self.values[bin as usize]
        }
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    /// Sum of bins `a..=b`. Indices are clamped into range; whatever the clamp
    /// cuts off is only counted when `include_overflow` asks for the
    /// under/overflow bins.
    pub fn range_sum(&self, a: i64, b: i64, include_overflow: bool) -> i64 {
        if b < a || self.values.is_empty() {
            return 0;
        }
        let last = self.values.len() as i64 - 1;
        let mut total = 0;
        let lo = if a < 0 {
            if include_overflow {
                total += self.underflow;
            }
            0
        } else {
            a
        };
        let hi = if b > last {
            if include_overflow {
                total += self.overflow;
            }
            last
        } else {
            b
        };
        if lo <= hi {
            total += self.values[lo as usize..=hi as usize].iter().sum::<i64>();
        }
        total
    }

    /// Fraction of the in-range integral strictly above `threshold`, overflow
    /// included in the numerator. Returns 0 for an empty histogram.
    pub fn fraction_above(&self, threshold: i64) -> f64 {
        let total = self.integral + self.overflow;
        if total <= 0 {
            return 0.0;
        }
        let above = self.range_sum(threshold + 1, i64::MAX, true);
        above as f64 / total as f64
    }

    /// Scans down from the top bin and returns the smallest bin `t` whose tail
    /// `count(> t)` (overflow included) is still at or below `max_count`,
    /// together with that tail count.
    pub fn tail_threshold(&self, max_count: f64) -> (i64, i64) {
        if self.values.is_empty() {
            return (0, self.overflow);
        }
        let mut threshold = self.values.len() as i64 - 1;
        let mut above = self.overflow;
        while threshold > 0 {
            let wider = above + self.values[threshold as usize];
            if wider as f64 > max_count {
                break;
            }
            above = wider;
            threshold -= 1;
        }
        (threshold, above)
    }

    /// Weighted mean of the bin index. 0 when the histogram is empty.
    pub fn mean(&self) -> f64 {
        if let Some(mean) = self.mean_cache.get() {
            return mean;
        }
        let mean = if self.integral == 0 {
            0.0
        } else {
            let weighted: f64 = self
                .values
                .iter()
                .enumerate()
                .map(|(bin, &w)| bin as f64 * w as f64)
                .sum();
            weighted / self.integral as f64
        };
        self.mean_cache.set(Some(mean));
        mean
    }

    pub fn variance(&self) -> f64 {
        if let Some(variance) = self.variance_cache.get() {
            return variance;
        }
        let variance = if self.integral == 0 {
            0.0
        } else {
            let mean = self.mean();
            let squared: f64 = self
                .values
                .iter()
                .enumerate()
                .map(|(bin, &w)| {
                    let d = bin as f64 - mean;
                    d * d * w as f64
                })
                .sum();
            squared / self.integral as f64
        };
        self.variance_cache.set(Some(variance));
        variance
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    fn invalidate(&self) {
        self.mean_cache.set(None);
        self.variance_cache.set(None);
    }
}

impl PartialEq for Histogram {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
            && self.underflow == other.underflow
            && self.overflow == other.overflow
            && self.integral == other.integral
            && self.entries == other.entries
    }
}
