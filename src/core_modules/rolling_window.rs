// THEORY:
// A `RollingSampleWindow` is the memory of the calibrator. It remembers the last
// N samples in arrival order and keeps a histogram that always describes exactly
// those samples. Like the history buffers of a learning region, it works as a
// sliding window: push to the back, pop from the front once full. The histogram
// is never rebuilt, the evicted sample is subtracted and the new one added.

use crate::core_modules::histogram::Histogram;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RollingSampleWindow {
    capacity: usize,
    samples: VecDeque<i64>,
    histogram: Histogram,
}

impl RollingSampleWindow {
    pub fn new(capacity: usize, nbins: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            histogram: Histogram::new(nbins),
        }
    }

    /// Inserts a sample and returns the one evicted to make room, if any.
    pub fn add(&mut self, value: i64) -> Option<i64> {
        if self.capacity == 0 {
            return None;
        }
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        if let Some(old) = evicted {
            self.histogram.remove(old);
        }
        self.samples.push_back(value);
        self.histogram.fill(value);
        evicted
    }

    /// Changes the capacity, dropping the oldest samples if it shrinks.
    pub fn resize(&mut self, capacity: usize) {
        while self.samples.len() > capacity {
            if let Some(old) = self.samples.pop_front() {
                self.histogram.remove(old);
            }
        }
        self.capacity = capacity;
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.histogram.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    pub fn iter(&self) -> impl Iterator<Item = &i64> {
        self.samples.iter()
    }
}
