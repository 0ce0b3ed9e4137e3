//! ---
//! ts_section: "11-simulation-test-harness"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Ring-buffer moving average mirroring the firmware smoothing."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---

/// Fixed-size moving average. Starts zero-filled, like the firmware buffer,
/// so the reported value ramps in over `capacity` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: Vec<f64>,
    cursor: usize,
    sum: f64,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            cursor: 0,
            sum: 0.0,
        }
    }

    /// Overwrite the oldest slot and return the new average.
    pub fn push(&mut self, value: f64) -> f64 {
        let old = std::mem::replace(&mut self.samples[self.cursor], value);
        self.sum += value - old;
        self.cursor = (self.cursor + 1) % self.samples.len();
        if self.cursor == 0 {
            // resync to shed accumulated rounding
            self.sum = self.samples.iter().sum();
        }
        self.average()
    }

    pub fn average(&self) -> f64 {
        self.sum / self.samples.len() as f64
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn reset(&mut self) {
        self.samples.iter_mut().for_each(|slot| *slot = 0.0);
        self.cursor = 0;
        self.sum = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::NoiseGenerator;
    use statrs::statistics::Statistics;

    #[test]
    fn converges_to_constant_input() {
        let mut filter = MovingAverage::new(48);
        let mut last = 0.0;
        for _ in 0..48 {
            let next = filter.push(400.0);
            assert!(next >= last);
            last = next;
        }
        assert!((last - 400.0).abs() < 1e-9);
    }

    #[test]
    fn wraps_with_independent_cursor() {
        let mut filter = MovingAverage::new(4);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            filter.push(v);
        }
        assert!((filter.average() - 3.5).abs() < 1e-9);
        filter.reset();
        assert_eq!(filter.average(), 0.0);
        assert_eq!(filter.capacity(), 4);
    }

    #[test]
    fn smoothing_reduces_variance() {
        let mut noise = NoiseGenerator::new(11);
        let mut filter = MovingAverage::new(48);
        for _ in 0..48 {
            filter.push(400.0 + 20.0 * noise.centered());
        }
        let mut raw = Vec::new();
        let mut smoothed = Vec::new();
        for _ in 0..500 {
            let sample = 400.0 + 20.0 * noise.centered();
            raw.push(sample);
            smoothed.push(filter.push(sample));
        }
        let raw_sd = raw.iter().std_dev();
        let smooth_sd = smoothed.iter().std_dev();
        assert!(smooth_sd < raw_sd, "{smooth_sd} !< {raw_sd}");
        assert!((smoothed.iter().mean() - 400.0).abs() < 2.0);
    }
}
