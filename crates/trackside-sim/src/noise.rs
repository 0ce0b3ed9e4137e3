//! ---
//! ts_section: "11-simulation-test-harness"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Seedable noise source for the motor model."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};

use crate::physics::Disturbance;

/// Noise source with optional deterministic seeding.
#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    rng: SmallRng,
    centered: Uniform<f64>,
}

impl NoiseGenerator {
    /// Seed `0` draws from OS entropy; any other seed is reproducible.
    pub fn new(seed: u64) -> Self {
        let rng = if seed == 0 {
            SmallRng::from_entropy()
        } else {
            SmallRng::seed_from_u64(seed)
        };
        Self {
            rng,
            centered: Uniform::new(-0.5, 0.5),
        }
    }

    /// Uniform sample in `[-0.5, 0.5)`.
    #[inline]
    pub fn centered(&mut self) -> f64 {
        self.centered.sample(&mut self.rng)
    }

    /// Uniform integer in `low..high`.
    pub fn between(&mut self, low: u32, high: u32) -> u32 {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..high)
    }

    /// One tick worth of disturbances for [`crate::MotorModel::step`].
    pub fn disturbance(&mut self) -> Disturbance {
        Disturbance {
            load: self.centered(),
            bemf: self.centered(),
            current: self.centered(),
        }
    }
}
