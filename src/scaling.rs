use crate::config::PoolConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Grow,
    Shrink,
    Hold,
}

/// Hysteresis controller for the transmitter pool.
///
/// Growing reacts to a single deep sample, shrinking needs `shrink_after`
/// consecutive shallow ones.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    min_workers: usize,
    max_workers: usize,
    high_water_per_worker: usize,
    low_water: usize,
    shrink_after: u32,
    low_streak: u32,
}

impl ScalingPolicy {
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        ScalingPolicy {
            min_workers: config.min_workers,
            max_workers: config.max_workers.max(config.min_workers),
            high_water_per_worker: config.high_water_per_worker,
            low_water: config.low_water,
            shrink_after: config.shrink_after.max(1),
            low_streak: 0,
        }
    }

    #[must_use]
    pub const fn min_workers(&self) -> usize {
        self.min_workers
    }

    #[must_use]
    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Feeds one `(queue depth, live workers)` sample.
    pub fn observe(&mut self, depth: usize, workers: usize) -> ScaleDecision {
        let high_water = self.high_water_per_worker.saturating_mul(workers);
        if depth > high_water {
            self.low_streak = 0;

            return match workers < self.max_workers {
                true => ScaleDecision::Grow,
                false => ScaleDecision::Hold,
            };
        }

        if depth > self.low_water {
            self.low_streak = 0;

            return ScaleDecision::Hold;
        }

        self.low_streak = self.low_streak.saturating_add(1);
        match self.low_streak >= self.shrink_after && workers > self.min_workers {
            true => {
                self.low_streak = 0;

                ScaleDecision::Shrink
            }
            false => ScaleDecision::Hold,
        }
    }
}
