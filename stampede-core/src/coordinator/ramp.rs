//! Rate-limited ramp toward a target user count.
use std::time::Duration;

/// How often a ramping coordinator spawns its next batch.
pub const RAMP_TICK: Duration = Duration::from_secs(1);

/// Slack for float accumulation so that e.g. ten ticks of 0.1 still add up
/// to one user.
const CREDIT_EPSILON: f64 = 1e-9;

/// Yields the number of users to start on each [`RAMP_TICK`].
///
/// Every tick earns `rate` users of credit and spends the whole part of it,
/// so fractional rates still average out (0.5/s starts one user every other
/// tick). The last batch is capped at whatever the target still needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RampPlan {
    current: usize,
    target: usize,
    rate: f64,
    credit: f64,
}

impl RampPlan {
    /// Plan from `current` running users up to `target`.
    pub fn new(current: usize, target: usize, rate: f64) -> Self {
        Self {
            current,
            target,
            rate,
            credit: 0.0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.current >= self.target
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Users started so far, including the starting point.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Batch for the next tick. Zero once the target is reached.
    pub fn next_batch(&mut self) -> usize {
        if self.is_done() {
            return 0;
        }
        self.credit += self.rate;
        let earned = (self.credit + CREDIT_EPSILON).floor().max(0.0) as usize;
        let batch = earned.min(self.target - self.current);
        self.credit -= batch as f64;
        self.current += batch;
        batch
    }
}

impl Iterator for RampPlan {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.is_done() {
            None
        } else {
            Some(self.next_batch())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifty_at_ten_per_second_is_five_batches() {
        let batches: Vec<_> = RampPlan::new(0, 50, 10.0).collect();
        assert_eq!(batches, vec![10, 10, 10, 10, 10]);
    }

    #[test]
    fn last_batch_is_capped() {
        let batches: Vec<_> = RampPlan::new(0, 25, 10.0).collect();
        assert_eq!(batches, vec![10, 10, 5]);
    }

    #[test]
    fn fractional_rate_accumulates() {
        let batches: Vec<_> = RampPlan::new(0, 3, 0.5).collect();
        assert_eq!(batches, vec![0, 1, 0, 1, 0, 1]);

        let tenths: Vec<_> = RampPlan::new(0, 1, 0.1).collect();
        assert_eq!(tenths.len(), 10);
        assert_eq!(tenths.iter().sum::<usize>(), 1);
    }

    #[test]
    fn resumes_from_current_count() {
        let mut plan = RampPlan::new(40, 50, 4.0);
        assert_eq!(plan.next_batch(), 4);
        assert_eq!(plan.next_batch(), 4);
        assert_eq!(plan.next_batch(), 2);
        assert!(plan.is_done());
        assert_eq!(plan.next_batch(), 0);
        assert!(RampPlan::new(60, 50, 4.0).is_done());
    }
}
