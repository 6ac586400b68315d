//! Weighted behavior selection.
use rand::Rng;

use crate::{behavior::Behavior, error::ConfigError};

/// Picks the next behavior for a simulated user.
///
/// The cumulative-weight table is built once at construction and never
/// mutated, so one scheduler is shared by every user of a scenario without a
/// lock. Each user brings its own RNG.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    behaviors: Vec<Behavior>,
    cumulative: Vec<u64>,
    total: u64,
}

impl TaskScheduler {
    /// Register `behaviors`. Fails on an empty list or any zero weight.
    pub fn new(scenario: &str, behaviors: Vec<Behavior>) -> Result<Self, ConfigError> {
        if behaviors.is_empty() {
            return Err(ConfigError::EmptyBehaviors(scenario.to_string()));
        }

        let mut cumulative = Vec::with_capacity(behaviors.len());
        let mut total = 0u64;
        for behavior in &behaviors {
            if behavior.weight() == 0 {
                return Err(ConfigError::NonPositiveWeight {
                    behavior: behavior.name().to_string(),
                    weight: behavior.weight(),
                });
            }
            total += u64::from(behavior.weight());
            cumulative.push(total);
        }

        Ok(Self {
            behaviors,
            cumulative,
            total,
        })
    }

    /// Draw from `[0, total_weight)` and return the first behavior whose
    /// cumulative weight exceeds the draw.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> &Behavior {
        self.pick(rng.gen_range(0..self.total))
    }

    fn pick(&self, draw: u64) -> &Behavior {
        let index = self.cumulative.partition_point(|&bound| bound <= draw);
        &self.behaviors[index]
    }

    pub fn total_weight(&self) -> u64 {
        self.total
    }

    pub fn behaviors(&self) -> &[Behavior] {
        &self.behaviors
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        behavior::{Action, BehaviorError},
        session::UserContext,
    };

    struct Noop;

    #[async_trait]
    impl Action for Noop {
        async fn run(&self, _ctx: &mut UserContext<'_>) -> Result<(), BehaviorError> {
            Ok(())
        }
    }

    fn scheduler(weights: &[(&str, u32)]) -> Result<TaskScheduler, ConfigError> {
        let behaviors = weights
            .iter()
            .map(|(name, weight)| Behavior::new(*name, *weight, Noop))
            .collect();
        TaskScheduler::new("test", behaviors)
    }

    fn frequencies(scheduler: &TaskScheduler, draws: usize, seed: u64) -> HashMap<String, usize> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut counts = HashMap::new();
        for _ in 0..draws {
            *counts
                .entry(scheduler.select(&mut rng).name().to_string())
                .or_default() += 1;
        }
        counts
    }

    #[test]
    fn rejects_empty_behavior_list() {
        let err = scheduler(&[]).expect_err("empty list");
        assert_eq!(err, ConfigError::EmptyBehaviors("test".into()));
    }

    #[test]
    fn rejects_zero_weight() {
        let err = scheduler(&[("a", 2), ("b", 0)]).expect_err("zero weight");
        assert_eq!(
            err,
            ConfigError::NonPositiveWeight {
                behavior: "b".into(),
                weight: 0
            }
        );
    }

    #[test]
    fn cumulative_boundaries() {
        let sched = scheduler(&[("a", 3), ("b", 1)]).expect("valid");
        assert_eq!(sched.total_weight(), 4);
        assert_eq!(sched.pick(0).name(), "a");
        assert_eq!(sched.pick(2).name(), "a");
        assert_eq!(sched.pick(3).name(), "b");
    }

    #[test]
    fn three_to_one_over_four_thousand_draws() {
        let sched = scheduler(&[("A", 3), ("B", 1)]).expect("valid");
        for seed in [1, 7, 42, 1337] {
            let counts = frequencies(&sched, 4_000, seed);
            let a = counts.get("A").copied().unwrap_or_default();
            let b = counts.get("B").copied().unwrap_or_default();
            assert!((2_850..=3_150).contains(&a), "seed {seed}: A selected {a} times");
            assert!((850..=1_150).contains(&b), "seed {seed}: B selected {b} times");
        }
    }

    #[test]
    fn frequencies_converge_to_weight_share() {
        let weights = [("browse", 3), ("search", 2), ("create", 1), ("health", 1)];
        let sched = scheduler(&weights).expect("valid");
        let draws = 200_000;
        let counts = frequencies(&sched, draws, 99);

        for (name, weight) in weights {
            let expected = f64::from(weight) / sched.total_weight() as f64;
            let observed = counts[name] as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "{name}: observed {observed:.4}, expected {expected:.4}"
            );
        }
    }

    #[test]
    fn single_behavior_always_selected() {
        let sched = scheduler(&[("only", 1)]).expect("valid");
        let counts = frequencies(&sched, 100, 5);
        assert_eq!(counts["only"], 100);
    }
}
