//! A class of simulated user: what it does and how long it pauses.
use std::{fmt, sync::Arc, time::Duration};

use rand::Rng;

use crate::{
    behavior::{Action, Behavior},
    error::ConfigError,
    transport::HeaderMap,
};

/// Uniform pause between two behaviors of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkTime {
    min: Duration,
    max: Duration,
}

impl ThinkTime {
    pub fn between(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidThinkTime { min, max });
        }
        Ok(Self { min, max })
    }

    pub const fn constant(pause: Duration) -> Self {
        Self {
            min: pause,
            max: pause,
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Draw a pause from `[min, max]`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let min = u64::try_from(self.min.as_nanos()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rng.gen_range(min..=max))
    }
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self::constant(Duration::ZERO)
    }
}

/// Behaviors plus per-user setup for one kind of simulated user.
#[derive(Clone)]
pub struct Scenario {
    name: String,
    behaviors: Vec<Behavior>,
    think_time: ThinkTime,
    on_start: Option<Arc<dyn Action>>,
    headers: HeaderMap,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("behaviors", &self.behaviors)
            .field("think_time", &self.think_time)
            .field("on_start", &self.on_start.is_some())
            .field("headers", &self.headers)
            .finish()
    }
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behaviors: Vec::new(),
            think_time: ThinkTime::default(),
            on_start: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behaviors.push(behavior);
        self
    }

    pub fn think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = think_time;
        self
    }

    /// Action run once per user, before its first behavior. Its requests are
    /// recorded under `on_start` unless they are named.
    pub fn on_start<A: Action>(mut self, action: A) -> Self {
        self.on_start = Some(Arc::new(action));
        self
    }

    /// Header every new session starts with.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn behaviors(&self) -> &[Behavior] {
        &self.behaviors
    }

    pub fn wait_time(&self) -> ThinkTime {
        self.think_time
    }

    pub fn start_action(&self) -> Option<&Arc<dyn Action>> {
        self.on_start.as_ref()
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.headers
    }
}
