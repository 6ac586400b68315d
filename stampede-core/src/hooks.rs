//! Run lifecycle listeners.
//!
//! Listeners are registered on a [`Hooks`] table handed to the coordinator at
//! construction. There is no global registry.
use std::sync::Arc;

use outcome_stats::RunReport;

use crate::coordinator::RunRole;

/// Receives run lifecycle events. Every method defaults to doing nothing.
pub trait RunListener: Send + Sync + 'static {
    /// The coordinator is about to start spawning toward `target_users`.
    fn on_test_start(&self, _role: RunRole, _target_users: usize) {}

    /// The ramp reached its target. On a master `user_count` is the total
    /// assigned across workers.
    fn on_spawning_complete(&self, _user_count: usize) {}

    /// The run stopped and the final report is ready.
    fn on_test_stop(&self, _report: &RunReport) {}
}

#[derive(Clone, Default)]
pub struct Hooks {
    listeners: Vec<Arc<dyn RunListener>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Listeners fire in registration order.
    pub fn register<L: RunListener>(&mut self, listener: L) -> &mut Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn test_start(&self, role: RunRole, target_users: usize) {
        for listener in &self.listeners {
            listener.on_test_start(role, target_users);
        }
    }

    pub(crate) fn spawning_complete(&self, user_count: usize) {
        for listener in &self.listeners {
            listener.on_spawning_complete(user_count);
        }
    }

    pub(crate) fn test_stop(&self, report: &RunReport) {
        for listener in &self.listeners {
            listener.on_test_stop(report);
        }
    }
}
