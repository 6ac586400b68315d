//! Weighted units of simulated-user work.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{session::UserContext, transport::TransportError};

/// The work a behavior performs. Implementations issue requests through
/// [`UserContext::request`] and may read or write the user's session.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    /// Run once. An `Err` is recorded as a failed outcome under the behavior's
    /// name and the user carries on with its next behavior.
    async fn run(&self, ctx: &mut UserContext<'_>) -> Result<(), BehaviorError>;
}

#[derive(Debug, Error)]
pub enum BehaviorError {
    /// A request failed at the transport. Its outcome has already been
    /// recorded by [`UserContext::request`].
    #[error(transparent)]
    Request(#[from] TransportError),

    /// The response did not look the way the behavior expected.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BehaviorError {
    /// Whether this failure already produced an outcome.
    pub fn is_recorded(&self) -> bool {
        matches!(self, BehaviorError::Request(_))
    }
}

/// A named, weighted action. Weight is the relative selection probability
/// among the behaviors of one scenario and must be at least 1; the
/// [`TaskScheduler`](crate::scheduler::TaskScheduler) rejects anything else
/// when the behavior is registered.
#[derive(Clone)]
pub struct Behavior {
    name: Arc<str>,
    weight: u32,
    action: Arc<dyn Action>,
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behavior")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

impl Behavior {
    pub fn new<A: Action>(name: impl Into<Arc<str>>, weight: u32, action: A) -> Self {
        Self {
            name: name.into(),
            weight,
            action: Arc::new(action),
        }
    }

    /// Behavior with the default weight of 1.
    pub fn unweighted<A: Action>(name: impl Into<Arc<str>>, action: A) -> Self {
        Self::new(name, 1, action)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn action(&self) -> &Arc<dyn Action> {
        &self.action
    }
}
