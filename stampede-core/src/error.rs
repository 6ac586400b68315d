//! Error types shared across the engine.
//!
//! Configuration problems are fatal and surface before any simulated user
//! starts. Channel problems between master and worker are transient and are
//! retried with backoff. Request and behavior failures never leave the
//! simulated user that hit them; they become failed outcomes instead (see
//! [`TransportError`] and [`BehaviorError`]).
//!
//! [`TransportError`]: crate::transport::TransportError
//! [`BehaviorError`]: crate::behavior::BehaviorError

use std::{io, time::Duration};

use thiserror::Error;

use crate::control::CodecError;

/// Invalid setup detected before a run starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Role string is not one of `standalone`, `master` or `worker`.
    #[error("unrecognized role `{0}`, expected one of standalone, master, worker")]
    InvalidRole(String),

    /// A scenario was registered without any behaviors.
    #[error("scenario `{0}` has no behaviors")]
    EmptyBehaviors(String),

    /// A behavior weight must be at least 1.
    #[error("behavior `{behavior}` has non-positive weight {weight}")]
    NonPositiveWeight { behavior: String, weight: u32 },

    /// Think-time range with `min > max`.
    #[error("think time minimum {min:?} exceeds maximum {max:?}")]
    InvalidThinkTime { min: Duration, max: Duration },

    /// Spawn rate must be a finite number above zero.
    #[error("spawn rate must be greater than 0, got {0}")]
    InvalidSpawnRate(f64),

    /// Standalone and master runs need a target user count.
    #[error("a target user count greater than 0 is required for the {0} role")]
    MissingUsers(&'static str),

    /// Catch-all for other out-of-range settings.
    #[error("invalid setting `{name}`: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Failure on the master/worker control channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Could not bind the master listener.
    #[error("failed to bind control listener on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// Could not reach the master.
    #[error("failed to connect to master at {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Framing or I/O failure on an established link.
    #[error("control link error: {0}")]
    Codec(#[from] CodecError),

    /// Peer closed the connection.
    #[error("control link closed by peer")]
    Closed,

    /// No heartbeat from the peer within the allowed window.
    #[error("no heartbeat for {0:?}")]
    HeartbeatTimeout(Duration),
}

impl ChannelError {
    /// Returns true for faults that a reconnect can fix. A failed bind is
    /// the only one that cannot.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChannelError::Bind { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_error_classification() {
        let bind = ChannelError::Bind {
            addr: "0.0.0.0:5557".into(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(!bind.is_retryable());

        let connect = ChannelError::Connect {
            addr: "10.0.0.1:5557".into(),
            reason: "refused".into(),
        };
        assert!(connect.is_retryable());
        assert!(ChannelError::Closed.is_retryable());
        assert!(ChannelError::HeartbeatTimeout(Duration::from_secs(3)).is_retryable());
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidRole("leader".into());
        assert!(err.to_string().contains("`leader`"));

        let err = ConfigError::NonPositiveWeight {
            behavior: "browse".into(),
            weight: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("browse"));
        assert!(msg.contains("weight 0"));
    }
}
