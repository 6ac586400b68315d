//! Master/worker control protocol.
//!
//! Every frame is a JSON envelope `{"type": <tag>, "payload": <value>}`. A
//! receiver never drops the link because of one bad frame: unknown tags come
//! back as [`Inbound::Unknown`] and undecodable frames as
//! [`Inbound::Malformed`], and the caller logs and skips them.
mod codec;

pub use codec::{CodecError, ControlCodec, MAX_FRAME_LENGTH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use outcome_stats::StatsReport;

pub const HELLO: &str = "hello";
pub const SPAWN: &str = "spawn";
pub const STOP: &str = "stop";
pub const HEARTBEAT: &str = "heartbeat";
pub const STATS: &str = "stats";
pub const QUIT: &str = "quit";

/// First frame a worker sends on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub worker_id: String,
}

/// Ramp this worker toward `user_count` users at `spawn_rate` users/second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spawn {
    pub user_count: usize,
    pub spawn_rate: f64,
}

/// Liveness ping. The master sends them on an interval; a worker answers
/// each one with its own, carrying its current user count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sender: String,
    #[serde(default)]
    pub user_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Hello(Hello),
    Spawn(Spawn),
    Stop,
    Heartbeat(Heartbeat),
    Stats(StatsReport),
    Quit,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ControlMessage),
    /// Well-formed envelope with a tag this build does not know.
    Unknown(String),
    /// Not JSON, no envelope, or a payload that does not fit its tag.
    Malformed { tag: Option<String>, reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ControlMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMessage::Hello(_) => HELLO,
            ControlMessage::Spawn(_) => SPAWN,
            ControlMessage::Stop => STOP,
            ControlMessage::Heartbeat(_) => HEARTBEAT,
            ControlMessage::Stats(_) => STATS,
            ControlMessage::Quit => QUIT,
        }
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let payload = match self {
            ControlMessage::Hello(hello) => serde_json::to_value(hello)?,
            ControlMessage::Spawn(spawn) => serde_json::to_value(spawn)?,
            ControlMessage::Heartbeat(beat) => serde_json::to_value(beat)?,
            ControlMessage::Stats(report) => serde_json::to_value(report)?,
            ControlMessage::Stop | ControlMessage::Quit => Value::Null,
        };
        serde_json::to_vec(&Envelope {
            kind: self.tag().to_owned(),
            payload,
        })
    }

    pub fn from_frame(frame: &[u8]) -> Inbound {
        let envelope: Envelope = match serde_json::from_slice(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                return Inbound::Malformed {
                    tag: None,
                    reason: err.to_string(),
                };
            }
        };
        let Envelope { kind, payload } = envelope;
        let decoded = match kind.as_str() {
            HELLO => serde_json::from_value(payload).map(ControlMessage::Hello),
            SPAWN => serde_json::from_value(payload).map(ControlMessage::Spawn),
            STOP => Ok(ControlMessage::Stop),
            HEARTBEAT => serde_json::from_value(payload).map(ControlMessage::Heartbeat),
            STATS => serde_json::from_value(payload).map(ControlMessage::Stats),
            QUIT => Ok(ControlMessage::Quit),
            _ => return Inbound::Unknown(kind),
        };
        match decoded {
            Ok(msg) => Inbound::Message(msg),
            Err(err) => Inbound::Malformed {
                tag: Some(kind),
                reason: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use outcome_stats::{RequestOutcome, StatsSnapshot};
    use serde_json::json;
    use std::time::Duration;

    use super::*;

    #[test]
    fn frames_carry_type_and_payload() {
        let msg = ControlMessage::Spawn(Spawn {
            user_count: 25,
            spawn_rate: 5.0,
        });
        let frame = msg.to_frame().expect("encode");
        let value: Value = serde_json::from_slice(&frame).expect("json");
        assert_eq!(
            value,
            json!({ "type": "spawn", "payload": { "user_count": 25, "spawn_rate": 5.0 } })
        );
        assert_eq!(ControlMessage::from_frame(&frame), Inbound::Message(msg));
    }

    #[test]
    fn stats_report_survives_the_wire() {
        let mut snapshot = StatsSnapshot::new();
        snapshot.record(&RequestOutcome::success("browse_jobs", Duration::from_millis(42), 512));
        let msg = ControlMessage::Stats(StatsReport {
            worker_id: "w-1".into(),
            incarnation: "5f0c".into(),
            epoch: 9,
            last: true,
            snapshot,
        });
        let frame = msg.to_frame().expect("encode");
        assert_eq!(ControlMessage::from_frame(&frame), Inbound::Message(msg));
    }

    #[test]
    fn stop_without_payload_decodes() {
        assert_eq!(
            ControlMessage::from_frame(br#"{"type":"stop"}"#),
            Inbound::Message(ControlMessage::Stop)
        );
    }

    #[test]
    fn unknown_tag_is_reported_not_rejected() {
        assert_eq!(
            ControlMessage::from_frame(br#"{"type":"rebalance","payload":{"x":1}}"#),
            Inbound::Unknown("rebalance".into())
        );
    }

    #[test]
    fn malformed_frames() {
        match ControlMessage::from_frame(b"\x00\x01not json") {
            Inbound::Malformed { tag: None, .. } => {}
            other => panic!("expected malformed frame, got {other:?}"),
        }
        match ControlMessage::from_frame(br#"{"type":"spawn","payload":{"user_count":"many"}}"#) {
            Inbound::Malformed { tag: Some(tag), .. } => assert_eq!(tag, "spawn"),
            other => panic!("expected malformed spawn, got {other:?}"),
        }
    }
}
