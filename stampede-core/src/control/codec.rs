use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::{ControlMessage, Inbound};

/// Largest control frame accepted, in bytes.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode control message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-prefixed JSON control frames: 4-byte big-endian length, then the
/// envelope.
#[derive(Debug)]
pub struct ControlCodec {
    frames: LengthDelimitedCodec,
}

impl ControlCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(ControlMessage::from_frame(&frame))),
            None => Ok(None),
        }
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = item.to_frame()?;
        self.frames.encode(Bytes::from(frame), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::control::Heartbeat;

    fn raw_frame(dst: &mut BytesMut, body: &[u8]) {
        dst.put_u32(body.len() as u32);
        dst.put_slice(body);
    }

    #[test]
    fn bad_frames_do_not_poison_the_stream() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        raw_frame(&mut buf, b"garbage");
        raw_frame(&mut buf, br#"{"type":"gossip","payload":null}"#);
        codec
            .encode(
                ControlMessage::Heartbeat(Heartbeat {
                    sender: "master".into(),
                    user_count: 0,
                }),
                &mut buf,
            )
            .expect("encode");

        assert!(matches!(
            codec.decode(&mut buf).expect("decode"),
            Some(Inbound::Malformed { .. })
        ));
        assert_eq!(
            codec.decode(&mut buf).expect("decode"),
            Some(Inbound::Unknown("gossip".into()))
        );
        assert!(matches!(
            codec.decode(&mut buf).expect("decode"),
            Some(Inbound::Message(ControlMessage::Heartbeat(_)))
        ));
        assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = ControlCodec::new();
        let mut full = BytesMut::new();
        codec.encode(ControlMessage::Stop, &mut full).expect("encode");

        let mut buf = full.split_to(full.len() - 2);
        assert_eq!(codec.decode(&mut buf).expect("decode"), None);
        buf.extend_from_slice(&full);
        assert_eq!(
            codec.decode(&mut buf).expect("decode"),
            Some(Inbound::Message(ControlMessage::Stop))
        );
    }
}
