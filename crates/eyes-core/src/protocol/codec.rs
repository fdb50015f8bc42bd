//! Length-delimited JSON framing.
//!
//! Frame layout: a 4-byte big-endian payload length followed by the JSON
//! payload. A reader loops until a whole frame is buffered, so a single TCP
//! read never truncates or coalesces envelopes.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::LengthDelimitedCodec;

/// Errors from encoding, decoding or moving frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the frame codec used on both halves of an agent connection.
///
/// Frames whose declared length exceeds `max_frame_length` fail with an
/// `InvalidData` I/O error.
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Serialize an envelope into a frame payload.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

/// Deserialize a frame payload into an envelope.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(frame).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentHello, AgentInfo};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn frames_survive_a_stream_boundary() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, frame_codec(1024));
        let mut reader = FramedRead::new(server, frame_codec(1024));

        let hello = AgentHello {
            id: "agent-with-a-fairly-long-identity-string".to_string(),
            info: AgentInfo {
                address: "192.0.2.10".to_string(),
                label: "lab".to_string(),
            },
        };

        // Two envelopes larger than the duplex buffer force partial reads.
        let send = async {
            writer.send(encode(&hello).unwrap()).await.unwrap();
            writer.send(encode(&hello).unwrap()).await.unwrap();
        };
        let recv = async {
            let first = reader.next().await.unwrap().unwrap();
            let second = reader.next().await.unwrap().unwrap();
            (first, second)
        };
        let ((), (first, second)) = tokio::join!(send, recv);

        assert_eq!(decode::<AgentHello>(&first).unwrap(), hello);
        assert_eq!(decode::<AgentHello>(&second).unwrap(), hello);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWrite::new(client, frame_codec(4096));
        let mut reader = FramedRead::new(server, frame_codec(8));

        writer
            .send(Bytes::from_static(b"0123456789abcdef"))
            .await
            .unwrap();

        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_garbage_fails() {
        let err = decode::<AgentHello>(b"not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
