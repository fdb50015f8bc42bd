//! Agent sessions: the controller's side of one live agent connection.
//!
//! A connection is split on handshake. The write half lives inside the
//! [`AgentSession`] behind an async mutex so concurrent probe dispatchers
//! take turns; the read half is moved into [`run_read_loop`], which runs as
//! its own task until the connection fails.
//!
//! ```text
//!   probe API ──send_command──► AgentSession.writer ──► socket
//!   socket ──► run_read_loop ──AgentProbeResult──► result channel
//!                      └────── Disconnect ───────► disconnect channel
//! ```

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::protocol::{self, AgentInfo, AgentProbeResult, ControllerCommand, ProtocolError};

/// Boxed write half of an agent connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed read half of an agent connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Framed inbound stream of an agent connection.
pub type FrameReader = FramedRead<BoxedReader, LengthDelimitedCodec>;

/// Errors from sending a command to an agent.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to write to agent {agent_id}: {source}")]
    Write {
        agent_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session for agent {0} is closed")]
    Closed(String),
}

/// Signal pushed by a read loop when its connection ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub agent_id: String,
    /// Distinguishes this connection from a later reconnect under the same
    /// identity.
    pub connection_id: u64,
}

/// Serializable snapshot of a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub address: String,
    pub label: String,
    pub connection_id: u64,
    pub connected_at: DateTime<Utc>,
}

/// One live agent: identity, descriptive info, and the outbound half of its
/// connection.
pub struct AgentSession {
    id: String,
    info: AgentInfo,
    connection_id: u64,
    connected_at: DateTime<Utc>,
    writer: Mutex<FramedWrite<BoxedWriter, LengthDelimitedCodec>>,
    cancel: CancellationToken,
}

impl AgentSession {
    /// Wrap the write half of a freshly handshaken connection.
    ///
    /// `cancel` stops the matching read loop when the session is closed.
    pub fn new(
        id: impl Into<String>,
        info: AgentInfo,
        connection_id: u64,
        writer: BoxedWriter,
        max_frame_length: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            info,
            connection_id,
            connected_at: Utc::now(),
            writer: Mutex::new(FramedWrite::new(
                writer,
                protocol::frame_codec(max_frame_length),
            )),
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Serialize `command` and write it as one frame.
    ///
    /// Safe to call from many tasks at once; writes are serialized by the
    /// session's write lock and never interleave with the read loop.
    pub async fn send_command(&self, command: &ControllerCommand) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed(self.id.clone()));
        }

        let frame = protocol::encode(command)?;
        let mut writer = self.writer.lock().await;
        writer.send(frame).await.map_err(|source| SessionError::Write {
            agent_id: self.id.clone(),
            source,
        })?;

        tracing::debug!(
            agent_id = %self.id,
            result_id = %command.result_id(),
            "command sent"
        );
        Ok(())
    }

    /// Stop the read loop and refuse further sends.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            address: self.info.address.clone(),
            label: self.info.label.clone(),
            connection_id: self.connection_id,
            connected_at: self.connected_at,
        }
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Decode result frames from one connection until it fails.
///
/// Every decoded result goes to `results`, waiting when the channel is full.
/// On EOF, I/O error, malformed frame, or cancellation exactly one
/// [`Disconnect`] is pushed to `disconnects` and the loop ends for good.
pub async fn run_read_loop(
    agent_id: String,
    connection_id: u64,
    mut frames: FrameReader,
    results: mpsc::Sender<AgentProbeResult>,
    disconnects: mpsc::Sender<Disconnect>,
    cancel: CancellationToken,
) {
    tracing::debug!(agent_id = %agent_id, connection_id, "read loop started");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(agent_id = %agent_id, connection_id, "read loop cancelled");
                break;
            }
            next = frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(
                    agent_id = %agent_id,
                    connection_id,
                    error = %e,
                    "agent read failed"
                );
                break;
            }
            None => {
                tracing::info!(agent_id = %agent_id, connection_id, "agent closed connection");
                break;
            }
        };

        let mut result = match protocol::decode::<AgentProbeResult>(&frame) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    agent_id = %agent_id,
                    connection_id,
                    error = %e,
                    "malformed result frame, dropping session"
                );
                break;
            }
        };

        // Results are attributed to the connection, never to a claimed id.
        result.agent_id.clone_from(&agent_id);

        tracing::debug!(agent_id = %agent_id, result_id = %result.result_id, "result received");

        if results.send(result).await.is_err() {
            tracing::debug!(agent_id = %agent_id, "result channel closed");
            break;
        }
    }

    cancel.cancel();

    let signal = Disconnect {
        agent_id: agent_id.clone(),
        connection_id,
    };
    if disconnects.send(signal).await.is_err() {
        tracing::debug!(agent_id = %agent_id, "disconnect channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LatencyDatapoint, LatencyRequest};
    use bytes::Bytes;
    use tokio::io::DuplexStream;

    fn reader(stream: DuplexStream) -> FrameReader {
        FramedRead::new(Box::new(stream) as BoxedReader, protocol::frame_codec(1024))
    }

    fn agent_writer(stream: DuplexStream) -> FramedWrite<DuplexStream, LengthDelimitedCodec> {
        FramedWrite::new(stream, protocol::frame_codec(1024))
    }

    fn result(id: &str) -> AgentProbeResult {
        AgentProbeResult {
            result_id: id.to_string(),
            agent_id: String::new(),
            datapoints: vec![LatencyDatapoint {
                sequence: 0,
                latency_ms: 1.5,
            }],
            error: None,
        }
    }

    #[tokio::test]
    async fn read_loop_forwards_results_then_disconnects_once() {
        let (agent_side, controller_side) = tokio::io::duplex(4096);
        let (results_tx, mut results_rx) = mpsc::channel(4);
        let (disconnects_tx, mut disconnects_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_read_loop(
            "a1".to_string(),
            7,
            reader(controller_side),
            results_tx,
            disconnects_tx,
            cancel.clone(),
        ));

        let mut agent = agent_writer(agent_side);
        agent
            .send(protocol::encode(&result("r1")).unwrap())
            .await
            .unwrap();
        agent
            .send(protocol::encode(&result("r2")).unwrap())
            .await
            .unwrap();
        drop(agent);

        let first = results_rx.recv().await.unwrap();
        assert_eq!(first.result_id, "r1");
        assert_eq!(first.agent_id, "a1", "empty agent_id is filled in");
        assert_eq!(results_rx.recv().await.unwrap().result_id, "r2");

        handle.await.unwrap();
        assert_eq!(
            disconnects_rx.recv().await.unwrap(),
            Disconnect {
                agent_id: "a1".to_string(),
                connection_id: 7
            }
        );
        assert!(disconnects_rx.try_recv().is_err());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn claimed_agent_id_is_replaced_with_session_identity() {
        let (agent_side, controller_side) = tokio::io::duplex(4096);
        let (results_tx, mut results_rx) = mpsc::channel(4);
        let (disconnects_tx, _disconnects_rx) = mpsc::channel(4);

        tokio::spawn(run_read_loop(
            "a1".to_string(),
            2,
            reader(controller_side),
            results_tx,
            disconnects_tx,
            CancellationToken::new(),
        ));

        let mut spoofed = result("r1");
        spoofed.agent_id = "someone-else".to_string();
        let mut agent = agent_writer(agent_side);
        agent
            .send(protocol::encode(&spoofed).unwrap())
            .await
            .unwrap();

        let forwarded = results_rx.recv().await.unwrap();
        assert_eq!(forwarded.result_id, "r1");
        assert_eq!(forwarded.agent_id, "a1");
    }

    #[tokio::test]
    async fn malformed_frame_ends_the_session() {
        let (agent_side, controller_side) = tokio::io::duplex(4096);
        let (results_tx, mut results_rx) = mpsc::channel(4);
        let (disconnects_tx, mut disconnects_rx) = mpsc::channel(4);

        let handle = tokio::spawn(run_read_loop(
            "a1".to_string(),
            1,
            reader(controller_side),
            results_tx,
            disconnects_tx,
            CancellationToken::new(),
        ));

        let mut agent = agent_writer(agent_side);
        agent.send(Bytes::from_static(b"{broken")).await.unwrap();

        handle.await.unwrap();
        assert_eq!(disconnects_rx.recv().await.unwrap().agent_id, "a1");
        assert!(results_rx.try_recv().is_err());
        // The connection is still open on the agent side; the loop gave up anyway.
        drop(agent);
    }

    #[tokio::test]
    async fn cancellation_ends_the_session() {
        let (_agent_side, controller_side) = tokio::io::duplex(4096);
        let (results_tx, _results_rx) = mpsc::channel(4);
        let (disconnects_tx, mut disconnects_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_read_loop(
            "a1".to_string(),
            3,
            reader(controller_side),
            results_tx,
            disconnects_tx,
            cancel.clone(),
        ));

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(disconnects_rx.recv().await.unwrap().connection_id, 3);
    }

    #[tokio::test]
    async fn send_command_writes_one_frame() {
        let (controller_side, agent_side) = tokio::io::duplex(4096);
        let session = AgentSession::new(
            "a1",
            AgentInfo::default(),
            1,
            Box::new(controller_side),
            1024,
            CancellationToken::new(),
        );

        let mut request = LatencyRequest::tcp("example.com", 80);
        request.result_id = "r9".to_string();
        let command = ControllerCommand::LatencyRequest {
            latency_request: request,
        };
        session.send_command(&command).await.unwrap();

        let mut frames = FramedRead::new(agent_side, protocol::frame_codec(1024));
        let frame = frames.next().await.unwrap().unwrap();
        let decoded: ControllerCommand = protocol::decode(&frame).unwrap();
        assert_eq!(decoded, command);
    }

    #[tokio::test]
    async fn closed_session_refuses_to_send() {
        let (controller_side, _agent_side) = tokio::io::duplex(4096);
        let session = AgentSession::new(
            "a1",
            AgentInfo::default(),
            1,
            Box::new(controller_side),
            1024,
            CancellationToken::new(),
        );
        session.close();
        assert!(session.is_closed());

        let command = ControllerCommand::LatencyRequest {
            latency_request: LatencyRequest::tcp("example.com", 80),
        };
        let err = session.send_command(&command).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed(id) if id == "a1"));
    }

    #[test]
    fn summary_copies_info() {
        let (controller_side, _agent_side) = tokio::io::duplex(64);
        let session = AgentSession::new(
            "a1",
            AgentInfo {
                address: "192.0.2.1".to_string(),
                label: "edge".to_string(),
            },
            4,
            Box::new(controller_side),
            1024,
            CancellationToken::new(),
        );
        let summary = session.summary();
        assert_eq!(summary.id, "a1");
        assert_eq!(summary.address, "192.0.2.1");
        assert_eq!(summary.label, "edge");
        assert_eq!(summary.connection_id, 4);
        assert_eq!(summary.connected_at, session.connected_at());
    }
}
