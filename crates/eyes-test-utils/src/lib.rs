//! Shared test utilities for eyes integration tests.
//!
//! Provides a controller bound to an ephemeral loopback port and a scripted
//! [`FakeAgent`] that speaks the agent side of the wire protocol over a real
//! TCP connection.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use eyes_core::protocol::{self, ProtocolError};
use eyes_core::{
    AgentHello, AgentInfo, AgentProbeResult, Controller, ControllerCommand, ControllerConfig,
    LatencyDatapoint,
};

const FRAME_LIMIT: usize = 64 * 1024;

/// Start a controller on `127.0.0.1:0` and return it with its bound address.
///
/// The controller serves in a background task until `close()` is called.
pub async fn start_controller(config: ControllerConfig) -> (Controller, SocketAddr) {
    let config = ControllerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..config
    };
    let controller = Controller::new(config);
    let listener = controller
        .bind()
        .await
        .expect("failed to bind test controller");
    let addr = listener.local_addr().expect("failed to read local addr");

    let serving = controller.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    (controller, addr)
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The agent side of one connection.
///
/// Commands received from the controller are decoded by a background task
/// and queued; tests pull them with [`FakeAgent::next_command`].
pub struct FakeAgent {
    id: String,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    commands: mpsc::UnboundedReceiver<ControllerCommand>,
    reader: JoinHandle<()>,
}

impl FakeAgent {
    /// Connect to `addr` and send a handshake for `id`.
    pub async fn connect(addr: SocketAddr, id: &str) -> Result<Self, ProtocolError> {
        let hello = AgentHello {
            id: id.to_string(),
            info: AgentInfo {
                address: "127.0.0.1".to_string(),
                label: format!("fake-{id}"),
            },
        };
        let mut agent = Self::connect_raw(addr, id).await?;
        agent.send_frame(protocol::encode(&hello)?).await?;
        Ok(agent)
    }

    /// Connect to `addr` without sending anything.
    pub async fn connect_raw(addr: SocketAddr, id: &str) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let (tx, commands) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, protocol::frame_codec(FRAME_LIMIT));
            while let Some(Ok(frame)) = frames.next().await {
                match protocol::decode::<ControllerCommand>(&frame) {
                    Ok(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            id: id.to_string(),
            writer: FramedWrite::new(write_half, protocol::frame_codec(FRAME_LIMIT)),
            commands,
            reader,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Write one raw frame payload.
    pub async fn send_frame(&mut self, payload: Bytes) -> Result<(), ProtocolError> {
        self.writer.send(payload).await?;
        Ok(())
    }

    /// Send a result envelope.
    pub async fn send_result(&mut self, result: &AgentProbeResult) -> Result<(), ProtocolError> {
        self.send_frame(protocol::encode(result)?).await
    }

    /// Send a successful single-sample result for `result_id`.
    pub async fn respond(&mut self, result_id: &str, latency_ms: f64) -> Result<(), ProtocolError> {
        let result = AgentProbeResult {
            result_id: result_id.to_string(),
            agent_id: self.id.clone(),
            datapoints: vec![LatencyDatapoint {
                sequence: 0,
                latency_ms,
            }],
            error: None,
        };
        self.send_result(&result).await
    }

    /// Wait up to `timeout` for the next command from the controller.
    pub async fn next_command(&mut self, timeout: Duration) -> Option<ControllerCommand> {
        tokio::time::timeout(timeout, self.commands.recv())
            .await
            .ok()
            .flatten()
    }

    /// Answer the next command with a single-sample result.
    ///
    /// Returns the answered result id, or `None` if no command arrived.
    pub async fn answer_next(&mut self, timeout: Duration, latency_ms: f64) -> Option<String> {
        let command = self.next_command(timeout).await?;
        let result_id = command.result_id().to_string();
        self.respond(&result_id, latency_ms).await.ok()?;
        Some(result_id)
    }

    /// Hand the agent to a background task that answers every command until
    /// the controller closes the connection. The task yields the number of
    /// commands answered.
    pub fn spawn_responder(mut self, latency_ms: f64) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut answered = 0;
            while let Some(command) = self.commands.recv().await {
                let result_id = command.result_id().to_string();
                if self.respond(&result_id, latency_ms).await.is_err() {
                    break;
                }
                answered += 1;
            }
            answered
        })
    }

    /// Close the connection from the agent side.
    pub async fn close(mut self) {
        let _ = SinkExt::<Bytes>::close(&mut self.writer).await;
        self.reader.abort();
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
