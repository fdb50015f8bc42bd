//! Connection acceptor and handshake.
//!
//! Every accepted connection gets its own task. The task reads exactly one
//! handshake frame, registers an [`AgentSession`] under the identity it
//! carries, and then spawns the session's read loop. Frames that arrived
//! right behind the handshake stay buffered in the same reader, so nothing
//! is lost to coalescing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::protocol::{self, AgentHello, AgentProbeResult, ProtocolError};
use crate::registry::AgentRegistry;
use crate::session::{
    AgentSession, BoxedReader, BoxedWriter, Disconnect, FrameReader, run_read_loop,
};

/// Reasons a new connection is abandoned before it becomes a session.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("connection closed before handshake")]
    Closed,

    #[error("handshake read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("handshake carried an empty agent id")]
    EmptyId,
}

/// Read and decode the single handshake frame of a new connection.
pub async fn read_hello(frames: &mut FrameReader) -> Result<AgentHello, HandshakeError> {
    let frame = frames.next().await.ok_or(HandshakeError::Closed)??;
    let hello: AgentHello = protocol::decode(&frame)?;
    if hello.id.is_empty() {
        return Err(HandshakeError::EmptyId);
    }
    Ok(hello)
}

/// Everything a handshake task needs to turn a connection into a session.
#[derive(Clone)]
pub struct Acceptor {
    registry: Arc<AgentRegistry>,
    results: mpsc::Sender<AgentProbeResult>,
    disconnects: mpsc::Sender<Disconnect>,
    next_connection_id: Arc<AtomicU64>,
    handshake_max_frame_length: usize,
    max_frame_length: usize,
    cancel: CancellationToken,
}

impl Acceptor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        results: mpsc::Sender<AgentProbeResult>,
        disconnects: mpsc::Sender<Disconnect>,
        handshake_max_frame_length: usize,
        max_frame_length: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            results,
            disconnects,
            next_connection_id: Arc::new(AtomicU64::new(0)),
            handshake_max_frame_length,
            max_frame_length,
            cancel,
        }
    }

    /// Handshake a connection, register its session and start its read loop.
    ///
    /// A session already registered under the same identity is replaced and
    /// closed; its eventual disconnect signal no longer matches the registry
    /// and is ignored.
    pub async fn establish(
        &self,
        reader: BoxedReader,
        writer: BoxedWriter,
        peer: &str,
    ) -> Result<Arc<AgentSession>, HandshakeError> {
        let mut frames = FramedRead::new(
            reader,
            protocol::frame_codec(self.handshake_max_frame_length),
        );
        let hello = read_hello(&mut frames).await?;
        frames
            .decoder_mut()
            .set_max_frame_length(self.max_frame_length);

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session_cancel = self.cancel.child_token();
        let session = Arc::new(AgentSession::new(
            hello.id.clone(),
            hello.info,
            connection_id,
            writer,
            self.max_frame_length,
            session_cancel.clone(),
        ));

        if let Some(previous) = self.registry.register(Arc::clone(&session)) {
            tracing::warn!(
                agent_id = %hello.id,
                old_connection_id = previous.connection_id(),
                connection_id,
                "agent reconnected, closing superseded session"
            );
            previous.close();
        }

        tokio::spawn(run_read_loop(
            hello.id.clone(),
            connection_id,
            frames,
            self.results.clone(),
            self.disconnects.clone(),
            session_cancel,
        ));

        // Lost a race with Controller::close; the disconnect handler is gone.
        if self.cancel.is_cancelled() {
            self.registry.remove_connection(&hello.id, connection_id);
            return Err(HandshakeError::Closed);
        }

        tracing::info!(
            agent_id = %hello.id,
            address = %session.info().address,
            label = %session.info().label,
            peer = %peer,
            connection_id,
            "agent connected"
        );

        Ok(session)
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("registry", &self.registry)
            .field(
                "handshake_max_frame_length",
                &self.handshake_max_frame_length,
            )
            .field("max_frame_length", &self.max_frame_length)
            .finish()
    }
}

/// Accept connections until `cancel` fires.
///
/// Accept errors are logged and the loop keeps going. Handshake failures
/// only affect their own connection.
pub async fn run_accept_loop(
    listener: TcpListener,
    acceptor: Acceptor,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let peer = peer.to_string();
                    let (reader, writer) = stream.into_split();
                    if let Err(e) = acceptor
                        .establish(Box::new(reader), Box::new(writer), &peer)
                        .await
                    {
                        tracing::warn!(
                            peer = %peer,
                            error = %e,
                            "handshake failed, dropping connection"
                        );
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "error accepting connection");
            }
        }
    }

    tracing::info!("accept loop stopped");
}
