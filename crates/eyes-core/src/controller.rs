//! The probe controller: owns the registry, the pending-request map, the
//! listener set and the two shared channels, and exposes the probe API.
//!
//! # Lifecycle
//!
//! ```text
//! Controller::new ──► start()/serve(listener) ──► ... ──► close()
//!                        │
//!                        ├─ spawn result dispatcher     (once)
//!                        ├─ spawn disconnect handler    (once)
//!                        └─ accept loop ─► handshake task per connection
//!                                               └─► read loop per session
//! ```
//!
//! `Controller` is cheap to clone; clones share all state.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::acceptor::{Acceptor, run_accept_loop};
use crate::config::ControllerConfig;
use crate::dispatch::{
    ListenerSet, PendingExpiry, ResultListener, run_disconnect_handler, run_result_dispatcher,
};
use crate::id::{IdGenerator, UuidGenerator};
use crate::pending::PendingRequests;
use crate::protocol::{AgentProbeResult, ControllerCommand, LatencyRequest};
use crate::registry::AgentRegistry;
use crate::session::{AgentSummary, Disconnect, SessionError};

/// Errors surfaced by the controller API.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no such agent: {0}")]
    UnknownAgent(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("probe {result_id} to agent {agent_id} timed out")]
    Timeout { agent_id: String, result_id: String },

    #[error("probe {0} expired before a result arrived")]
    Expired(String),
}

/// Receiving ends of the shared channels, held until the dispatchers start.
struct Receivers {
    results: mpsc::Receiver<AgentProbeResult>,
    disconnects: mpsc::Receiver<Disconnect>,
}

/// Handles of the two consumer tasks, owned by the first `serve` call.
struct Dispatchers {
    results: JoinHandle<()>,
    disconnects: JoinHandle<()>,
}

/// Central coordinator for a fleet of probe agents.
#[derive(Clone)]
pub struct Controller {
    config: Arc<ControllerConfig>,
    registry: Arc<AgentRegistry>,
    pending: Arc<PendingRequests>,
    listeners: Arc<ListenerSet>,
    ids: Arc<dyn IdGenerator>,
    acceptor: Acceptor,
    receivers: Arc<Mutex<Option<Receivers>>>,
    cancel: CancellationToken,
}

impl Controller {
    /// Create a controller that generates UUID correlation ids.
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_id_generator(config, Arc::new(UuidGenerator))
    }

    /// Create a controller with a custom correlation id source.
    pub fn with_id_generator(config: ControllerConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let registry = Arc::new(AgentRegistry::new());
        let cancel = CancellationToken::new();
        let (results_tx, results) = mpsc::channel(config.result_channel_capacity.max(1));
        let (disconnects_tx, disconnects) =
            mpsc::channel(config.disconnect_channel_capacity.max(1));

        let acceptor = Acceptor::new(
            Arc::clone(&registry),
            results_tx,
            disconnects_tx,
            config.handshake_max_frame_length,
            config.max_frame_length,
            cancel.clone(),
        );

        Self {
            config: Arc::new(config),
            registry,
            pending: Arc::new(PendingRequests::new()),
            listeners: Arc::new(ListenerSet::new()),
            ids,
            acceptor,
            receivers: Arc::new(Mutex::new(Some(Receivers {
                results,
                disconnects,
            }))),
            cancel,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Bind the agent listener on the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ControllerError> {
        let addr = self.config.listen_addr.clone();
        TcpListener::bind(&addr).await.map_err(|source| {
            tracing::error!(addr = %addr, error = %source, "error listening on socket");
            ControllerError::Bind { addr, source }
        })
    }

    /// Bind and serve until [`Controller::close`] is called.
    ///
    /// Only a bind failure is returned; every later error is logged and
    /// contained to its connection.
    pub async fn start(&self) -> Result<(), ControllerError> {
        tracing::info!("controller: starting");
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Serve agents on an already bound listener until closed.
    ///
    /// The first call also runs the result dispatcher and disconnect
    /// handler. If either stops while the controller is open, the controller
    /// is closed and a panic from that task is resumed here.
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "controller listening for agents");
        }
        let accept = run_accept_loop(listener, self.acceptor.clone(), self.cancel.clone());
        match self.spawn_dispatchers() {
            Some(dispatchers) => self.supervise(accept, dispatchers).await,
            None => accept.await,
        }
    }

    /// Start the result dispatcher and disconnect handler.
    ///
    /// Only the first call spawns anything; the receivers are moved into the
    /// tasks.
    fn spawn_dispatchers(&self) -> Option<Dispatchers> {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        let expiry = self.config.pending_ttl.map(|ttl| PendingExpiry {
            ttl,
            sweep_interval: self.config.pending_sweep_interval,
        });

        let results = tokio::spawn(run_result_dispatcher(
            receivers.results,
            Arc::clone(&self.listeners),
            Arc::clone(&self.pending),
            expiry,
            self.cancel.clone(),
        ));
        let disconnects = tokio::spawn(run_disconnect_handler(
            receivers.disconnects,
            Arc::clone(&self.registry),
            self.cancel.clone(),
        ));
        Some(Dispatchers {
            results,
            disconnects,
        })
    }

    /// Run the accept loop while watching the dispatcher tasks.
    async fn supervise(&self, accept: impl Future<Output = ()>, dispatchers: Dispatchers) {
        let Dispatchers {
            mut results,
            mut disconnects,
        } = dispatchers;
        tokio::pin!(accept);

        let (task, outcome) = tokio::select! {
            () = &mut accept => return,
            outcome = &mut results => ("result dispatcher", outcome),
            outcome = &mut disconnects => ("disconnect handler", outcome),
        };

        if !self.is_closed() {
            tracing::error!(
                task,
                "controller task stopped unexpectedly, closing"
            );
            self.close();
        }
        accept.await;

        if let Err(e) = outcome {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }
    }

    /// Stop every task this controller started and close all sessions.
    pub fn close(&self) {
        tracing::info!("controller: closing");
        self.cancel.cancel();
        self.registry.close_all();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Register a handler that sees every result, in registration order.
    pub fn add_result_listener<F>(&self, listener: F)
    where
        F: Fn(&AgentProbeResult) + Send + Sync + 'static,
    {
        let listener: ResultListener = Arc::new(listener);
        self.listeners.add(listener);
    }

    /// Send a latency probe to `agent_id` and return its correlation id.
    ///
    /// An empty `result_id` is replaced with a fresh one. Delivery failures
    /// are logged, not returned: the id comes back either way, so a returned
    /// id does not imply the probe reached the agent.
    pub async fn send(&self, agent_id: &str, mut request: LatencyRequest) -> String {
        self.ensure_result_id(&mut request);
        let result_id = request.result_id.clone();
        if let Err(e) = self.dispatch(agent_id, request).await {
            tracing::error!(
                agent_id = %agent_id,
                result_id = %result_id,
                error = %e,
                "send probe failed"
            );
        }
        result_id
    }

    /// Like [`Controller::send`], but report whether the probe was written.
    pub async fn try_send(
        &self,
        agent_id: &str,
        mut request: LatencyRequest,
    ) -> Result<String, ControllerError> {
        self.ensure_result_id(&mut request);
        let result_id = request.result_id.clone();
        self.dispatch(agent_id, request).await?;
        Ok(result_id)
    }

    /// Send a probe and call `handler` once with its result.
    ///
    /// A fresh id always replaces the caller's. If the agent is absent the
    /// handler stays registered until it expires (see
    /// [`ControllerConfig::pending_ttl`]) or forever when no TTL is set.
    pub async fn send_with_callback<F>(
        &self,
        agent_id: &str,
        mut request: LatencyRequest,
        handler: F,
    ) -> String
    where
        F: FnOnce(AgentProbeResult) + Send + 'static,
    {
        let result_id = self.ids.generate();
        self.pending
            .register_callback(result_id.clone(), Box::new(handler));
        request.result_id = result_id;
        self.send(agent_id, request).await
    }

    /// Send a probe and wait up to `timeout` for its result.
    ///
    /// The pending entry is removed on every failure path.
    pub async fn probe(
        &self,
        agent_id: &str,
        mut request: LatencyRequest,
        timeout: Duration,
    ) -> Result<AgentProbeResult, ControllerError> {
        let result_id = self.ids.generate();
        let reply = self.pending.register_reply(result_id.clone());
        request.result_id = result_id.clone();

        if let Err(e) = self.dispatch(agent_id, request).await {
            self.pending.cancel(&result_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ControllerError::Expired(result_id)),
            Err(_) => {
                self.pending.cancel(&result_id);
                tracing::warn!(
                    agent_id = %agent_id,
                    result_id = %result_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "probe timed out"
                );
                Err(ControllerError::Timeout {
                    agent_id: agent_id.to_string(),
                    result_id,
                })
            }
        }
    }

    fn ensure_result_id(&self, request: &mut LatencyRequest) {
        if request.result_id.is_empty() {
            request.result_id = self.ids.generate();
        }
    }

    /// Look the agent up and write the command. The registry lock is
    /// released before any I/O.
    async fn dispatch(
        &self,
        agent_id: &str,
        request: LatencyRequest,
    ) -> Result<(), ControllerError> {
        let session = self
            .registry
            .get(agent_id)
            .ok_or_else(|| ControllerError::UnknownAgent(agent_id.to_string()))?;

        let command = ControllerCommand::LatencyRequest {
            latency_request: request,
        };
        session.send_command(&command).await?;
        Ok(())
    }

    /// Snapshot of the connected agents, sorted by identity.
    pub fn agents(&self) -> Vec<AgentSummary> {
        self.registry.list()
    }

    pub fn agent_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.registry.contains(agent_id)
    }

    /// Connection id of the session currently registered for `agent_id`.
    pub fn connection_id(&self, agent_id: &str) -> Option<u64> {
        self.registry.get(agent_id).map(|s| s.connection_id())
    }

    /// Number of requests still waiting for a result.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, result_id: &str) -> bool {
        self.pending.contains(result_id)
    }

    /// Controller version as `(major, minor, patch)`.
    pub fn version(&self) -> (u32, u32, u32) {
        version()
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("listen_addr", &self.config.listen_addr)
            .field("registry", &self.registry)
            .field("pending", &self.pending)
            .field("listeners", &self.listeners)
            .finish()
    }
}

/// Crate version as `(major, minor, patch)`.
pub fn version() -> (u32, u32, u32) {
    (
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    )
}
