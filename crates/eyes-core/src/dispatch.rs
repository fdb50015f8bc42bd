//! The two long-lived consumer loops: the result dispatcher and the
//! disconnect handler.
//!
//! Each is the sole reader of its channel. Neither isolates handler panics:
//! a faulting listener or callback ends its task, and
//! [`Controller::serve`](crate::Controller::serve) closes the controller and
//! resumes the panic.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pending::PendingRequests;
use crate::protocol::AgentProbeResult;
use crate::registry::AgentRegistry;
use crate::session::Disconnect;

/// Broadcast handler invoked for every result.
pub type ResultListener = Arc<dyn Fn(&AgentProbeResult) + Send + Sync>;

/// Append-only, ordered set of result listeners.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<ResultListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: ResultListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Clone the current listeners so they can be called without the lock.
    fn snapshot(&self) -> Vec<ResultListener> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

/// Expiry policy for unanswered pending requests.
#[derive(Debug, Clone, Copy)]
pub struct PendingExpiry {
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

/// Deliver one result: listeners first, in registration order, then the
/// matching pending entry if one is still registered.
pub fn dispatch_result(
    result: AgentProbeResult,
    listeners: &ListenerSet,
    pending: &PendingRequests,
) {
    for listener in listeners.snapshot() {
        listener(&result);
    }

    match pending.take(&result.result_id) {
        Some(entry) => {
            tracing::debug!(
                result_id = %result.result_id,
                agent_id = %result.agent_id,
                "delivering result to pending request"
            );
            entry.deliver(result);
        }
        None => {
            tracing::trace!(result_id = %result.result_id, "no pending request for result");
        }
    }
}

/// Consume the result channel until it closes or `cancel` fires.
///
/// With `expiry` set, pending requests older than the TTL are purged on
/// every sweep tick.
pub async fn run_result_dispatcher(
    mut results: mpsc::Receiver<AgentProbeResult>,
    listeners: Arc<ListenerSet>,
    pending: Arc<PendingRequests>,
    expiry: Option<PendingExpiry>,
    cancel: CancellationToken,
) {
    tracing::info!("result dispatcher: starting");

    let sweep_every = expiry
        .map(|e| e.sweep_interval)
        .unwrap_or(Duration::from_secs(3600))
        .max(Duration::from_millis(10));
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = results.recv() => match next {
                Some(result) => dispatch_result(result, &listeners, &pending),
                None => break,
            },
            _ = sweep.tick(), if expiry.is_some() => {
                if let Some(policy) = expiry {
                    for result_id in pending.expire_older_than(policy.ttl) {
                        tracing::warn!(
                            result_id = %result_id,
                            ttl_ms = policy.ttl.as_millis() as u64,
                            "pending request expired without a result"
                        );
                    }
                }
            }
        }
    }

    tracing::info!("result dispatcher: stopped");
}

/// Consume the disconnect channel until it closes or `cancel` fires.
///
/// A signal only removes the registry entry that belongs to the same
/// connection; stale or duplicate signals are ignored.
pub async fn run_disconnect_handler(
    mut disconnects: mpsc::Receiver<Disconnect>,
    registry: Arc<AgentRegistry>,
    cancel: CancellationToken,
) {
    tracing::info!("disconnect handler: starting");

    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            next = disconnects.recv() => match next {
                Some(signal) => signal,
                None => break,
            },
        };

        if registry.remove_connection(&signal.agent_id, signal.connection_id) {
            tracing::info!(
                agent_id = %signal.agent_id,
                connection_id = signal.connection_id,
                "agent disconnected"
            );
        } else {
            tracing::debug!(
                agent_id = %signal.agent_id,
                connection_id = signal.connection_id,
                "ignoring disconnect for absent or superseded session"
            );
        }
    }

    tracing::info!("disconnect handler: stopped");
}
