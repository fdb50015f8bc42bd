//! Pending requests: the `result_id` → one-shot handler map.
//!
//! Each entry is delivered at most once. The result dispatcher takes the
//! entry out of the map under the lock and delivers it after the lock is
//! released, so a duplicate result finds nothing and a handler may safely
//! issue new probes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::AgentProbeResult;

/// One-shot handler invoked with the result matching its `result_id`.
pub type ResultCallback = Box<dyn FnOnce(AgentProbeResult) + Send>;

/// What to do with the result for one `result_id`.
pub enum PendingEntry {
    /// Call a handler registered through `send_with_callback`.
    Callback(ResultCallback),
    /// Complete a future returned by `probe`.
    Reply(oneshot::Sender<AgentProbeResult>),
}

impl PendingEntry {
    /// Hand the result to whoever is waiting for it.
    pub fn deliver(self, result: AgentProbeResult) {
        match self {
            PendingEntry::Callback(callback) => callback(result),
            PendingEntry::Reply(reply) => {
                // The waiter may have timed out and gone away.
                let _ = reply.send(result);
            }
        }
    }
}

impl std::fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingEntry::Callback(_) => f.write_str("Callback"),
            PendingEntry::Reply(_) => f.write_str("Reply"),
        }
    }
}

struct Pending {
    entry: PendingEntry,
    registered_at: Instant,
}

/// The callback registry, guarded by its own lock.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, Pending>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, result_id: String, entry: PendingEntry) {
        let pending = Pending {
            entry,
            registered_at: Instant::now(),
        };
        if self.entries().insert(result_id.clone(), pending).is_some() {
            tracing::warn!(result_id = %result_id, "replaced an existing pending request");
        }
    }

    /// Register a callback for `result_id`.
    pub fn register_callback(&self, result_id: impl Into<String>, callback: ResultCallback) {
        self.insert(result_id.into(), PendingEntry::Callback(callback));
    }

    /// Register a reply channel for `result_id` and return its receiving end.
    pub fn register_reply(
        &self,
        result_id: impl Into<String>,
    ) -> oneshot::Receiver<AgentProbeResult> {
        let (tx, rx) = oneshot::channel();
        self.insert(result_id.into(), PendingEntry::Reply(tx));
        rx
    }

    /// Remove and return the entry for `result_id`, if any.
    pub fn take(&self, result_id: &str) -> Option<PendingEntry> {
        self.entries().remove(result_id).map(|p| p.entry)
    }

    /// Drop the entry for `result_id` without delivering anything.
    pub fn cancel(&self, result_id: &str) -> bool {
        self.entries().remove(result_id).is_some()
    }

    /// Drop every entry registered more than `ttl` ago and return their ids.
    pub fn expire_older_than(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.entries().retain(|result_id, pending| {
            let keep = now.duration_since(pending.registered_at) < ttl;
            if !keep {
                expired.push(result_id.clone());
            }
            keep
        });
        expired
    }

    pub fn contains(&self, result_id: &str) -> bool {
        self.entries().contains_key(result_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result(id: &str) -> AgentProbeResult {
        AgentProbeResult {
            result_id: id.to_string(),
            agent_id: "a1".to_string(),
            datapoints: vec![],
            error: None,
        }
    }

    #[test]
    fn take_removes_the_entry() {
        let pending = PendingRequests::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        pending.register_callback(
            "r1",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(pending.contains("r1"));

        pending.take("r1").unwrap().deliver(result("r1"));
        assert!(pending.take("r1").is_none(), "second take finds nothing");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn reply_entry_completes_the_receiver() {
        let pending = PendingRequests::new();
        let rx = pending.register_reply("r2");

        pending.take("r2").unwrap().deliver(result("r2"));
        assert_eq!(rx.await.unwrap().result_id, "r2");
    }

    #[test]
    fn reply_to_dropped_receiver_is_ignored() {
        let pending = PendingRequests::new();
        drop(pending.register_reply("r3"));
        pending.take("r3").unwrap().deliver(result("r3"));
    }

    #[test]
    fn cancel_drops_without_delivering() {
        let pending = PendingRequests::new();
        pending.register_callback("r4", Box::new(|_| panic!("must not be called")));
        assert!(pending.cancel("r4"));
        assert!(!pending.cancel("r4"));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_older_than_keeps_fresh_entries() {
        let pending = PendingRequests::new();
        pending.register_callback("old", Box::new(|_| {}));
        tokio::time::advance(Duration::from_secs(10)).await;
        pending.register_callback("new", Box::new(|_| {}));

        let expired = pending.expire_older_than(Duration::from_secs(5));
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(pending.contains("new"));
        assert!(!pending.contains("old"));
    }

    #[test]
    fn debug_shows_entry_kind() {
        let (tx, _rx) = oneshot::channel();
        assert_eq!(format!("{:?}", PendingEntry::Reply(tx)), "Reply");
        assert_eq!(
            format!("{:?}", PendingEntry::Callback(Box::new(|_| {}))),
            "Callback"
        );
    }
}
