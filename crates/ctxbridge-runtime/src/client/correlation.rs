//! Correlation registry: outstanding request id -> pending continuation.
//!
//! Ids are allocated from a monotonically increasing counter, so an id is
//! never handed out twice while the registry lives. An entry is removed when
//! its terminal envelope arrives, when the caller abandons it, or when the
//! connection is torn down, whichever comes first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use ctxbridge_core::error::{BridgeError, Result};

use crate::client::stream::ClientStream;

pub(crate) enum Pending {
    Call(oneshot::Sender<Result<Value>>),
    Stream(Arc<ClientStream>),
}

pub struct CorrelationRegistry {
    next_id: AtomicU64,
    pending: DashMap<u64, Pending>,
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate an id for a unary call and return its continuation.
    pub fn register_call(&self) -> (u64, oneshot::Receiver<Result<Value>>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending::Call(tx));
        (id, rx)
    }

    pub(crate) fn register_stream(&self, id: u64, stream: Arc<ClientStream>) {
        self.pending.insert(id, Pending::Stream(stream));
    }

    pub(crate) fn stream(&self, id: u64) -> Option<Arc<ClientStream>> {
        match self.pending.get(&id).as_deref() {
            Some(Pending::Stream(s)) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    /// Settle a call with its `result`/`error`. An `error` for a stream id
    /// (e.g. an unknown stream) terminates that stream instead.
    pub fn settle(&self, id: u64, outcome: Result<Value>) -> bool {
        match self.pending.remove(&id) {
            Some((_, Pending::Call(tx))) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = tx.send(outcome);
                true
            }
            Some((_, Pending::Stream(s))) => {
                let err = match outcome {
                    Err(e) => e,
                    Ok(_) => BridgeError::Protocol("result received for a stream".into()),
                };
                s.finish(Err(err));
                true
            }
            None => {
                tracing::debug!(id, "terminal envelope for unknown or evicted id ignored");
                false
            }
        }
    }

    /// Terminate a stream with its `stream-end` outcome.
    pub(crate) fn end_stream(&self, id: u64, outcome: Result<()>) -> bool {
        match self.pending.remove(&id) {
            Some((_, Pending::Stream(s))) => {
                s.finish(outcome);
                true
            }
            Some((id, other)) => {
                tracing::warn!(id, "stream-end for a unary call ignored");
                self.pending.insert(id, other);
                false
            }
            None => {
                tracing::debug!(id, "stream-end for unknown or evicted id ignored");
                false
            }
        }
    }

    /// Forget an entry without settling it (abandoned by the caller).
    pub fn evict(&self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Fail every outstanding entry with `err`. Returns how many there were.
    pub fn fail_all(&self, err: &BridgeError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            let Some((_, pending)) = self.pending.remove(&id) else { continue };
            match pending {
                Pending::Call(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
                Pending::Stream(s) => s.finish(Err(err.clone())),
            }
            failed += 1;
        }
        failed
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn results_reach_their_own_caller() {
        let reg = CorrelationRegistry::new();
        let mut calls: Vec<(u64, oneshot::Receiver<Result<Value>>)> =
            (0..1000).map(|_| reg.register_call()).collect();

        // Settle in reverse order; every receiver must see its own id.
        for (id, _) in calls.iter().rev() {
            assert!(reg.settle(*id, Ok(json!(id))));
        }
        for (id, rx) in calls.drain(..) {
            assert_eq!(rx.await.unwrap().unwrap(), json!(id));
        }
        assert_eq!(reg.outstanding(), 0);
    }

    #[tokio::test]
    async fn evicted_entries_ignore_late_results() {
        let reg = CorrelationRegistry::new();
        let (id, rx) = reg.register_call();
        assert!(reg.evict(id));
        assert!(!reg.settle(id, Ok(json!(1))));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn fail_all_rejects_everything() {
        let reg = CorrelationRegistry::new();
        let rxs: Vec<_> = (0..5).map(|_| reg.register_call().1).collect();
        assert_eq!(reg.fail_all(&BridgeError::Disconnected), 5);
        for rx in rxs {
            assert_eq!(rx.await.unwrap(), Err(BridgeError::Disconnected));
        }
    }

    #[test]
    fn ids_are_unique() {
        let reg = CorrelationRegistry::new();
        let a = reg.register_call().0;
        let b = reg.next_id();
        let c = reg.register_call().0;
        assert!(a < b && b < c);
    }
}
