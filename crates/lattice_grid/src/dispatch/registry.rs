//! Tracking of outstanding remote invocations.
//!
//! Every remote dispatch registers a call under a locally generated id; an
//! inbound response (or a peer disconnect) completes it. Late or duplicate
//! responses are dropped, never treated as fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use super::error::OpError;
use super::types::{NodeId, OpResult};

/// One outstanding remote invocation awaiting its response.
struct Call {
    target: NodeId,
    slot: oneshot::Sender<OpResult>,
}

/// Process-wide table of in-flight calls keyed by locally generated ids.
///
/// Ids are monotonically increasing and unique to this node; 0 is reserved
/// to mean "no call" on fire-and-forget frames.
pub struct CallRegistry {
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, Call>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh id and insert a pending call for `target`.
    pub fn register(&self, target: NodeId) -> (u64, oneshot::Receiver<OpResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls
            .lock()
            .unwrap()
            .insert(id, Call { target, slot: tx });
        (id, rx)
    }

    /// Remove a pending call without completing it.
    pub fn deregister(&self, call_id: u64) -> bool {
        self.calls.lock().unwrap().remove(&call_id).is_some()
    }

    /// Complete the call registered under `call_id`. Unknown ids are late or
    /// duplicate responses and are dropped.
    pub fn notify(&self, call_id: u64, result: OpResult) {
        let call = self.calls.lock().unwrap().remove(&call_id);
        match call {
            Some(call) => {
                // The receiver may have given up (invocation timeout).
                let _ = call.slot.send(result);
            }
            None => {
                debug!(call_id, "dropping response for unknown call id");
            }
        }
    }

    /// Fail every pending call targeting `node` so no invocation waits
    /// forever past a peer departure.
    pub fn on_disconnect(&self, node: NodeId) {
        let failed: Vec<Call> = {
            let mut calls = self.calls.lock().unwrap();
            let ids: Vec<u64> = calls
                .iter()
                .filter(|(_, call)| call.target == node)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| calls.remove(&id)).collect()
        };
        if !failed.is_empty() {
            debug!(node, count = failed.len(), "failing calls for departed node");
        }
        for call in failed {
            let _ = call.slot.send(Err(OpError::NotAMember { target: node }));
        }
    }

    pub fn pending(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}
