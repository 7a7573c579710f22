//! Table of in-flight outbound requests.
//!
//! Ids come from a per-table counter that only moves forward, so an id is
//! never handed out twice while its call is unresolved. Each slot resolves
//! once: the first matching response wins and later duplicates are
//! reported back as unmatched.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{AcpError, Result};
use crate::transport::protocol::{RequestId, RpcError};

type Slot = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct State {
    next_id: u64,
    slots: HashMap<u64, Slot>,
    closed: bool,
}

/// Pending-call table for one connection.
#[derive(Default)]
pub struct PendingCalls {
    state: Mutex<State>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id and the future that resolves with its response.
    ///
    /// Fails with [`AcpError::ConnectionClosed`] once [`cancel_all`](Self::cancel_all)
    /// has run.
    pub fn register(&self) -> Result<(u64, PendingCall)> {
        let mut state = self.lock();
        if state.closed {
            return Err(AcpError::ConnectionClosed);
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.slots.insert(id, tx);
        Ok((id, PendingCall { rx }))
    }

    /// Deliver a response. Returns `false` if no call is waiting on `id`.
    pub fn resolve(&self, id: &RequestId, outcome: std::result::Result<Value, RpcError>) -> bool {
        let RequestId::Number(n) = id else {
            return false;
        };
        let Some(slot) = self.lock().slots.remove(n) else {
            return false;
        };
        // The caller may have stopped waiting; the slot is consumed either way.
        let _ = slot.send(outcome.map_err(AcpError::from_remote));
        true
    }

    /// Drop a slot whose request never made it onto the wire.
    pub fn forget(&self, id: u64) {
        self.lock().slots.remove(&id);
    }

    /// Reject every outstanding call with [`AcpError::ConnectionClosed`] and
    /// refuse new registrations. Returns how many calls were rejected.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let slots: Vec<Slot> = {
            let mut state = self.lock();
            state.closed = true;
            state.slots.drain().map(|(_, slot)| slot).collect()
        };
        let count = slots.len();
        for slot in slots {
            let _ = slot.send(Err(AcpError::ConnectionClosed));
        }
        debug!(count, reason, "Cancelled pending calls");
        count
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Future side of a registered call.
#[derive(Debug)]
pub struct PendingCall {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(AcpError::ConnectionClosed)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use serde_json::json;

    #[test]
    fn ids_increase_and_are_never_reused() {
        let table = PendingCalls::new();
        let (a, _fa) = table.register().unwrap();
        let (b, _fb) = table.register().unwrap();
        assert!(b > a);

        assert!(table.resolve(&RequestId::Number(a), Ok(Value::Null)));
        let (c, _fc) = table.register().unwrap();
        assert!(c > b, "resolved id {a} must not be recycled");
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let table = PendingCalls::new();
        let (id, call) = table.register().unwrap();

        assert!(table.resolve(&RequestId::Number(id), Ok(json!({"ok": true}))));
        assert!(!table.resolve(&RequestId::Number(id), Ok(json!({"ok": false}))));
        assert_eq!(call.await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn error_outcome_is_typed() {
        let table = PendingCalls::new();
        let (id, call) = table.register().unwrap();
        table.resolve(&RequestId::Number(id), Err(RpcError::method_not_found("x/y")));
        assert!(matches!(call.await, Err(AcpError::MethodNotFound(_))));
    }

    #[test]
    fn unknown_ids_are_unmatched() {
        let table = PendingCalls::new();
        assert!(!table.resolve(&RequestId::Number(42), Ok(Value::Null)));
        assert!(!table.resolve(&RequestId::Str("0".into()), Ok(Value::Null)));
    }

    #[tokio::test]
    async fn cancel_all_rejects_every_pending_call() {
        let table = PendingCalls::new();
        let calls: Vec<_> = (0..5).map(|_| table.register().unwrap().1).collect();

        assert_eq!(table.cancel_all("test"), 5);
        assert!(table.is_empty());
        for call in calls {
            assert!(matches!(call.await, Err(AcpError::ConnectionClosed)));
        }
        assert!(matches!(table.register(), Err(AcpError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn forgotten_call_reports_closed() {
        let table = PendingCalls::new();
        let (id, call) = table.register().unwrap();
        table.forget(id);
        assert!(matches!(call.await, Err(AcpError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn concurrent_registration_yields_distinct_ids() {
        let table = Arc::new(PendingCalls::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..50 {
                    let (id, call) = table.register().unwrap();
                    ids.push(id);
                    assert!(table.resolve(&RequestId::Number(id), Ok(json!(id))));
                    assert_eq!(call.await.unwrap(), json!(id));
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "id {id} issued twice");
            }
        }
        assert_eq!(seen.len(), 16 * 50);
    }
}
