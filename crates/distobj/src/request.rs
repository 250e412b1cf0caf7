//! Request/reply correlation.
//!
//! A caller registers a request, puts the returned ticket into an outgoing
//! packet, and waits; the receiver or command task serves the ticket when
//! the reply packet arrives. Tickets are 32-bit monotonic; the table never
//! carries pointers through the wire, only the ticket.

use crate::error::{Error, Result};
use crate::object::Object;
use distnet::{NodeId, RequestId, Version};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Value carried by a reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RequestValue {
    None,
    U32(u32),
    Version(Version),
    NodeId(NodeId),
    /// The operation failed on the remote side, or the node shut down
    /// while the request was pending.
    Failed,
}

struct Waiter {
    tx: oneshot::Sender<RequestValue>,
    data: Option<Object>,
}

/// A registered request: the wire ticket plus the local wait slot.
pub(crate) struct PendingRequest {
    pub id: RequestId,
    rx: oneshot::Receiver<RequestValue>,
}

#[derive(Default)]
pub(crate) struct RequestHandler {
    next: AtomicU32,
    waiters: Mutex<HashMap<RequestId, Waiter>>,
}

impl RequestHandler {
    pub fn new() -> Self {
        RequestHandler { next: AtomicU32::new(1), waiters: Mutex::new(HashMap::new()) }
    }

    /// Register a request, optionally attaching the object the reply
    /// handler will need.
    pub fn register(&self, data: Option<Object>) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().insert(id, Waiter { tx, data });
        PendingRequest { id, rx }
    }

    /// The user data attached at registration, without consuming the slot.
    pub fn data(&self, id: RequestId) -> Option<Object> {
        self.waiters.lock().get(&id).and_then(|w| w.data.clone())
    }

    /// Serve a pending request. Returns false for unknown tickets, which
    /// happens legitimately when a wait timed out before the reply landed.
    pub fn serve(&self, id: RequestId, value: RequestValue) -> bool {
        match self.waiters.lock().remove(&id) {
            Some(waiter) => waiter.tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop a pending request without serving it.
    pub fn unregister(&self, id: RequestId) {
        self.waiters.lock().remove(&id);
    }

    /// Wait for the reply. A timeout unregisters the ticket before
    /// returning, so a late `serve` finds nothing to write into.
    pub async fn wait(&self, pending: PendingRequest, timeout: Duration) -> Result<RequestValue> {
        match tokio::time::timeout(timeout, pending.rx).await {
            Ok(Ok(value)) => Ok(value),
            // Sender dropped: the handler was torn down.
            Ok(Err(_)) => Ok(RequestValue::Failed),
            Err(_) => {
                // Unregister before returning; a reply racing the timeout
                // finds no slot and reports the failed serve.
                self.waiters.lock().remove(&pending.id);
                Err(Error::Timeout)
            }
        }
    }

    /// Serve every pending request with failure; used at shutdown and when
    /// a peer vanishes.
    pub fn fail_all(&self) {
        let waiters: Vec<Waiter> = {
            let mut map = self.waiters.lock();
            map.drain().map(|(_, w)| w).collect()
        };
        for waiter in waiters {
            waiter.tx.send(RequestValue::Failed).ok();
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serve_wakes_waiter() {
        let handler = RequestHandler::new();
        let pending = handler.register(None);
        let id = pending.id;

        assert!(handler.serve(id, RequestValue::U32(99)));
        let value = handler.wait(pending, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, RequestValue::U32(99));
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_unregisters() {
        let handler = RequestHandler::new();
        let pending = handler.register(None);
        let id = pending.id;

        let result = handler.wait(pending, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(handler.pending_count(), 0);

        // A late reply must not find the slot.
        assert!(!handler.serve(id, RequestValue::None));
    }

    #[tokio::test]
    async fn test_exactly_one_resolution() {
        // For any ticket, exactly one of serve, timeout, or unregister
        // resolves it; a second resolution always reports failure.
        let handler = RequestHandler::new();

        let served = handler.register(None);
        let id = served.id;
        assert!(handler.serve(id, RequestValue::None));
        assert!(!handler.serve(id, RequestValue::None));

        let unregistered = handler.register(None);
        handler.unregister(unregistered.id);
        assert!(!handler.serve(unregistered.id, RequestValue::None));
        drop(served);
        drop(unregistered);
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let handler = RequestHandler::new();
        let a = handler.register(None);
        let b = handler.register(None);
        handler.fail_all();
        assert_eq!(handler.wait(a, Duration::from_secs(1)).await.unwrap(), RequestValue::Failed);
        assert_eq!(handler.wait(b, Duration::from_secs(1)).await.unwrap(), RequestValue::Failed);
    }

    #[tokio::test]
    async fn test_tickets_are_unique() {
        let handler = RequestHandler::new();
        let a = handler.register(None);
        let b = handler.register(None);
        assert_ne!(a.id, b.id);
    }
}
