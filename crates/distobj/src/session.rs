//! Sessions: named identifier-allocation scopes.
//!
//! A session is hosted by one node, its master. The master mints blocks
//! `[start, start + count)` out of the session's pool; clients forward
//! allocation requests over the wire. Object ownership is not scoped here;
//! it lives in the object store of the hosting node, keyed by object id
//! across all sessions.

use crate::commands::SessionCommand;
use crate::error::{Error, Result};
use crate::local_node::LocalNodeInner;
use crate::node::NodeRef;
use crate::packets::GenIdsPacket;
use crate::request::RequestValue;
use distnet::{SessionId, DATATYPE_SESSION};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Allocator for session-scoped 32-bit identifier blocks.
///
/// Identifier 0 is never handed out; it doubles as the wire-level failure
/// marker. Release is idempotent: only blocks recorded as allocated return
/// to the free list.
pub struct IdPool {
    next: u32,
    allocated: BTreeMap<u32, u32>,
    free: Vec<(u32, u32)>,
}

impl IdPool {
    pub fn new() -> Self {
        IdPool { next: 1, allocated: BTreeMap::new(), free: Vec::new() }
    }

    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        if count == 0 {
            return None;
        }
        if let Some(at) = self.free.iter().position(|(_, c)| *c >= count) {
            let (start, available) = self.free.swap_remove(at);
            if available > count {
                self.free.push((start + count, available - count));
            }
            self.allocated.insert(start, count);
            return Some(start);
        }
        let start = self.next;
        let end = start.checked_add(count)?;
        self.next = end;
        self.allocated.insert(start, count);
        Some(start)
    }

    pub fn release(&mut self, start: u32, count: u32) {
        match self.allocated.get(&start) {
            Some(&allocated) if allocated == count => {
                self.allocated.remove(&start);
                self.free.push((start, count));
            }
            // Unknown or mismatched block: releasing twice is a no-op.
            _ => {}
        }
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

struct SessionInner {
    id: SessionId,
    name: String,
    server: NodeRef,
    is_master: bool,
    local: Weak<LocalNodeInner>,
    pool: Mutex<IdPool>,
}

/// A named identifier-allocation scope; a thin facade over the hosting
/// node's pool.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new_master(
        id: SessionId,
        name: &str,
        server: NodeRef,
        local: Weak<LocalNodeInner>,
        pool: IdPool,
    ) -> Self {
        debug!("master session {id} ({name})");
        Session {
            inner: Arc::new(SessionInner {
                id,
                name: name.to_string(),
                server,
                is_master: true,
                local,
                pool: Mutex::new(pool),
            }),
        }
    }

    pub(crate) fn new_client(
        id: SessionId,
        name: &str,
        server: NodeRef,
        local: Weak<LocalNodeInner>,
    ) -> Self {
        debug!("client session {id} ({name}) served by {}", server.node_id());
        Session {
            inner: Arc::new(SessionInner {
                id,
                name: name.to_string(),
                server,
                is_master: false,
                local,
                pool: Mutex::new(IdPool::new()),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_master(&self) -> bool {
        self.inner.is_master
    }

    pub fn server_node(&self) -> NodeRef {
        self.inner.server.clone()
    }

    /// Allocate a block of `count` identifiers, minting locally on the
    /// master and forwarding to it from clients.
    pub async fn generate_ids(&self, count: u32) -> Result<u32> {
        if self.inner.is_master {
            return self
                .inner
                .pool
                .lock()
                .allocate(count)
                .ok_or_else(|| Error::Resource("session identifier space exhausted".into()));
        }

        let local = self
            .inner
            .local
            .upgrade()
            .ok_or_else(|| Error::state("local node is gone"))?;
        let pending = local.requests().register(None);
        let packet =
            GenIdsPacket { session_id: self.inner.id, request_id: pending.id, count };
        self.inner
            .server
            .send(DATATYPE_SESSION, SessionCommand::GenIds as u32, &packet.encode())
            .await?;
        match local.wait(pending).await? {
            RequestValue::U32(0) => {
                Err(Error::Resource("session master could not allocate identifiers".into()))
            }
            RequestValue::U32(start) => Ok(start),
            RequestValue::Failed => Err(Error::state("identifier request failed")),
            other => Err(Error::protocol(format!("unexpected GEN_IDS reply {other:?}"))),
        }
    }

    /// Return a block to the pool. Only meaningful on the master; releasing
    /// a block twice is a no-op.
    pub fn release_ids(&self, start: u32, count: u32) {
        if self.inner.is_master {
            self.inner.pool.lock().release(start, count);
        }
    }

    /// Master-side block allocation for remote GEN_IDS requests.
    pub(crate) fn allocate_block(&self, count: u32) -> Option<u32> {
        self.inner.pool.lock().allocate(count)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session({}, {:?}, {})",
            self.inner.id,
            self.inner.name,
            if self.inner.is_master { "master" } else { "client" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_allocates_disjoint_blocks() {
        let mut pool = IdPool::new();
        let a = pool.allocate(10).unwrap();
        let b = pool.allocate(5).unwrap();
        assert_ne!(a, b);
        assert!(b >= a + 10 || a >= b + 5);
        assert!(a > 0 && b > 0);
    }

    #[test]
    fn test_pool_reuses_released_blocks() {
        let mut pool = IdPool::new();
        let a = pool.allocate(8).unwrap();
        pool.release(a, 8);
        let b = pool.allocate(8).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = IdPool::new();
        let a = pool.allocate(4).unwrap();
        pool.release(a, 4);
        pool.release(a, 4);
        let b = pool.allocate(4).unwrap();
        let c = pool.allocate(4).unwrap();
        // The double release must not hand the same block out twice.
        assert_ne!(b, c);
    }

    #[test]
    fn test_zero_count_allocation_fails() {
        let mut pool = IdPool::new();
        assert!(pool.allocate(0).is_none());
    }
}
