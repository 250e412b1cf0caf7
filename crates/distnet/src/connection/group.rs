//! Reliable in-process multicast groups.
//!
//! A group is a named broadcast domain held in a process-global registry.
//! Every `send` is delivered exactly once, in per-sender order, to every
//! other current member. The group name travels with the connection as the
//! stable multicast identifier, so receivers can deduplicate data that also
//! arrives over a unicast path.
//!
//! This transport carries whole packets per send call; interleaving between
//! senders happens at packet granularity, never inside one.

use super::{Connection, ConnectionDescription, ConnectionRef, ConnectionState, StateCell};
use crate::error::{NetError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::debug;

struct GroupState {
    members: HashMap<u64, mpsc::UnboundedSender<Bytes>>,
    next_member: u64,
}

static GROUPS: OnceLock<Mutex<HashMap<String, GroupState>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, GroupState>> {
    GROUPS.get_or_init(|| Mutex::new(HashMap::new()))
}

struct Reader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

/// Membership in a reliable multicast group.
pub struct GroupConnection {
    description: ConnectionDescription,
    member_id: u64,
    reader: tokio::sync::Mutex<Reader>,
    state: StateCell,
}

impl GroupConnection {
    /// Join the named group, creating it on first use.
    pub fn join(group: &str) -> Result<ConnectionRef> {
        let (tx, rx) = mpsc::unbounded_channel();
        let member_id = {
            let mut groups = registry().lock();
            let state = groups.entry(group.to_string()).or_insert_with(|| GroupState {
                members: HashMap::new(),
                next_member: 0,
            });
            let id = state.next_member;
            state.next_member += 1;
            state.members.insert(id, tx);
            id
        };
        debug!("joined multicast group {group} as member {member_id}");

        Ok(Arc::new(GroupConnection {
            description: ConnectionDescription::group(group),
            member_id,
            reader: tokio::sync::Mutex::new(Reader { rx, pending: Bytes::new() }),
            state: StateCell::new(ConnectionState::Connected),
        }))
    }

    fn group(&self) -> &str {
        &self.description.hostname
    }

    fn leave(&self) {
        let mut groups = registry().lock();
        if let Some(state) = groups.get_mut(self.group()) {
            state.members.remove(&self.member_id);
            if state.members.is_empty() {
                groups.remove(self.group());
            }
        }
    }
}

#[async_trait]
impl Connection for GroupConnection {
    fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn multicast_group(&self) -> Option<&str> {
        Some(self.group())
    }

    async fn send(&self, buf: &[u8]) -> Result<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(NetError::ConnectionClosed);
        }
        let peers: Vec<mpsc::UnboundedSender<Bytes>> = {
            let groups = registry().lock();
            let state = groups
                .get(self.group())
                .ok_or_else(|| NetError::UnknownGroup(self.group().to_string()))?;
            state
                .members
                .iter()
                .filter(|(id, _)| **id != self.member_id)
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        let payload = Bytes::copy_from_slice(buf);
        for tx in peers {
            // A departed member's channel just drops the message.
            tx.send(payload.clone()).ok();
        }
        Ok(())
    }

    async fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let mut filled = 0;
        while filled < buf.len() {
            if reader.pending.is_empty() {
                reader.pending = match reader.rx.recv().await {
                    Some(bytes) => bytes,
                    None => {
                        self.state.set(ConnectionState::Closed);
                        return Err(NetError::ConnectionClosed);
                    }
                };
            }
            let n = (buf.len() - filled).min(reader.pending.len());
            buf[filled..filled + n].copy_from_slice(&reader.pending[..n]);
            reader.pending = reader.pending.slice(n..);
            filled += n;
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.set(ConnectionState::Closed);
        self.leave();
        // Unblock a pending recv.
        self.reader.lock().await.rx.close();
    }
}

impl Drop for GroupConnection {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let a = GroupConnection::join("test-group-a").unwrap();
        let b = GroupConnection::join("test-group-a").unwrap();
        let c = GroupConnection::join("test-group-a").unwrap();

        a.send(b"data").await.unwrap();

        let mut buf = [0u8; 4];
        b.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
        c.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");

        // The sender must not see its own broadcast: send from b, only a and
        // c receive; a's first message is b's.
        b.send(b"next").await.unwrap();
        a.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"next");
    }

    #[tokio::test]
    async fn test_per_sender_order() {
        let a = GroupConnection::join("test-group-b").unwrap();
        let b = GroupConnection::join("test-group-b").unwrap();

        for i in 0u8..10 {
            a.send(&[i]).await.unwrap();
        }
        for i in 0u8..10 {
            let mut buf = [0u8; 1];
            b.recv_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], i);
        }
    }

    #[tokio::test]
    async fn test_group_identifier() {
        let a = GroupConnection::join("test-group-c").unwrap();
        assert_eq!(a.multicast_group(), Some("test-group-c"));
    }
}
