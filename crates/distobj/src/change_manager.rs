//! Change managers: the per-object replication policy machine.
//!
//! The policy set is closed and known at attach time, so the managers are a
//! tagged enum with exhaustive matching rather than an open class
//! hierarchy: one master state, one slave state, each switching on the
//! [`ChangeType`] where the policies diverge.
//!
//! Masters mint versions and keep whatever history their policy requires;
//! slaves queue received versions and apply them strictly in order.

use crate::error::{Error, Result};
use crate::instance_cache::CachedInstance;
use crate::node::NodeRef;
use crate::object::{ChangeType, ObjectData, COMMIT_NEXT};
use crate::object_data::ObjectDataIStream;
use crate::packets::{MapObjectPacket, MapObjectReplyPacket, MapObjectSuccessPacket, ObjectAddress, ObjectDataPacket};
use bytes::Bytes;
use distnet::{DataOStream, InstanceId, NodeId, Version};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

pub(crate) enum ChangeManager {
    Detached,
    Master(MasterCm),
    Slave(SlaveCm),
}

/// One subscribed slave instance.
#[derive(Clone)]
pub(crate) struct SlaveEntry {
    pub node: NodeRef,
    pub instance_id: InstanceId,
    /// Advertised queue bound, absolute against the version sequence.
    /// Recorded for diagnostics; commits do not block on it.
    #[allow(dead_code)]
    pub max_versions: u64,
}

struct InstanceEntry {
    version: Version,
    commit_count: u64,
    data: Bytes,
}

/// What a commit produced.
pub(crate) enum CommitOutcome {
    /// Nothing was dirty or nothing was written; no new version.
    Unchanged(Version),
    /// Unbuffered commit without subscribers is a no-op.
    NoSubscribers,
    /// A new version to broadcast to the subscriber set.
    Broadcast {
        version: Version,
        payload: Bytes,
        delta: bool,
        subscribers: Vec<SlaveEntry>,
    },
}

/// The master's answer to a map request: packets to send, in order
/// success, data streams, reply.
pub(crate) struct InitSlave {
    pub success: MapObjectSuccessPacket,
    pub reply: MapObjectReplyPacket,
    pub streams: Vec<(Version, Bytes)>,
}

pub(crate) struct MasterCm {
    change_type: ChangeType,
    version: Version,
    commit_count: u64,
    n_versions: u32,
    /// Full instance history, oldest first, head last. Bounded by the
    /// policy: one entry for Instance, `n_versions`-driven for Full and
    /// Delta, empty for Unbuffered and None.
    instances: VecDeque<InstanceEntry>,
    slaves: Vec<SlaveEntry>,
}

impl MasterCm {
    pub fn new(change_type: ChangeType, initial: Option<Bytes>) -> Self {
        let version = if change_type == ChangeType::None { Version::NONE } else { Version::FIRST };
        let mut instances = VecDeque::new();
        if let Some(data) = initial {
            instances.push_back(InstanceEntry { version, commit_count: 0, data });
        }
        MasterCm {
            change_type,
            version,
            commit_count: 0,
            n_versions: 0,
            instances,
            slaves: Vec::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn auto_obsolete(&self) -> u32 {
        self.n_versions
    }

    pub fn set_auto_obsolete(&mut self, count: u32) {
        self.n_versions = count;
    }

    /// The oldest version still retrievable from this master.
    pub fn oldest_version(&self) -> Version {
        self.instances.front().map(|e| e.version).unwrap_or(self.version)
    }

    pub fn commit(&mut self, data: &dyn ObjectData, incarnation: u32) -> Result<CommitOutcome> {
        match self.change_type {
            ChangeType::None | ChangeType::Static => {
                return Err(Error::state("commit on an unversioned object"));
            }
            _ => {}
        }
        if !data.is_dirty() {
            return Ok(CommitOutcome::Unchanged(self.version));
        }

        let delta = self.change_type == ChangeType::Delta;
        let payload = {
            let mut os = DataOStream::new();
            if delta {
                data.pack(&mut os);
            } else {
                data.get_instance_data(&mut os);
            }
            os.into_bytes()
        };
        if payload.is_empty() {
            // Nothing written, no new version.
            return Ok(CommitOutcome::Unchanged(self.version));
        }

        if self.change_type == ChangeType::Unbuffered && self.slaves.is_empty() {
            return Ok(CommitOutcome::NoSubscribers);
        }

        self.commit_count = if incarnation == COMMIT_NEXT {
            self.commit_count + 1
        } else {
            incarnation as u64
        };
        self.version = self.version.next();

        if self.change_type.is_buffered() {
            // Delta broadcasts the delta but buffers the full instance for
            // late mappers.
            let instance_data = if delta {
                let mut os = DataOStream::new();
                data.get_instance_data(&mut os);
                os.into_bytes()
            } else {
                payload.clone()
            };
            self.instances.push_back(InstanceEntry {
                version: self.version,
                commit_count: self.commit_count,
                data: instance_data,
            });
            self.obsolete();
        }

        trace!("committed v{} ({} bytes, {} subscribers)", self.version, payload.len(), self.slaves.len());
        Ok(CommitOutcome::Broadcast {
            version: self.version,
            payload,
            delta,
            subscribers: self.slaves.clone(),
        })
    }

    /// Drop versions older than the last `n_versions` commits, always
    /// keeping the head. Instance masters keep exactly the head.
    fn obsolete(&mut self) {
        let keep_history = matches!(self.change_type, ChangeType::Full | ChangeType::Delta);
        while self.instances.len() > 1 {
            let front = self.instances.front().expect("non-empty");
            let expired = !keep_history
                || front.commit_count + self.n_versions as u64 <= self.commit_count;
            if !expired {
                break;
            }
            trace!("obsoleting v{}", front.version);
            self.instances.pop_front();
        }
    }

    /// The head version with its serialized instance, serializing fresh
    /// when this policy buffers nothing.
    pub fn head_instance_data(&self, data: &dyn ObjectData) -> (Version, Bytes) {
        if let Some(back) = self.instances.back() {
            return (back.version, back.data.clone());
        }
        let mut os = DataOStream::new();
        data.get_instance_data(&mut os);
        (self.version, os.into_bytes())
    }

    /// Subscribe a slave and decide how to initialize it.
    pub fn add_slave(
        &mut self,
        packet: &MapObjectPacket,
        node: &NodeRef,
        data: &dyn ObjectData,
        _local_node_id: NodeId,
        address: ObjectAddress,
    ) -> InitSlave {
        let max_versions = match packet.max_versions {
            0 => u64::MAX,
            bound => bound.saturating_add(self.version.low),
        };
        self.slaves.push(SlaveEntry {
            node: node.clone(),
            instance_id: packet.instance_id,
            max_versions,
        });

        let success = MapObjectSuccessPacket {
            node_id: node.node_id(),
            request_id: packet.request_id,
            object_id: address.object_id,
            instance_id: packet.instance_id,
            change_type: self.change_type as u32,
            master_instance_id: address.instance_id,
        };
        let mut reply = MapObjectReplyPacket {
            node_id: node.node_id(),
            request_id: packet.request_id,
            object_id: address.object_id,
            version: self.version,
            result: true,
            use_cache: false,
            release_cache: packet.use_cache,
        };

        if packet.requested_version == Version::NONE {
            // No data wanted; an empty marker sets the version.
            return InitSlave { success, reply, streams: vec![(self.version, Bytes::new())] };
        }

        let oldest = self.oldest_version();
        let start = match packet.requested_version {
            Version::OLDEST => oldest,
            Version::HEAD | Version::NEXT => self.version,
            requested => requested.clamp(oldest, self.version),
        };

        // The slave's cache must cover everything from the start version to
        // the head for the master to skip the retransmission.
        if packet.use_cache
            && packet.master_instance_id == address.instance_id
            && packet.min_cached_version <= start
            && packet.max_cached_version >= self.version
        {
            debug!("map of {} v{start} served from the slave's cache", address.object_id);
            reply.use_cache = true;
            return InitSlave { success, reply, streams: Vec::new() };
        }

        let mut streams: Vec<(Version, Bytes)> = self
            .instances
            .iter()
            .filter(|e| e.version >= start)
            .map(|e| (e.version, e.data.clone()))
            .collect();
        if streams.is_empty() {
            // Nothing buffered (unbuffered policy, or history emptied):
            // serialize the current state.
            let mut os = DataOStream::new();
            data.get_instance_data(&mut os);
            streams.push((self.version, os.into_bytes()));
        }
        InitSlave { success, reply, streams }
    }

    pub fn remove_slave(&mut self, node_id: NodeId, instance_id: InstanceId) {
        let before = self.slaves.len();
        self.slaves
            .retain(|s| !(s.node.node_id() == node_id && s.instance_id == instance_id));
        if self.slaves.len() == before {
            warn!("unsubscribe from unknown slave {node_id}.{instance_id}");
        }
    }

    pub fn remove_slaves(&mut self, node_id: NodeId) -> bool {
        let before = self.slaves.len();
        self.slaves.retain(|s| s.node.node_id() != node_id);
        self.slaves.len() != before
    }

    pub fn subscriber_nodes(&self) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = Vec::new();
        for slave in &self.slaves {
            if !nodes.iter().any(|n| n.node_id() == slave.node.node_id()) {
                nodes.push(slave.node.clone());
            }
        }
        nodes
    }

    #[cfg(test)]
    pub fn history_len(&self) -> usize {
        self.instances.len()
    }
}

/// How far a sync attempt got.
pub(crate) enum SyncProgress {
    Done(Version),
    /// Nothing applicable queued; wait for the receiver to queue more.
    Wait,
    /// A delta gap after the given version; the master must resend a full
    /// instance.
    Resend(Version),
}

pub(crate) struct SlaveCm {
    change_type: ChangeType,
    version: Version,
    master_instance_id: InstanceId,
    master: Option<NodeRef>,
    /// Versions still receiving chunks.
    partial: HashMap<Version, ObjectDataIStream>,
    /// Complete versions pending application, ascending.
    queue: VecDeque<ObjectDataIStream>,
    /// One resend per gap; reset when data applies again.
    resend_pending: bool,
}

impl SlaveCm {
    pub fn new(change_type: ChangeType, master_instance_id: InstanceId) -> Self {
        SlaveCm {
            change_type,
            version: Version::NONE,
            master_instance_id,
            master: None,
            partial: HashMap::new(),
            queue: VecDeque::new(),
            resend_pending: false,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn head_version(&self) -> Version {
        self.queue.back().map(|s| s.version()).unwrap_or(self.version)
    }

    pub fn master_instance_id(&self) -> InstanceId {
        self.master_instance_id
    }

    pub fn master_node(&self) -> Option<NodeRef> {
        self.master.clone()
    }

    pub fn set_master_node(&mut self, node: NodeRef) {
        self.master = Some(node);
    }

    /// Queue one received chunk. Duplicates from multicast echo are dropped
    /// by version equality. Returns the version when it became complete.
    pub fn queue_chunk(
        &mut self,
        packet: &ObjectDataPacket,
        delta: bool,
        big_endian: bool,
    ) -> Option<Version> {
        let version = packet.version;
        if version <= self.version && self.version != Version::NONE {
            trace!("dropping stale data for v{version}");
            return None;
        }
        if self.queue.iter().any(|s| s.version() == version) {
            trace!("dropping duplicate data for v{version}");
            return None;
        }

        let stream = self
            .partial
            .entry(version)
            .or_insert_with(|| ObjectDataIStream::new(version, delta, big_endian));
        if let Err(e) = stream.add_chunk(packet) {
            warn!("discarding corrupt data stream for v{version}: {e}");
            self.partial.remove(&version);
            return None;
        }
        if !stream.is_ready() {
            return None;
        }

        let stream = self.partial.remove(&version).expect("just inserted");
        let at = self.queue.iter().position(|s| s.version() > version).unwrap_or(self.queue.len());
        self.queue.insert(at, stream);
        Some(version)
    }

    /// Queue cache-replayed full instances up to the authorized version.
    pub fn add_cached(&mut self, versions: &[CachedInstance], big_endian: bool, up_to: Version) {
        for cached in versions {
            if cached.version <= self.version && self.version != Version::NONE {
                continue;
            }
            if cached.version > up_to {
                break;
            }
            if self.queue.iter().any(|s| s.version() == cached.version) {
                continue;
            }
            let stream =
                ObjectDataIStream::from_bytes(cached.version, big_endian, cached.data.clone());
            let at = self
                .queue
                .iter()
                .position(|s| s.version() > cached.version)
                .unwrap_or(self.queue.len());
            self.queue.insert(at, stream);
        }
    }

    /// Apply queued versions towards `target` under the object locks.
    /// Never blocks; the caller waits and retries on [`SyncProgress::Wait`].
    pub fn try_sync(
        &mut self,
        data: &mut dyn ObjectData,
        target: Version,
    ) -> Result<SyncProgress> {
        if self.change_type == ChangeType::None {
            return Err(Error::state("sync on an unversioned object"));
        }

        let concrete = match target {
            Version::HEAD | Version::NEXT => None,
            version => Some(version),
        };

        // Full instances supersede each other: skip straight to the newest
        // applicable one instead of applying every intermediate.
        if matches!(self.change_type, ChangeType::Instance | ChangeType::Unbuffered) {
            while self.queue.len() > 1 {
                let second_applicable = concrete
                    .map(|t| self.queue[1].version() <= t)
                    .unwrap_or(true);
                if second_applicable && target != Version::NEXT {
                    self.queue.pop_front();
                } else {
                    break;
                }
            }
        }

        let mut applied_any = false;
        loop {
            // Drop anything stale.
            while self
                .queue
                .front()
                .map(|s| s.version() <= self.version && self.version != Version::NONE)
                .unwrap_or(false)
            {
                self.queue.pop_front();
            }

            if let Some(t) = concrete {
                if self.version >= t && self.version != Version::NONE {
                    break;
                }
            }

            let Some(front) = self.queue.front() else {
                return match target {
                    Version::HEAD => Ok(SyncProgress::Done(self.version)),
                    _ if applied_any && target == Version::NEXT => {
                        Ok(SyncProgress::Done(self.version))
                    }
                    _ => Ok(SyncProgress::Wait),
                };
            };

            let version = front.version();
            if let Some(t) = concrete {
                if version > t {
                    // Everything up to the target has been applied or was
                    // never produced; syncing beyond it is not this call's
                    // business.
                    break;
                }
            }

            if front.is_delta() {
                let expected =
                    if self.version == Version::NONE { Version::FIRST } else { self.version.next() };
                if version != expected {
                    if self.resend_pending {
                        return Ok(SyncProgress::Wait);
                    }
                    self.resend_pending = true;
                    debug!("delta gap: have v{}, next queued v{version}", self.version);
                    return Ok(SyncProgress::Resend(self.version));
                }
            }

            let stream = self.queue.pop_front().expect("front exists");
            if stream.len() == 0 {
                // Empty version marker: advances the version without data.
            } else {
                let mut is = stream.istream();
                if stream.is_delta() {
                    data.unpack(&mut is)?;
                } else {
                    data.apply_instance_data(&mut is)?;
                }
            }
            self.version = stream.version();
            self.resend_pending = false;
            applied_any = true;
            trace!("applied v{}", self.version);

            if target == Version::NEXT {
                break;
            }
            if self.change_type == ChangeType::Static {
                break;
            }
        }
        Ok(SyncProgress::Done(self.version))
    }
}
