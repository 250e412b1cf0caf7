//! Per-node object registry and the object half of the command protocol.
//!
//! The store owns the attach table (mutated only on the receiver task), the
//! instance cache, the send-on-register queue (owned by the command task),
//! and the push-data accumulator. Map, unmap, register and deregister are
//! driven from here; versioned data routing for the four
//! `OBJECT_INSTANCE_*` carriers also lands here.

use crate::change_manager::{CommitOutcome, InitSlave};
use crate::command::Command;
use crate::commands::{NodeCommand, ObjectCommand, OBJECT_COMMAND_CUSTOM};
use crate::config::Config;
use crate::error::{fatal, Error, Result};
use crate::instance_cache::InstanceCache;
use crate::local_node::LocalNodeInner;
use crate::node::NodeRef;
use crate::object::{ChangeType, Object};
use crate::object_data::{chunk_payload, ObjectDataIStream};
use crate::packets::*;
use crate::request::RequestValue;
use bytes::Bytes;
use distnet::{
    Connection, InstanceId, NodeId, ObjectId, Version, DATATYPE_NODE, DATATYPE_OBJECT,
    INSTANCE_INVALID, INSTANCE_MAX, INSTANCE_NONE, REQUEST_INVALID,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace, warn};

struct SendQueueItem {
    object_id: ObjectId,
    /// Advisory age limit; expired entries are dropped unsent.
    deadline: Option<Instant>,
}

/// Counters mirroring what the protocol does not make directly observable.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub instance_packets_received: AtomicU64,
    /// Master-side: map requests answered out of the slave's cache.
    pub maps_cache_authorized: AtomicU64,
    /// Slave-side: maps initialized from the local cache.
    pub maps_from_cache: AtomicU64,
    pub commit_unicast_sends: AtomicU64,
    pub commit_multicast_sends: AtomicU64,
    pub pushes_delivered: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Default)]
pub struct StoreStatsSnapshot {
    pub instance_packets_received: u64,
    pub maps_cache_authorized: u64,
    pub maps_from_cache: u64,
    pub commit_unicast_sends: u64,
    pub commit_multicast_sends: u64,
    pub pushes_delivered: u64,
}

impl StoreStats {
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            instance_packets_received: self.instance_packets_received.load(Ordering::Relaxed),
            maps_cache_authorized: self.maps_cache_authorized.load(Ordering::Relaxed),
            maps_from_cache: self.maps_from_cache.load(Ordering::Relaxed),
            commit_unicast_sends: self.commit_unicast_sends.load(Ordering::Relaxed),
            commit_multicast_sends: self.commit_multicast_sends.load(Ordering::Relaxed),
            pushes_delivered: self.pushes_delivered.load(Ordering::Relaxed),
        }
    }
}

/// An in-flight non-blocking map operation.
pub struct MapRequest {
    pub(crate) pending: Option<crate::request::PendingRequest>,
    pub(crate) object: Object,
}

pub(crate) struct ObjectStore {
    local: Weak<LocalNodeInner>,
    /// Attach table. Mutated only on the receiver task; read anywhere.
    objects: RwLock<HashMap<ObjectId, Vec<Object>>>,
    next_instance_id: AtomicU32,
    pub(crate) cache: InstanceCache,
    /// Owned by the command task.
    send_queue: Mutex<VecDeque<SendQueueItem>>,
    send_on_register: AtomicI32,
    /// Reassembly of incoming instance data for the cache.
    pending_cache: Mutex<HashMap<(ObjectId, Version), ObjectDataIStream>>,
    /// Reassembly of push data until the OBJECT_PUSH marker.
    push_data: Mutex<HashMap<ObjectId, ObjectDataIStream>>,
    robust: bool,
    aggressive_caching: bool,
    pub(crate) stats: StoreStats,
}

impl ObjectStore {
    pub fn new(local: Weak<LocalNodeInner>, config: &Config) -> Self {
        ObjectStore {
            local,
            objects: RwLock::new(HashMap::new()),
            next_instance_id: AtomicU32::new(1),
            cache: InstanceCache::new(
                config.instance_cache_size_mb as u64 * 1024 * 1024,
                config.robustness,
            ),
            send_queue: Mutex::new(VecDeque::new()),
            send_on_register: AtomicI32::new(if config.send_queue_size > 0 { 1 } else { 0 }),
            pending_cache: Mutex::new(HashMap::new()),
            push_data: Mutex::new(HashMap::new()),
            robust: config.robustness,
            aggressive_caching: config.aggressive_caching,
            stats: StoreStats::default(),
        }
    }

    fn local(&self) -> Result<Arc<LocalNodeInner>> {
        self.local.upgrade().ok_or_else(|| Error::state("local node is gone"))
    }

    fn generate_instance_id(&self) -> InstanceId {
        let raw = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        raw % (INSTANCE_MAX + 1)
    }

    // ---- attach / detach ---------------------------------------------

    /// Attach via a self-addressed command, so the table mutation runs on
    /// the receiver task. Must not be called from the receiver task itself;
    /// receiver-side paths use [`ObjectStore::attach_inline`].
    pub async fn attach_object(
        &self,
        object: &Object,
        id: ObjectId,
        instance_id: InstanceId,
    ) -> Result<()> {
        let local = self.local()?;
        let pending = local.requests().register(Some(object.clone()));
        let packet = AttachObjectPacket { request_id: pending.id, object_id: id, instance_id };
        local
            .send_to_self(DATATYPE_NODE, NodeCommand::AttachObject as u32, &packet.encode())
            .await?;
        local.wait(pending).await?;
        Ok(())
    }

    pub async fn detach_object(&self, object: &Object) -> Result<()> {
        let local = self.local()?;
        let pending = local.requests().register(None);
        let packet = DetachObjectPacket {
            request_id: pending.id,
            object_id: object.id(),
            instance_id: object.instance_id(),
        };
        local
            .send_to_self(DATATYPE_NODE, NodeCommand::DetachObject as u32, &packet.encode())
            .await?;
        local.wait(pending).await?;
        Ok(())
    }

    /// Receiver-task half of attach.
    fn attach_inline(&self, object: &Object, id: ObjectId, instance_id: InstanceId) {
        let local = match self.local() {
            Ok(local) => local,
            Err(_) => return,
        };
        let instance_id = if instance_id == INSTANCE_INVALID {
            self.generate_instance_id()
        } else {
            instance_id
        };
        object.attach(id, instance_id, &local);

        let mut objects = self.objects.write();
        let instances = objects.entry(id).or_default();
        if object.is_master() && !instances.is_empty() {
            fatal!(self.robust, "attaching a second master for {id}");
        }
        instances.push(object.clone());
    }

    /// Receiver-task half of detach.
    fn detach_inline(&self, object: &Object) {
        if !object.is_attached() {
            return;
        }
        let id = object.id();
        {
            let mut objects = self.objects.write();
            if let Some(instances) = objects.get_mut(&id) {
                instances.retain(|o| !o.ptr_eq(object));
                if instances.is_empty() {
                    objects.remove(&id);
                }
            }
        }
        object.detach();
        debug!("detached object {id}");
    }

    fn find_instance(&self, id: ObjectId, instance_id: InstanceId) -> Option<Object> {
        let objects = self.objects.read();
        objects
            .get(&id)?
            .iter()
            .find(|o| o.instance_id() == instance_id)
            .cloned()
    }

    fn find_master_instance(&self, id: ObjectId) -> Option<Object> {
        let objects = self.objects.read();
        objects.get(&id)?.iter().find(|o| o.is_master()).cloned()
    }

    // ---- register / deregister (master side) -------------------------

    pub async fn register_object(&self, object: &Object) -> Result<()> {
        if object.is_attached() {
            return Err(Error::state("object is already attached"));
        }
        let id = object.id();
        if !id.is_generated() {
            return Err(Error::state("object has no identifier"));
        }
        let local = self.local()?;

        object.setup_master()?;
        self.attach_object(object, id, INSTANCE_INVALID).await?;

        if local.config().send_queue_size > 0 {
            let packet = RegisterObjectPacket { object_id: id };
            local
                .send_to_self(DATATYPE_NODE, NodeCommand::RegisterObject as u32, &packet.encode())
                .await?;
        }
        debug!("registered {id} as {:?} master", object.change_type());
        Ok(())
    }

    pub async fn deregister_object(&self, object: &Object) -> Result<()> {
        if !object.is_attached() {
            return Ok(());
        }
        if !object.is_master() {
            return Err(Error::state("deregister of a slave instance"));
        }
        let local = self.local()?;
        let id = object.id();

        if local.config().send_queue_size > 0 {
            // Blocking removal from the send queue: no in-flight copy may
            // survive the deregistration.
            let pending = local.requests().register(Some(object.clone()));
            let packet = DeregisterObjectPacket { request_id: pending.id, object_id: id };
            local
                .send_to_self(DATATYPE_NODE, NodeCommand::DeregisterObject as u32, &packet.encode())
                .await?;
            local.wait(pending).await?;
        }

        // Remaining subscribers lose their master: tell them to unmap.
        let subscribers = object.subscriber_nodes();
        let unmap = UnmapObjectPacket { object_id: id }.encode();
        for node in subscribers {
            if node
                .send(DATATYPE_NODE, NodeCommand::UnmapObject as u32, &unmap)
                .await
                .is_err()
            {
                trace!("subscriber {} unreachable during deregister", node.node_id());
            }
        }

        self.detach_object(object).await?;
        self.cache.erase(id);
        debug!("deregistered {id}");
        Ok(())
    }

    // ---- identifier-to-master lookup ---------------------------------

    /// Locate the master node for an identifier: locally first, then by
    /// asking every connected peer, first non-zero answer wins.
    pub async fn find_master_node_id(&self, id: ObjectId) -> Result<NodeId> {
        let local = self.local()?;
        if let Some(found) = self.find_master_node_local(id, &local) {
            return Ok(found);
        }

        let nodes = local.connected_nodes();
        let mut waits = Vec::new();
        for node in &nodes {
            let pending = local.requests().register(None);
            let packet = FindMasterNodeIdPacket { request_id: pending.id, object_id: id };
            trace!("asking {} for the master of {id}", node.node_id());
            if node
                .send(DATATYPE_NODE, NodeCommand::FindMasterNodeId as u32, &packet.encode())
                .await
                .is_ok()
            {
                waits.push(local.wait(pending));
            } else {
                local.requests().unregister(pending.id);
            }
        }

        // All requests are in flight; take the first useful answer.
        let mut futures: Vec<_> = waits.into_iter().map(Box::pin).collect();
        while !futures.is_empty() {
            let (result, _, rest) = futures::future::select_all(futures).await;
            if let Ok(RequestValue::NodeId(node_id)) = result {
                if !node_id.is_zero() {
                    debug!("master of {id} is {node_id}");
                    return Ok(node_id);
                }
            }
            futures = rest;
        }
        Ok(NodeId::ZERO)
    }

    fn find_master_node_local(&self, id: ObjectId, local: &LocalNodeInner) -> Option<NodeId> {
        let objects = self.objects.read();
        let instances = objects.get(&id)?;
        for object in instances {
            if object.is_master() {
                return Some(local.node_id());
            }
            let master = object.master_node_id();
            if !master.is_zero() {
                return Some(master);
            }
        }
        None
    }

    async fn connect_master(&self, id: ObjectId) -> Result<NodeRef> {
        let master_id = self.find_master_node_id(id).await?;
        if master_id.is_zero() {
            return Err(Error::NotFound(format!("no master node for object {id}")));
        }
        let local = self.local()?;
        local.connect_by_id(master_id).await
    }

    // ---- map / unmap (slave side) ------------------------------------

    /// Start mapping `object` as a slave of `id`. The request is complete
    /// once [`ObjectStore::map_object_sync`] returns.
    pub async fn map_object_nb(
        &self,
        object: &Object,
        id: ObjectId,
        version: Version,
    ) -> Result<MapRequest> {
        if !id.is_generated() {
            return Err(Error::state("mapping needs a generated identifier"));
        }
        if object.is_attached() {
            return Err(Error::state("object is already attached"));
        }
        let local = self.local()?;
        let master = self.connect_master(id).await?;

        let mut packet = MapObjectPacket {
            request_id: REQUEST_INVALID,
            object_id: id,
            requested_version: version,
            max_versions: object.read_max_versions(),
            instance_id: self.generate_instance_id(),
            use_cache: false,
            master_instance_id: INSTANCE_INVALID,
            min_cached_version: Version::NONE,
            max_cached_version: Version::NONE,
        };

        // Advertise the locally cached window; the entry stays pinned until
        // the reply releases it.
        if let Some(hit) = self.cache.lookup(id) {
            packet.use_cache = true;
            packet.master_instance_id = hit.master_instance_id;
            packet.min_cached_version = hit.versions.first().expect("non-empty").version;
            packet.max_cached_version = hit.versions.last().expect("non-empty").version;
            trace!(
                "map hint: {id} cached v{}..v{}",
                packet.min_cached_version,
                packet.max_cached_version
            );
        }

        let pending = local.requests().register(Some(object.clone()));
        packet.request_id = pending.id;
        master
            .send(DATATYPE_NODE, NodeCommand::MapObject as u32, &packet.encode())
            .await?;
        Ok(MapRequest { pending: Some(pending), object: object.clone() })
    }

    /// Wait for a map started with [`ObjectStore::map_object_nb`] and apply
    /// the initial instance data.
    pub async fn map_object_sync(&self, mut request: MapRequest) -> Result<Version> {
        let local = self.local()?;
        let pending = request
            .pending
            .take()
            .ok_or_else(|| Error::state("map request already synced"))?;
        let version = match local.wait(pending).await? {
            RequestValue::Version(version) => version,
            RequestValue::Failed => {
                return Err(Error::NotFound("master did not map the object".into()));
            }
            other => return Err(Error::protocol(format!("unexpected map reply {other:?}"))),
        };
        if !request.object.is_attached() {
            return Err(Error::NotFound("map reply arrived for a detached object".into()));
        }
        let applied = request.object.apply_map_data(version)?;
        debug!("mapped {} at v{applied}", request.object.id());
        Ok(applied)
    }

    pub async fn unmap_object(&self, object: &Object) -> Result<()> {
        if !object.is_attached() {
            return Ok(());
        }
        if object.is_master() {
            return Err(Error::state("unmap of a master instance; deregister instead"));
        }
        let local = self.local()?;
        let id = object.id();
        let master_instance_id = object.master_instance_id();
        let master = object.master_node();

        if master_instance_id != INSTANCE_INVALID {
            if let Some(master) = master.filter(|m| m.is_connected()) {
                let pending = local.requests().register(None);
                let packet = UnsubscribeObjectPacket {
                    request_id: pending.id,
                    object_id: id,
                    master_instance_id,
                    slave_instance_id: object.instance_id(),
                };
                master
                    .send(DATATYPE_NODE, NodeCommand::UnsubscribeObject as u32, &packet.encode())
                    .await?;
                // The master answers with DETACH_OBJECT, which detaches on
                // the receiver task and serves this request.
                local.wait(pending).await?;
                return Ok(());
            }
            debug!("master for {id} unreachable, detaching locally");
        }

        self.detach_object(object).await
    }

    // ---- node departure ----------------------------------------------

    /// Purge everything a departed node contributed. Blocks until the
    /// command task processed the removal.
    pub async fn remove_node(&self, node_id: NodeId) -> Result<()> {
        let local = self.local()?;
        let pending = local.requests().register(None);
        let packet = RemoveNodePacket { request_id: pending.id, node_id };
        local
            .send_to_self(DATATYPE_NODE, NodeCommand::RemoveNode as u32, &packet.encode())
            .await?;
        local.wait(pending).await?;
        Ok(())
    }

    // ---- send-on-register --------------------------------------------

    pub fn enable_send_on_register(&self) {
        self.send_on_register.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn disable_send_on_register(&self) -> Result<()> {
        let local = self.local()?;
        if local.config().send_queue_size == 0 {
            self.send_on_register.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }
        let pending = local.requests().register(None);
        let packet = DisableSendOnRegisterPacket { request_id: pending.id };
        local
            .send_to_self(
                DATATYPE_NODE,
                NodeCommand::DisableSendOnRegister as u32,
                &packet.encode(),
            )
            .await?;
        local.wait(pending).await?;
        Ok(())
    }

    /// Opportunistic send-queue drain, called by the idle command task.
    /// Returns true when more work remains.
    pub async fn notify_command_thread_idle(&self) -> bool {
        let item = {
            let mut queue = self.send_queue.lock();
            match queue.pop_front() {
                Some(item) => item,
                None => return false,
            }
        };

        // The age limit is advisory: expired entries are dropped unsent.
        let expired = item.deadline.map(|d| Instant::now() > d).unwrap_or(false);
        if !expired {
            if let Some(object) = self.find_master_instance(item.object_id) {
                let local = match self.local() {
                    Ok(local) => local,
                    Err(_) => return false,
                };
                let nodes = local.connected_nodes();
                if nodes.is_empty() {
                    // Nobody to warm yet; keep the item for later.
                    self.send_queue.lock().push_front(item);
                    return false;
                }
                let (version, payload) = object.head_instance_data();
                self.broadcast_instance_data(
                    &local,
                    NodeCommand::ObjectInstance,
                    &nodes,
                    &object,
                    INSTANCE_NONE,
                    NodeId::ZERO,
                    version,
                    &payload,
                )
                .await;
                trace!("warmed caches with {} v{version}", item.object_id);
            }
        }

        !self.send_queue.lock().is_empty()
    }

    // ---- command handlers: receiver task -----------------------------

    pub fn cmd_attach_object(&self, command: &Command) -> Result<()> {
        let packet = AttachObjectPacket::decode(&mut command.istream())?;
        let local = self.local()?;
        let Some(object) = local.requests().data(packet.request_id) else {
            warn!("attach without a registered object");
            return Ok(());
        };
        self.attach_inline(&object, packet.object_id, packet.instance_id);
        local.requests().serve(packet.request_id, RequestValue::None);
        Ok(())
    }

    pub fn cmd_detach_object(&self, command: &Command) -> Result<()> {
        let packet = DetachObjectPacket::decode(&mut command.istream())?;
        if let Some(object) = self.find_instance(packet.object_id, packet.instance_id) {
            self.detach_inline(&object);
        }
        if packet.request_id != REQUEST_INVALID {
            self.local()?.requests().serve(packet.request_id, RequestValue::None);
        }
        Ok(())
    }

    pub fn cmd_map_object_success(&self, command: &Command) -> Result<()> {
        let packet = MapObjectSuccessPacket::decode(&mut command.istream())?;
        let local = self.local()?;
        if packet.node_id != local.node_id() {
            return Ok(()); // multicast, not for us
        }
        let Some(object) = local.requests().data(packet.request_id) else {
            warn!("map success for an expired request {}", packet.request_id);
            return Ok(());
        };
        let change_type = ChangeType::from_u32(packet.change_type)
            .ok_or_else(|| Error::protocol(format!("unknown change type {}", packet.change_type)))?;
        object.setup_slave(change_type, packet.master_instance_id);
        self.attach_inline(&object, packet.object_id, packet.instance_id);
        Ok(())
    }

    pub fn cmd_map_object_reply(&self, command: &Command) -> Result<()> {
        let packet = MapObjectReplyPacket::decode(&mut command.istream())?;
        let local = self.local()?;
        if packet.node_id != local.node_id() {
            return Ok(());
        }
        let id = packet.object_id;

        if packet.result {
            let Some(object) = local.requests().data(packet.request_id) else {
                warn!("map reply for an expired request {}", packet.request_id);
                return Ok(());
            };
            object.set_master_node(command.node.clone());

            if packet.use_cache {
                match self.cache.lookup(id) {
                    Some(hit) => {
                        object.add_cached_instances(&hit.versions, hit.big_endian, packet.version);
                        self.stats.maps_from_cache.fetch_add(1, Ordering::Relaxed);
                        // This lookup and the pin taken when the hint was
                        // sent.
                        self.cache.release(id, 2);
                    }
                    None => {
                        fatal!(self.robust, "authorized cache entry for {id} vanished");
                        self.cache.release(id, 1);
                    }
                }
            } else if packet.release_cache {
                self.cache.release(id, 1);
            }
            local.requests().serve(packet.request_id, RequestValue::Version(packet.version));
        } else {
            if packet.release_cache {
                self.cache.release(id, 1);
            }
            warn!("could not map object {id}");
            local.requests().serve(packet.request_id, RequestValue::Failed);
        }
        Ok(())
    }

    pub fn cmd_unmap_object(&self, command: &Command) -> Result<()> {
        let packet = UnmapObjectPacket::decode(&mut command.istream())?;
        self.cache.erase(packet.object_id);

        let instances = { self.objects.write().remove(&packet.object_id) };
        if let Some(instances) = instances {
            debug!("unmapping {} local instances of {}", instances.len(), packet.object_id);
            for object in instances {
                object.detach();
            }
        }
        Ok(())
    }

    pub fn cmd_find_master_node_id_reply(&self, command: &Command) -> Result<()> {
        let packet = FindMasterNodeIdReplyPacket::decode(&mut command.istream())?;
        self.local()?
            .requests()
            .serve(packet.request_id, RequestValue::NodeId(packet.master_node_id));
        Ok(())
    }

    /// The four OBJECT_INSTANCE_* carriers.
    pub fn cmd_instance(&self, kind: NodeCommand, command: &Command) -> Result<()> {
        let packet = ObjectInstancePacket::decode(&mut command.istream())?;
        let local = self.local()?;
        self.stats.instance_packets_received.fetch_add(1, Ordering::Relaxed);

        let cache_this = match kind {
            NodeCommand::ObjectInstancePush => self.aggressive_caching,
            _ => true,
        };
        if cache_this && self.cache.is_enabled() {
            self.cache_chunk(&packet, command.header.big_endian);
        }

        match kind {
            // Passive cache fill only.
            NodeCommand::ObjectInstance => Ok(()),

            NodeCommand::ObjectInstanceMap => {
                if packet.node_id != local.node_id() {
                    return Ok(());
                }
                let data = &packet.data;
                match self.find_instance(data.object_id, data.instance_id) {
                    Some(object) => object.queue_data(data, false, command.header.big_endian),
                    None => warn!("map data for unknown instance {}.{}", data.object_id, data.instance_id),
                }
                Ok(())
            }

            NodeCommand::ObjectInstanceCommit => {
                let data = &packet.data;
                let instances = {
                    self.objects.read().get(&data.object_id).cloned().unwrap_or_default()
                };
                for object in instances {
                    object.queue_data(data, false, command.header.big_endian);
                }
                Ok(())
            }

            NodeCommand::ObjectInstancePush => {
                let data = &packet.data;
                let mut push_data = self.push_data.lock();
                let stream = push_data.entry(data.object_id).or_insert_with(|| {
                    ObjectDataIStream::new(data.version, false, command.header.big_endian)
                });
                if let Err(e) = stream.add_chunk(data) {
                    warn!("discarding push data for {}: {e}", data.object_id);
                    push_data.remove(&data.object_id);
                }
                Ok(())
            }

            other => Err(Error::protocol(format!("{other:?} is not an instance carrier"))),
        }
    }

    /// Reassemble incoming instance data for the cache; complete versions
    /// are inserted keyed by `(id, version)`.
    fn cache_chunk(&self, packet: &ObjectInstancePacket, big_endian: bool) {
        let data = &packet.data;
        let key = (data.object_id, data.version);
        let mut pending = self.pending_cache.lock();
        let stream = pending
            .entry(key)
            .or_insert_with(|| ObjectDataIStream::new(data.version, false, big_endian));
        if stream.add_chunk(data).is_err() {
            // Duplicate delivery over unicast and multicast reaches here as
            // a replayed sequence; the cache add below dedups by version.
            pending.remove(&key);
            return;
        }
        if !stream.is_ready() {
            return;
        }
        let stream = pending.remove(&key).expect("just inserted");
        drop(pending);
        self.cache.add(
            data.object_id,
            packet.master_instance_id,
            packet.master_node_id,
            big_endian,
            data.version,
            stream.concat(),
        );
    }

    /// Route an OBJECT-datatype command to the local instance(s).
    pub fn dispatch_object_command(&self, command: &Command) -> Result<()> {
        let address = ObjectAddress::decode(&mut command.istream())?;
        let instances = {
            match self.objects.read().get(&address.object_id) {
                Some(instances) => instances.clone(),
                None => {
                    // Broadcasts for objects we no longer have are expected;
                    // targeted commands are not.
                    if address.instance_id != INSTANCE_NONE {
                        warn!(
                            "object command {} for unknown object {}",
                            command.header.command, address.object_id
                        );
                    }
                    return Ok(());
                }
            }
        };

        if address.instance_id <= INSTANCE_MAX {
            match instances.iter().find(|o| o.instance_id() == address.instance_id) {
                Some(object) => self.deliver_object_command(object, command),
                None => warn!(
                    "object command for unknown instance {}.{}",
                    address.object_id, address.instance_id
                ),
            }
            return Ok(());
        }

        // Broadcast: the first instance gets the command, every further one
        // a refcounted clone.
        let mut iter = instances.iter();
        if let Some(first) = iter.next() {
            self.deliver_object_command(first, command);
        }
        for object in iter {
            let clone = command.clone();
            self.deliver_object_command(object, &clone);
        }
        Ok(())
    }

    fn deliver_object_command(&self, object: &Object, command: &Command) {
        match command.object_command() {
            Some(ObjectCommand::Instance) | Some(ObjectCommand::Delta) => {
                let delta = command.object_command() == Some(ObjectCommand::Delta);
                match ObjectDataPacket::decode(&mut command.istream()) {
                    Ok(packet) => object.queue_data(&packet, delta, command.header.big_endian),
                    Err(e) => warn!("bad object data packet: {e}"),
                }
            }
            None if command.header.command >= OBJECT_COMMAND_CUSTOM => {
                object.dispatch_custom(command);
            }
            other => {
                fatal!(self.robust, "unroutable object command {other:?}");
            }
        }
    }

    // ---- command handlers: command task ------------------------------

    pub async fn cmd_find_master_node_id(&self, command: &Command) -> Result<()> {
        let packet = FindMasterNodeIdPacket::decode(&mut command.istream())?;
        let local = self.local()?;
        let master_node_id = self
            .find_master_node_local(packet.object_id, &local)
            .unwrap_or(NodeId::ZERO);
        trace!("master of {} here: {master_node_id}", packet.object_id);
        let reply = FindMasterNodeIdReplyPacket { request_id: packet.request_id, master_node_id };
        command
            .node
            .send(DATATYPE_NODE, NodeCommand::FindMasterNodeIdReply as u32, &reply.encode())
            .await
    }

    pub fn cmd_register_object(&self, command: &Command) -> Result<()> {
        if self.send_on_register.load(Ordering::Relaxed) <= 0 {
            return Ok(());
        }
        let packet = RegisterObjectPacket::decode(&mut command.istream())?;
        let local = self.local()?;
        let config = local.config();

        let deadline = if config.send_queue_age.is_zero() {
            None
        } else {
            Some(Instant::now() + config.send_queue_age)
        };
        let mut queue = self.send_queue.lock();
        queue.push_back(SendQueueItem { object_id: packet.object_id, deadline });
        while queue.len() > config.send_queue_size as usize {
            queue.pop_front();
        }
        Ok(())
    }

    pub fn cmd_deregister_object(&self, command: &Command) -> Result<()> {
        let packet = DeregisterObjectPacket::decode(&mut command.istream())?;
        self.send_queue.lock().retain(|item| item.object_id != packet.object_id);
        self.local()?.requests().serve(packet.request_id, RequestValue::None);
        Ok(())
    }

    /// Master side of the map protocol.
    pub async fn cmd_map_object(&self, command: &Command) -> Result<()> {
        let packet = MapObjectPacket::decode(&mut command.istream())?;
        let node = &command.node;

        let Some(master) = self.find_master_instance(packet.object_id) else {
            warn!("no master instance to map {}", packet.object_id);
            let reply = MapObjectReplyPacket {
                node_id: node.node_id(),
                request_id: packet.request_id,
                object_id: packet.object_id,
                version: Version::NONE,
                result: false,
                use_cache: false,
                release_cache: packet.use_cache,
            };
            return node
                .send(DATATYPE_NODE, NodeCommand::MapObjectReply as u32, &reply.encode())
                .await;
        };

        let InitSlave { success, reply, streams } = master.add_slave(&packet, node)?;
        if reply.use_cache {
            self.stats.maps_cache_authorized.fetch_add(1, Ordering::Relaxed);
        }

        // Strict order on the slave's connection: success, data, reply.
        node.send(DATATYPE_NODE, NodeCommand::MapObjectSuccess as u32, &success.encode())
            .await?;
        let local = self.local()?;
        for (version, payload) in &streams {
            self.send_instance_data_to(
                &local,
                node,
                NodeCommand::ObjectInstanceMap,
                &master,
                packet.instance_id,
                node.node_id(),
                *version,
                payload,
            )
            .await?;
        }
        node.send(DATATYPE_NODE, NodeCommand::MapObjectReply as u32, &reply.encode())
            .await
    }

    pub async fn cmd_unsubscribe_object(&self, command: &Command) -> Result<()> {
        let packet = UnsubscribeObjectPacket::decode(&mut command.istream())?;
        if let Some(master) = self.find_instance(packet.object_id, packet.master_instance_id) {
            master.remove_slave(&command.node, packet.slave_instance_id);
        }
        let detach = DetachObjectPacket {
            request_id: packet.request_id,
            object_id: packet.object_id,
            instance_id: packet.slave_instance_id,
        };
        command
            .node
            .send(DATATYPE_NODE, NodeCommand::DetachObject as u32, &detach.encode())
            .await
    }

    pub fn cmd_disable_send_on_register(&self, command: &Command) -> Result<()> {
        let packet = DisableSendOnRegisterPacket::decode(&mut command.istream())?;
        if self.send_on_register.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.send_queue.lock().clear();
        }
        self.local()?.requests().serve(packet.request_id, RequestValue::None);
        Ok(())
    }

    pub async fn cmd_remove_node(&self, command: &Command) -> Result<()> {
        let packet = RemoveNodePacket::decode(&mut command.istream())?;
        let node_id = packet.node_id;
        let local = self.local()?;

        let instances: Vec<Object> = {
            self.objects.read().values().flatten().cloned().collect()
        };
        for object in &instances {
            // Masters lose their subscriptions from the departed node.
            object.remove_slaves(node_id);
        }

        // Slaves of the departed master detach; the mutation runs on the
        // receiver task via self-addressed DETACH_OBJECT.
        for object in instances {
            if !object.is_master() && object.master_node_id() == node_id {
                let detach = DetachObjectPacket {
                    request_id: REQUEST_INVALID,
                    object_id: object.id(),
                    instance_id: object.instance_id(),
                };
                local
                    .send_to_self(DATATYPE_NODE, NodeCommand::DetachObject as u32, &detach.encode())
                    .await
                    .ok();
            }
        }

        self.cache.remove_node(node_id);
        if packet.request_id != REQUEST_INVALID {
            local.requests().serve(packet.request_id, RequestValue::None);
        }
        Ok(())
    }

    /// OBJECT/COMMIT from the owning application thread.
    pub async fn cmd_object_commit(&self, command: &Command) -> Result<()> {
        let packet = ObjectCommitPacket::decode(&mut command.istream())?;
        let local = self.local()?;
        let Some(object) =
            self.find_instance(packet.address.object_id, packet.address.instance_id)
        else {
            local.requests().serve(packet.request_id, RequestValue::Failed);
            return Ok(());
        };

        match object.run_commit(packet.incarnation) {
            Ok(CommitOutcome::Unchanged(version)) => {
                local.requests().serve(packet.request_id, RequestValue::Version(version));
            }
            Ok(CommitOutcome::NoSubscribers) => {
                local.requests().serve(packet.request_id, RequestValue::Version(Version::NONE));
            }
            Ok(CommitOutcome::Broadcast { version, payload, delta, subscribers }) => {
                let nodes: Vec<NodeRef> = {
                    let mut nodes: Vec<NodeRef> = Vec::new();
                    for entry in &subscribers {
                        if !nodes.iter().any(|n| n.node_id() == entry.node.node_id()) {
                            nodes.push(entry.node.clone());
                        }
                    }
                    nodes
                };
                if delta {
                    self.broadcast_delta(&local, &nodes, packet.address.object_id, version, &payload)
                        .await;
                } else {
                    self.broadcast_instance_data(
                        &local,
                        NodeCommand::ObjectInstanceCommit,
                        &nodes,
                        &object,
                        INSTANCE_NONE,
                        NodeId::ZERO,
                        version,
                        &payload,
                    )
                    .await;
                }
                local.requests().serve(packet.request_id, RequestValue::Version(version));
            }
            Err(e) => {
                warn!("commit failed: {e}");
                local.requests().serve(packet.request_id, RequestValue::Failed);
            }
        }
        Ok(())
    }

    /// OBJECT/SYNC: a slave hit a delta gap; resend a full instance.
    pub async fn cmd_object_sync(&self, command: &Command) -> Result<()> {
        let packet = ObjectSyncPacket::decode(&mut command.istream())?;
        let local = self.local()?;
        let Some(master) =
            self.find_instance(packet.address.object_id, packet.address.instance_id)
        else {
            warn!("resend request for unknown master {}", packet.address.object_id);
            return Ok(());
        };
        let Some(slave) = local.get_node(packet.slave_node_id) else {
            return Ok(());
        };
        let (version, payload) = master.head_instance_data();
        debug!(
            "resending {} v{version} to {} after gap at v{}",
            packet.address.object_id, packet.slave_node_id, packet.version
        );
        self.send_instance_data_to(
            &local,
            &slave,
            NodeCommand::ObjectInstanceMap,
            &master,
            packet.slave_instance_id,
            packet.slave_node_id,
            version,
            &payload,
        )
        .await
    }

    /// OBJECT/PUSH: serialize once and push to the named nodes.
    pub async fn cmd_object_push_exec(&self, command: &Command) -> Result<()> {
        let packet = ObjectPushExecPacket::decode(&mut command.istream())?;
        let local = self.local()?;
        let Some(object) =
            self.find_instance(packet.address.object_id, packet.address.instance_id)
        else {
            local.requests().serve(packet.request_id, RequestValue::Failed);
            return Ok(());
        };

        let (version, payload) = object.head_instance_data();
        let nodes: Vec<NodeRef> =
            packet.nodes.iter().filter_map(|id| local.get_node(*id)).collect();

        self.broadcast_instance_data(
            &local,
            NodeCommand::ObjectInstancePush,
            &nodes,
            &object,
            INSTANCE_NONE,
            NodeId::ZERO,
            version,
            &payload,
        )
        .await;

        // The marker closes the fragment sequence on every path.
        let marker = ObjectPushPacket {
            object_id: packet.address.object_id,
            group_id: packet.group_id,
            type_id: packet.type_id,
        }
        .encode();
        self.fan_out(&local, &nodes, DATATYPE_NODE, NodeCommand::ObjectPush as u32, &marker)
            .await;

        local.requests().serve(packet.request_id, RequestValue::None);
        Ok(())
    }

    /// NODE/OBJECT_PUSH marker: hand the assembled stream to the user
    /// callback.
    pub fn cmd_object_push(&self, command: &Command) -> Result<()> {
        let packet = ObjectPushPacket::decode(&mut command.istream())?;
        let stream = self.push_data.lock().remove(&packet.object_id);
        let Some(stream) = stream else {
            warn!("push marker without data for {}", packet.object_id);
            return Ok(());
        };
        if !stream.is_ready() {
            warn!("push marker before the last fragment of {}", packet.object_id);
            return Ok(());
        }
        let local = self.local()?;
        if local.deliver_push(packet.group_id, packet.type_id, packet.object_id, stream.istream()) {
            self.stats.pushes_delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    // ---- outbound instance data --------------------------------------

    /// Unicast one version of instance data as OBJECT_INSTANCE_* carriers.
    #[allow(clippy::too_many_arguments)]
    async fn send_instance_data_to(
        &self,
        local: &LocalNodeInner,
        node: &NodeRef,
        kind: NodeCommand,
        object: &Object,
        target_instance: InstanceId,
        target_node: NodeId,
        version: Version,
        payload: &Bytes,
    ) -> Result<()> {
        for chunk in chunk_payload(object.id(), target_instance, version, payload) {
            let carrier = ObjectInstancePacket {
                node_id: target_node,
                master_node_id: local.node_id(),
                master_instance_id: object.instance_id(),
                data: chunk,
            };
            node.send(DATATYPE_NODE, kind as u32, &carrier.encode()).await?;
        }
        Ok(())
    }

    /// Broadcast one version of instance data, taking the multicast path
    /// once for every subscriber it covers.
    #[allow(clippy::too_many_arguments)]
    async fn broadcast_instance_data(
        &self,
        local: &LocalNodeInner,
        kind: NodeCommand,
        nodes: &[NodeRef],
        object: &Object,
        target_instance: InstanceId,
        target_node: NodeId,
        version: Version,
        payload: &Bytes,
    ) {
        let mut packets = Vec::new();
        for chunk in chunk_payload(object.id(), target_instance, version, payload) {
            let carrier = ObjectInstancePacket {
                node_id: target_node,
                master_node_id: local.node_id(),
                master_instance_id: object.instance_id(),
                data: chunk,
            };
            packets.push(carrier.encode());
        }
        for packet in &packets {
            self.fan_out(local, nodes, DATATYPE_NODE, kind as u32, packet).await;
        }
    }

    /// Broadcast delta data as OBJECT/DELTA packets.
    async fn broadcast_delta(
        &self,
        local: &LocalNodeInner,
        nodes: &[NodeRef],
        object_id: ObjectId,
        version: Version,
        payload: &Bytes,
    ) {
        for chunk in chunk_payload(object_id, INSTANCE_NONE, version, payload) {
            let mut os = distnet::DataOStream::with_capacity(64 + chunk.data.len());
            chunk.encode_into(&mut os);
            let packet = os.into_bytes();
            self.fan_out(local, nodes, DATATYPE_OBJECT, ObjectCommand::Delta as u32, &packet)
                .await;
        }
    }

    /// Send one packet to a set of nodes: once on the multicast group for
    /// all members it covers, unicast to the rest.
    async fn fan_out(
        &self,
        local: &LocalNodeInner,
        nodes: &[NodeRef],
        datatype: u32,
        command: u32,
        payload: &Bytes,
    ) {
        let group = local.group_connection();
        let group_name = group.as_ref().and_then(|g| g.multicast_group().map(str::to_string));
        let mut sent_multicast = false;

        for node in nodes {
            let covered = match (&group_name, node.multicast_group()) {
                (Some(ours), Some(theirs)) => *ours == theirs,
                _ => false,
            };
            if covered {
                if !sent_multicast {
                    let group = group.as_ref().expect("group exists when named");
                    if group.send(&distnet::assemble(datatype, command, payload)).await.is_ok() {
                        self.stats.commit_multicast_sends.fetch_add(1, Ordering::Relaxed);
                        sent_multicast = true;
                        continue;
                    }
                } else {
                    continue; // already covered by the group send
                }
            }
            if node.send(datatype, command, payload).await.is_ok() {
                self.stats.commit_unicast_sends.fetch_add(1, Ordering::Relaxed);
            } else {
                trace!("send to {} failed, peer gone", node.node_id());
            }
        }
    }

    // ---- maintenance -------------------------------------------------

    pub fn expire_instance_data(&self, age: std::time::Duration) {
        self.cache.expire(age);
    }

    pub fn attached_object_count(&self) -> usize {
        self.objects.read().values().map(Vec::len).sum()
    }

    pub fn clear(&self) {
        let instances: Vec<Object> = self.objects.write().drain().flat_map(|(_, v)| v).collect();
        for object in instances {
            object.detach();
        }
        self.send_queue.lock().clear();
        self.push_data.lock().clear();
        self.pending_cache.lock().clear();
    }
}
