//! Distributed objects.
//!
//! An [`Object`] is a cloneable handle around application state implementing
//! [`ObjectData`]. Registering the handle makes it the cluster-wide master
//! of its identifier; mapping attaches it as a slave of an existing master.
//! All replication state lives in the change manager chosen at attach time.

use crate::change_manager::{ChangeManager, CommitOutcome, InitSlave, MasterCm, SlaveCm, SyncProgress};
use crate::command::Command;
use crate::commands::{ObjectCommand, OBJECT_COMMAND_CUSTOM};
use crate::error::{Error, Result};
use crate::local_node::LocalNodeInner;
use crate::node::NodeRef;
use crate::packets::{MapObjectPacket, ObjectAddress, ObjectCommitPacket, ObjectDataPacket, ObjectPushExecPacket, ObjectSyncPacket};
use crate::request::RequestValue;
use bytes::Bytes;
use distnet::{
    DataIStream, DataOStream, InstanceId, NodeId, ObjectId, Version, DATATYPE_OBJECT,
    INSTANCE_INVALID,
};
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::debug;

/// Commit incarnation sentinel: use the next incarnation.
pub const COMMIT_NEXT: u32 = u32::MAX;

/// How changes of an object are handled; fixed at first attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChangeType {
    /// Unattached placeholder; commit and sync are rejected.
    None = 0,
    /// One full serialization at attach, never changes.
    Static = 1,
    /// The master keeps the latest full instance; commits re-serialize and
    /// broadcast it.
    Instance = 2,
    /// Commits broadcast deltas; the master keeps bounded full-instance
    /// history for late mappers.
    Delta = 3,
    /// Commits broadcast full instances; nothing is retained.
    Unbuffered = 4,
    /// Bounded deque of full instances, auto-obsoleted by count.
    Full = 5,
}

impl ChangeType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Static),
            2 => Some(Self::Instance),
            3 => Some(Self::Delta),
            4 => Some(Self::Unbuffered),
            5 => Some(Self::Full),
            _ => None,
        }
    }

    /// Whether masters of this type keep instance data buffers.
    pub fn is_buffered(&self) -> bool {
        matches!(self, ChangeType::Static | ChangeType::Instance | ChangeType::Delta | ChangeType::Full)
    }
}

/// Application state of a distributed object.
///
/// `get_instance_data`/`apply_instance_data` carry the full state;
/// `pack`/`unpack` carry one version's change and default to full
/// serialization, which is what every change type except [`ChangeType::Delta`]
/// wants.
pub trait ObjectData: Any + Send + Sync {
    /// How changes to this object propagate.
    fn change_type(&self) -> ChangeType;

    /// Serialize the full object state.
    fn get_instance_data(&self, os: &mut DataOStream);

    /// Apply a full serialization.
    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()>;

    /// Serialize the changes since the last commit.
    fn pack(&self, os: &mut DataOStream) {
        self.get_instance_data(os);
    }

    /// Apply one version's changes.
    fn unpack(&mut self, is: &mut DataIStream) -> Result<()> {
        self.apply_instance_data(is)
    }

    /// Early-out hint: a commit serializes only if this returns true.
    fn is_dirty(&self) -> bool {
        true
    }

    /// Flow-control bound advertised when mapping as a slave; 0 means
    /// unbounded.
    fn max_versions(&self) -> u64 {
        0
    }

    /// Called from the receiver task when a slave queues a new version.
    /// Must not block and must not sync the object.
    fn notify_new_head_version(&self, _version: Version) {}

    /// User object command delivered through the per-object dispatch.
    fn on_command(&mut self, _command: &Command) -> Result<()> {
        Ok(())
    }
}

struct Attachment {
    id: ObjectId,
    instance_id: InstanceId,
    local: Weak<LocalNodeInner>,
}

pub(crate) struct ObjectInner {
    data: RwLock<Box<dyn ObjectData>>,
    attach: Mutex<Attachment>,
    cm: Mutex<ChangeManager>,
    new_version: Notify,
}

/// Handle to a distributed object. Clones share the same instance.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Object {
    /// Wrap application state into a detached object with a fresh
    /// identifier.
    pub fn new(data: impl ObjectData) -> Self {
        Self::from_boxed(Box::new(data))
    }

    pub fn from_boxed(data: Box<dyn ObjectData>) -> Self {
        Object {
            inner: Arc::new(ObjectInner {
                data: RwLock::new(data),
                attach: Mutex::new(Attachment {
                    id: ObjectId::generate(),
                    instance_id: INSTANCE_INVALID,
                    local: Weak::new(),
                }),
                cm: Mutex::new(ChangeManager::Detached),
                new_version: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.attach.lock().id
    }

    /// Override the identifier. Only valid while detached; mapping replaces
    /// it with the master's identifier anyway.
    pub fn set_id(&self, id: ObjectId) -> Result<()> {
        if self.is_attached() {
            return Err(Error::state("cannot change the id of an attached object"));
        }
        self.inner.attach.lock().id = id;
        Ok(())
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.attach.lock().instance_id
    }

    pub fn is_attached(&self) -> bool {
        self.instance_id() != INSTANCE_INVALID
    }

    pub fn is_master(&self) -> bool {
        matches!(&*self.inner.cm.lock(), ChangeManager::Master(_))
    }

    pub fn change_type(&self) -> ChangeType {
        self.inner.data.read().change_type()
    }

    /// The currently synchronized version.
    pub fn version(&self) -> Version {
        match &*self.inner.cm.lock() {
            ChangeManager::Detached => Version::NONE,
            ChangeManager::Master(cm) => cm.version(),
            ChangeManager::Slave(cm) => cm.version(),
        }
    }

    /// The latest locally known version: the head on a master, the newest
    /// queued version on a slave.
    pub fn head_version(&self) -> Version {
        match &*self.inner.cm.lock() {
            ChangeManager::Detached => Version::NONE,
            ChangeManager::Master(cm) => cm.version(),
            ChangeManager::Slave(cm) => cm.head_version(),
        }
    }

    pub fn master_instance_id(&self) -> InstanceId {
        match &*self.inner.cm.lock() {
            ChangeManager::Detached => INSTANCE_INVALID,
            ChangeManager::Master(_) => self.instance_id(),
            ChangeManager::Slave(cm) => cm.master_instance_id(),
        }
    }

    pub fn master_node(&self) -> Option<NodeRef> {
        match &*self.inner.cm.lock() {
            ChangeManager::Slave(cm) => cm.master_node(),
            _ => None,
        }
    }

    pub fn master_node_id(&self) -> NodeId {
        match &*self.inner.cm.lock() {
            ChangeManager::Detached => NodeId::ZERO,
            ChangeManager::Master(_) => {
                self.local().map(|l| l.node_id()).unwrap_or(NodeId::ZERO)
            }
            ChangeManager::Slave(cm) => {
                cm.master_node().map(|n| n.node_id()).unwrap_or(NodeId::ZERO)
            }
        }
    }

    /// Number of old versions a buffered master retains.
    pub fn auto_obsolete(&self) -> u32 {
        match &*self.inner.cm.lock() {
            ChangeManager::Master(cm) => cm.auto_obsolete(),
            _ => 0,
        }
    }

    pub fn set_auto_obsolete(&self, count: u32) {
        if let ChangeManager::Master(cm) = &mut *self.inner.cm.lock() {
            cm.set_auto_obsolete(count);
        }
    }

    /// Read access to the application state, downcast to its concrete type.
    pub fn read<T: ObjectData>(&self) -> Option<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.inner.data.read(), |data| {
            (&**data as &dyn Any).downcast_ref::<T>()
        })
        .ok()
    }

    /// Write access to the application state. The caller owns the thread
    /// model: do not race writes against `sync` on the same object.
    pub fn write<T: ObjectData>(&self) -> Option<MappedRwLockWriteGuard<'_, T>> {
        RwLockWriteGuard::try_map(self.inner.data.write(), |data| {
            (&mut **data as &mut dyn Any).downcast_mut::<T>()
        })
        .ok()
    }

    /// Commit a new version with the next incarnation.
    pub async fn commit(&self) -> Result<Version> {
        self.commit_incarnation(COMMIT_NEXT).await
    }

    /// Commit a new version of this master object.
    ///
    /// The serialization and broadcast run on the node's command task; this
    /// returns the new head version, the current version when nothing was
    /// dirty, or [`Version::NONE`] for an unbuffered commit without
    /// subscribers.
    pub async fn commit_incarnation(&self, incarnation: u32) -> Result<Version> {
        let local = self.attached_local()?;
        if !self.is_master() {
            return Err(Error::state("commit on a slave instance"));
        }
        match self.change_type() {
            ChangeType::None | ChangeType::Static => {
                return Err(Error::state("commit on an unversioned object"));
            }
            _ => {}
        }

        let pending = local.requests().register(Some(self.clone()));
        let packet = ObjectCommitPacket {
            address: self.address(),
            request_id: pending.id,
            incarnation,
        };
        local
            .send_to_self(DATATYPE_OBJECT, ObjectCommand::Commit as u32, &packet.encode())
            .await?;
        match local.wait(pending).await? {
            RequestValue::Version(version) => Ok(version),
            RequestValue::Failed => Err(Error::state("commit failed")),
            other => Err(Error::protocol(format!("unexpected commit reply {other:?}"))),
        }
    }

    /// Apply queued versions up to `version`.
    ///
    /// [`Version::HEAD`] applies everything queued without blocking;
    /// [`Version::NEXT`] applies exactly one version, blocking until one is
    /// available; a concrete version blocks until every version up to it
    /// has been applied in order.
    pub async fn sync(&self, version: Version) -> Result<Version> {
        if version == Version::NONE {
            return Ok(self.version());
        }
        if self.is_master() {
            // Slave commits are not part of the protocol; a master only
            // answers the non-blocking forms.
            return match version {
                Version::HEAD => Ok(self.version()),
                _ => Err(Error::state("sync to a concrete version on a master")),
            };
        }

        loop {
            // Enable the wakeup before inspecting the queue, so a version
            // queued in between is not missed.
            let notified = self.inner.new_version.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let progress = {
                let mut data = self.inner.data.write();
                let mut cm = self.inner.cm.lock();
                match &mut *cm {
                    ChangeManager::Slave(slave) => slave.try_sync(data.as_mut(), version)?,
                    ChangeManager::Detached => {
                        return Err(Error::state("sync on a detached object"))
                    }
                    ChangeManager::Master(_) => unreachable!("master handled above"),
                }
            };
            match progress {
                SyncProgress::Done(applied) => return Ok(applied),
                SyncProgress::Wait => notified.await,
                SyncProgress::Resend(stuck) => {
                    self.request_resend(stuck).await?;
                    notified.await;
                }
            }
        }
    }

    /// Push the instance data of this object to the given nodes without
    /// establishing a mapping. Each receiving node delivers the stream to
    /// its registered push handler exactly once.
    pub async fn push(&self, group_id: u128, type_id: u128, nodes: &[NodeRef]) -> Result<()> {
        if nodes.is_empty() {
            return Err(Error::state("push to an empty node list"));
        }
        let local = self.attached_local()?;
        let pending = local.requests().register(Some(self.clone()));
        let packet = ObjectPushExecPacket {
            address: self.address(),
            request_id: pending.id,
            group_id,
            type_id,
            nodes: nodes.iter().map(|n| n.node_id()).collect(),
        };
        local
            .send_to_self(DATATYPE_OBJECT, ObjectCommand::Push as u32, &packet.encode())
            .await?;
        match local.wait(pending).await? {
            RequestValue::None => Ok(()),
            RequestValue::Failed => Err(Error::state("push failed")),
            other => Err(Error::protocol(format!("unexpected push reply {other:?}"))),
        }
    }

    /// Send a user command to the peer instance(s) of this object on
    /// another node. `command` is offset into the user command range.
    pub async fn send_custom(
        &self,
        node: &NodeRef,
        command: u32,
        payload: &[u8],
        instance_id: InstanceId,
    ) -> Result<()> {
        if !self.is_attached() {
            return Err(Error::state("send on a detached object"));
        }
        let mut os = DataOStream::with_capacity(20 + payload.len());
        ObjectAddress { object_id: self.id(), instance_id }.encode_into(&mut os);
        os.write_raw(payload);
        node.send(DATATYPE_OBJECT, OBJECT_COMMAND_CUSTOM + command, &os.into_bytes())
            .await
    }

    // ---- internal ----------------------------------------------------

    pub(crate) fn read_max_versions(&self) -> u64 {
        self.inner.data.read().max_versions()
    }

    pub(crate) fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn address(&self) -> ObjectAddress {
        let attach = self.inner.attach.lock();
        ObjectAddress { object_id: attach.id, instance_id: attach.instance_id }
    }

    pub(crate) fn local(&self) -> Option<Arc<LocalNodeInner>> {
        self.inner.attach.lock().local.upgrade()
    }

    fn attached_local(&self) -> Result<Arc<LocalNodeInner>> {
        if !self.is_attached() {
            return Err(Error::state("object is not attached"));
        }
        self.local().ok_or_else(|| Error::state("local node is gone"))
    }

    /// Bind identifier and instance; runs on the receiver task.
    pub(crate) fn attach(&self, id: ObjectId, instance_id: InstanceId, local: &Arc<LocalNodeInner>) {
        let mut attach = self.inner.attach.lock();
        attach.id = id;
        attach.instance_id = instance_id;
        attach.local = Arc::downgrade(local);
        debug!("attached object {id}.{instance_id}");
    }

    /// Drop the attachment and the change manager.
    pub(crate) fn detach(&self) {
        let mut attach = self.inner.attach.lock();
        attach.instance_id = INSTANCE_INVALID;
        attach.local = Weak::new();
        *self.inner.cm.lock() = ChangeManager::Detached;
        // Unblock sync waiters; they observe the detached state.
        self.inner.new_version.notify_waiters();
    }

    /// Install the master change manager, serializing the initial version.
    pub(crate) fn setup_master(&self) -> Result<()> {
        let data = self.inner.data.read();
        let change_type = data.change_type();
        let initial = if change_type.is_buffered() {
            let mut os = DataOStream::new();
            data.get_instance_data(&mut os);
            Some(os.into_bytes())
        } else {
            None
        };
        let mut cm = self.inner.cm.lock();
        if !matches!(&*cm, ChangeManager::Detached) {
            return Err(Error::Conflict("object already has a change manager".into()));
        }
        *cm = ChangeManager::Master(MasterCm::new(change_type, initial));
        Ok(())
    }

    /// Install the slave change manager from a MAP_OBJECT_SUCCESS.
    pub(crate) fn setup_slave(&self, change_type: ChangeType, master_instance_id: InstanceId) {
        *self.inner.cm.lock() = ChangeManager::Slave(SlaveCm::new(change_type, master_instance_id));
    }

    pub(crate) fn set_master_node(&self, node: NodeRef) {
        if let ChangeManager::Slave(cm) = &mut *self.inner.cm.lock() {
            cm.set_master_node(node);
        }
    }

    /// Run a commit on the command task; returns what to broadcast.
    pub(crate) fn run_commit(&self, incarnation: u32) -> Result<CommitOutcome> {
        let data = self.inner.data.read();
        let mut cm = self.inner.cm.lock();
        match &mut *cm {
            ChangeManager::Master(master) => master.commit(data.as_ref(), incarnation),
            _ => Err(Error::state("commit on a non-master instance")),
        }
    }

    /// Serve a map request on the command task.
    pub(crate) fn add_slave(&self, packet: &MapObjectPacket, node: &NodeRef) -> Result<InitSlave> {
        let data = self.inner.data.read();
        let mut cm = self.inner.cm.lock();
        match &mut *cm {
            ChangeManager::Master(master) => Ok(master.add_slave(
                packet,
                node,
                data.as_ref(),
                self.local().map(|l| l.node_id()).unwrap_or(NodeId::ZERO),
                self.address(),
            )),
            _ => Err(Error::state("map request reached a non-master instance")),
        }
    }

    pub(crate) fn remove_slave(&self, node: &NodeRef, instance_id: InstanceId) {
        if let ChangeManager::Master(cm) = &mut *self.inner.cm.lock() {
            cm.remove_slave(node.node_id(), instance_id);
        }
    }

    /// Purge all subscriptions of a departed node. Returns true if any
    /// were held.
    pub(crate) fn remove_slaves(&self, node_id: NodeId) -> bool {
        match &mut *self.inner.cm.lock() {
            ChangeManager::Master(cm) => cm.remove_slaves(node_id),
            _ => false,
        }
    }

    /// Nodes currently subscribed to this master.
    pub(crate) fn subscriber_nodes(&self) -> Vec<NodeRef> {
        match &*self.inner.cm.lock() {
            ChangeManager::Master(cm) => cm.subscriber_nodes(),
            _ => Vec::new(),
        }
    }

    /// The head version and its full serialization, for send-on-register
    /// and push. Serializes fresh when no buffered head exists.
    pub(crate) fn head_instance_data(&self) -> (Version, Bytes) {
        let data = self.inner.data.read();
        let cm = self.inner.cm.lock();
        match &*cm {
            ChangeManager::Master(master) => master.head_instance_data(data.as_ref()),
            _ => {
                let mut os = DataOStream::new();
                data.get_instance_data(&mut os);
                (Version::NONE, os.into_bytes())
            }
        }
    }

    /// Queue one received data chunk into the slave change manager; runs on
    /// the receiver task. Notifies sync waiters when a version completes.
    pub(crate) fn queue_data(&self, packet: &ObjectDataPacket, delta: bool, big_endian: bool) {
        let completed = {
            let mut cm = self.inner.cm.lock();
            match &mut *cm {
                ChangeManager::Slave(slave) => slave.queue_chunk(packet, delta, big_endian),
                // A master sees its own multicast echo; drop it.
                _ => None,
            }
        };
        if let Some(version) = completed {
            self.inner.new_version.notify_waiters();
            self.inner.data.read().notify_new_head_version(version);
        }
    }

    /// Feed authorized cached instance datas into the slave queue.
    pub(crate) fn add_cached_instances(
        &self,
        versions: &[crate::instance_cache::CachedInstance],
        big_endian: bool,
        up_to: Version,
    ) {
        let mut cm = self.inner.cm.lock();
        if let ChangeManager::Slave(slave) = &mut *cm {
            slave.add_cached(versions, big_endian, up_to);
        }
        drop(cm);
        self.inner.new_version.notify_waiters();
    }

    /// Apply the initial map data. The master sends success, data, reply in
    /// order on one connection, so the data is already queued when the
    /// reply serves the map request.
    pub(crate) fn apply_map_data(&self, version: Version) -> Result<Version> {
        let mut data = self.inner.data.write();
        let mut cm = self.inner.cm.lock();
        match &mut *cm {
            ChangeManager::Slave(slave) => match slave.try_sync(data.as_mut(), version)? {
                SyncProgress::Done(applied) => Ok(applied),
                _ => Err(Error::protocol(format!(
                    "initial map data for v{version} missing"
                ))),
            },
            _ => Err(Error::state("map data on a non-slave instance")),
        }
    }

    /// Deliver a user object command.
    pub(crate) fn dispatch_custom(&self, command: &Command) {
        let mut data = self.inner.data.write();
        if let Err(e) = data.on_command(command) {
            tracing::warn!("object command handler failed: {e}");
        }
    }

    async fn request_resend(&self, stuck: Version) -> Result<()> {
        let (master, master_instance_id) = {
            match &*self.inner.cm.lock() {
                ChangeManager::Slave(cm) => (cm.master_node(), cm.master_instance_id()),
                _ => (None, INSTANCE_INVALID),
            }
        };
        let master = master.ok_or_else(|| Error::state("master node unknown"))?;
        let local = self.attached_local()?;
        let packet = ObjectSyncPacket {
            address: ObjectAddress { object_id: self.id(), instance_id: master_instance_id },
            slave_node_id: local.node_id(),
            slave_instance_id: self.instance_id(),
            version: stuck,
        };
        debug!("requesting full resend of {} after v{stuck}", self.id());
        master
            .send(DATATYPE_OBJECT, ObjectCommand::Sync as u32, &packet.encode())
            .await
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attach = self.inner.attach.lock();
        write!(f, "Object({}.{})", attach.id, attach.instance_id)
    }
}
