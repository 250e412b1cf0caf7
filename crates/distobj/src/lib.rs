//! Distributed object synchronization core.
//!
//! A peer-to-peer node runtime keeping mutable objects consistent between a
//! master instance and its mapped slaves:
//!
//! - [`LocalNode`]: the process-local runtime; connections, the receiver
//!   and command tasks, request/reply, sessions
//! - [`Object`] + [`ObjectData`]: distributed objects with versioned
//!   replication and a change-propagation policy per [`ChangeType`]
//! - register/map/commit/sync/unmap, send-on-register cache warming, and
//!   one-shot push
//! - user-defined command handlers on custom packet datatypes
//!
//! # Example
//!
//! ```no_run
//! use distobj::{ChangeType, Config, LocalNode, Object, ObjectData, Version};
//! use distnet::{ConnectionDescription, DataIStream, DataOStream};
//!
//! struct Counter(u64);
//!
//! impl ObjectData for Counter {
//!     fn change_type(&self) -> ChangeType {
//!         ChangeType::Instance
//!     }
//!     fn get_instance_data(&self, os: &mut DataOStream) {
//!         os.write_u64(self.0);
//!     }
//!     fn apply_instance_data(&mut self, is: &mut DataIStream) -> distobj::Result<()> {
//!         self.0 = is.read_u64()?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> distobj::Result<()> {
//!     let node = LocalNode::new(Config::from_env());
//!     node.add_listen_description(ConnectionDescription::tcp("127.0.0.1", 0));
//!     node.listen().await?;
//!
//!     let counter = Object::new(Counter(0));
//!     node.register_object(&counter).await?;
//!     counter.write::<Counter>().unwrap().0 = 1;
//!     let version = counter.commit().await?;
//!     assert_eq!(version, Version::new(0, 2));
//!     node.close().await
//! }
//! ```

mod change_manager;
mod command;
mod commands;
mod config;
mod error;
mod instance_cache;
mod local_node;
mod node;
mod object;
mod object_data;
mod object_store;
mod packets;
mod request;
mod session;

pub use command::Command;
pub use commands::{NodeCommand, ObjectCommand, SessionCommand, OBJECT_COMMAND_CUSTOM};
pub use config::{Config, ENV_PREFIX};
pub use error::{Error, Result};
pub use instance_cache::{CacheHit, CachedInstance, InstanceCache};
pub use local_node::{CommandHandler, LocalNode, PushHandler};
pub use node::{Node, NodeRef, NodeState};
pub use object::{ChangeType, Object, ObjectData, COMMIT_NEXT};
pub use object_store::{MapRequest, StoreStats, StoreStatsSnapshot};
pub use session::{IdPool, Session};

// The identifier and version primitives are defined next to the wire
// format; re-exported here so most users need only this crate.
pub use distnet::{
    InstanceId, NodeId, ObjectId, RequestId, SessionId, Version, INSTANCE_ALL, INSTANCE_INVALID,
    INSTANCE_MAX, INSTANCE_NONE, REQUEST_INVALID,
};
