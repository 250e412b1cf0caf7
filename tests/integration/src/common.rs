//! Shared helpers for the integration tests.

#![allow(dead_code)]

use distnet::{ConnectionDescription, DataIStream, DataOStream};
use distobj::{ChangeType, Command, Config, LocalNode, Node, NodeRef, Object, ObjectData, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DISTOBJ_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init()
        .ok();
}

/// A string-valued distributed object used by most scenarios.
pub struct Text {
    pub value: String,
    pub kind: ChangeType,
    /// Payload of the last user command received, if any.
    pub last_command: Mutex<Option<String>>,
}

impl Text {
    pub fn new(value: &str, kind: ChangeType) -> Self {
        Text { value: value.into(), kind, last_command: Mutex::new(None) }
    }

    pub fn full(value: &str) -> Self {
        Self::new(value, ChangeType::Full)
    }
}

impl ObjectData for Text {
    fn change_type(&self) -> ChangeType {
        self.kind
    }

    fn get_instance_data(&self, os: &mut DataOStream) {
        os.write_string(&self.value);
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()> {
        self.value = is.read_string()?;
        Ok(())
    }

    fn on_command(&mut self, command: &Command) -> Result<()> {
        let mut is = command.istream();
        // Skip the object address prefix.
        let _ = is.read_object_id()?;
        let _ = is.read_u32()?;
        *self.last_command.lock().unwrap() = Some(is.read_string()?);
        Ok(())
    }
}

/// An object that serializes nothing at all.
pub struct Silent;

impl ObjectData for Silent {
    fn change_type(&self) -> ChangeType {
        ChangeType::Full
    }

    fn get_instance_data(&self, _os: &mut DataOStream) {}

    fn apply_instance_data(&mut self, _is: &mut DataIStream) -> Result<()> {
        Ok(())
    }
}

/// Start a node listening on an ephemeral TCP port.
pub async fn start_node(config: Config) -> LocalNode {
    let node = LocalNode::new(config);
    node.add_listen_description(ConnectionDescription::tcp("127.0.0.1", 0));
    node.listen().await.unwrap();
    node
}

/// Start a node that is also a member of the given multicast group.
pub async fn start_group_node(config: Config, group: &str) -> LocalNode {
    let node = LocalNode::new(config);
    node.add_listen_description(ConnectionDescription::tcp("127.0.0.1", 0));
    node.add_listen_description(ConnectionDescription::group(group));
    node.listen().await.unwrap();
    node
}

/// Connect `from` to `to` and return the peer handle on `from`'s side.
pub async fn connect(from: &LocalNode, to: &LocalNode) -> NodeRef {
    let peer = Node::new(0);
    for description in to.descriptions() {
        peer.add_description(description);
    }
    from.connect_node(peer.clone()).await.unwrap();
    peer
}

/// Poll `condition` until it holds or the timeout expires.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Read the current value of a mapped [`Text`] object.
pub fn text_value(object: &Object) -> String {
    object.read::<Text>().expect("a Text object").value.clone()
}
