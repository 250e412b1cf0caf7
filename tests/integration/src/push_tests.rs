//! Push delivery and user-defined commands.

mod common;

use common::*;
use distobj::{Config, Object, Version};
use std::time::Duration;
use tokio::sync::mpsc;

const GROUP: u128 = 0x47;
const KIND: u128 = 0x11;

#[tokio::test(flavor = "multi_thread")]
async fn test_push_delivers_exactly_once_per_node() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    let c = start_node(Config::default()).await;
    connect(&b, &a).await;
    connect(&c, &a).await;

    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    b.register_push_handler(GROUP, move |group, kind, id, mut stream| {
        let value = stream.read_string().unwrap();
        tx_b.send((group, kind, id, value)).unwrap();
    });
    let (tx_c, mut rx_c) = mpsc::unbounded_channel();
    c.register_push_handler(GROUP, move |_, _, _, mut stream| {
        tx_c.send(stream.read_string().unwrap()).unwrap();
    });

    let object = Object::new(Text::full("pushed payload"));
    a.register_object(&object).await.unwrap();

    let targets = a.nodes();
    assert_eq!(targets.len(), 2);
    object.push(GROUP, KIND, &targets).await.unwrap();

    let (group, kind, id, value) =
        tokio::time::timeout(Duration::from_secs(5), rx_b.recv()).await.unwrap().unwrap();
    assert_eq!(group, GROUP);
    assert_eq!(kind, KIND);
    assert_eq!(id, object.id());
    assert_eq!(value, "pushed payload");

    let value = tokio::time::timeout(Duration::from_secs(5), rx_c.recv()).await.unwrap().unwrap();
    assert_eq!(value, "pushed payload");

    // Exactly once: no further delivery shows up on either node.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx_b.try_recv().is_err());
    assert!(rx_c.try_recv().is_err());

    c.close().await.unwrap();
    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_push_without_handler_is_dropped() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let object = Object::new(Text::full("nobody listens"));
    a.register_object(&object).await.unwrap();
    object.push(GROUP, KIND, &a.nodes()).await.unwrap();

    eventually("push data consumed at b", || b.stats().instance_packets_received >= 1).await;
    assert_eq!(b.stats().pushes_delivered, 0);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_push_payload() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let big: String = "p".repeat(90 * 1024);
    let object = Object::new(Text::full(&big));
    a.register_object(&object).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.register_push_handler(GROUP, move |_, _, _, mut stream| {
        tx.send(stream.read_string().unwrap()).unwrap();
    });

    object.push(GROUP, KIND, &a.nodes()).await.unwrap();
    let value = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(value.len(), big.len());
    assert_eq!(value, big);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_object_command() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::full("state"));
    a.register_object(&master).await.unwrap();
    let slave = Object::new(Text::full(""));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();

    // The slave messages the master's instances through the per-object
    // command table.
    let a_node = b.get_node(a.node_id()).unwrap();
    let mut payload = distnet::DataOStream::new();
    payload.write_string("poke");
    slave
        .send_custom(&a_node, 0, &payload.into_bytes(), distobj::INSTANCE_NONE)
        .await
        .unwrap();

    eventually("command delivery at a", || {
        master
            .read::<Text>()
            .unwrap()
            .last_command
            .lock()
            .unwrap()
            .as_deref()
            == Some("poke")
    })
    .await;

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_custom_datatype_handler() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.register_command_handler(200, true, move |command| {
        let mut is = command.istream();
        tx.send((command.header.command, is.read_string().unwrap())).unwrap();
    })
    .unwrap();

    let a_node = b.get_node(a.node_id()).unwrap();
    let mut payload = distnet::DataOStream::new();
    payload.write_string("application data");
    a_node.send(200, 7, &payload.into_bytes()).await.unwrap();

    let (command, value) =
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(command, 7);
    assert_eq!(value, "application data");

    b.close().await.unwrap();
    a.close().await.unwrap();
}
