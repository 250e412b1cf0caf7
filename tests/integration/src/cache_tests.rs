//! Instance cache scenarios: send-on-register warming and multicast
//! deduplication.

mod common;

use common::*;
use distnet::NodeId;
use distobj::{Config, Object, Version};

#[tokio::test(flavor = "multi_thread")]
async fn test_send_on_register_warms_remote_caches() {
    init_logging();
    let a = start_node(Config::default().with_send_queue_size(4)).await;
    let b = start_node(Config::default()).await;

    // Register five objects before any peer is connected; the send queue
    // keeps the newest four.
    let mut masters = Vec::new();
    for i in 1..=5 {
        let object = Object::new(Text::full(&format!("warm{i}")));
        a.register_object(&object).await.unwrap();
        masters.push(object);
    }

    connect(&b, &a).await;
    // Give the idle command task a reason to run, then wait for the warm
    // broadcast to land.
    a.remove_node(NodeId::ZERO).await.unwrap();
    eventually("warm instance data at b", || {
        b.stats().instance_packets_received >= 4
    })
    .await;
    assert!(b.instance_cache_size() > 0);

    // Mapping an object whose data already sits in b's cache must not
    // retransmit the instance payload.
    let x3 = &masters[2];
    let received_before_map = b.stats().instance_packets_received;
    let slave = Object::new(Text::full(""));
    b.map_object(&slave, x3.id(), Version::OLDEST).await.unwrap();
    assert_eq!(text_value(&slave), "warm3");

    assert_eq!(a.stats().maps_cache_authorized, 1);
    assert_eq!(b.stats().maps_from_cache, 1);
    assert_eq!(b.stats().instance_packets_received, received_before_map);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oldest_send_queue_entry_is_dropped() {
    init_logging();
    let a = start_node(Config::default().with_send_queue_size(2)).await;
    let b = start_node(Config::default()).await;

    let first = Object::new(Text::full("first"));
    a.register_object(&first).await.unwrap();
    let second = Object::new(Text::full("second"));
    a.register_object(&second).await.unwrap();
    let third = Object::new(Text::full("third"));
    a.register_object(&third).await.unwrap();

    connect(&b, &a).await;
    a.remove_node(NodeId::ZERO).await.unwrap();
    eventually("warm instance data at b", || {
        b.stats().instance_packets_received >= 2
    })
    .await;

    // Only the two newest registrations were broadcast; mapping the first
    // object transmits its payload.
    let slave = Object::new(Text::full(""));
    b.map_object(&slave, first.id(), Version::OLDEST).await.unwrap();
    assert_eq!(text_value(&slave), "first");
    assert_eq!(a.stats().maps_cache_authorized, 0);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multicast_commit_reaches_members_once() {
    init_logging();
    let group = "cache-tests-commit-group";
    let a = start_group_node(Config::default(), group).await;
    let b = start_group_node(Config::default(), group).await;
    let c = start_group_node(Config::default(), group).await;
    connect(&b, &a).await;
    connect(&c, &a).await;

    let master = Object::new(Text::full("m1"));
    a.register_object(&master).await.unwrap();

    let slave_b = Object::new(Text::full(""));
    b.map_object(&slave_b, master.id(), Version::OLDEST).await.unwrap();
    let slave_c = Object::new(Text::full(""));
    c.map_object(&slave_c, master.id(), Version::OLDEST).await.unwrap();

    let b_before = b.stats().instance_packets_received;
    let c_before = c.stats().instance_packets_received;

    master.write::<Text>().unwrap().value = "m2".into();
    master.commit().await.unwrap();

    slave_b.sync(Version::new(0, 2)).await.unwrap();
    slave_c.sync(Version::new(0, 2)).await.unwrap();
    assert_eq!(text_value(&slave_b), "m2");
    assert_eq!(text_value(&slave_c), "m2");

    // One multicast send covered both subscribers; neither got a unicast
    // duplicate of the commit data.
    let stats = a.stats();
    assert_eq!(stats.commit_multicast_sends, 1);
    assert_eq!(stats.commit_unicast_sends, 0);
    assert_eq!(b.stats().instance_packets_received, b_before + 1);
    assert_eq!(c.stats().instance_packets_received, c_before + 1);

    c.close().await.unwrap();
    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mixed_group_falls_back_to_unicast() {
    init_logging();
    let group = "cache-tests-mixed-group";
    let a = start_group_node(Config::default(), group).await;
    let b = start_group_node(Config::default(), group).await;
    // c is not a group member.
    let c = start_node(Config::default()).await;
    connect(&b, &a).await;
    connect(&c, &a).await;

    let master = Object::new(Text::full("m1"));
    a.register_object(&master).await.unwrap();

    let slave_b = Object::new(Text::full(""));
    b.map_object(&slave_b, master.id(), Version::OLDEST).await.unwrap();
    let slave_c = Object::new(Text::full(""));
    c.map_object(&slave_c, master.id(), Version::OLDEST).await.unwrap();

    master.write::<Text>().unwrap().value = "m2".into();
    master.commit().await.unwrap();
    slave_b.sync(Version::new(0, 2)).await.unwrap();
    slave_c.sync(Version::new(0, 2)).await.unwrap();

    let stats = a.stats();
    assert_eq!(stats.commit_multicast_sends, 1);
    assert_eq!(stats.commit_unicast_sends, 1);

    c.close().await.unwrap();
    b.close().await.unwrap();
    a.close().await.unwrap();
}
