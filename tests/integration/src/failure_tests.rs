//! Partial-failure scenarios: master loss, discovery, unmapping.

mod common;

use common::*;
use distobj::{Config, Error, Object, ObjectId, Version};

#[tokio::test(flavor = "multi_thread")]
async fn test_master_loss_detaches_slaves() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::full("v1"));
    a.register_object(&master).await.unwrap();

    let slave = Object::new(Text::full(""));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();
    assert!(slave.is_attached());

    // The master node dies; b's receiver observes the disconnect and
    // purges everything sourced from a.
    a.close().await.unwrap();
    eventually("slave detach after master loss", || !slave.is_attached()).await;

    let err = slave.sync(Version::HEAD).await.unwrap_err();
    assert!(matches!(err, Error::State(_)), "got {err}");
    assert!(b.nodes().is_empty());

    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_master_discovery_via_bootstrap_peer() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    let c = start_node(Config::default()).await;

    // c masters the object; a maps it, so a knows where the master lives.
    connect(&a, &c).await;
    let master = Object::new(Text::full("remote"));
    c.register_object(&master).await.unwrap();
    let on_a = Object::new(Text::full(""));
    a.map_object(&on_a, master.id(), Version::OLDEST).await.unwrap();

    // b only knows a. Mapping walks the discovery chain: a names c,
    // a hands out c's connection data, b connects c directly.
    connect(&b, &a).await;
    let slave = Object::new(Text::full(""));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();
    assert_eq!(text_value(&slave), "remote");
    assert!(b.get_node(c.node_id()).is_some());

    b.close().await.unwrap();
    a.close().await.unwrap();
    c.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_map_of_unknown_object_fails() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let slave = Object::new(Text::full(""));
    let err = b.map_object(&slave, ObjectId::generate(), Version::OLDEST).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err}");
    assert!(!slave.is_attached());

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unmap_unsubscribes_from_master() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::full("v1"));
    a.register_object(&master).await.unwrap();

    let slave = Object::new(Text::full(""));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();
    b.unmap_object(&slave).await.unwrap();
    assert!(!slave.is_attached());

    // Commits after the unmap reach nobody; the master is unaffected.
    master.write::<Text>().unwrap().value = "v2".into();
    assert_eq!(master.commit().await.unwrap(), Version::new(0, 2));
    assert_eq!(a.stats().commit_unicast_sends, 0);
    assert_eq!(a.stats().commit_multicast_sends, 0);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deregister_unmaps_remote_slaves() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::full("v1"));
    a.register_object(&master).await.unwrap();

    let slave = Object::new(Text::full(""));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();

    a.deregister_object(&master).await.unwrap();
    assert!(!master.is_attached());
    eventually("slave detach after deregister", || !slave.is_attached()).await;

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remap_after_reconnect() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::full("v1"));
    a.register_object(&master).await.unwrap();

    let slave = Object::new(Text::full(""));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();

    // b drops off; the master purges its subscription.
    b.close().await.unwrap();
    eventually("master notices the departed slave", || a.nodes().is_empty()).await;

    // A fresh node maps from scratch and sees consistent state.
    master.write::<Text>().unwrap().value = "v2".into();
    master.commit().await.unwrap();

    let b2 = start_node(Config::default()).await;
    connect(&b2, &a).await;
    let slave2 = Object::new(Text::full(""));
    let mapped = b2.map_object(&slave2, master.id(), Version::OLDEST).await.unwrap();
    assert_eq!(mapped, Version::new(0, 2));
    assert_eq!(text_value(&slave2), "v2");

    b2.close().await.unwrap();
    a.close().await.unwrap();
}
