//! Register / map / commit / sync scenarios.

mod common;

use common::*;
use distobj::{ChangeType, Config, Object, Version};

#[tokio::test(flavor = "multi_thread")]
async fn test_register_map_commit_sync() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::full("v1"));
    a.register_object(&master).await.unwrap();
    master.set_auto_obsolete(3);
    assert!(master.is_master());
    assert_eq!(master.version(), Version::FIRST);

    let slave = Object::new(Text::full(""));
    let mapped = b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();
    assert_eq!(mapped, Version::FIRST);
    assert_eq!(text_value(&slave), "v1");

    master.write::<Text>().unwrap().value = "v2".into();
    assert_eq!(master.commit().await.unwrap(), Version::new(0, 2));
    master.write::<Text>().unwrap().value = "v3".into();
    assert_eq!(master.commit().await.unwrap(), Version::new(0, 3));

    let synced = slave.sync(Version::new(0, 3)).await.unwrap();
    assert_eq!(synced, Version::new(0, 3));
    assert_eq!(text_value(&slave), "v3");

    master.write::<Text>().unwrap().value = "v4".into();
    assert_eq!(master.commit().await.unwrap(), Version::new(0, 4));
    slave.sync(Version::new(0, 4)).await.unwrap();
    assert_eq!(text_value(&slave), "v4");

    // After four commits with three retained versions, a late mapper
    // starts past the obsoleted first version and ends at the head.
    let late = Object::new(Text::full(""));
    let mapped = b.map_object(&late, master.id(), Version::OLDEST).await.unwrap();
    assert_eq!(mapped, Version::new(0, 4));
    assert_eq!(text_value(&late), "v4");

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_head_is_non_blocking() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::full("only"));
    a.register_object(&master).await.unwrap();

    let slave = Object::new(Text::full(""));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();

    // Nothing queued: HEAD returns immediately with the current version.
    let version = slave.sync(Version::HEAD).await.unwrap();
    assert_eq!(version, Version::FIRST);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_register_fails() {
    init_logging();
    let a = start_node(Config::default()).await;

    let object = Object::new(Text::full("x"));
    a.register_object(&object).await.unwrap();
    let err = a.register_object(&object).await.unwrap_err();
    assert!(matches!(err, distobj::Error::State(_)), "got {err}");

    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_without_changes_keeps_version() {
    init_logging();
    let a = start_node(Config::default()).await;

    // An object that writes no data produces no new version.
    let object = Object::new(Silent);
    a.register_object(&object).await.unwrap();
    assert_eq!(object.commit().await.unwrap(), Version::FIRST);
    assert_eq!(object.version(), Version::FIRST);

    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_static_object_rejects_commit() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::new("frozen", ChangeType::Static));
    a.register_object(&master).await.unwrap();
    assert!(master.commit().await.is_err());

    let slave = Object::new(Text::new("", ChangeType::Static));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();
    assert_eq!(text_value(&slave), "frozen");
    // Syncing a static object stays a no-op.
    assert_eq!(slave.sync(Version::HEAD).await.unwrap(), Version::FIRST);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unbuffered_commit_without_subscribers_is_noop() {
    init_logging();
    let a = start_node(Config::default()).await;

    let object = Object::new(Text::new("u", ChangeType::Unbuffered));
    a.register_object(&object).await.unwrap();
    object.write::<Text>().unwrap().value = "changed".into();
    assert_eq!(object.commit().await.unwrap(), Version::NONE);
    assert_eq!(object.version(), Version::FIRST);

    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_instance_objects_converge_to_latest() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::new("i1", ChangeType::Instance));
    a.register_object(&master).await.unwrap();

    let slave = Object::new(Text::new("", ChangeType::Instance));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();

    for value in ["i2", "i3", "i4"] {
        master.write::<Text>().unwrap().value = value.into();
        master.commit().await.unwrap();
    }

    let version = slave.sync(Version::new(0, 4)).await.unwrap();
    assert_eq!(version, Version::new(0, 4));
    assert_eq!(text_value(&slave), "i4");

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delta_objects_apply_changes_in_order() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::new("d1", ChangeType::Delta));
    a.register_object(&master).await.unwrap();
    master.set_auto_obsolete(8);

    let slave = Object::new(Text::new("", ChangeType::Delta));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();
    assert_eq!(text_value(&slave), "d1");

    for value in ["d2", "d3"] {
        master.write::<Text>().unwrap().value = value.into();
        master.commit().await.unwrap();
    }
    slave.sync(Version::new(0, 3)).await.unwrap();
    assert_eq!(text_value(&slave), "d3");

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_payload_fragments_and_reassembles() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    // Larger than both the data chunk size and the packet bound.
    let big: String = "x".repeat(100 * 1024);
    let master = Object::new(Text::full(&big));
    a.register_object(&master).await.unwrap();

    let slave = Object::new(Text::full(""));
    b.map_object(&slave, master.id(), Version::OLDEST).await.unwrap();
    assert_eq!(text_value(&slave).len(), big.len());
    assert_eq!(text_value(&slave), big);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_map_at_concrete_version_syncs_to_head() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let master = Object::new(Text::full("h1"));
    a.register_object(&master).await.unwrap();
    master.set_auto_obsolete(8);
    for value in ["h2", "h3"] {
        master.write::<Text>().unwrap().value = value.into();
        master.commit().await.unwrap();
    }

    let slave = Object::new(Text::full(""));
    let mapped = b.map_object(&slave, master.id(), Version::FIRST).await.unwrap();
    assert_eq!(mapped, Version::new(0, 3));
    assert_eq!(text_value(&slave), "h3");

    b.close().await.unwrap();
    a.close().await.unwrap();
}
