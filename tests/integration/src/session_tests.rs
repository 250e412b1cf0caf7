//! Session identifier allocation, local and proxied.

mod common;

use common::*;
use distobj::Config;

#[tokio::test(flavor = "multi_thread")]
async fn test_master_session_allocates_locally() {
    init_logging();
    let a = start_node(Config::default()).await;

    let session = a.host_session("render");
    assert!(session.is_master());
    assert_eq!(session.name(), "render");

    let first = session.generate_ids(16).await.unwrap();
    let second = session.generate_ids(16).await.unwrap();
    assert!(first > 0);
    assert!(second >= first + 16 || first >= second + 16);

    // Release and re-release; the block is reused exactly once.
    session.release_ids(first, 16);
    session.release_ids(first, 16);
    let third = session.generate_ids(16).await.unwrap();
    assert_eq!(third, first);

    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_session_proxies_to_master() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    let hosted = a.host_session("shared");
    let server = b.get_node(a.node_id()).unwrap();
    let client = b.map_session(server, hosted.id(), "shared");
    assert!(!client.is_master());

    let remote = client.generate_ids(8).await.unwrap();
    let local = hosted.generate_ids(8).await.unwrap();
    assert!(remote > 0);
    // Blocks minted for the client and locally never overlap.
    assert!(remote + 8 <= local || local + 8 <= remote);

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_session_allocation_fails() {
    init_logging();
    let a = start_node(Config::default()).await;
    let b = start_node(Config::default()).await;
    connect(&b, &a).await;

    // No session hosted under this identifier on a.
    let server = b.get_node(a.node_id()).unwrap();
    let client = b.map_session(server, distobj::SessionId::generate(), "ghost");
    assert!(client.generate_ids(4).await.is_err());

    b.close().await.unwrap();
    a.close().await.unwrap();
}
