// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_create_get_set_delete() {
    let ensemble = InMemoryEnsemble::new();
    let session = ensemble.session().unwrap();

    assert_eq!(
        session.create("/a", b"x", CreateMode::Persistent).await,
        Ok("/a".to_owned())
    );
    assert!(session
        .create("/a", b"y", CreateMode::Persistent)
        .await
        .unwrap_err()
        .is_node_exists());
    assert!(session
        .create("/missing/b", b"", CreateMode::Persistent)
        .await
        .unwrap_err()
        .is_no_node());

    assert_eq!(session.get("/a").await.unwrap(), b"x".to_vec());
    session.set("/a", b"z").await.unwrap();
    assert_eq!(session.get("/a").await.unwrap(), b"z".to_vec());

    session
        .create("/a/b", b"", CreateMode::Persistent)
        .await
        .unwrap();
    assert!(session.delete("/a").await.unwrap_err().is_not_empty());
    session.delete("/a/b").await.unwrap();
    session.delete("/a").await.unwrap();
    assert!(!session.exists("/a").await.unwrap());
    assert!(session.delete("/a").await.unwrap_err().is_no_node());
}

#[tokio::test]
async fn test_versions_survive_recreation() {
    let ensemble = InMemoryEnsemble::new();
    let session = ensemble.session().unwrap();

    session
        .create("/lock", b"5", CreateMode::Persistent)
        .await
        .unwrap();
    let (_, created) = session.get_with_version("/lock").await.unwrap();
    session.set_if_version("/lock", b"6", created).await.unwrap();
    assert_eq!(
        session.set_if_version("/lock", b"7", created).await,
        Err(CoordinationError::BadVersion {
            path: "/lock".to_owned(),
            version: created,
        })
    );

    // A node deleted and created again with the same data does not match an old version.
    let (_, stale) = session.get_with_version("/lock").await.unwrap();
    session.delete("/lock").await.unwrap();
    session
        .create("/lock", b"6", CreateMode::Persistent)
        .await
        .unwrap();
    assert!(session
        .delete_if_version("/lock", stale)
        .await
        .unwrap_err()
        .is_bad_version());
    assert!(session.exists("/lock").await.unwrap());

    let (data, current) = session.get_with_version("/lock").await.unwrap();
    assert_eq!(data, b"6".to_vec());
    assert_ne!(current, stale);
    session.delete_if_version("/lock", current).await.unwrap();
    assert!(session
        .delete_if_version("/lock", current)
        .await
        .unwrap_err()
        .is_no_node());
}

#[tokio::test]
async fn test_create_all_and_children() {
    let ensemble = InMemoryEnsemble::new();
    let session = ensemble.session().unwrap();

    session
        .create_all("/root/tenant/txids/blacklist", b"", CreateMode::Persistent)
        .await
        .unwrap();
    session
        .create_all("/root/tenant/locks", b"", CreateMode::Persistent)
        .await
        .unwrap();

    let mut children = session.children("/root/tenant").await.unwrap();
    children.sort();
    assert_eq!(children, vec!["locks".to_owned(), "txids".to_owned()]);
    assert!(session.children("/nope").await.unwrap_err().is_no_node());
}

#[tokio::test]
async fn test_sequential_suffixes() {
    let ensemble = InMemoryEnsemble::new();
    let session = ensemble.session().unwrap();
    session
        .create("/txids", b"", CreateMode::Persistent)
        .await
        .unwrap();

    let first = session
        .create("/txids/tx", b"", CreateMode::PersistentSequential)
        .await
        .unwrap();
    let second = session
        .create("/txids/tx", b"", CreateMode::PersistentSequential)
        .await
        .unwrap();
    assert_eq!(first, "/txids/tx0000000000");
    assert_eq!(second, "/txids/tx0000000001");

    ensemble.set_next_sequence("/txids", 41).unwrap();
    assert_eq!(
        session
            .create("/txids/tx", b"", CreateMode::PersistentSequential)
            .await
            .unwrap(),
        "/txids/tx0000000041"
    );
}

#[tokio::test]
async fn test_ephemeral_nodes_removed_with_session() {
    let ensemble = InMemoryEnsemble::new();
    let owner = ensemble.session().unwrap();
    let observer = ensemble.session().unwrap();

    owner
        .create("/lock", b"", CreateMode::Persistent)
        .await
        .unwrap();
    let contender = owner
        .create("/lock/c__lock__", b"", CreateMode::EphemeralSequential)
        .await
        .unwrap();
    assert!(owner
        .create(&format!("{contender}/child"), b"", CreateMode::Persistent)
        .await
        .is_err());

    let (exists, watch) = observer.exists_watch(&contender).await.unwrap();
    assert!(exists);

    ensemble.expire_session(owner.session_id());
    assert_eq!(watch.await.unwrap(), WatchEvent::NodeDeleted);
    assert!(!observer.exists(&contender).await.unwrap());
    assert!(observer.exists("/lock").await.unwrap());
    assert_eq!(
        owner.get("/lock").await,
        Err(CoordinationError::SessionExpired {
            session_id: owner.session_id()
        })
    );
    assert!(owner.restart().await.is_err());
}

#[tokio::test]
async fn test_watches_fire_once() {
    let ensemble = InMemoryEnsemble::new();
    let session = ensemble.session().unwrap();

    let (exists, created) = session.exists_watch("/w").await.unwrap();
    assert!(!exists);
    session
        .create("/w", b"", CreateMode::Persistent)
        .await
        .unwrap();
    assert_eq!(created.await.unwrap(), WatchEvent::NodeCreated);

    let (_, changed) = session.exists_watch("/w").await.unwrap();
    session.set("/w", b"1").await.unwrap();
    assert_eq!(changed.await.unwrap(), WatchEvent::NodeDataChanged);

    let (_, mut deleted) = session.exists_watch("/w").await.unwrap();
    assert!(deleted.try_recv().is_err());
    session.delete("/w").await.unwrap();
    assert_eq!(deleted.await.unwrap(), WatchEvent::NodeDeleted);
}

#[tokio::test]
async fn test_watch_notified_on_session_close() {
    let ensemble = InMemoryEnsemble::new();
    let session = ensemble.session().unwrap();
    let (_, watch) = session.exists_watch("/never").await.unwrap();
    session.close().await;
    assert_eq!(watch.await.unwrap(), WatchEvent::SessionClosed);
    assert_eq!(session.get("/").await, Err(CoordinationError::Closed));
}

#[tokio::test]
async fn test_increment() {
    let ensemble = InMemoryEnsemble::new();
    let session = ensemble.session().unwrap();

    assert_eq!(session.increment("/c/counter", 5).await.unwrap(), (0, 5));
    assert_eq!(session.increment("/c/counter", -2).await.unwrap(), (5, 3));
    assert_eq!(session.get("/c/counter").await.unwrap(), b"3".to_vec());
}

#[tokio::test]
async fn test_fault_injection() {
    let ensemble = InMemoryEnsemble::new();
    let session = ensemble.session().unwrap();

    ensemble.fail_next(1);
    assert_eq!(
        session.exists("/").await,
        Err(CoordinationError::ConnectionLoss)
    );
    assert!(session.exists("/").await.unwrap());

    ensemble.disconnect_session(session.session_id());
    assert!(!session.is_connected());
    assert_eq!(
        session.exists("/").await,
        Err(CoordinationError::ConnectionLoss)
    );
    session.restart().await.unwrap();
    assert!(session.is_connected());

    ensemble.set_available(false);
    assert_eq!(session.exists("/").await, Err(CoordinationError::Unavailable));
    assert!(ensemble.session().is_err());
    ensemble.set_available(true);
    assert!(session.exists("/").await.unwrap());
}

#[tokio::test]
async fn test_dump() {
    let ensemble = InMemoryEnsemble::new();
    let session = ensemble.session().unwrap();
    session
        .create_all("/a/b", b"v", CreateMode::Persistent)
        .await
        .unwrap();
    session
        .create("/ab", b"", CreateMode::Persistent)
        .await
        .unwrap();

    assert_eq!(
        ensemble.dump("/a"),
        vec![
            ("/a".to_owned(), String::new()),
            ("/a/b".to_owned(), "v".to_owned())
        ]
    );
}
