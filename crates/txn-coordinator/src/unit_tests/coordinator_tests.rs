// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use coordination_client::InMemoryEnsemble;
use pretty_assertions::assert_eq;

use super::*;
use crate::batch::InMemoryBatchStore;
use crate::gc::GarbageCollector;
use crate::paths::GROOMER_LOCK_PATH;
use crate::test_utils::{
    key, new_coordinator, new_coordinator_with, test_config, LostReplyConnector, TENANT,
};

async fn setup() -> (InMemoryEnsemble, Arc<TransactionCoordinator>) {
    let ensemble = InMemoryEnsemble::new();
    let coordinator = new_coordinator(&ensemble, test_config()).await;
    (ensemble, coordinator)
}

fn lock_list(ensemble: &InMemoryEnsemble, coordinator: &TransactionCoordinator, txid: TxId) -> Vec<String> {
    ensemble
        .data(&coordinator.paths().lock_list(TENANT, txid))
        .map(|data| split_lock_list(&String::from_utf8_lossy(&data)))
        .unwrap_or_default()
}

#[tokio::test]
async fn test_begin_allocates_increasing_ids() {
    let (ensemble, coordinator) = setup().await;

    let first = coordinator.begin(TENANT, false).await.unwrap();
    let second = coordinator.begin(TENANT, true).await.unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    assert!(!coordinator.is_xg(TENANT, first).await.unwrap());
    assert!(coordinator.is_xg(TENANT, second).await.unwrap());
    assert!(ensemble.exists(&coordinator.paths().transaction(TENANT, first)));
    assert!(coordinator
        .transaction_start_time(TENANT, first)
        .await
        .unwrap()
        .is_some_and(|started| started > 0.0));
    assert_eq!(coordinator.metrics().transactions_begun.get(), 2);
}

#[tokio::test]
async fn test_begin_per_tenant_sequences() {
    let (_ensemble, coordinator) = setup().await;
    assert_eq!(coordinator.begin(TENANT, false).await.unwrap(), 1);
    assert_eq!(coordinator.begin("other-app", false).await.unwrap(), 1);
    assert_eq!(coordinator.begin(TENANT, false).await.unwrap(), 2);
}

#[tokio::test]
async fn test_lock_covers_whole_entity_group() {
    let (ensemble, coordinator) = setup().await;
    let owner = coordinator.begin(TENANT, false).await.unwrap();
    let other = coordinator.begin(TENANT, false).await.unwrap();

    assert!(coordinator
        .acquire_lock(TENANT, owner, &key("Guestbook:1/Greeting:5"))
        .await
        .unwrap());
    assert!(coordinator
        .acquire_lock(TENANT, owner, &key("Guestbook:1/Greeting:6"))
        .await
        .unwrap());
    assert_eq!(lock_list(&ensemble, &coordinator, owner).len(), 1);

    let group = coordinator.paths().group_lock(TENANT, &key("Guestbook:1"));
    assert_eq!(
        coordinator
            .acquire_lock(TENANT, other, &key("Guestbook:1/Greeting:6"))
            .await,
        Err(CoordinatorError::AlreadyLocked {
            path: group,
            holder: owner
        })
    );
    assert!(coordinator.is_in_transaction(TENANT, owner).await.unwrap());
    assert!(!coordinator.is_in_transaction(TENANT, other).await.unwrap());
}

#[tokio::test]
async fn test_cross_group_requires_xg() {
    let (_ensemble, coordinator) = setup().await;
    let txid = coordinator.begin(TENANT, false).await.unwrap();

    coordinator
        .acquire_lock(TENANT, txid, &key("Guestbook:1"))
        .await
        .unwrap();
    assert_eq!(
        coordinator
            .acquire_lock(TENANT, txid, &key("Guestbook:2"))
            .await,
        Err(CoordinatorError::CrossGroupNotAllowed { txid })
    );
}

#[tokio::test]
async fn test_xg_group_cap() {
    let (ensemble, coordinator) = setup().await;
    let txid = coordinator.begin(TENANT, true).await.unwrap();

    for group in 1..=5 {
        assert!(coordinator
            .acquire_lock(TENANT, txid, &key(&format!("Guestbook:{group}")))
            .await
            .unwrap());
    }
    assert_eq!(
        coordinator
            .acquire_lock(TENANT, txid, &key("Guestbook:6"))
            .await,
        Err(CoordinatorError::TooManyGroups { txid, max: 5 })
    );
    assert_eq!(lock_list(&ensemble, &coordinator, txid).len(), 5);
    assert!(!ensemble.exists(&coordinator.paths().group_lock(TENANT, &key("Guestbook:6"))));
}

#[tokio::test]
async fn test_unknown_or_failed_transaction_cannot_lock() {
    let (_ensemble, coordinator) = setup().await;
    assert_eq!(
        coordinator
            .acquire_lock(TENANT, 42, &key("Guestbook:1"))
            .await,
        Err(CoordinatorError::TransactionInvalid { txid: 42 })
    );

    let txid = coordinator.begin(TENANT, false).await.unwrap();
    assert!(coordinator
        .notify_failed_transaction(TENANT, txid)
        .await
        .unwrap());
    assert_eq!(
        coordinator
            .acquire_lock(TENANT, txid, &key("Guestbook:1"))
            .await,
        Err(CoordinatorError::TransactionBlacklisted { txid })
    );
    assert_eq!(
        coordinator.is_in_transaction(TENANT, txid).await,
        Err(CoordinatorError::TransactionBlacklisted { txid })
    );
}

#[tokio::test]
async fn test_release_then_reacquire() {
    let (ensemble, coordinator) = setup().await;
    let first = coordinator.begin(TENANT, false).await.unwrap();
    let second = coordinator.begin(TENANT, false).await.unwrap();
    let entity = key("Guestbook:1/Greeting:5");

    coordinator.acquire_lock(TENANT, first, &entity).await.unwrap();
    assert!(coordinator.release_lock(TENANT, first).await.unwrap());
    assert!(!ensemble.exists(&coordinator.paths().transaction(TENANT, first)));
    assert!(!ensemble.exists(&coordinator.paths().group_lock(TENANT, &entity)));

    assert!(coordinator.acquire_lock(TENANT, second, &entity).await.unwrap());
    assert_eq!(coordinator.get_current_transactions(TENANT).await.unwrap(), vec![second]);
}

#[tokio::test]
async fn test_release_without_locks() {
    let (ensemble, coordinator) = setup().await;
    let txid = coordinator.begin(TENANT, true).await.unwrap();

    assert!(!coordinator.release_lock(TENANT, txid).await.unwrap());
    assert!(!ensemble.exists(&coordinator.paths().transaction(TENANT, txid)));
    assert_eq!(
        coordinator.release_lock(TENANT, txid).await,
        Err(CoordinatorError::TransactionInvalid { txid })
    );
}

#[tokio::test]
async fn test_release_of_failed_transaction() {
    let (_ensemble, coordinator) = setup().await;
    let txid = coordinator.begin(TENANT, false).await.unwrap();
    coordinator
        .acquire_lock(TENANT, txid, &key("Guestbook:1"))
        .await
        .unwrap();
    coordinator
        .notify_failed_transaction(TENANT, txid)
        .await
        .unwrap();

    assert_eq!(
        coordinator.release_lock(TENANT, txid).await,
        Err(CoordinatorError::TransactionBlacklisted { txid })
    );
}

#[tokio::test]
async fn test_valid_transaction_id() {
    let (_ensemble, coordinator) = setup().await;
    let greeting = key("Guestbook:1/Greeting:5");
    let untouched = key("Guestbook:1/Greeting:6");

    assert_eq!(
        coordinator
            .get_valid_transaction_id(TENANT, 0, &greeting)
            .await
            .unwrap(),
        0
    );

    // In progress: readers get the version registered before the write.
    let writer = coordinator.begin(TENANT, false).await.unwrap();
    coordinator
        .register_updated_key(TENANT, writer, &greeting, 0)
        .await
        .unwrap();
    assert_eq!(
        coordinator
            .get_valid_transaction_id(TENANT, writer, &greeting)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        coordinator
            .get_valid_transaction_id(TENANT, writer, &untouched)
            .await
            .unwrap(),
        writer
    );

    // Committed: its own version is valid.
    coordinator.release_lock(TENANT, writer).await.unwrap();
    assert_eq!(
        coordinator
            .get_valid_transaction_id(TENANT, writer, &greeting)
            .await
            .unwrap(),
        writer
    );

    // Failed: the registered previous version wins.
    let failed = coordinator.begin(TENANT, false).await.unwrap();
    coordinator
        .register_updated_key(TENANT, failed, &greeting, writer)
        .await
        .unwrap();
    coordinator
        .notify_failed_transaction(TENANT, failed)
        .await
        .unwrap();
    assert_eq!(
        coordinator
            .get_valid_transaction_id(TENANT, failed, &greeting)
            .await
            .unwrap(),
        writer
    );
    assert_eq!(
        coordinator
            .get_valid_transaction_id(TENANT, failed, &untouched)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_register_updated_key() {
    let (ensemble, coordinator) = setup().await;
    let greeting = key("Guestbook:1/Greeting:5");
    let known = key("Guestbook:1/Greeting:6");
    let txid = coordinator.begin(TENANT, false).await.unwrap();

    coordinator
        .register_updated_key(TENANT, txid, &greeting, 3)
        .await
        .unwrap();
    coordinator
        .register_updated_key(TENANT, txid, &greeting, 4)
        .await
        .unwrap();
    assert_eq!(
        coordinator.get_updated_key_list(TENANT, txid).await.unwrap(),
        vec![(greeting.clone(), 3), (greeting.clone(), 4)]
    );
    assert_eq!(
        coordinator
            .get_valid_transaction_id(TENANT, txid, &greeting)
            .await
            .unwrap(),
        4
    );

    // An existing valid version entry is overwritten in place.
    coordinator.set_valid_version(TENANT, &known, 2).await.unwrap();
    coordinator
        .register_updated_key(TENANT, txid, &known, 5)
        .await
        .unwrap();
    assert_eq!(
        ensemble.data(&coordinator.paths().valid_version(TENANT, &known)),
        Some(b"5".to_vec())
    );
    assert_eq!(
        coordinator.get_updated_key_list(TENANT, txid).await.unwrap().len(),
        2
    );

    assert_eq!(
        coordinator
            .register_updated_key(TENANT, 77, &greeting, 1)
            .await,
        Err(CoordinatorError::TransactionInvalid { txid: 77 })
    );
}

#[tokio::test]
async fn test_notify_failed_transaction() {
    let (ensemble, coordinator) = setup().await;
    let greeting = key("Guestbook:1/Greeting:5");
    let newer = key("Guestbook:1/Greeting:6");
    let txid = coordinator.begin(TENANT, false).await.unwrap();
    let next = coordinator.begin(TENANT, false).await.unwrap();

    coordinator.acquire_lock(TENANT, txid, &greeting).await.unwrap();
    coordinator
        .register_updated_key(TENANT, txid, &greeting, 4)
        .await
        .unwrap();
    coordinator
        .register_updated_key(TENANT, txid, &newer, 1)
        .await
        .unwrap();
    // Recorded after registration, so it must survive the restore.
    coordinator.set_valid_version(TENANT, &newer, 9).await.unwrap();

    assert!(coordinator
        .notify_failed_transaction(TENANT, txid)
        .await
        .unwrap());
    assert!(coordinator.is_blacklisted(TENANT, txid).await.unwrap());
    assert!(!ensemble.exists(&coordinator.paths().transaction(TENANT, txid)));
    assert_eq!(
        ensemble.data(&coordinator.paths().valid_version(TENANT, &greeting)),
        Some(b"4".to_vec())
    );
    assert_eq!(
        ensemble.data(&coordinator.paths().valid_version(TENANT, &newer)),
        Some(b"9".to_vec())
    );
    assert!(coordinator.acquire_lock(TENANT, next, &greeting).await.unwrap());

    assert!(!coordinator
        .notify_failed_transaction(TENANT, txid)
        .await
        .unwrap());
    assert_eq!(coordinator.metrics().transactions_invalidated.get(), 1);
}

#[tokio::test]
async fn test_current_transactions() {
    let (_ensemble, coordinator) = setup().await;
    assert!(coordinator
        .get_current_transactions(TENANT)
        .await
        .unwrap()
        .is_empty());

    let first = coordinator.begin(TENANT, false).await.unwrap();
    let second = coordinator.begin(TENANT, true).await.unwrap();
    let third = coordinator.begin(TENANT, false).await.unwrap();
    coordinator.release_lock(TENANT, second).await.unwrap();
    // Bookkeeping nodes next to the transactions are not transactions.
    coordinator
        .notify_failed_transaction(TENANT, first)
        .await
        .unwrap();

    assert_eq!(
        coordinator.get_current_transactions(TENANT).await.unwrap(),
        vec![third]
    );
    assert_eq!(
        coordinator.transaction_start_time(TENANT, second).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_counters() {
    let (_ensemble, coordinator) = setup().await;
    let counter = "/appscale/counters/entities";
    assert_eq!(
        coordinator.increment_and_get_counter(counter, 1).await.unwrap(),
        (0, 1)
    );
    assert_eq!(
        coordinator.increment_and_get_counter(counter, 2).await.unwrap(),
        (1, 3)
    );
    assert_eq!(
        coordinator.increment_and_get_counter(counter, -3).await.unwrap(),
        (3, 0)
    );
}

#[tokio::test]
async fn test_lock_with_path() {
    let ensemble = InMemoryEnsemble::new();
    let first = new_coordinator(&ensemble, test_config()).await;
    let second = new_coordinator(&ensemble, test_config()).await;

    assert!(first.get_lock_with_path(GROOMER_LOCK_PATH).await.unwrap());
    assert!(!second.get_lock_with_path(GROOMER_LOCK_PATH).await.unwrap());

    first.release_lock_with_path(GROOMER_LOCK_PATH).await.unwrap();
    assert_eq!(
        first.release_lock_with_path(GROOMER_LOCK_PATH).await,
        Err(CoordinatorError::LockNotHeld {
            path: GROOMER_LOCK_PATH.to_owned()
        })
    );
    assert!(second.get_lock_with_path(GROOMER_LOCK_PATH).await.unwrap());

    // Held through an ephemeral node: gone with its session.
    second.handle().close().await;
    assert!(!ensemble.exists(GROOMER_LOCK_PATH));
}

#[tokio::test]
async fn test_acquire_locks() {
    let (ensemble, coordinator) = setup().await;
    let txid = coordinator.begin(TENANT, true).await.unwrap();
    let keys = [
        key("Guestbook:2/Greeting:1"),
        key("Guestbook:1"),
        key("Guestbook:1/Greeting:3"),
    ];
    let cancel = CancellationToken::new();

    let groups = coordinator
        .acquire_locks(TENANT, txid, &keys, None, &cancel)
        .await
        .unwrap();
    assert_eq!(
        groups,
        vec![
            coordinator.paths().group_lock(TENANT, &key("Guestbook:1")),
            coordinator.paths().group_lock(TENANT, &key("Guestbook:2")),
        ]
    );
    assert_eq!(lock_list(&ensemble, &coordinator, txid).len(), 2);

    // Already held, in either mode.
    assert!(coordinator
        .acquire_lock(TENANT, txid, &key("Guestbook:2/Greeting:9"))
        .await
        .unwrap());
    assert_eq!(
        coordinator
            .acquire_locks(TENANT, txid, &keys[..1], None, &cancel)
            .await
            .unwrap()
            .len(),
        2
    );

    assert!(coordinator.release_lock(TENANT, txid).await.unwrap());
    for group in groups {
        assert!(!ensemble.exists(&group));
    }
}

#[tokio::test]
async fn test_acquire_locks_limits() {
    let (_ensemble, coordinator) = setup().await;
    let cancel = CancellationToken::new();
    let single = coordinator.begin(TENANT, false).await.unwrap();
    assert_eq!(
        coordinator
            .acquire_locks(
                TENANT,
                single,
                &[key("Guestbook:1"), key("Guestbook:2")],
                None,
                &cancel
            )
            .await,
        Err(CoordinatorError::CrossGroupNotAllowed { txid: single })
    );

    let xg = coordinator.begin(TENANT, true).await.unwrap();
    let keys: Vec<EntityKey> = (1..=6).map(|group| key(&format!("Guestbook:{group}"))).collect();
    assert_eq!(
        coordinator
            .acquire_locks(TENANT, xg, &keys, None, &cancel)
            .await,
        Err(CoordinatorError::TooManyGroups { txid: xg, max: 5 })
    );
    assert!(!coordinator.is_in_transaction(TENANT, xg).await.unwrap());
}

#[tokio::test]
async fn test_acquire_locks_times_out_behind_holder() {
    let (ensemble, coordinator) = setup().await;
    let holder = coordinator.begin(TENANT, false).await.unwrap();
    let waiter = coordinator.begin(TENANT, true).await.unwrap();
    coordinator
        .acquire_lock(TENANT, holder, &key("Guestbook:1"))
        .await
        .unwrap();

    assert_eq!(
        coordinator
            .acquire_locks(
                TENANT,
                waiter,
                &[key("Guestbook:1"), key("Guestbook:2")],
                Some(Duration::from_millis(100)),
                &CancellationToken::new(),
            )
            .await,
        Err(CoordinatorError::LockTimeout)
    );
    assert!(!coordinator.is_in_transaction(TENANT, waiter).await.unwrap());
    assert!(!ensemble.exists(&coordinator.paths().group_lock(TENANT, &key("Guestbook:2"))));
}

#[tokio::test]
async fn test_acquire_locks_waits_for_release() {
    let (_ensemble, coordinator) = setup().await;
    let holder = coordinator.begin(TENANT, false).await.unwrap();
    let waiter = coordinator.begin(TENANT, true).await.unwrap();
    coordinator
        .acquire_lock(TENANT, holder, &key("Guestbook:1"))
        .await
        .unwrap();

    let task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .acquire_locks(
                    TENANT,
                    waiter,
                    &[key("Guestbook:1"), key("Guestbook:2")],
                    None,
                    &CancellationToken::new(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    coordinator.release_lock(TENANT, holder).await.unwrap();
    assert_eq!(task.await.unwrap().unwrap().len(), 2);
    assert!(coordinator.is_in_transaction(TENANT, waiter).await.unwrap());
}

#[tokio::test]
async fn test_lost_contender_reply_leaves_nothing_behind() {
    let ensemble = InMemoryEnsemble::new();
    let connector = LostReplyConnector::new(&ensemble);
    let coordinator = new_coordinator_with(connector.clone(), test_config()).await;
    let other = new_coordinator(&ensemble, test_config()).await;
    let keys = [key("Guestbook:1"), key("Guestbook:2")];
    let cancel = CancellationToken::new();

    let txid = coordinator.begin(TENANT, true).await.unwrap();
    connector.lose_next_reply(CreateMode::EphemeralSequential);
    let held = coordinator
        .acquire_locks(TENANT, txid, &keys, None, &cancel)
        .await
        .unwrap();
    assert!(!connector.is_armed());
    assert_eq!(held.len(), 2);
    for key in &keys {
        let group = coordinator.paths().group_lock(TENANT, key);
        assert_eq!(ensemble.dump(&group).len(), 2);
    }

    assert!(coordinator.release_lock(TENANT, txid).await.unwrap());
    for key in &keys {
        assert_eq!(ensemble.dump(&coordinator.paths().group_lock(TENANT, key)), vec![]);
    }

    let next = other.begin(TENANT, true).await.unwrap();
    other
        .acquire_locks(TENANT, next, &keys, Some(Duration::from_millis(500)), &cancel)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_lost_allocation_reply() {
    let ensemble = InMemoryEnsemble::new();
    let connector = LostReplyConnector::new(&ensemble);
    let coordinator = new_coordinator_with(connector.clone(), test_config()).await;

    assert_eq!(coordinator.begin(TENANT, false).await.unwrap(), 1);
    connector.lose_next_reply(CreateMode::PersistentSequential);
    assert_eq!(coordinator.begin(TENANT, false).await.unwrap(), 3);
    assert!(!connector.is_armed());

    // The node made by the lost create is unowned and goes once it expires.
    assert_eq!(
        coordinator.get_current_transactions(TENANT).await.unwrap(),
        vec![1, 2, 3]
    );
    let gc = GarbageCollector::new(coordinator.clone(), Arc::new(InMemoryBatchStore::new()));
    let report = gc.run_once_at(unix_time_secs() + 1_000.0).await.unwrap();
    assert_eq!(report.tenants[0].1.collected, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unreadable_start_time_counts_as_now() {
    let (ensemble, coordinator) = setup().await;
    let txid = coordinator.begin(TENANT, false).await.unwrap();
    coordinator
        .handle()
        .set(&coordinator.paths().transaction(TENANT, txid), b"yesterday")
        .await
        .unwrap();

    let before = unix_time_secs();
    let started = coordinator
        .transaction_start_time(TENANT, txid)
        .await
        .unwrap()
        .unwrap();
    assert!(started >= before);

    let gc = GarbageCollector::new(coordinator.clone(), Arc::new(InMemoryBatchStore::new()));
    let report = gc.run_once().await.unwrap();
    assert!(report.tenants[0].1.collected.is_empty());
    assert!(ensemble.exists(&coordinator.paths().transaction(TENANT, txid)));
}
