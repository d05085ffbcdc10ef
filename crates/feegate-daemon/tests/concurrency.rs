//! Races between independent writers on one database file.
//!
//! Each writer gets its own connection, the way separate daemon processes
//! would.

mod common;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use common::{BroadcastBehavior, Harness, ScriptedSettlement, terms};
use feegate_core::fee::Transition;
use feegate_core::{FeeError, FeeStatus, FeeStore, Scope, ScopeId, TxReference};
use feegate_daemon::db::{DEFAULT_BUSY_TIMEOUT, Database};
use feegate_daemon::executor::ExecutionOutcome;
use feegate_daemon::store::SqliteFeeStore;
use proptest::prelude::*;

fn open_handles(path: &Path, count: usize) -> Vec<Arc<SqliteFeeStore>> {
    (0..count)
        .map(|_| Arc::new(SqliteFeeStore::open(path, DEFAULT_BUSY_TIMEOUT).unwrap()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_concurrent_create_yields_one_record(threads in 2usize..8) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fees.db");
        let handles = open_handles(&path, 2);
        let scope = Scope::new(ScopeId::new(), "vault-1", "listing-1");
        let barrier = Arc::new(Barrier::new(threads));

        let workers: Vec<_> = (0..threads)
            .map(|i| {
                let store = Arc::clone(&handles[i % handles.len()]);
                let scope = scope.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.create_if_absent(&scope, &terms(), Utc::now()).unwrap()
                })
            })
            .collect();

        let ids: HashSet<_> = workers
            .into_iter()
            .map(|w| w.join().unwrap().id)
            .collect();
        prop_assert_eq!(ids.len(), 1);

        let pending = handles[0].list_by_status(FeeStatus::Pending).unwrap();
        prop_assert_eq!(pending.len(), 1);
        prop_assert!(ids.contains(&pending[0].id));
    }
}

#[test]
fn test_concurrent_transitions_apply_once() {
    let dir = tempfile::tempdir().unwrap();
    let handles = open_handles(&dir.path().join("fees.db"), 2);
    let scope = Scope::new(ScopeId::new(), "vault-1", "listing-1");
    let record = handles[0]
        .create_if_absent(&scope, &terms(), Utc::now())
        .unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = handles
        .iter()
        .enumerate()
        .map(|(i, store)| {
            let store = Arc::clone(store);
            let barrier = Arc::clone(&barrier);
            let transition =
                Transition::submitted(record.id, TxReference::new(format!("0x{i}")).unwrap());
            thread::spawn(move || {
                barrier.wait();
                store.transition(&transition, Utc::now()).unwrap()
            })
        })
        .collect();

    let applied: Vec<bool> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(applied.iter().filter(|applied| **applied).count(), 1);

    let stored = handles[1].get(record.id).unwrap().unwrap();
    assert_eq!(stored.status, FeeStatus::Submitted);
    let winner = applied.iter().position(|applied| *applied).unwrap();
    assert_eq!(
        stored.tx_reference.as_ref().map(TxReference::as_str),
        Some(format!("0x{winner}").as_str())
    );
}

#[tokio::test]
async fn test_concurrent_executors_broadcast_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fees.db");
    let first = Harness::from_db(Database::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap());
    let second = Harness::from_db(Database::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap());
    let scope = first.add_policy();
    let record = first
        .store
        .create_if_absent(&scope, &terms(), Utc::now())
        .unwrap();

    let settlement = ScriptedSettlement::with(BroadcastBehavior::Succeed {
        tx: "0xabc".to_string(),
        delay: Duration::from_millis(100),
    });
    let a = first.executor(settlement.clone());
    let b = second.executor(settlement.clone());

    let (left, right) = tokio::join!(a.execute(record.id), b.execute(record.id));
    let (ok, err) = match (left, right) {
        (Ok(outcome), Err(err)) | (Err(err), Ok(outcome)) => (outcome, err),
        other => panic!("expected one success and one conflict, got {other:?}"),
    };

    assert!(matches!(ok, ExecutionOutcome::Submitted { .. }));
    let FeeError::Conflict { reason, .. } = err else {
        panic!("expected conflict, got {err:?}");
    };
    assert!(
        reason == "execution already in progress"
            || reason == "listing fee is not in pending state"
    );
    assert_eq!(settlement.broadcasts(), 1);

    let stored = second.store.get(record.id).unwrap().unwrap();
    assert_eq!(stored.status, FeeStatus::Submitted);
    assert_eq!(stored.tx_reference.as_ref().map(TxReference::as_str), Some("0xabc"));
}
