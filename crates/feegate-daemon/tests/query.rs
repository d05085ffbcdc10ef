//! Query service and the queued execution path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Harness, PAYER, ScriptedSettlement, TARGET, terms};
use feegate_core::collaborators::ExecutionQueue;
use feegate_core::fee::Transition;
use feegate_core::{FeeError, FeeId, FeeStatus, ScopeId};
use feegate_daemon::policy::upsert_policy;
use feegate_daemon::query::QueryService;
use feegate_daemon::queue::{ExecutionConsumer, channel};
use feegate_daemon::state::shutdown_channel;

fn query_service(
    harness: &Harness,
) -> (
    QueryService,
    tokio::sync::mpsc::Receiver<feegate_core::collaborators::ExecutionRequest>,
) {
    let (queue, rx) = channel(8);
    let queue: Arc<dyn ExecutionQueue> = Arc::new(queue);
    let service = QueryService::new(
        harness.store.clone(),
        harness.policies.clone(),
        queue,
        terms(),
        Duration::from_secs(5),
    );
    (service, rx)
}

#[tokio::test]
async fn test_lookups() {
    let harness = Harness::in_memory();
    let (query, _rx) = query_service(&harness);

    assert!(matches!(
        query.get_by_id(FeeId::new()).await,
        Err(FeeError::NotFound { .. })
    ));
    assert!(matches!(
        query.get_by_scope(PAYER, TARGET).await,
        Err(FeeError::NotFound { .. })
    ));

    let scope = harness.add_policy();
    let created = query.get_or_create_for_scope(scope.scope_id).await.unwrap();
    assert_eq!(created.status, FeeStatus::Pending);
    assert_eq!(query.get_by_id(created.id).await.unwrap(), created);
    assert_eq!(query.get_by_scope(PAYER, TARGET).await.unwrap().id, created.id);

    let view = query.view(created.id).await.unwrap();
    assert_eq!(view.payment.destination, "D");
    assert_eq!(view.payment.amount, "100");
}

#[tokio::test]
async fn test_get_or_create_for_scope() {
    let harness = Harness::in_memory();
    let (query, _rx) = query_service(&harness);

    assert!(matches!(
        query.get_or_create_for_scope(ScopeId::new()).await,
        Err(FeeError::NotFound { .. })
    ));

    let targetless = ScopeId::new();
    upsert_policy(&harness.db, targetless, PAYER, None, true).unwrap();
    assert!(matches!(
        query.get_or_create_for_scope(targetless).await,
        Err(FeeError::Permanent(_))
    ));

    let scope = harness.add_policy();
    let first = query.get_or_create_for_scope(scope.scope_id).await.unwrap();
    let again = query.get_or_create_for_scope(scope.scope_id).await.unwrap();
    assert_eq!(first.id, again.id);

    // A failed fee is replaced on the next lookup.
    let failed = Transition::failed(first.id, FeeStatus::Pending, "insufficient balance");
    assert!(harness.store.transition(&failed, Utc::now()).unwrap());
    let replacement = query.get_or_create_for_scope(scope.scope_id).await.unwrap();
    assert_ne!(replacement.id, first.id);
    assert_eq!(replacement.status, FeeStatus::Pending);
}

#[tokio::test]
async fn test_request_execution_preconditions() {
    let harness = Harness::in_memory();
    let (query, mut rx) = query_service(&harness);
    let scope = harness.add_policy();
    let record = query.get_or_create_for_scope(scope.scope_id).await.unwrap();

    assert!(matches!(
        query.request_execution(FeeId::new()).await,
        Err(FeeError::NotFound { .. })
    ));

    let request = query.request_execution(record.id).await.unwrap();
    assert_eq!(request.fee_id, record.id);
    assert_eq!(rx.recv().await, Some(request));

    let now = Utc::now();
    assert!(harness
        .store
        .try_claim_execution(record.id, now, now + chrono::Duration::minutes(5))
        .unwrap());
    let FeeError::Conflict { reason, .. } = query.request_execution(record.id).await.unwrap_err()
    else {
        panic!("expected conflict");
    };
    assert_eq!(reason, "execution already in progress");

    let failed = Transition::failed(record.id, FeeStatus::Pending, "insufficient balance");
    assert!(harness.store.transition(&failed, Utc::now()).unwrap());
    let FeeError::Conflict { status, reason, .. } =
        query.request_execution(record.id).await.unwrap_err()
    else {
        panic!("expected conflict");
    };
    assert_eq!(status, FeeStatus::Failed);
    assert_eq!(reason, "listing fee is not in pending state");
}

#[tokio::test]
async fn test_request_execution_without_consumer_is_transient() {
    let harness = Harness::in_memory();
    let (query, rx) = query_service(&harness);
    drop(rx);
    let scope = harness.add_policy();
    let record = query.get_or_create_for_scope(scope.scope_id).await.unwrap();

    let err = query.request_execution(record.id).await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_queued_execution_is_consumed() {
    let harness = Harness::in_memory();
    let (query, rx) = query_service(&harness);
    let scope = harness.add_policy();
    let record = query.get_or_create_for_scope(scope.scope_id).await.unwrap();

    let settlement = ScriptedSettlement::succeeding("0xabc");
    let executor = Arc::new(harness.executor(settlement.clone()));
    let (trigger, shutdown) = shutdown_channel();
    let consumer = tokio::spawn(ExecutionConsumer::new(rx, executor).run(shutdown));

    query.request_execution(record.id).await.unwrap();

    let submitted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = query.get_by_id(record.id).await.unwrap();
            if current.status == FeeStatus::Submitted {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(submitted.tx_reference.unwrap().as_str(), "0xabc");
    assert_eq!(settlement.broadcasts(), 1);

    // Requests for a submitted fee are refused.
    let err = query.request_execution(record.id).await.unwrap_err();
    assert!(err.is_conflict());

    trigger.request_shutdown();
    consumer.await.unwrap();
}
