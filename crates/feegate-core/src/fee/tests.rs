//! Tests for the fee module.

use chrono::{Duration, TimeZone, Utc};

use super::error::{FeeError, LifecycleError, ParseError};
use super::lifecycle::{
    FeeSignal, REASON_FAILED_ON_CHAIN, REASON_LOST, Transition, is_adoptable, plan,
};
use super::state::{
    FeeAmount, FeeRecord, FeeStatus, FeeTerms, OnChainResult, OracleReport, Scope, ScopeId,
    TxReference,
};

fn terms() -> FeeTerms {
    FeeTerms {
        asset: "0xusdc".to_string(),
        amount: FeeAmount::new(100),
        destination: "0xtreasury".to_string(),
    }
}

fn record(status: FeeStatus, tx: Option<&str>) -> FeeRecord {
    let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let mut record = FeeRecord::new_pending(
        Scope::new(ScopeId::new(), "vault-1", "listing-1"),
        terms(),
        created,
    );
    record.status = status;
    record.tx_reference = tx.map(|t| TxReference::new(t).unwrap());
    record
}

fn report(tx: &str, on_chain: OnChainResult, lost: bool) -> OracleReport {
    OracleReport {
        tx_reference: TxReference::new(tx).unwrap(),
        on_chain,
        lost,
        broadcast_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap()),
        confirmations: Some(12),
    }
}

// =============================================================================
// State types
// =============================================================================

#[test]
fn test_status_round_trips_persisted_literals() {
    for status in FeeStatus::ALL {
        assert_eq!(status.as_str().parse::<FeeStatus>().unwrap(), status);
    }
    assert!(matches!(
        "PAID".parse::<FeeStatus>(),
        Err(ParseError::InvalidStatus { .. })
    ));
}

#[test]
fn test_transition_table() {
    use FeeStatus::{Failed, Paid, Pending, Submitted};

    let allowed = [
        (Pending, Submitted),
        (Pending, Failed),
        (Submitted, Paid),
        (Submitted, Failed),
    ];
    for from in FeeStatus::ALL {
        for to in FeeStatus::ALL {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
}

#[test]
fn test_terminal_and_open_statuses() {
    assert!(FeeStatus::Paid.is_terminal());
    assert!(FeeStatus::Failed.is_terminal());
    assert!(!FeeStatus::Submitted.is_terminal());
    assert!(FeeStatus::Paid.is_open());
    assert!(!FeeStatus::Failed.is_open());
}

#[test]
fn test_amount_rejects_signs_and_garbage() {
    assert_eq!("100".parse::<FeeAmount>().unwrap(), FeeAmount::new(100));
    assert_eq!(
        "340282366920938463463374607431768211455"
            .parse::<FeeAmount>()
            .unwrap()
            .base_units(),
        u128::MAX
    );
    for bad in ["", "+1", "-1", "1.5", "0x10", "340282366920938463463374607431768211456"] {
        assert!(bad.parse::<FeeAmount>().is_err(), "{bad:?}");
    }
}

#[test]
fn test_amount_serializes_as_string() {
    let json = serde_json::to_string(&FeeAmount::new(u128::MAX)).unwrap();
    assert_eq!(json, "\"340282366920938463463374607431768211455\"");
    let back: FeeAmount = serde_json::from_str(&json).unwrap();
    assert_eq!(back.base_units(), u128::MAX);
}

#[test]
fn test_tx_reference_rejects_blank() {
    assert_eq!(TxReference::new("  "), Err(ParseError::EmptyTxReference));
    assert_eq!(TxReference::new(" 0xabc ").unwrap().as_str(), "0xabc");
    assert!(serde_json::from_str::<TxReference>("\"\"").is_err());
}

#[test]
fn test_lease_liveness() {
    let mut rec = record(FeeStatus::Pending, None);
    let now = rec.created_at;
    assert!(!rec.has_live_lease(now));
    rec.execution_lease_until = Some(now + Duration::seconds(30));
    assert!(rec.has_live_lease(now));
    assert!(!rec.has_live_lease(now + Duration::seconds(30)));
}

// =============================================================================
// Execution signals
// =============================================================================

#[test]
fn test_execution_requested_on_pending_is_admitted() {
    let rec = record(FeeStatus::Pending, None);
    assert_eq!(plan(&rec, &FeeSignal::ExecutionRequested), Ok(None));
}

#[test]
fn test_execution_requested_on_non_pending_is_rejected() {
    for status in [FeeStatus::Submitted, FeeStatus::Paid, FeeStatus::Failed] {
        let rec = record(status, Some("0xabc"));
        let err = plan(&rec, &FeeSignal::ExecutionRequested).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::NotPending {
                fee_id: rec.id,
                status
            }
        );
    }
}

#[test]
fn test_broadcast_succeeded_plans_submitted() {
    let rec = record(FeeStatus::Pending, None);
    let tx = TxReference::new("0xabc").unwrap();
    let planned = plan(
        &rec,
        &FeeSignal::BroadcastSucceeded {
            tx_reference: tx.clone(),
        },
    )
    .unwrap()
    .unwrap();
    assert_eq!(planned, Transition::submitted(rec.id, tx));
    assert!(planned.validate().is_ok());
}

#[test]
fn test_submitted_record_is_never_rebroadcast() {
    let rec = record(FeeStatus::Submitted, Some("0xabc"));
    let signal = FeeSignal::BroadcastSucceeded {
        tx_reference: TxReference::new("0xother").unwrap(),
    };
    assert!(matches!(
        plan(&rec, &signal),
        Err(LifecycleError::NotPending { .. })
    ));
}

#[test]
fn test_execution_failed_plans_failed_with_reason() {
    let rec = record(FeeStatus::Pending, None);
    let planned = plan(
        &rec,
        &FeeSignal::ExecutionFailed {
            reason: "build rejected".to_string(),
        },
    )
    .unwrap()
    .unwrap();
    assert_eq!(planned.from, FeeStatus::Pending);
    assert_eq!(planned.to, FeeStatus::Failed);
    assert_eq!(planned.fields.failure_reason.as_deref(), Some("build rejected"));
}

// =============================================================================
// Oracle signals
// =============================================================================

#[test]
fn test_oracle_success_plans_paid_with_confirmations() {
    let rec = record(FeeStatus::Submitted, Some("0xabc"));
    let planned = plan(
        &rec,
        &FeeSignal::OracleObserved(report("0xabc", OnChainResult::Success, false)),
    )
    .unwrap()
    .unwrap();
    assert_eq!(planned, Transition::paid(rec.id, Some(12)));
}

#[test]
fn test_oracle_fail_and_lost_plan_failed() {
    let rec = record(FeeStatus::Submitted, Some("0xdef"));

    let failed = plan(
        &rec,
        &FeeSignal::OracleObserved(report("0xdef", OnChainResult::Fail, false)),
    )
    .unwrap()
    .unwrap();
    assert_eq!(
        failed.fields.failure_reason.as_deref(),
        Some(REASON_FAILED_ON_CHAIN)
    );

    let lost = plan(
        &rec,
        &FeeSignal::OracleObserved(report("0xdef", OnChainResult::Unknown, true)),
    )
    .unwrap()
    .unwrap();
    assert_eq!(lost.to, FeeStatus::Failed);
    assert_eq!(lost.fields.failure_reason.as_deref(), Some(REASON_LOST));
}

#[test]
fn test_unindexed_submitted_transaction_is_lost() {
    let rec = record(FeeStatus::Submitted, Some("0xabc"));
    let lost = plan(&rec, &FeeSignal::TransactionUnindexed)
        .unwrap()
        .unwrap();
    assert_eq!(lost.from, FeeStatus::Submitted);
    assert_eq!(lost.to, FeeStatus::Failed);
    assert_eq!(lost.fields.failure_reason.as_deref(), Some(REASON_LOST));

    for status in [FeeStatus::Pending, FeeStatus::Paid, FeeStatus::Failed] {
        let rec = record(status, None);
        assert_eq!(plan(&rec, &FeeSignal::TransactionUnindexed), Ok(None));
    }
}

#[test]
fn test_oracle_unknown_is_noop() {
    let rec = record(FeeStatus::Submitted, Some("0xabc"));
    let signal = FeeSignal::OracleObserved(report("0xabc", OnChainResult::Unknown, false));
    assert_eq!(plan(&rec, &signal), Ok(None));
}

#[test]
fn test_oracle_report_for_other_tx_is_ignored() {
    let rec = record(FeeStatus::Submitted, Some("0xabc"));
    let signal = FeeSignal::OracleObserved(report("0xzzz", OnChainResult::Success, false));
    assert_eq!(plan(&rec, &signal), Ok(None));
}

#[test]
fn test_oracle_on_terminal_record_is_noop() {
    for status in [FeeStatus::Paid, FeeStatus::Failed] {
        let rec = record(status, Some("0xabc"));
        let signal = FeeSignal::OracleObserved(report("0xabc", OnChainResult::Fail, false));
        assert_eq!(plan(&rec, &signal), Ok(None));
    }
}

// =============================================================================
// Adoption
// =============================================================================

#[test]
fn test_pending_adopts_live_report_broadcast_after_creation() {
    let rec = record(FeeStatus::Pending, None);
    let signal = FeeSignal::OracleObserved(report("0xabc", OnChainResult::Unknown, false));
    let planned = plan(&rec, &signal).unwrap().unwrap();
    assert_eq!(
        planned,
        Transition::submitted(rec.id, TxReference::new("0xabc").unwrap())
    );
}

#[test]
fn test_pending_does_not_adopt_older_or_dead_reports() {
    let rec = record(FeeStatus::Pending, None);

    let mut older = report("0xold", OnChainResult::Success, false);
    older.broadcast_at = Some(rec.created_at - Duration::minutes(1));
    assert!(!is_adoptable(&rec, &older));

    let mut undated = report("0xnodate", OnChainResult::Success, false);
    undated.broadcast_at = None;
    assert!(!is_adoptable(&rec, &undated));

    assert!(!is_adoptable(&rec, &report("0xf", OnChainResult::Fail, false)));
    assert!(!is_adoptable(&rec, &report("0xl", OnChainResult::Unknown, true)));
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_lifecycle_errors_map_to_fee_errors() {
    let rec = record(FeeStatus::Submitted, Some("0xabc"));
    let err: FeeError = plan(&rec, &FeeSignal::ExecutionRequested)
        .unwrap_err()
        .into();
    assert!(err.is_conflict());
    assert!(!err.is_retryable());

    let illegal = Transition::paid(rec.id, None);
    let illegal = Transition {
        from: FeeStatus::Paid,
        ..illegal
    };
    let err: FeeError = illegal.validate().unwrap_err().into();
    assert!(matches!(err, FeeError::Permanent(_)));
}

#[test]
fn test_transient_is_retryable() {
    assert!(FeeError::Transient("rpc timeout".into()).is_retryable());
    assert!(!FeeError::Permanent("bad".into()).is_retryable());
    assert!(!FeeError::not_found("listing fee", "x").is_retryable());
}

mod properties {
    use proptest::prelude::*;

    use super::*;

    fn any_status() -> impl Strategy<Value = FeeStatus> {
        prop::sample::select(FeeStatus::ALL.to_vec())
    }

    fn any_on_chain() -> impl Strategy<Value = OnChainResult> {
        prop::sample::select(vec![
            OnChainResult::Success,
            OnChainResult::Fail,
            OnChainResult::Unknown,
        ])
    }

    fn any_signal() -> impl Strategy<Value = FeeSignal> {
        prop_oneof![
            Just(FeeSignal::ExecutionRequested),
            Just(FeeSignal::TransactionUnindexed),
            "0x[0-9a-f]{1,4}".prop_map(|tx| FeeSignal::BroadcastSucceeded {
                tx_reference: TxReference::new(tx).unwrap(),
            }),
            "[a-z ]{1,12}".prop_map(|reason| FeeSignal::ExecutionFailed { reason }),
            ("0x[0-9a-f]{1,2}", any_on_chain(), any::<bool>(), -600i64..600).prop_map(
                |(tx, on_chain, lost, offset)| {
                    let mut report = report(&tx, on_chain, lost);
                    report.broadcast_at = Some(
                        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                            + Duration::seconds(offset),
                    );
                    FeeSignal::OracleObserved(report)
                }
            ),
        ]
    }

    proptest! {
        #[test]
        fn prop_planned_transitions_follow_table(
            status in any_status(),
            tx in prop::option::of("0x[0-9a-f]{1,2}"),
            signal in any_signal(),
        ) {
            let record = record(status, tx.as_deref());
            if let Ok(Some(transition)) = plan(&record, &signal) {
                prop_assert_eq!(transition.fee_id, record.id);
                prop_assert_eq!(transition.from, record.status);
                prop_assert!(record.status.can_transition_to(transition.to));
                prop_assert!(transition.validate().is_ok());
                prop_assert!(!record.status.is_terminal());
            }
        }

        #[test]
        fn prop_status_walk_is_monotonic(signals in prop::collection::vec(any_signal(), 0..12)) {
            let mut record = record(FeeStatus::Pending, None);
            let mut seen = vec![record.status];
            for signal in &signals {
                if let Ok(Some(transition)) = plan(&record, signal) {
                    record.status = transition.to;
                    if let Some(tx) = transition.fields.tx_reference {
                        record.tx_reference = Some(tx);
                    }
                    seen.push(record.status);
                }
            }
            for pair in seen.windows(2) {
                prop_assert!(pair[0].can_transition_to(pair[1]));
            }
            prop_assert!(seen.len() <= 3);
        }
    }
}
