mod common;

use common::{CATEGORY, PARTICIPANT, card_event, harness, initiate};
use planpay::application::reconciler::ReconcileOutcome;
use planpay::domain::budget::Balance;
use planpay::domain::rail::RailKind;
use planpay::domain::transaction::TransactionStatus;
use planpay::error::PaymentError;
use rand::seq::SliceRandom;
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_replayed_confirmation_commits_once() {
    let h = harness(dec!(500)).await;
    let initiated = initiate(&h, dec!(100)).await;
    let intent = initiated.rail_artifact.rail_reference().to_string();

    let (raw, headers) = card_event(&h.rails, "evt_1", &intent, "succeeded");
    let mut applied = 0;
    for _ in 0..5 {
        let outcome = h
            .engine
            .ingest_webhook(RailKind::Card, &raw, &headers)
            .await
            .unwrap();
        if outcome.applied() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    let tx = h
        .engine
        .transaction_for(PARTICIPANT, &initiated.transaction.id)
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);

    let category = h.engine.category_for(PARTICIPANT, CATEGORY).await.unwrap();
    assert_eq!(category.spent_amount, Balance(dec!(100)));
    assert_eq!(category.remaining_amount, Balance(dec!(400)));
    assert!(category.is_balanced());
}

#[tokio::test]
async fn test_late_pending_after_confirmation_is_ignored() {
    let h = harness(dec!(500)).await;
    let initiated = initiate(&h, dec!(60)).await;
    let intent = initiated.rail_artifact.rail_reference().to_string();

    let (confirmed, confirmed_headers) = card_event(&h.rails, "evt_1", &intent, "succeeded");
    let (pending, pending_headers) = card_event(&h.rails, "evt_2", &intent, "processing");

    h.engine
        .ingest_webhook(RailKind::Card, &confirmed, &confirmed_headers)
        .await
        .unwrap();
    let outcome = h
        .engine
        .ingest_webhook(RailKind::Card, &pending, &pending_headers)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Transaction {
            transaction_id: initiated.transaction.id.clone(),
            status: TransactionStatus::Completed,
            applied: false,
        }
    );
    let category = h.engine.category_for(PARTICIPANT, CATEGORY).await.unwrap();
    assert_eq!(category.spent_amount, Balance(dec!(60)));
}

#[tokio::test]
async fn test_confirmation_after_failure_changes_nothing() {
    let h = harness(dec!(500)).await;
    let initiated = initiate(&h, dec!(75)).await;
    let intent = initiated.rail_artifact.rail_reference().to_string();

    let (failed, failed_headers) = card_event(&h.rails, "evt_1", &intent, "payment_failed");
    let (confirmed, confirmed_headers) = card_event(&h.rails, "evt_2", &intent, "succeeded");

    h.engine
        .ingest_webhook(RailKind::Card, &failed, &failed_headers)
        .await
        .unwrap();
    let outcome = h
        .engine
        .ingest_webhook(RailKind::Card, &confirmed, &confirmed_headers)
        .await
        .unwrap();
    assert!(!outcome.applied());

    let tx = h
        .engine
        .transaction_for(PARTICIPANT, &initiated.transaction.id)
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Failed);
    let category = h.engine.category_for(PARTICIPANT, CATEGORY).await.unwrap();
    assert_eq!(category.spent_amount, Balance(dec!(0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_confirmation_and_failure_settle_one_way() {
    let h = harness(dec!(5000)).await;
    let mut expected_spent = dec!(0);

    for round in 0..20 {
        let initiated = initiate(&h, dec!(10)).await;
        let intent = initiated.rail_artifact.rail_reference().to_string();

        let mut events = vec![
            card_event(&h.rails, &format!("evt_{round}_ok"), &intent, "succeeded"),
            card_event(&h.rails, &format!("evt_{round}_ko"), &intent, "payment_failed"),
        ];
        events.shuffle(&mut rand::thread_rng());

        let handles: Vec<_> = events
            .into_iter()
            .map(|(raw, headers)| {
                let engine = h.engine.clone();
                tokio::spawn(async move {
                    engine
                        .ingest_webhook(RailKind::Card, &raw, &headers)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().applied() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1, "exactly one event may win round {round}");

        let tx = h
            .engine
            .transaction_for(PARTICIPANT, &initiated.transaction.id)
            .await
            .unwrap();
        assert!(tx.status.is_terminal());
        if tx.status == TransactionStatus::Completed {
            expected_spent += dec!(10);
        }

        let category = h.engine.category_for(PARTICIPANT, CATEGORY).await.unwrap();
        assert_eq!(category.spent_amount, Balance(expected_spent));
        assert!(category.is_balanced());
    }
}

#[tokio::test]
async fn test_bad_signature_mutates_nothing() {
    let h = harness(dec!(500)).await;
    let initiated = initiate(&h, dec!(40)).await;
    let intent = initiated.rail_artifact.rail_reference().to_string();

    let (raw, headers) = card_event(&h.rails, "evt_1", &intent, "succeeded");
    let mut tampered = raw.clone();
    tampered.extend_from_slice(b" ");

    let result = h
        .engine
        .ingest_webhook(RailKind::Card, &tampered, &headers)
        .await;
    assert!(matches!(result, Err(PaymentError::InvalidSignature(_))));

    let result = h
        .engine
        .ingest_webhook(RailKind::OnChain, &raw, &headers)
        .await;
    assert!(matches!(result, Err(PaymentError::InvalidSignature(_))));

    let tx = h
        .engine
        .transaction_for(PARTICIPANT, &initiated.transaction.id)
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn test_unknown_reference_is_unmatched() {
    let h = harness(dec!(500)).await;
    let (raw, headers) = card_event(&h.rails, "evt_1", "pi_unknown", "succeeded");

    let outcome = h
        .engine
        .ingest_webhook(RailKind::Card, &raw, &headers)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Unmatched {
            rail: RailKind::Card,
            rail_reference: "pi_unknown".into(),
        }
    );
}
