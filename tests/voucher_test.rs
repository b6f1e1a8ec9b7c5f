mod common;

use common::{CATEGORY, PARTICIPANT, PROVIDER, card_event, card_payment, harness};
use planpay::domain::budget::{Amount, Balance};
use planpay::domain::rail::RailKind;
use planpay::domain::transaction::TransactionStatus;
use planpay::domain::voucher::VoucherStatus;
use planpay::error::PaymentError;
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_voucher_backed_payment_settles_by_webhook() {
    let h = harness(dec!(500)).await;

    let voucher = h
        .engine
        .mint_voucher(PARTICIPANT, CATEGORY, Amount::new(dec!(200)).unwrap(), None)
        .await
        .unwrap();
    assert_eq!(voucher.status, VoucherStatus::Active);
    let category = h.engine.category_for(PARTICIPANT, CATEGORY).await.unwrap();
    assert_eq!(category.remaining_amount, Balance(dec!(300)));

    let mut request = card_payment(dec!(150));
    request.voucher_id = Some(voucher.id.clone());
    let initiated = h
        .engine
        .initiate_payment(PARTICIPANT, request)
        .await
        .unwrap();

    let intent = initiated.rail_artifact.rail_reference().to_string();
    let (raw, headers) = card_event(&h.rails, "evt_1", &intent, "succeeded");
    h.engine
        .ingest_webhook(RailKind::Card, &raw, &headers)
        .await
        .unwrap();

    let tx = h
        .engine
        .transaction_for(PROVIDER, &initiated.transaction.id)
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);

    let voucher = h.engine.voucher(&voucher.id).await.unwrap();
    assert_eq!(voucher.status, VoucherStatus::Spent);
    assert!(voucher.spent_at.is_some());

    let category = h.engine.category_for(PARTICIPANT, CATEGORY).await.unwrap();
    assert_eq!(category.spent_amount, Balance(dec!(350)));
    assert_eq!(category.remaining_amount, Balance(dec!(150)));
    assert!(category.is_balanced());
}

#[tokio::test]
async fn test_mint_beyond_remaining_is_rejected() {
    let h = harness(dec!(100)).await;
    let result = h
        .engine
        .mint_voucher(PARTICIPANT, CATEGORY, Amount::new(dec!(100.01)).unwrap(), None)
        .await;

    match result {
        Err(PaymentError::InsufficientFunds { remaining, .. }) => {
            assert_eq!(remaining, dec!(100));
        }
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }
}

#[tokio::test]
async fn test_voucher_smaller_than_payment_is_rejected() {
    let h = harness(dec!(500)).await;
    let voucher = h
        .engine
        .mint_voucher(PARTICIPANT, CATEGORY, Amount::new(dec!(50)).unwrap(), None)
        .await
        .unwrap();

    let mut request = card_payment(dec!(80));
    request.voucher_id = Some(voucher.id);
    let result = h.engine.initiate_payment(PARTICIPANT, request).await;
    assert!(matches!(result, Err(PaymentError::ValidationError(_))));
}

#[tokio::test]
async fn test_provider_bound_voucher_rules() {
    let h = harness(dec!(500)).await;
    let voucher = h
        .engine
        .mint_voucher(
            PARTICIPANT,
            CATEGORY,
            Amount::new(dec!(40)).unwrap(),
            Some(PROVIDER.into()),
        )
        .await
        .unwrap();

    let check = h
        .engine
        .validate_voucher(&voucher.id, "taxi", PROVIDER)
        .await
        .unwrap();
    assert!(check.allowed);

    let check = h
        .engine
        .validate_voucher(&voucher.id, "02_051_0108_1_1", "prov-other")
        .await
        .unwrap();
    assert!(!check.allowed);

    let check = h
        .engine
        .validate_voucher(&voucher.id, "therapy", PROVIDER)
        .await
        .unwrap();
    assert!(!check.allowed);
}

#[tokio::test]
async fn test_other_participant_cannot_mint() {
    let h = harness(dec!(500)).await;
    let result = h
        .engine
        .mint_voucher("p-2", CATEGORY, Amount::new(dec!(10)).unwrap(), None)
        .await;
    assert!(matches!(result, Err(PaymentError::Forbidden(_))));
}
