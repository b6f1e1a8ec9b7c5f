mod common;

use chrono::Utc;
use common::{BACKUP_CODES, CATEGORY, PARTICIPANT, TOTP_SECRET, card_payment, harness};
use planpay::application::step_up::totp_code;
use planpay::domain::budget::Balance;
use planpay::domain::step_up::{StepUpEvidence, StepUpMethod};
use planpay::error::PaymentError;
use rust_decimal_macros::dec;

fn current_totp() -> String {
    totp_code(TOTP_SECRET, Utc::now().timestamp() as u64 / 30)
}

#[tokio::test]
async fn test_below_threshold_needs_no_evidence() {
    let h = harness(dec!(5000)).await;
    let initiated = h
        .engine
        .initiate_payment(PARTICIPANT, card_payment(dec!(999.99)))
        .await;
    assert!(initiated.is_ok());
}

#[tokio::test]
async fn test_threshold_amount_requires_step_up() {
    let h = harness(dec!(5000)).await;
    let result = h
        .engine
        .initiate_payment(PARTICIPANT, card_payment(dec!(1000)))
        .await;

    match result {
        Err(PaymentError::StepUpRequired { methods }) => {
            assert_eq!(methods, vec![StepUpMethod::Totp, StepUpMethod::BackupCode]);
        }
        other => panic!("expected StepUpRequired, got {other:?}"),
    }

    // Nothing was reserved or persisted for the rejected attempt.
    let category = h.engine.category_for(PARTICIPANT, CATEGORY).await.unwrap();
    assert_eq!(category.remaining_amount, Balance(dec!(5000)));
}

#[tokio::test]
async fn test_valid_totp_passes_gate() {
    let h = harness(dec!(5000)).await;
    let mut request = card_payment(dec!(1200));
    request.step_up_evidence = Some(StepUpEvidence {
        totp_code: Some(current_totp()),
        ..Default::default()
    });

    let initiated = h
        .engine
        .initiate_payment(PARTICIPANT, request)
        .await
        .unwrap();
    assert_eq!(initiated.transaction.amount.value(), dec!(1200));
}

#[tokio::test]
async fn test_backup_code_works_once() {
    let h = harness(dec!(5000)).await;
    let with_backup = || {
        let mut request = card_payment(dec!(1500));
        request.step_up_evidence = Some(StepUpEvidence {
            backup_code: Some(BACKUP_CODES[0].to_lowercase()),
            ..Default::default()
        });
        request
    };

    assert!(
        h.engine
            .initiate_payment(PARTICIPANT, with_backup())
            .await
            .is_ok()
    );
    assert!(matches!(
        h.engine.initiate_payment(PARTICIPANT, with_backup()).await,
        Err(PaymentError::StepUpRequired { .. })
    ));
}

#[tokio::test]
async fn test_wrong_totp_is_challenged() {
    let h = harness(dec!(5000)).await;
    let mut request = card_payment(dec!(2000));
    request.step_up_evidence = Some(StepUpEvidence {
        totp_code: Some("12345x".into()),
        ..Default::default()
    });

    let result = h.engine.initiate_payment(PARTICIPANT, request).await;
    assert!(matches!(result, Err(PaymentError::StepUpRequired { .. })));
}
