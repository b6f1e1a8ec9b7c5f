#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use planpay::domain::budget::{Amount, Balance, BudgetCategory, LedgerPosting, PostingSource};
use planpay::domain::ports::{LedgerStore, TransactionStore};
use planpay::domain::rail::RailKind;
use planpay::domain::transaction::{NewTransaction, PaymentTransaction, TransactionStatus};
use planpay::error::PaymentError;
use planpay::infrastructure::rocksdb::RocksDBStore;
use rust_decimal_macros::dec;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_rocksdb_report_recovers_categories() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("planpay_db");

    let mut seed = tempfile::NamedTempFile::new().unwrap();
    writeln!(seed, "id,plan_id,participant_id,category_code,allocated").unwrap();
    writeln!(seed, "cat-1,plan-1,p-1,transport,250").unwrap();

    let output1 = Command::new(cargo_bin!("planpay"))
        .arg("report")
        .arg(seed.path())
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output1.status.success());
    assert!(String::from_utf8_lossy(&output1.stdout).contains("cat-1,p-1,transport,250,0,250"));

    // Second run without a seed reads the persisted category back.
    let output2 = Command::new(cargo_bin!("planpay"))
        .arg("report")
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output2.status.success());
    assert!(String::from_utf8_lossy(&output2.stdout).contains("cat-1,p-1,transport,250,0,250"));
}

#[tokio::test]
async fn test_postings_survive_reopen_and_stay_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger_db");

    {
        let store = RocksDBStore::open(&path).unwrap();
        store
            .provision(BudgetCategory::new(
                "cat-1",
                "plan-1",
                "p-1",
                "transport",
                Balance(dec!(500)),
            ))
            .await
            .unwrap();
        let posting = LedgerPosting::new(
            "cat-1",
            Amount::new(dec!(120)).unwrap(),
            PostingSource::Settlement("txn_1".into()),
        );
        store.commit(posting).await.unwrap();
    }

    let store = RocksDBStore::open(&path).unwrap();
    let replay = LedgerPosting::new(
        "cat-1",
        Amount::new(dec!(120)).unwrap(),
        PostingSource::Settlement("txn_1".into()),
    );
    let category = store.commit(replay).await.unwrap();
    assert_eq!(category.spent_amount, Balance(dec!(120)));
    assert_eq!(category.remaining_amount, Balance(dec!(380)));
    assert!(category.is_balanced());
}

#[tokio::test]
async fn test_transaction_transitions_persist() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tx_db");

    let tx = PaymentTransaction::open(NewTransaction {
        participant_id: "p-1".into(),
        provider_id: "prov-1".into(),
        category_id: "cat-1".into(),
        voucher_id: None,
        amount: Amount::new(dec!(75)).unwrap(),
        service_code: "transport".into(),
        rail_kind: RailKind::Card,
    });

    {
        let store = RocksDBStore::open(&path).unwrap();
        store.insert(tx.clone()).await.unwrap();
        store.attach_rail_reference(&tx.id, "pi_123").await.unwrap();
        let transition = store
            .transition(
                &tx.id,
                TransactionStatus::Completed,
                TransactionStatus::allowed_prior_states(TransactionStatus::Completed),
                None,
            )
            .await
            .unwrap();
        assert!(transition.is_applied());
    }

    let store = RocksDBStore::open(&path).unwrap();
    let found = store
        .find_by_rail_reference(RailKind::Card, "pi_123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.status, TransactionStatus::Completed);

    let late = store
        .transition(
            &tx.id,
            TransactionStatus::Failed,
            TransactionStatus::allowed_prior_states(TransactionStatus::Failed),
            None,
        )
        .await
        .unwrap();
    assert!(!late.is_applied());
}

#[tokio::test]
async fn test_holds_survive_reopen_and_convert_on_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("holds_db");
    let source = PostingSource::Settlement("txn_1".into());

    {
        let store = RocksDBStore::open(&path).unwrap();
        store
            .provision(BudgetCategory::new(
                "cat-1",
                "plan-1",
                "p-1",
                "transport",
                Balance(dec!(500)),
            ))
            .await
            .unwrap();
        store
            .reserve("cat-1", &source, Amount::new(dec!(300)).unwrap())
            .await
            .unwrap();
    }

    let store = RocksDBStore::open(&path).unwrap();
    let other = store
        .reserve(
            "cat-1",
            &PostingSource::Settlement("txn_2".into()),
            Amount::new(dec!(300)).unwrap(),
        )
        .await;
    assert!(matches!(other, Err(PaymentError::InsufficientFunds { .. })));

    let category = store
        .commit(LedgerPosting::new(
            "cat-1",
            Amount::new(dec!(300)).unwrap(),
            source.clone(),
        ))
        .await
        .unwrap();
    assert_eq!(category.spent_amount, Balance(dec!(300)));
    assert_eq!(category.held_amount, Balance::ZERO);
    assert!(category.is_balanced());
    assert!(!store.release("cat-1", &source).await.unwrap());
}
