mod common;

use common::{fund, wait_for_balance, wait_for_no_pending, wait_for_withdraw_uses, PaymentScript, TestLedger};
use chrono::Utc;
use ldk_ledger::db::{InvoiceModel, InvoiceQueries, PendingPaymentQueries, TransactionFilter, WalletRef};
use ldk_ledger::LedgerError;

async fn create_user(ledger: &TestLedger, username: &str) -> WalletRef {
    let created = ledger.app.users.create_user(Some(username)).await.unwrap();
    created.wallet.wallet_ref()
}

async fn transactions(ledger: &TestLedger, wallet: &WalletRef) -> Vec<ldk_ledger::db::TransactionModel> {
    ledger
        .app
        .wallets
        .list_wallet_transactions(wallet, &TransactionFilter::default())
        .await
        .unwrap()
        .transactions
}

#[tokio::test]
async fn test_invoice_settles_into_balance() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    assert_eq!(app.wallets.get_wallet(&alice).await.unwrap().balance_msat, 0);

    let invoice = app.payments.create_invoice(&alice, "coffee", 5_000, 3_600).await.unwrap();
    assert_eq!(app.wallets.confirmed_balance(&alice).await.unwrap(), 0);
    assert_eq!(app.payments.list_pending_invoices(&alice).await.unwrap().len(), 1);

    ledger.node.settle_invoice(&invoice.payment_hash, 5_000);
    wait_for_balance(app, &alice, 5_000).await;
    wait_for_no_pending(app, &alice).await;

    let history = transactions(&ledger, &alice).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, None);
    assert_eq!(history[0].to, Some(alice.clone()));
    assert_eq!(history[0].amount_msat, 5_000);
    assert_eq!(history[0].invoice_id.as_deref(), Some(invoice.payment_hash.as_str()));

    let stored = app.payments.get_invoice(&alice, &invoice.payment_hash).await.unwrap();
    assert!(stored.is_settled());
    let invoices = app.payments.list_invoices(&alice).await.unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].recipient, Some(alice.clone()));

    // a repeated event changes nothing
    ledger.node.settle_invoice(&invoice.payment_hash, 5_000);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(app.wallets.get_wallet(&alice).await.unwrap().balance_msat, 5_000);
    assert_eq!(transactions(&ledger, &alice).await.len(), 1);
}

#[tokio::test]
async fn test_canceled_invoice_credits_nothing() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;

    let invoice = app.payments.create_invoice(&alice, "", 5_000, 60).await.unwrap();
    ledger.node.cancel_invoice(&invoice.payment_hash);
    wait_for_no_pending(app, &alice).await;

    assert_eq!(app.wallets.get_wallet(&alice).await.unwrap().balance_msat, 0);
    assert!(transactions(&ledger, &alice).await.is_empty());
}

#[tokio::test]
async fn test_pay_invoice_issued_by_this_ledger() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    let bob = create_user(&ledger, "bob").await;
    fund(app, &alice, 5_000).await;

    let invoice = app.payments.create_invoice(&bob, "lunch", 1_200, 3_600).await.unwrap();
    let outcome = app
        .payments
        .pay_invoice(&alice, &invoice.payment_request, false)
        .await
        .unwrap()
        .expect("internal payments resolve immediately");

    assert!(outcome.success);
    assert_eq!(outcome.fee_msat, 0);
    assert_eq!(outcome.amount_msat, 1_200);
    assert!(ledger.node.sent().is_empty());

    assert_eq!(app.wallets.get_wallet(&alice).await.unwrap().balance_msat, 3_800);
    assert_eq!(app.wallets.get_wallet(&bob).await.unwrap().balance_msat, 1_200);
    assert!(app.payments.list_pending_invoices(&bob).await.unwrap().is_empty());

    let history = transactions(&ledger, &bob).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, Some(alice.clone()));
    assert_eq!(history[0].to, Some(bob.clone()));
    assert_eq!(history[0].fees_paid_msat, 0);

    let stored = app.payments.get_invoice(&alice, &invoice.payment_hash).await.unwrap();
    assert_eq!(stored.sender, Some(alice));
    assert!(stored.is_settled());
}

#[tokio::test]
async fn test_internal_payment_needs_funds() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    let bob = create_user(&ledger, "bob").await;
    fund(app, &alice, 1_000).await;

    let invoice = app.payments.create_invoice(&bob, "", 1_200, 3_600).await.unwrap();
    let err = app
        .payments
        .pay_invoice(&alice, &invoice.payment_request, true)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance));
    assert_eq!(app.payments.list_pending_invoices(&bob).await.unwrap().len(), 1);
    assert_eq!(app.wallets.get_wallet(&alice).await.unwrap().balance_msat, 1_000);
}

#[tokio::test]
async fn test_external_payment_success() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    fund(app, &alice, 5_000).await;

    ledger.node.script(PaymentScript::Succeed { fee_msat: 10 });
    let (payment_request, payment_hash) = ledger.node.remote_invoice(1_000);
    let outcome = app
        .payments
        .pay_invoice(&alice, &payment_request, true)
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.payment_hash, payment_hash);
    assert_eq!(outcome.fee_msat, 10);

    let sent = ledger.node.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].amount_msat, 1_000);
    // 3% of the amount, below what the balance could cover
    assert_eq!(sent[0].fee_limit_msat, 30);

    // debited amount minus the reported fee
    assert_eq!(app.wallets.get_wallet(&alice).await.unwrap().balance_msat, 4_010);
    assert!(app.payments.list_pending_payments(&alice).await.unwrap().is_empty());

    let history = transactions(&ledger, &alice).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, Some(alice.clone()));
    assert_eq!(history[0].to, None);
    assert_eq!(history[0].fees_paid_msat, 10);
    assert!(app.payments.get_invoice(&alice, &payment_hash).await.unwrap().is_settled());
}

#[tokio::test]
async fn test_external_payment_failure_releases_funds() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    fund(app, &alice, 5_000).await;

    ledger.node.script(PaymentScript::Fail("no route".to_string()));
    let (payment_request, payment_hash) = ledger.node.remote_invoice(4_990);
    let outcome = app
        .payments
        .pay_invoice(&alice, &payment_request, true)
        .await
        .unwrap()
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.failure_reason.as_deref(), Some("no route"));
    // the fee ceiling is capped by what is left after the amount
    assert_eq!(ledger.node.sent()[0].fee_limit_msat, 10);

    assert_eq!(app.wallets.get_wallet(&alice).await.unwrap().balance_msat, 5_000);
    assert_eq!(app.wallets.confirmed_balance(&alice).await.unwrap(), 5_000);
    assert!(transactions(&ledger, &alice).await.is_empty());
    assert!(!app.payments.get_invoice(&alice, &payment_hash).await.unwrap().is_settled());
}

#[tokio::test]
async fn test_rejected_dispatch_keeps_nothing_reserved() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    fund(app, &alice, 5_000).await;

    ledger.node.script(PaymentScript::Reject);
    let (payment_request, payment_hash) = ledger.node.remote_invoice(1_000);
    let err = app.payments.pay_invoice(&alice, &payment_request, true).await.unwrap_err();
    assert!(matches!(err, LedgerError::Node(_)));
    assert!(app.payments.list_pending_payments(&alice).await.unwrap().is_empty());
    assert!(matches!(
        app.payments.get_invoice(&alice, &payment_hash).await,
        Err(LedgerError::InvoiceNotFound)
    ));
    assert_eq!(app.wallets.confirmed_balance(&alice).await.unwrap(), 5_000);
}

#[tokio::test]
async fn test_payment_validation() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    fund(app, &alice, 5_000).await;

    let (too_much, _) = ledger.node.remote_invoice(6_000);
    assert!(matches!(
        app.payments.pay_invoice(&alice, &too_much, true).await,
        Err(LedgerError::InsufficientBalance)
    ));

    assert!(matches!(
        app.payments.pay_invoice(&alice, "garbage", true).await,
        Err(LedgerError::Validation(_))
    ));

    let (amountless, _) = ledger.node.remote_invoice(0);
    assert!(matches!(
        app.payments.pay_invoice(&alice, &amountless, true).await,
        Err(LedgerError::Validation(_))
    ));
    let (fixed, _) = ledger.node.remote_invoice(1_000);
    assert!(matches!(
        app.payments.pay_invoice_amount(&alice, &fixed, true, 900).await,
        Err(LedgerError::Validation(_))
    ));

    ledger.node.script(PaymentScript::Succeed { fee_msat: 0 });
    let outcome = app
        .payments
        .pay_invoice_amount(&alice, &amountless, true, 700)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.success);
    assert_eq!(app.wallets.get_wallet(&alice).await.unwrap().balance_msat, 4_300);
}

#[tokio::test]
async fn test_async_payment_reserves_until_resolved() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    fund(app, &alice, 5_000).await;

    ledger.node.script(PaymentScript::Hold);
    let (payment_request, payment_hash) = ledger.node.remote_invoice(1_000);
    let outcome = app.payments.pay_invoice(&alice, &payment_request, false).await.unwrap();
    assert!(outcome.is_none());

    assert_eq!(app.wallets.get_wallet(&alice).await.unwrap().balance_msat, 5_000);
    assert_eq!(app.wallets.confirmed_balance(&alice).await.unwrap(), 4_000);
    assert!(matches!(
        app.payments.pay_invoice(&alice, &payment_request, false).await,
        Err(LedgerError::PaymentInFlight)
    ));

    ledger.node.resolve_payment(&payment_hash, true, 0);
    wait_for_balance(app, &alice, 4_000).await;
    wait_for_no_pending(app, &alice).await;
}

#[tokio::test]
async fn test_concurrent_transfers_respect_reservations() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let a = create_user(&ledger, "alice").await;
    let b = app.wallets.create_wallet("alice", Some("savings"), None).await.unwrap().wallet_ref();
    fund(app, &a, 5_000).await;

    ledger.node.script(PaymentScript::Hold);
    let (payment_request, _) = ledger.node.remote_invoice(4_990);
    app.payments.pay_invoice(&a, &payment_request, false).await.unwrap();
    assert_eq!(app.wallets.confirmed_balance(&a).await.unwrap(), 10);

    let (first, second) = tokio::join!(
        app.wallets.transfer("alice", "alice", "savings", 10),
        app.wallets.transfer("alice", "alice", "savings", 10),
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(LedgerError::InsufficientBalance))));

    assert_eq!(app.wallets.get_wallet(&a).await.unwrap().balance_msat, 4_990);
    assert_eq!(app.wallets.get_wallet(&b).await.unwrap().balance_msat, 10);
    assert_eq!(transactions(&ledger, &b).await.len(), 1);
}

#[tokio::test]
async fn test_locked_wallet_cannot_pay() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    fund(app, &alice, 5_000).await;

    let lock = ldk_ledger::db::WalletOptions {
        locked: Some(true),
        ..Default::default()
    };
    app.wallets.update_wallet_options(&alice, &lock).await.unwrap();

    let (payment_request, _) = ledger.node.remote_invoice(1_000);
    assert!(matches!(
        app.payments.pay_invoice(&alice, &payment_request, true).await,
        Err(LedgerError::CannotTransactWithLockedWallet)
    ));
    assert!(matches!(
        app.payments.create_invoice(&alice, "", 1_000, 60).await,
        Err(LedgerError::CannotTransactWithLockedWallet)
    ));
}

#[tokio::test]
async fn test_recovery_after_restart_is_idempotent() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    fund(app, &alice, 5_000).await;

    let invoice = app.payments.create_invoice(&alice, "", 2_000, 3_600).await.unwrap();
    ledger.node.script(PaymentScript::Hold);
    let (payment_request, payment_hash) = ledger.node.remote_invoice(1_000);
    app.payments.pay_invoice(&alice, &payment_request, false).await.unwrap();

    // both resolve while the ledger is not listening
    ledger.node.settle_invoice_silently(&invoice.payment_hash, 2_000);
    ledger.node.resolve_offline(&payment_hash, true, 0);

    let restarted = ledger.restart().await;
    wait_for_balance(&restarted, &alice, 6_000).await;
    wait_for_no_pending(&restarted, &alice).await;

    restarted.payments.recover().await.unwrap();
    restarted.payments.recover().await.unwrap();

    assert_eq!(restarted.wallets.get_wallet(&alice).await.unwrap().balance_msat, 6_000);
    let history = restarted
        .wallets
        .list_wallet_transactions(&alice, &TransactionFilter::default())
        .await
        .unwrap();
    assert_eq!(history.total, 2);
    assert!(ledger.node.track_calls() >= 1);
}

#[tokio::test]
async fn test_recovery_releases_reservation_the_node_never_saw() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    fund(app, &alice, 5_000).await;

    // reserved, then the process died before the payment reached the node
    let (payment_request, payment_hash) = ledger.node.remote_invoice(1_000);
    let invoice = InvoiceModel {
        payment_hash: payment_hash.clone(),
        payment_request,
        memo: String::new(),
        amount_msat: 1_000,
        pubkey: common::REMOTE_PUBKEY.to_string(),
        sender: Some(alice.clone()),
        recipient: None,
        settled_at: None,
        created_at: Utc::now(),
    };
    let wallet = alice.clone();
    let hash = payment_hash.clone();
    app.db
        .transaction(move |tx| {
            PendingPaymentQueries::new(tx).create(&hash, &wallet, 1_000, None)?;
            InvoiceQueries::new(tx).upsert_outgoing(&invoice)
        })
        .await
        .unwrap();
    assert_eq!(app.wallets.confirmed_balance(&alice).await.unwrap(), 4_000);
    assert!(matches!(
        app.users.delete_user("alice").await,
        Err(LedgerError::PaymentInFlight)
    ));

    let restarted = ledger.restart().await;
    wait_for_no_pending(&restarted, &alice).await;

    assert_eq!(restarted.wallets.confirmed_balance(&alice).await.unwrap(), 5_000);
    assert_eq!(restarted.wallets.get_wallet(&alice).await.unwrap().balance_msat, 5_000);
    assert!(matches!(
        restarted.payments.get_invoice(&alice, &payment_hash).await,
        Err(LedgerError::InvoiceNotFound)
    ));
    assert!(ledger.node.sent().is_empty());
    let history = restarted
        .wallets
        .list_wallet_transactions(&alice, &TransactionFilter::default())
        .await
        .unwrap();
    assert_eq!(history.total, 0);
    restarted.users.delete_user("alice").await.unwrap();
}

#[tokio::test]
async fn test_concurrent_self_payments_settle_once() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    let carol = create_user(&ledger, "carol").await;
    let bob = create_user(&ledger, "bob").await;
    fund(app, &alice, 5_000).await;
    fund(app, &carol, 5_000).await;

    let invoice = app.payments.create_invoice(&bob, "", 1_000, 3_600).await.unwrap();
    let (first, second) = tokio::join!(
        app.payments.pay_invoice(&alice, &invoice.payment_request, true),
        app.payments.pay_invoice(&carol, &invoice.payment_request, true),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::Validation(_))))
            .count(),
        1
    );

    assert_eq!(app.wallets.get_wallet(&bob).await.unwrap().balance_msat, 1_000);
    let alice_balance = app.wallets.get_wallet(&alice).await.unwrap().balance_msat;
    let carol_balance = app.wallets.get_wallet(&carol).await.unwrap().balance_msat;
    assert_eq!(alice_balance + carol_balance, 9_000);
    assert!(ledger.node.sent().is_empty());
    assert_eq!(transactions(&ledger, &bob).await.len(), 1);
    assert!(app.payments.list_pending_invoices(&bob).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_withdraw_limits() {
    let ledger = TestLedger::start().await;
    let app = &ledger.app;
    let alice = create_user(&ledger, "alice").await;
    fund(app, &alice, 5_000).await;

    let url = app
        .withdraws
        .create_withdraw(&alice, "payout", 100, 2_000, 1, None)
        .await
        .unwrap();
    let (_, k1) = url.split_once("?k1=").unwrap();

    let (too_large, _) = ledger.node.remote_invoice(3_000);
    assert!(matches!(
        app.payments.pay_withdraw_invoice(k1, &too_large).await,
        Err(LedgerError::Validation(_))
    ));

    ledger.node.script(PaymentScript::Hold);
    let (first, first_hash) = ledger.node.remote_invoice(1_000);
    app.payments.pay_withdraw_invoice(k1, &first).await.unwrap();

    let (second, _) = ledger.node.remote_invoice(1_000);
    let err = app.payments.pay_withdraw_invoice(k1, &second).await.unwrap_err();
    assert!(matches!(err, LedgerError::Retryable(_)));
    assert_eq!(err.to_string(), "processing other withdrawals. Retry.");

    ledger.node.resolve_payment(&first_hash, true, 0);
    wait_for_withdraw_uses(app, k1, 1).await;
    wait_for_balance(app, &alice, 4_000).await;

    let err = app.payments.pay_withdraw_invoice(k1, &second).await.unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
    assert_eq!(err.to_string(), "exceeded maximum number of allowed withdrawals");
}
