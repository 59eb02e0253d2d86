//! Integration tests for session balance and payment watching

use lumenbridge::error::SessionError;
use lumenbridge::ledger::{LedgerClient, PaymentRecord, WhitelistFn};
use lumenbridge::memory_ledger::MemoryLedger;
use lumenbridge::session::BlockchainSession;
use lumenbridge::store::{InMemoryStore, Store};
use lumenbridge::types::{Amount, Balance, NetworkVersion, PaymentMemoIdentifier};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn bound_session(ledger: &MemoryLedger, balance: Amount) -> (Arc<BlockchainSession>, String) {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let session = Arc::new(BlockchainSession::new(store));
    let account = ledger.add_funded_account(balance);
    let address = account.public_address();
    session.bind(account).await.unwrap();
    (session, address)
}

#[tokio::test]
async fn test_cached_balance_served_without_network_fetch() {
    let store = Arc::new(InMemoryStore::new());
    store
        .set_last_balance(Some(&Balance::new(Amount::from_num(12))))
        .unwrap();
    let session = Arc::new(BlockchainSession::new(store.clone() as Arc<dyn Store>));

    let ledger = MemoryLedger::new(NetworkVersion::Sdk);
    // Keystore-only account: any balance fetch would fail with a missing
    // account error, so a delivered value can only come from the cache.
    let account = ledger.add_account().unwrap();
    session.bind(account).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::clone(&seen);
    session
        .add_balance_observer(Box::new(move |b| probe.lock().push(b.amount)), None)
        .await
        .unwrap();

    assert_eq!(seen.lock().clone(), vec![Amount::from_num(12)]);
    assert!(session.balance().await.is_err());
}

#[tokio::test]
async fn test_removed_observer_receives_no_stale_callbacks() {
    let ledger = MemoryLedger::new(NetworkVersion::Sdk);
    let (session, address) = bound_session(&ledger, Amount::from_num(10)).await;

    let first_calls = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::clone(&first_calls);
    let first = session
        .add_balance_observer(Box::new(move |b| probe.lock().push(b.amount)), None)
        .await
        .unwrap();

    session.balance().await.unwrap();
    assert_eq!(first_calls.lock().clone(), vec![Amount::from_num(10)]);

    session.remove_balance_observer(&first).await;

    let second_calls = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::clone(&second_calls);
    session
        .add_balance_observer(Box::new(move |b| probe.lock().push(b.amount)), None)
        .await
        .unwrap();
    // Registration itself replays the cached 10.
    assert_eq!(second_calls.lock().clone(), vec![Amount::from_num(10)]);

    ledger.set_balance(&address, Amount::from_num(25));
    session.balance().await.unwrap();

    assert!(second_calls.lock().contains(&Amount::from_num(25)));
    // The removed observer saw nothing after removal.
    assert_eq!(first_calls.lock().clone(), vec![Amount::from_num(10)]);
}

#[tokio::test]
async fn test_wait_times_out_and_removes_waiter() {
    let ledger = MemoryLedger::new(NetworkVersion::Sdk);
    let (session, _address) = bound_session(&ledger, Amount::from_num(0)).await;

    let memo = PaymentMemoIdentifier::new("memo-1");
    session.start_watching(memo.clone()).await.unwrap();

    let result = session
        .wait_for_new_payment(&memo, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(SessionError::WatchTimedOut)));

    // The waiter entry is gone; a second wait fails fast.
    let result = session
        .wait_for_new_payment(&memo, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(SessionError::WatchNotStarted)));
}

#[tokio::test]
async fn test_first_matching_memo_wins() {
    let ledger = MemoryLedger::new(NetworkVersion::Sdk);
    let (session, address) = bound_session(&ledger, Amount::from_num(0)).await;

    let memo_a = PaymentMemoIdentifier::new("memo-A");
    let memo_b = PaymentMemoIdentifier::new("memo-B");
    session.start_watching(memo_a.clone()).await.unwrap();
    session.start_watching(memo_b.clone()).await.unwrap();

    let waiter = {
        let session = Arc::clone(&session);
        let memo_a = memo_a.clone();
        tokio::spawn(async move {
            session
                .wait_for_new_payment(&memo_a, Duration::from_secs(2))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    ledger.deliver_payment(
        &address,
        PaymentRecord {
            memo_text: Some("memo-A".to_string()),
            hash: "deadbeef".to_string(),
            amount: Amount::from_num(1),
        },
    );

    let hash = waiter.await.unwrap().unwrap();
    assert_eq!(hash, "deadbeef");

    // memo-B is still pending and can only time out.
    let result = session
        .wait_for_new_payment(&memo_b, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(SessionError::WatchTimedOut)));
}

#[tokio::test]
async fn test_unmatched_memo_never_resolves_other_waiters() {
    let ledger = MemoryLedger::new(NetworkVersion::Sdk);
    let (session, address) = bound_session(&ledger, Amount::from_num(0)).await;

    let memo = PaymentMemoIdentifier::new("expected");
    session.start_watching(memo.clone()).await.unwrap();

    // A payment with a different memo text passes through unmatched.
    ledger.deliver_payment(
        &address,
        PaymentRecord {
            memo_text: Some("unrelated".to_string()),
            hash: "cafe".to_string(),
            amount: Amount::from_num(1),
        },
    );

    let result = session
        .wait_for_new_payment(&memo, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(SessionError::WatchTimedOut)));
}

#[tokio::test]
async fn test_prebind_payment_watch_replays_after_bind() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let session = Arc::new(BlockchainSession::new(store));

    // Registered before any account exists; buffered.
    let memo = PaymentMemoIdentifier::new("early-bird");
    session.start_watching(memo.clone()).await.unwrap();

    let ledger = MemoryLedger::new(NetworkVersion::Sdk);
    let account = ledger.add_funded_account(Amount::from_num(0));
    let address = account.public_address();
    session.bind(account).await.unwrap();

    let waiter = {
        let session = Arc::clone(&session);
        let memo = memo.clone();
        tokio::spawn(async move {
            session.wait_for_new_payment(&memo, Duration::from_secs(2)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    ledger.deliver_payment(
        &address,
        PaymentRecord {
            memo_text: Some("early-bird".to_string()),
            hash: "feedface".to_string(),
            amount: Amount::from_num(2),
        },
    );

    let hash = waiter.await.unwrap().unwrap();
    assert_eq!(hash, "feedface");
}

#[tokio::test]
async fn test_stop_watching_all_clears_every_waiter() {
    let ledger = MemoryLedger::new(NetworkVersion::Sdk);
    let (session, _address) = bound_session(&ledger, Amount::from_num(0)).await;

    session
        .start_watching(PaymentMemoIdentifier::new("one"))
        .await
        .unwrap();
    session
        .start_watching(PaymentMemoIdentifier::new("two"))
        .await
        .unwrap();

    session.stop_watching(None).await;

    let result = session
        .wait_for_new_payment(&PaymentMemoIdentifier::new("one"), Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(SessionError::WatchNotStarted)));
}

#[tokio::test]
async fn test_pay_runs_the_whitelist_step() {
    let ledger = MemoryLedger::new(NetworkVersion::Sdk);
    let (session, _address) = bound_session(&ledger, Amount::from_num(100)).await;
    let recipient = ledger.add_funded_account(Amount::from_num(0));

    let authorized = Arc::new(AtomicBool::new(false));
    let probe = Arc::clone(&authorized);
    let whitelist: WhitelistFn = Arc::new(move |envelope| {
        probe.store(true, Ordering::SeqCst);
        Ok(envelope)
    });

    let hash = session
        .pay(
            &recipient.public_address(),
            Amount::from_num(30),
            Some("invoice-9"),
            whitelist,
        )
        .await
        .unwrap();
    assert!(!hash.is_empty());
    assert!(authorized.load(Ordering::SeqCst));
    assert_eq!(recipient.balance().await.unwrap(), Amount::from_num(30));
}
