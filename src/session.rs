//! Blockchain session
//!
//! Manages one bound account after the migration coordinator hands it over:
//! balance caching and observer fan-out, onboarding, outgoing payments, and
//! memo-keyed payment watching. Registrations arriving before an account is
//! bound are buffered and replayed on bind.
//!
//! One shared payment stream and one shared balance stream exist per session
//! at most; both are started lazily on first registration and torn down when
//! the last observer leaves.

use crate::error::{LedgerError, SessionError, StoreError};
use crate::events::{EventSink, SessionEvent, SinkHandle};
use crate::ledger::{LedgerAccount, LedgerClient, PaymentRecord, WhitelistFn};
use crate::store::Store;
use crate::types::{Amount, Balance, PaymentMemoIdentifier};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Timeout applied by callers that have no tighter deadline for a payment.
pub const DEFAULT_PAYMENT_TIMEOUT: Duration = Duration::from_secs(300);

pub type BalanceCallback = Box<dyn Fn(Balance) + Send + Sync>;

enum PendingRegistration {
    BalanceObserver {
        identifier: String,
        callback: BalanceCallback,
    },
    PaymentWatch {
        memo: PaymentMemoIdentifier,
    },
}

#[derive(Default)]
struct PaymentWatchState {
    waits: HashMap<PaymentMemoIdentifier, watch::Sender<Option<String>>>,
    watcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BalanceWatchState {
    observers: HashMap<String, BalanceCallback>,
    watcher: Option<JoinHandle<()>>,
}

pub struct BlockchainSession {
    store: Arc<dyn Store>,
    sink: parking_lot::RwLock<SinkHandle>,
    account: tokio::sync::RwLock<Option<Arc<dyn LedgerAccount>>>,
    needs_reset: AtomicBool,
    /// Buffered pre-bind registrations. This lock also serializes every
    /// registration against `bind`, so nothing is lost or duplicated when
    /// they race.
    registrations: tokio::sync::Mutex<Vec<PendingRegistration>>,
    payments: Mutex<PaymentWatchState>,
    balances: Mutex<BalanceWatchState>,
}

impl BlockchainSession {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            sink: parking_lot::RwLock::new(SinkHandle::default()),
            account: tokio::sync::RwLock::new(None),
            needs_reset: AtomicBool::new(false),
            registrations: tokio::sync::Mutex::new(Vec::new()),
            payments: Mutex::new(PaymentWatchState::default()),
            balances: Mutex::new(BalanceWatchState::default()),
        }
    }

    pub fn set_event_sink(&self, sink: &Arc<dyn EventSink>) {
        *self.sink.write() = SinkHandle::new(sink);
    }

    /// Marks the session for a reset; the next `bind` clears the cached
    /// balance before installing the account.
    pub fn set_needs_reset(&self) {
        self.needs_reset.store(true, Ordering::SeqCst);
    }

    /// Binds an account, replacing any previous one, and replays buffered
    /// registrations in their original order.
    pub async fn bind(self: &Arc<Self>, account: Arc<dyn LedgerAccount>) -> Result<(), SessionError> {
        let mut pending = self.registrations.lock().await;
        if self.needs_reset.swap(false, Ordering::SeqCst) {
            self.write_balance(None)?;
        }
        *self.account.write().await = Some(account);
        for registration in pending.drain(..) {
            match registration {
                PendingRegistration::BalanceObserver {
                    identifier,
                    callback,
                } => {
                    self.install_balance_observer(identifier, callback).await?;
                }
                PendingRegistration::PaymentWatch { memo } => {
                    self.install_payment_watch(memo).await?;
                }
            }
        }
        Ok(())
    }

    /// Turns a ready client into a bound session: picks the newest keystore
    /// account or creates one, binds it, and kicks off an initial balance
    /// fetch in the background.
    pub async fn start_account(
        self: &Arc<Self>,
        client: &Arc<dyn LedgerClient>,
    ) -> Result<Arc<dyn LedgerAccount>, SessionError> {
        let account = match client.accounts().pop() {
            Some(existing) => existing,
            None => {
                self.sink().session(SessionEvent::AccountCreationRequested);
                client.add_account()?
            }
        };
        self.bind(Arc::clone(&account)).await?;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let _ = session.balance().await;
        });
        Ok(account)
    }

    pub async fn public_address(&self) -> Option<String> {
        self.account.read().await.as_ref().map(|a| a.public_address())
    }

    /// The cached balance, if any. No network traffic.
    pub fn last_balance(&self) -> Result<Option<Balance>, StoreError> {
        self.store.last_balance()
    }

    /// Fetches the balance from the ledger, updating the cache and notifying
    /// observers on success. Ledger failures propagate unchanged and leave
    /// the cache alone.
    pub async fn balance(&self) -> Result<Amount, SessionError> {
        let account = self.bound_account().await?;
        let amount = account.balance().await?;
        self.write_balance(Some(Balance::new(amount)))?;
        Ok(amount)
    }

    /// Brings the bound account to a usable state. Idempotent: a durable
    /// per-account marker short-circuits repeat calls.
    pub async fn onboard(&self) -> Result<(), SessionError> {
        let account = self.bound_account().await?;
        if account.extra().is_some() {
            return Ok(());
        }
        match self.balance().await {
            Ok(_) => {
                account.set_extra(Some(Vec::new()));
                Ok(())
            }
            Err(SessionError::Ledger(LedgerError::MissingAccount)) => {
                account.watch_creation().await?;
                self.activate(&account).await
            }
            Err(SessionError::Ledger(LedgerError::MissingBalance)) => {
                self.activate(&account).await
            }
            Err(error) => Err(error),
        }
    }

    pub async fn onboarded(&self) -> bool {
        match self.account.read().await.as_ref() {
            Some(account) => account.extra().is_some(),
            None => false,
        }
    }

    /// Submits a payment through the ledger capability. The whitelist step
    /// runs before the transaction is accepted by the network.
    pub async fn pay(
        &self,
        recipient: &str,
        amount: Amount,
        memo: Option<&str>,
        whitelist: WhitelistFn,
    ) -> Result<String, SessionError> {
        let account = self.bound_account().await?;
        Ok(account
            .send_transaction(recipient, amount, memo, 0, whitelist)
            .await?)
    }

    /// Registers a pending wait for `memo`, lazily starting the shared
    /// payment stream. Before an account is bound the registration is
    /// buffered.
    pub async fn start_watching(
        self: &Arc<Self>,
        memo: PaymentMemoIdentifier,
    ) -> Result<(), SessionError> {
        let mut pending = self.registrations.lock().await;
        if self.account.read().await.is_none() {
            pending.push(PendingRegistration::PaymentWatch { memo });
            return Ok(());
        }
        self.install_payment_watch(memo).await
    }

    /// Blocks until the stream delivers a payment whose memo text equals
    /// `memo`, or the timeout elapses. Either way the waiter entry is gone
    /// afterward. Fails fast with `WatchNotStarted` for unregistered memos.
    pub async fn wait_for_new_payment(
        self: &Arc<Self>,
        memo: &PaymentMemoIdentifier,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        let mut rx = {
            let state = self.payments.lock();
            match state.waits.get(memo) {
                Some(tx) => tx.subscribe(),
                None => return Err(SessionError::WatchNotStarted),
            }
        };

        let delivery = async {
            loop {
                if let Some(hash) = rx.borrow_and_update().clone() {
                    return hash;
                }
                if rx.changed().await.is_err() {
                    // Waiter was cleared without a match; only the timeout
                    // resolves us now.
                    std::future::pending::<()>().await;
                }
            }
        };

        match tokio::time::timeout(timeout, delivery).await {
            Ok(hash) => {
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = session.balance().await;
                });
                Ok(hash)
            }
            Err(_) => {
                self.stop_watching(Some(memo)).await;
                Err(SessionError::WatchTimedOut)
            }
        }
    }

    /// Removes one waiter, or every waiter when `memo` is `None`. The shared
    /// stream is torn down once no waiters remain.
    pub async fn stop_watching(&self, memo: Option<&PaymentMemoIdentifier>) {
        let mut pending = self.registrations.lock().await;
        match memo {
            Some(memo) => pending.retain(
                |r| !matches!(r, PendingRegistration::PaymentWatch { memo: queued } if queued == memo),
            ),
            None => pending.retain(|r| !matches!(r, PendingRegistration::PaymentWatch { .. })),
        }

        let mut state = self.payments.lock();
        match memo {
            Some(memo) => {
                state.waits.remove(memo);
                info!("removed payment watch for {}", memo);
            }
            None => {
                state.waits.clear();
                info!("removed all payment watches");
            }
        }
        if state.waits.is_empty() {
            if let Some(handle) = state.watcher.take() {
                handle.abort();
            }
        }
    }

    /// Registers a balance observer under a generated or supplied identifier
    /// and returns it. When a cached balance exists the callback fires once
    /// immediately, without network traffic.
    pub async fn add_balance_observer(
        self: &Arc<Self>,
        callback: BalanceCallback,
        identifier: Option<String>,
    ) -> Result<String, SessionError> {
        let mut pending = self.registrations.lock().await;
        let identifier = identifier.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.account.read().await.is_none() {
            pending.push(PendingRegistration::BalanceObserver {
                identifier: identifier.clone(),
                callback,
            });
            return Ok(identifier);
        }
        self.install_balance_observer(identifier.clone(), callback)
            .await?;
        Ok(identifier)
    }

    /// Removes one observer; the shared balance stream is torn down once
    /// none remain.
    pub async fn remove_balance_observer(&self, identifier: &str) {
        let mut pending = self.registrations.lock().await;
        pending.retain(
            |r| !matches!(r, PendingRegistration::BalanceObserver { identifier: queued, .. } if queued == identifier),
        );

        let mut state = self.balances.lock();
        state.observers.remove(identifier);
        if state.observers.is_empty() {
            if let Some(handle) = state.watcher.take() {
                handle.abort();
            }
        }
    }

    async fn bound_account(&self) -> Result<Arc<dyn LedgerAccount>, SessionError> {
        self.account
            .read()
            .await
            .clone()
            .ok_or(SessionError::NotBound)
    }

    async fn activate(&self, account: &Arc<dyn LedgerAccount>) -> Result<(), SessionError> {
        match account.activate().await {
            Ok(()) => {
                self.sink().session(SessionEvent::TrustlineSetupSucceeded);
                self.sink().session(SessionEvent::WalletCreationSucceeded);
                account.set_extra(Some(Vec::new()));
                Ok(())
            }
            Err(error) => {
                self.sink().session(SessionEvent::TrustlineSetupFailed {
                    error: error.to_string(),
                });
                Err(error.into())
            }
        }
    }

    /// Cache write and observer notification happen under the observer lock,
    /// so every observer sees exactly the value that was just persisted.
    /// Unchanged values are not re-announced.
    fn write_balance(&self, balance: Option<Balance>) -> Result<(), StoreError> {
        let state = self.balances.lock();
        let previous = self.store.last_balance()?;
        self.store.set_last_balance(balance.as_ref())?;
        if let Some(balance) = balance {
            if previous != Some(balance) {
                for callback in state.observers.values() {
                    callback(balance);
                }
            }
        }
        Ok(())
    }

    async fn install_payment_watch(
        self: &Arc<Self>,
        memo: PaymentMemoIdentifier,
    ) -> Result<(), SessionError> {
        if self.payments.lock().watcher.is_none() {
            let account = self.bound_account().await?;
            let mut stream = account.watch_payments("now").await?;
            let session = Arc::downgrade(self);
            let handle = tokio::spawn(async move {
                while let Some(record) = stream.recv().await {
                    let Some(session) = session.upgrade() else { break };
                    session.deliver_payment(record);
                }
            });
            let mut state = self.payments.lock();
            if state.watcher.is_none() {
                state.watcher = Some(handle);
                debug!("started shared payment watch");
            } else {
                handle.abort();
            }
        }
        debug!("added payment watch for {}", memo);
        let (tx, _rx) = watch::channel(None);
        self.payments.lock().waits.insert(memo, tx);
        Ok(())
    }

    async fn install_balance_observer(
        self: &Arc<Self>,
        identifier: String,
        callback: BalanceCallback,
    ) -> Result<(), SessionError> {
        self.balances.lock().observers.insert(identifier.clone(), callback);

        if self.balances.lock().watcher.is_none() {
            let account = self.bound_account().await?;
            let from = self.store.last_balance()?.map(|b| b.amount);
            let mut stream = account.watch_balance(from).await?;
            let session = Arc::downgrade(self);
            let handle = tokio::spawn(async move {
                while let Some(amount) = stream.recv().await {
                    let Some(session) = session.upgrade() else { break };
                    let _ = session.write_balance(Some(Balance::new(amount)));
                }
            });
            let mut state = self.balances.lock();
            if state.watcher.is_none() {
                state.watcher = Some(handle);
                debug!("started shared balance watch");
            } else {
                handle.abort();
            }
        }

        if let Some(balance) = self.store.last_balance()? {
            let state = self.balances.lock();
            if let Some(callback) = state.observers.get(&identifier) {
                callback(balance);
            }
        }
        Ok(())
    }

    /// First registered memo matching the record's memo text wins; its wait
    /// resolves with the transaction hash and the entry is removed.
    fn deliver_payment(&self, record: PaymentRecord) {
        let Some(memo_text) = record.memo_text else { return };
        let mut state = self.payments.lock();
        let matched = state
            .waits
            .keys()
            .find(|key| key.as_str() == memo_text)
            .cloned();
        let Some(memo) = matched else { return };
        info!("payment found on ledger for {}", memo);
        if let Some(tx) = state.waits.remove(&memo) {
            tx.send_replace(Some(record.hash));
        }
        if state.waits.is_empty() {
            if let Some(handle) = state.watcher.take() {
                handle.abort();
            }
        }
    }

    fn sink(&self) -> SinkHandle {
        self.sink.read().clone()
    }
}
