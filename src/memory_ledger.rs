//! In-memory ledger capability for tests and the demo binary
//!
//! Simulates one network plus its local keystore: accounts can be created,
//! funded, activated, burned and watched without any transport. Scripted
//! failure knobs let tests exercise the hard-error paths.

use crate::error::LedgerError;
use crate::ledger::{
    BalanceStream, ClientFactory, LedgerAccount, LedgerClient, PaymentRecord, PaymentStream,
    WhitelistFn,
};
use crate::types::{Amount, NetworkVersion};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Exported key material blob. The in-memory keystore is unencrypted; the
/// passphrase is accepted and ignored.
#[derive(Serialize, Deserialize)]
struct KeyMaterial {
    public_address: String,
    seed: String,
}

#[derive(Serialize)]
struct Envelope<'a> {
    from: &'a str,
    to: &'a str,
    amount: Amount,
    memo: Option<&'a str>,
    fee: u32,
}

struct AccountCell {
    exists: bool,
    activated: bool,
    burned: bool,
    balance: Amount,
    extra: Option<Vec<u8>>,
    burn_error: Option<LedgerError>,
    payment_watchers: Vec<mpsc::Sender<PaymentRecord>>,
    balance_watchers: Vec<mpsc::Sender<Amount>>,
}

struct AccountState {
    address: String,
    seed: [u8; 32],
    cell: Mutex<AccountCell>,
    created: Notify,
}

impl AccountState {
    fn new(seed: [u8; 32], exists: bool, activated: bool, balance: Amount) -> Self {
        Self {
            address: derive_address(&seed),
            seed,
            cell: Mutex::new(AccountCell {
                exists,
                activated,
                burned: false,
                balance,
                extra: None,
                burn_error: None,
                payment_watchers: Vec::new(),
                balance_watchers: Vec::new(),
            }),
            created: Notify::new(),
        }
    }

    fn deliver_payment(&self, record: PaymentRecord) {
        let mut cell = self.cell.lock();
        cell.payment_watchers
            .retain(|tx| tx.try_send(record.clone()).is_ok());
    }

    fn deliver_balance(&self, amount: Amount) {
        let mut cell = self.cell.lock();
        cell.balance_watchers
            .retain(|tx| tx.try_send(amount).is_ok());
    }
}

fn derive_address(seed: &[u8]) -> String {
    let digest = Sha256::digest(seed);
    format!("G{}", &hex::encode_upper(digest)[..55])
}

struct LedgerState {
    version: NetworkVersion,
    accounts: Mutex<Vec<Arc<AccountState>>>,
    nonce: AtomicU64,
}

impl LedgerState {
    fn find(&self, address: &str) -> Option<Arc<AccountState>> {
        self.accounts
            .lock()
            .iter()
            .find(|a| a.address == address)
            .cloned()
    }

    fn next_hash(&self, payload: &str) -> String {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        hasher.update(nonce.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

/// One simulated network with its keystore.
#[derive(Clone)]
pub struct MemoryLedger {
    state: Arc<LedgerState>,
}

impl MemoryLedger {
    pub fn new(version: NetworkVersion) -> Self {
        Self {
            state: Arc::new(LedgerState {
                version,
                accounts: Mutex::new(Vec::new()),
                nonce: AtomicU64::new(1),
            }),
        }
    }

    /// Adds an account that already exists on the network, activated and
    /// holding `balance`.
    pub fn add_funded_account(&self, balance: Amount) -> Arc<dyn LedgerAccount> {
        let account = Arc::new(AccountState::new(random_seed(), true, true, balance));
        self.state.accounts.lock().push(Arc::clone(&account));
        self.wrap(account)
    }

    /// Marks a keystore-only account as created on the network, waking any
    /// `watch_creation` callers.
    pub fn mark_created(&self, address: &str, balance: Amount) {
        if let Some(account) = self.state.find(address) {
            {
                let mut cell = account.cell.lock();
                cell.exists = true;
                cell.balance = balance;
            }
            account.created.notify_waiters();
        }
    }

    /// Sets the network-side balance and feeds active balance watchers.
    pub fn set_balance(&self, address: &str, amount: Amount) {
        if let Some(account) = self.state.find(address) {
            account.cell.lock().balance = amount;
            account.deliver_balance(amount);
        }
    }

    /// Feeds a payment record to the account's active payment watchers.
    pub fn deliver_payment(&self, address: &str, record: PaymentRecord) {
        if let Some(account) = self.state.find(address) {
            account.deliver_payment(record);
        }
    }

    /// Scripts the next burn attempts on `address` to fail hard.
    pub fn set_burn_error(&self, address: &str, error: LedgerError) {
        if let Some(account) = self.state.find(address) {
            account.cell.lock().burn_error = Some(error);
        }
    }

    pub fn is_burned(&self, address: &str) -> bool {
        self.state
            .find(address)
            .map(|a| a.cell.lock().burned)
            .unwrap_or(false)
    }

    pub fn holds(&self, address: &str) -> bool {
        self.state.find(address).is_some()
    }

    fn wrap(&self, account: Arc<AccountState>) -> Arc<dyn LedgerAccount> {
        Arc::new(MemoryAccount {
            state: account,
            ledger: Arc::clone(&self.state),
        })
    }
}

fn random_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

impl LedgerClient for MemoryLedger {
    fn network_version(&self) -> NetworkVersion {
        self.state.version
    }

    fn accounts(&self) -> Vec<Arc<dyn LedgerAccount>> {
        let accounts = self.state.accounts.lock().clone();
        accounts.into_iter().map(|a| self.wrap(a)).collect()
    }

    fn add_account(&self) -> Result<Arc<dyn LedgerAccount>, LedgerError> {
        // Fresh accounts live only in the keystore until created on-network.
        let account = Arc::new(AccountState::new(
            random_seed(),
            false,
            false,
            Amount::ZERO,
        ));
        self.state.accounts.lock().push(Arc::clone(&account));
        Ok(self.wrap(account))
    }

    fn import_account(
        &self,
        material: &str,
        _passphrase: &str,
    ) -> Result<Arc<dyn LedgerAccount>, LedgerError> {
        let material: KeyMaterial = serde_json::from_str(material)
            .map_err(|e| LedgerError::Transport(format!("invalid key material: {}", e)))?;
        if self.state.find(&material.public_address).is_some() {
            return Err(LedgerError::Transport(format!(
                "account {} already in keystore",
                material.public_address
            )));
        }
        let seed_bytes = hex::decode(&material.seed)
            .map_err(|e| LedgerError::Transport(format!("invalid key material: {}", e)))?;
        let mut seed = [0u8; 32];
        if seed_bytes.len() != seed.len() {
            return Err(LedgerError::Transport("invalid seed length".to_string()));
        }
        seed.copy_from_slice(&seed_bytes);

        let account = Arc::new(AccountState::new(seed, true, true, Amount::ZERO));
        self.state.accounts.lock().push(Arc::clone(&account));
        Ok(self.wrap(account))
    }

    fn delete_keystore(&self) {
        self.state.accounts.lock().clear();
    }
}

struct MemoryAccount {
    state: Arc<AccountState>,
    ledger: Arc<LedgerState>,
}

#[async_trait]
impl LedgerAccount for MemoryAccount {
    fn public_address(&self) -> String {
        self.state.address.clone()
    }

    fn extra(&self) -> Option<Vec<u8>> {
        self.state.cell.lock().extra.clone()
    }

    fn set_extra(&self, extra: Option<Vec<u8>>) {
        self.state.cell.lock().extra = extra;
    }

    async fn balance(&self) -> Result<Amount, LedgerError> {
        let cell = self.state.cell.lock();
        if !cell.exists {
            return Err(LedgerError::MissingAccount);
        }
        if !cell.activated {
            return Err(LedgerError::MissingBalance);
        }
        Ok(cell.balance)
    }

    async fn watch_creation(&self) -> Result<(), LedgerError> {
        loop {
            let notified = self.state.created.notified();
            if self.state.cell.lock().exists {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn activate(&self) -> Result<(), LedgerError> {
        let mut cell = self.state.cell.lock();
        if !cell.exists {
            return Err(LedgerError::MissingAccount);
        }
        cell.activated = true;
        Ok(())
    }

    async fn burn(&self) -> Result<Option<String>, LedgerError> {
        {
            let mut cell = self.state.cell.lock();
            if let Some(error) = cell.burn_error.clone() {
                return Err(error);
            }
            if !cell.exists {
                return Err(LedgerError::MissingAccount);
            }
            if !cell.activated {
                return Err(LedgerError::MissingBalance);
            }
            if cell.burned {
                return Ok(None);
            }
            cell.burned = true;
        }
        let hash = self.ledger.next_hash(&format!("burn:{}", self.state.address));
        Ok(Some(hash))
    }

    fn export(&self, _passphrase: &str) -> Result<String, LedgerError> {
        let material = KeyMaterial {
            public_address: self.state.address.clone(),
            seed: hex::encode(self.state.seed),
        };
        serde_json::to_string(&material)
            .map_err(|e| LedgerError::InternalInconsistency(e.to_string()))
    }

    async fn watch_payments(&self, _cursor: &str) -> Result<PaymentStream, LedgerError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.state.cell.lock().payment_watchers.push(tx);
        Ok(rx)
    }

    async fn watch_balance(&self, from: Option<Amount>) -> Result<BalanceStream, LedgerError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut cell = self.state.cell.lock();
        // Catch the watcher up when the ledger moved past the caller's view.
        if let Some(from) = from {
            if cell.activated && cell.balance != from {
                let _ = tx.try_send(cell.balance);
            }
        }
        cell.balance_watchers.push(tx);
        Ok(rx)
    }

    async fn send_transaction(
        &self,
        recipient: &str,
        amount: Amount,
        memo: Option<&str>,
        fee: u32,
        whitelist: WhitelistFn,
    ) -> Result<String, LedgerError> {
        let envelope = serde_json::to_string(&Envelope {
            from: &self.state.address,
            to: recipient,
            amount,
            memo,
            fee,
        })
        .map_err(|e| LedgerError::InternalInconsistency(e.to_string()))?;
        let envelope = whitelist(envelope)?;

        let remaining = {
            let mut cell = self.state.cell.lock();
            if !cell.exists {
                return Err(LedgerError::MissingAccount);
            }
            if !cell.activated {
                return Err(LedgerError::MissingBalance);
            }
            if cell.burned {
                return Err(LedgerError::Transport("account is burned".to_string()));
            }
            if cell.balance < amount {
                return Err(LedgerError::Transport("underfunded".to_string()));
            }
            cell.balance -= amount;
            cell.balance
        };
        self.state.deliver_balance(remaining);

        let hash = self.ledger.next_hash(&envelope);
        if let Some(target) = self.ledger.find(recipient) {
            let new_balance = {
                let mut cell = target.cell.lock();
                cell.balance += amount;
                cell.balance
            };
            target.deliver_payment(PaymentRecord {
                memo_text: memo.map(|m| m.to_string()),
                hash: hash.clone(),
                amount,
            });
            target.deliver_balance(new_balance);
        }
        Ok(hash)
    }
}

/// Hands the coordinator one [`MemoryLedger`] per network.
pub struct MemoryClientFactory {
    core: MemoryLedger,
    sdk: MemoryLedger,
}

impl MemoryClientFactory {
    pub fn new(core: MemoryLedger, sdk: MemoryLedger) -> Self {
        Self { core, sdk }
    }
}

impl ClientFactory for MemoryClientFactory {
    fn client(&self, version: NetworkVersion) -> Arc<dyn LedgerClient> {
        match version {
            NetworkVersion::Core => Arc::new(self.core.clone()),
            NetworkVersion::Sdk => Arc::new(self.sdk.clone()),
        }
    }
}
