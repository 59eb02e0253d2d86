//! Ledger account capability consumed by the coordinator and session
//!
//! The crate never talks to a network directly; everything goes through
//! these traits. Production wires in a real ledger client library, tests
//! and the demo binary use [`crate::memory_ledger::MemoryLedger`].

use crate::error::LedgerError;
use crate::types::{Amount, NetworkVersion};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One payment delivered by a payment watch.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    /// Memo text attached to the transaction, if any.
    pub memo_text: Option<String>,
    /// Transaction hash on the ledger.
    pub hash: String,
    pub amount: Amount,
}

/// Stream of payments touching the watched account, oldest first.
pub type PaymentStream = mpsc::Receiver<PaymentRecord>;

/// Stream of balance amounts as they change on the ledger.
pub type BalanceStream = mpsc::Receiver<Amount>;

/// Authorization step applied to an outgoing transaction envelope before it
/// is submitted to the network (e.g. a whitelist co-signing service).
pub type WhitelistFn = Arc<dyn Fn(String) -> Result<String, LedgerError> + Send + Sync>;

/// A single keyed account on one network.
#[async_trait]
pub trait LedgerAccount: Send + Sync {
    fn public_address(&self) -> String;

    /// Opaque local marker attached to the account. `Some` denotes completed
    /// onboarding; the value itself carries no meaning.
    fn extra(&self) -> Option<Vec<u8>>;
    fn set_extra(&self, extra: Option<Vec<u8>>);

    async fn balance(&self) -> Result<Amount, LedgerError>;

    /// Resolves once the account exists on the network.
    async fn watch_creation(&self) -> Result<(), LedgerError>;

    /// Establishes the trustline that lets the account hold the asset.
    async fn activate(&self) -> Result<(), LedgerError>;

    /// Irreversibly disables the account for further transfers.
    ///
    /// `Ok(None)` means the account was already inactive; that is a success,
    /// not an error.
    async fn burn(&self) -> Result<Option<String>, LedgerError>;

    /// Exports the keyed account material for import into another keystore.
    fn export(&self, passphrase: &str) -> Result<String, LedgerError>;

    async fn watch_payments(&self, cursor: &str) -> Result<PaymentStream, LedgerError>;

    async fn watch_balance(&self, from: Option<Amount>) -> Result<BalanceStream, LedgerError>;

    /// Builds, authorizes and submits a payment transaction, returning its
    /// transaction hash.
    async fn send_transaction(
        &self,
        recipient: &str,
        amount: Amount,
        memo: Option<&str>,
        fee: u32,
        whitelist: WhitelistFn,
    ) -> Result<String, LedgerError>;
}

/// A keystore-backed client for one network.
pub trait LedgerClient: Send + Sync {
    fn network_version(&self) -> NetworkVersion;

    /// All accounts currently held by the keystore, oldest first.
    fn accounts(&self) -> Vec<Arc<dyn LedgerAccount>>;

    fn add_account(&self) -> Result<Arc<dyn LedgerAccount>, LedgerError>;

    /// Imports previously exported key material. Fails when the keystore
    /// already holds the address; callers check first.
    fn import_account(
        &self,
        material: &str,
        passphrase: &str,
    ) -> Result<Arc<dyn LedgerAccount>, LedgerError>;

    fn delete_keystore(&self);
}

/// Produces the per-network clients a coordinator works with. Implementations
/// must be cheap to call repeatedly; the coordinator memoizes the result per
/// version.
pub trait ClientFactory: Send + Sync {
    fn client(&self, version: NetworkVersion) -> Arc<dyn LedgerClient>;
}
