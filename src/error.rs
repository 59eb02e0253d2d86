//! Error types for lumenbridge
//!
//! Success-with-reason outcomes (already burned, already migrated, no account,
//! no trustline) are ordinary values in [`crate::events`], never errors.

use thiserror::Error;

/// Errors produced by ledger capability implementations.
///
/// `MissingAccount` and `MissingBalance` are load-bearing: the migration
/// coordinator and the onboarding flow branch on them, so capability
/// implementations must report them faithfully rather than collapsing
/// everything into `Transport`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("account does not exist on the network")]
    MissingAccount,
    #[error("account exists but holds no asset balance")]
    MissingBalance,
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("internal ledger inconsistency: {0}")]
    InternalInconsistency(String),
}

/// Errors from the durable preference store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors terminating a migration run.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// `start()` was called before a version-resolution delegate was set.
    #[error("no migration delegate registered")]
    MissingDelegate,
    /// The state machine reached a state it cannot be in. Not retryable.
    #[error("migration reached an unexpected condition")]
    UnexpectedCondition,
    /// The migration service answered with a code outside the known set.
    #[error("migration service rejected account: code {code}: {message}")]
    MigrationFailed { code: i64, message: String },
    /// The migration service could not be reached or returned garbage.
    #[error("migration service unreachable: {0}")]
    Service(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the blockchain session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation requires a bound account and none is bound yet.
    #[error("no account is bound to the session")]
    NotBound,
    /// `wait_for_new_payment` was called for a memo that was never registered.
    #[error("no watch was started for the given memo")]
    WatchNotStarted,
    /// The payment wait elapsed before a matching payment arrived.
    #[error("watch timed out before a matching payment arrived")]
    WatchTimedOut,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
