//! Shared value types used across the migration and session layers

use fixed::types::I64F64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic fixed-point representation for asset amounts.
pub type Amount = I64F64;

/// The two network generations a session can run against.
///
/// `Core` is the origin network; `Sdk` is its successor. The choice is made
/// once per migration run and, after a successful migration, pinned to `Sdk`
/// by the persisted migrated flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkVersion {
    Core,
    Sdk,
}

impl fmt::Display for NetworkVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkVersion::Core => write!(f, "core"),
            NetworkVersion::Sdk => write!(f, "sdk"),
        }
    }
}

/// A point-in-time account balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub amount: Amount,
}

impl Balance {
    pub fn new(amount: Amount) -> Self {
        Self { amount }
    }
}

/// Opaque key correlating an expected inbound payment with the logical order
/// that requested it.
///
/// The string format is entirely the caller's business; matching against
/// delivered payment records uses exact string equality on the memo text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentMemoIdentifier(String);

impl PaymentMemoIdentifier {
    pub fn new(memo: impl Into<String>) -> Self {
        Self(memo.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentMemoIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PaymentMemoIdentifier {
    fn from(memo: String) -> Self {
        Self(memo)
    }
}

impl From<&str> for PaymentMemoIdentifier {
    fn from(memo: &str) -> Self {
        Self(memo.to_string())
    }
}
