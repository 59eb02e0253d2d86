//! Migration service client
//!
//! The service credits an equivalent balance on the successor network for a
//! burned origin-network account. One POST per account, keyed by public
//! address; the response body always carries `{ code, message }`.

use crate::error::MigrationError;
use crate::events::MigrateReason;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Service response codes with a defined meaning. Everything else fails the
/// run with `MigrationFailed`.
pub const MIGRATE_CODE_SUCCESS: i64 = 200;
pub const MIGRATE_CODE_ALREADY_MIGRATED: i64 = 4001;
pub const MIGRATE_CODE_ACCOUNT_NOT_FOUND: i64 = 4041;

#[derive(Debug, Clone, Deserialize)]
pub struct MigrateResponse {
    pub code: i64,
    pub message: String,
}

impl MigrateResponse {
    /// Maps the response code onto a success reason, or `None` for codes
    /// that must abort the run.
    pub fn reason(&self) -> Option<MigrateReason> {
        match self.code {
            MIGRATE_CODE_SUCCESS => Some(MigrateReason::Migrated),
            MIGRATE_CODE_ALREADY_MIGRATED => Some(MigrateReason::AlreadyMigrated),
            MIGRATE_CODE_ACCOUNT_NOT_FOUND => Some(MigrateReason::NoAccount),
            _ => None,
        }
    }
}

#[async_trait]
pub trait MigrationService: Send + Sync {
    /// Requests server-side migration of one account.
    ///
    /// `Err` means the service could not be reached or answered garbage;
    /// interpreting the response code is the caller's business.
    async fn migrate(&self, public_address: &str) -> Result<MigrateResponse, MigrationError>;
}

/// HTTP implementation: `POST <base>/migrate?address=<public_address>`.
pub struct HttpMigrationService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMigrationService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, MigrationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MigrationError::Service(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl MigrationService for HttpMigrationService {
    async fn migrate(&self, public_address: &str) -> Result<MigrateResponse, MigrationError> {
        let url = format!(
            "{}/migrate?address={}",
            self.base_url.trim_end_matches('/'),
            public_address
        );
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| MigrationError::Service(e.to_string()))?;
        // The service reports outcomes through the body code, including on
        // non-2xx statuses, so the body is decoded unconditionally.
        response
            .json::<MigrateResponse>()
            .await
            .map_err(|e| MigrationError::Service(e.to_string()))
    }
}

/// Scripted in-memory implementation for tests and the demo binary.
pub struct InMemoryMigrationService {
    scripted: Mutex<HashMap<String, MigrateResponse>>,
    transport_error: Mutex<Option<String>>,
    requests: Mutex<Vec<String>>,
}

impl InMemoryMigrationService {
    /// All unscripted addresses answer `MIGRATE_CODE_SUCCESS`.
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            transport_error: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Scripts the response for one address.
    pub fn script(&self, public_address: &str, code: i64, message: &str) {
        self.scripted.lock().insert(
            public_address.to_string(),
            MigrateResponse {
                code,
                message: message.to_string(),
            },
        );
    }

    /// Makes every call fail at the transport layer.
    pub fn fail_transport(&self, message: &str) {
        *self.transport_error.lock() = Some(message.to_string());
    }

    /// Addresses requested so far, in call order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Default for InMemoryMigrationService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MigrationService for InMemoryMigrationService {
    async fn migrate(&self, public_address: &str) -> Result<MigrateResponse, MigrationError> {
        self.requests.lock().push(public_address.to_string());
        if let Some(message) = self.transport_error.lock().clone() {
            return Err(MigrationError::Service(message));
        }
        if let Some(response) = self.scripted.lock().get(public_address) {
            return Ok(response.clone());
        }
        Ok(MigrateResponse {
            code: MIGRATE_CODE_SUCCESS,
            message: "migrated".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_mapping() {
        let ok = MigrateResponse {
            code: MIGRATE_CODE_SUCCESS,
            message: String::new(),
        };
        assert_eq!(ok.reason(), Some(MigrateReason::Migrated));

        let already = MigrateResponse {
            code: MIGRATE_CODE_ALREADY_MIGRATED,
            message: String::new(),
        };
        assert_eq!(already.reason(), Some(MigrateReason::AlreadyMigrated));

        let missing = MigrateResponse {
            code: MIGRATE_CODE_ACCOUNT_NOT_FOUND,
            message: String::new(),
        };
        assert_eq!(missing.reason(), Some(MigrateReason::NoAccount));

        let unknown = MigrateResponse {
            code: 5000,
            message: String::new(),
        };
        assert_eq!(unknown.reason(), None);
    }

    #[tokio::test]
    async fn test_in_memory_service_records_requests() {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let service = InMemoryMigrationService::new();
            service.script("GA", 4001, "already migrated");

            let a = service.migrate("GA").await.unwrap();
            assert_eq!(a.code, 4001);
            let b = service.migrate("GB").await.unwrap();
            assert_eq!(b.code, MIGRATE_CODE_SUCCESS);

            assert_eq!(service.requests(), vec!["GA".to_string(), "GB".to_string()]);
        })
        .await
        .expect("test_in_memory_service_records_requests timed out");
    }
}
