//! Lifecycle event stream for migration runs and session onboarding
//!
//! Every phase transition in the migration coordinator and every trustline
//! outcome in the session is reported here as a structured event with a
//! stable snake_case wire code. The sink is telemetry only: nothing in the
//! state machines reads back from it.

use crate::types::NetworkVersion;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::info;

/// Why a burn attempt counted as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BurnReason {
    /// The burn transaction was submitted and accepted.
    Burned,
    /// The account was already inactive; nothing to do.
    AlreadyBurned,
    /// The account never existed on the origin network.
    NoAccount,
    /// The account exists but never established a trustline.
    NoTrustline,
}

/// Why a migration request counted as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrateReason {
    Migrated,
    AlreadyMigrated,
    NoAccount,
}

/// Why a run completed ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyReason {
    /// The version check resolved to the origin network; no migration needed.
    ApiCheck,
    /// The persisted migrated flag short-circuited the run.
    AlreadyMigrated,
    /// The origin network had no accounts to move.
    NoAccountToMigrate,
    /// Every account was burned and migrated in this run.
    Migrated,
}

impl BurnReason {
    pub fn code(&self) -> &'static str {
        match self {
            BurnReason::Burned => "burned",
            BurnReason::AlreadyBurned => "already_burned",
            BurnReason::NoAccount => "no_account",
            BurnReason::NoTrustline => "no_trustline",
        }
    }
}

impl MigrateReason {
    pub fn code(&self) -> &'static str {
        match self {
            MigrateReason::Migrated => "migrated",
            MigrateReason::AlreadyMigrated => "already_migrated",
            MigrateReason::NoAccount => "account_not_found",
        }
    }
}

impl ReadyReason {
    pub fn code(&self) -> &'static str {
        match self {
            ReadyReason::ApiCheck => "api_check",
            ReadyReason::AlreadyMigrated => "already_migrated",
            ReadyReason::NoAccountToMigrate => "no_account_to_migrate",
            ReadyReason::Migrated => "migrated",
        }
    }
}

/// One migration lifecycle event, emitted once per phase transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_name", rename_all = "snake_case")]
pub enum MigrationEvent {
    MethodStarted,
    VersionCheckStarted,
    VersionCheckSucceeded {
        version: NetworkVersion,
    },
    VersionCheckFailed {
        error: String,
    },
    /// The burn/migrate path is about to begin. Not emitted on the
    /// short-circuit paths (already migrated, api check, no accounts).
    MigrationStarted,
    BurnStarted {
        public_address: String,
    },
    BurnSucceeded {
        public_address: String,
        reason: BurnReason,
    },
    BurnFailed {
        public_address: String,
        error: String,
    },
    RequestAccountMigrationStarted {
        public_address: String,
    },
    RequestAccountMigrationSucceeded {
        public_address: String,
        reason: MigrateReason,
    },
    RequestAccountMigrationFailed {
        public_address: String,
        error: String,
    },
    Ready {
        version: NetworkVersion,
        reason: ReadyReason,
    },
    Failed {
        error: String,
    },
}

/// One session lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_name", rename_all = "snake_case")]
pub enum SessionEvent {
    /// No account existed locally; one is being created.
    AccountCreationRequested,
    TrustlineSetupSucceeded,
    TrustlineSetupFailed { error: String },
    WalletCreationSucceeded,
}

/// Receives lifecycle events. Telemetry only, never a control dependency.
pub trait EventSink: Send + Sync {
    fn migration_event(&self, event: MigrationEvent);
    fn session_event(&self, event: SessionEvent);
}

/// Non-owning handle to an event sink.
///
/// The coordinator and session hold these; the owner is responsible for the
/// sink's lifetime. A dropped sink silently stops receiving events.
#[derive(Clone, Default)]
pub struct SinkHandle(Option<Weak<dyn EventSink>>);

impl SinkHandle {
    pub fn new(sink: &Arc<dyn EventSink>) -> Self {
        Self(Some(Arc::downgrade(sink)))
    }

    pub fn migration(&self, event: MigrationEvent) {
        if let Some(sink) = self.0.as_ref().and_then(Weak::upgrade) {
            sink.migration_event(event);
        }
    }

    pub fn session(&self, event: SessionEvent) {
        if let Some(sink) = self.0.as_ref().and_then(Weak::upgrade) {
            sink.session_event(event);
        }
    }
}

/// Forwards every event to `tracing` as a JSON payload.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn migration_event(&self, event: MigrationEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(target: "lumenbridge::events", kind = "migration", %payload);
    }

    fn session_event(&self, event: SessionEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(target: "lumenbridge::events", kind = "session", %payload);
    }
}

/// Accumulates events in memory, timestamped on arrival. Used by tests and
/// the demo binary to inspect emitted sequences.
#[derive(Default)]
pub struct RecordingSink {
    migration: Mutex<Vec<(DateTime<Utc>, MigrationEvent)>>,
    session: Mutex<Vec<(DateTime<Utc>, SessionEvent)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Migration events in arrival order, without timestamps.
    pub fn migration_events(&self) -> Vec<MigrationEvent> {
        self.migration.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn session_events(&self) -> Vec<SessionEvent> {
        self.session.lock().iter().map(|(_, e)| e.clone()).collect()
    }
}

impl EventSink for RecordingSink {
    fn migration_event(&self, event: MigrationEvent) {
        self.migration.lock().push((Utc::now(), event));
    }

    fn session_event(&self, event: SessionEvent) {
        self.session.lock().push((Utc::now(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(BurnReason::AlreadyBurned.code(), "already_burned");
        assert_eq!(MigrateReason::NoAccount.code(), "account_not_found");
        assert_eq!(ReadyReason::NoAccountToMigrate.code(), "no_account_to_migrate");
    }

    #[test]
    fn test_event_wire_format() {
        let event = MigrationEvent::BurnSucceeded {
            public_address: "GABC".to_string(),
            reason: BurnReason::NoTrustline,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_name\":\"burn_succeeded\""));
        assert!(json.contains("\"reason\":\"no_trustline\""));
    }

    #[test]
    fn test_dropped_sink_is_silent() {
        let handle = {
            let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::new());
            SinkHandle::new(&sink)
        };
        // Sink is gone; emitting must not panic.
        handle.migration(MigrationEvent::MethodStarted);
    }
}
