//! Migration coordinator
//!
//! Drives the one-time decision of which network generation a session runs
//! against and, when the answer is the successor network, moves every
//! origin-network account over: burn each account, request server-side
//! migration, import key material into the successor keystore.
//!
//! Phases are strictly sequential (version check, burn, migrate); accounts
//! within a phase are processed concurrently with fail-fast semantics. Every
//! step is idempotent against already-completed sub-steps, so a failed run
//! can always be retried from `start()` without cleanup.

use crate::error::{LedgerError, MigrationError, StoreError};
use crate::events::{BurnReason, EventSink, MigrationEvent, ReadyReason, SinkHandle};
use crate::ledger::{ClientFactory, LedgerAccount, LedgerClient};
use crate::service::MigrationService;
use crate::store::Store;
use crate::types::NetworkVersion;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Key material moved between keystores is not wrapped in an extra
/// passphrase; the keystores themselves are the protection boundary.
const EXPORT_PASSPHRASE: &str = "";

/// Answers the coordinator's questions. The coordinator holds a non-owning
/// reference; the session owner is responsible for the delegate's lifetime.
#[async_trait]
pub trait MigrationDelegate: Send + Sync {
    /// Resolve which network version the session should use. May perform a
    /// network round trip; the run blocks on it.
    async fn needs_version(&self) -> Result<NetworkVersion, MigrationError>;

    /// The burn/migrate path is about to begin. Not called on the
    /// short-circuit paths.
    fn did_start_migration(&self) {}
}

/// Terminal outcome of a successful run.
pub struct MigrationReady {
    /// Client for the chosen network; the session owner binds an account
    /// from it.
    pub client: Arc<dyn LedgerClient>,
    pub version: NetworkVersion,
    pub reason: ReadyReason,
}

pub struct MigrationCoordinator {
    factory: Arc<dyn ClientFactory>,
    service: Arc<dyn MigrationService>,
    store: Arc<dyn Store>,
    delegate: RwLock<Option<Weak<dyn MigrationDelegate>>>,
    sink: RwLock<SinkHandle>,
    core_client: OnceCell<Arc<dyn LedgerClient>>,
    sdk_client: OnceCell<Arc<dyn LedgerClient>>,
    version: RwLock<Option<NetworkVersion>>,
    started: AtomicBool,
}

impl MigrationCoordinator {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        service: Arc<dyn MigrationService>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            factory,
            service,
            store,
            delegate: RwLock::new(None),
            sink: RwLock::new(SinkHandle::default()),
            core_client: OnceCell::new(),
            sdk_client: OnceCell::new(),
            version: RwLock::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Registers the version-resolution delegate. Must happen before
    /// `start()`.
    pub fn set_delegate(&self, delegate: &Arc<dyn MigrationDelegate>) {
        *self.delegate.write() = Some(Arc::downgrade(delegate));
    }

    pub fn set_event_sink(&self, sink: &Arc<dyn EventSink>) {
        *self.sink.write() = SinkHandle::new(sink);
    }

    /// The version resolved by the current or last run, if any.
    pub fn version(&self) -> Option<NetworkVersion> {
        *self.version.read()
    }

    pub fn is_migrated(&self) -> Result<bool, StoreError> {
        self.store.is_migrated()
    }

    /// Wipes both networks' keystores. Debugging aid.
    pub fn delete_keystore(&self) {
        self.core_client().delete_keystore();
        self.sdk_client().delete_keystore();
    }

    /// Runs the migration state machine to its terminal outcome.
    ///
    /// Returns `Ok(None)` when a run is already active (re-entrant calls are
    /// a no-op, not an error). Returns `Ok(Some(ready))` with the client for
    /// the chosen network, or the error that terminated the run. Failed runs
    /// leave persisted state untouched and can be retried.
    pub async fn start(&self) -> Result<Option<MigrationReady>, MigrationError> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let delegate = self
            .delegate
            .read()
            .clone()
            .and_then(|weak| weak.upgrade())
            .ok_or(MigrationError::MissingDelegate)?;
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }

        let result = self.run(delegate.as_ref()).await;
        self.started.store(false, Ordering::SeqCst);

        match result {
            Ok(ready) => {
                self.emit(MigrationEvent::Ready {
                    version: ready.version,
                    reason: ready.reason,
                });
                Ok(Some(ready))
            }
            Err(error) => {
                warn!("migration run failed: {}", error);
                self.emit(MigrationEvent::Failed {
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn run(&self, delegate: &dyn MigrationDelegate) -> Result<MigrationReady, MigrationError> {
        self.emit(MigrationEvent::MethodStarted);

        if self.store.is_migrated()? {
            *self.version.write() = Some(NetworkVersion::Sdk);
            return self.completed(ReadyReason::AlreadyMigrated);
        }

        self.emit(MigrationEvent::VersionCheckStarted);
        let version = match delegate.needs_version().await {
            Ok(version) => {
                self.emit(MigrationEvent::VersionCheckSucceeded { version });
                version
            }
            Err(error) => {
                self.emit(MigrationEvent::VersionCheckFailed {
                    error: error.to_string(),
                });
                return Err(error);
            }
        };
        *self.version.write() = Some(version);

        match version {
            NetworkVersion::Core => self.completed(ReadyReason::ApiCheck),
            NetworkVersion::Sdk => self.start_migration(delegate).await,
        }
    }

    async fn start_migration(
        &self,
        delegate: &dyn MigrationDelegate,
    ) -> Result<MigrationReady, MigrationError> {
        let accounts = self.core_client().accounts();
        if accounts.is_empty() {
            return self.completed(ReadyReason::NoAccountToMigrate);
        }

        self.emit(MigrationEvent::MigrationStarted);
        delegate.did_start_migration();

        self.burn_accounts(&accounts).await?;
        self.migrate_accounts(&accounts).await?;
        self.completed(ReadyReason::Migrated)
    }

    fn completed(&self, reason: ReadyReason) -> Result<MigrationReady, MigrationError> {
        let Some(version) = *self.version.read() else {
            return Err(MigrationError::UnexpectedCondition);
        };
        if version == NetworkVersion::Sdk {
            self.store.set_migrated()?;
        }
        let client = match version {
            NetworkVersion::Core => self.core_client(),
            NetworkVersion::Sdk => self.sdk_client(),
        };
        debug!("migration run completed: version={} reason={}", version, reason.code());
        Ok(MigrationReady {
            client,
            version,
            reason,
        })
    }

    /// Burns every account concurrently. Fails on the first hard error;
    /// already-spawned attempts run to completion detached, their results
    /// ignored.
    async fn burn_accounts(
        &self,
        accounts: &[Arc<dyn LedgerAccount>],
    ) -> Result<(), MigrationError> {
        let mut attempts: FuturesUnordered<_> = accounts
            .iter()
            .map(|account| {
                let account = Arc::clone(account);
                let sink = self.sink();
                tokio::spawn(async move { burn_account(account, sink).await })
            })
            .collect();

        while let Some(joined) = attempts.next().await {
            joined.map_err(|_| MigrationError::UnexpectedCondition)??;
        }
        Ok(())
    }

    /// Requests migration for every account concurrently, importing key
    /// material into the SDK keystore as each succeeds. Same fail-fast
    /// semantics as the burn phase.
    async fn migrate_accounts(
        &self,
        accounts: &[Arc<dyn LedgerAccount>],
    ) -> Result<(), MigrationError> {
        let sdk_client = self.sdk_client();
        let mut attempts: FuturesUnordered<_> = accounts
            .iter()
            .map(|account| {
                let account = Arc::clone(account);
                let sdk_client = Arc::clone(&sdk_client);
                let service = Arc::clone(&self.service);
                let sink = self.sink();
                tokio::spawn(async move { migrate_account(account, sdk_client, service, sink).await })
            })
            .collect();

        while let Some(joined) = attempts.next().await {
            joined.map_err(|_| MigrationError::UnexpectedCondition)??;
        }
        Ok(())
    }

    fn core_client(&self) -> Arc<dyn LedgerClient> {
        self.core_client
            .get_or_init(|| self.factory.client(NetworkVersion::Core))
            .clone()
    }

    fn sdk_client(&self) -> Arc<dyn LedgerClient> {
        self.sdk_client
            .get_or_init(|| self.factory.client(NetworkVersion::Sdk))
            .clone()
    }

    fn sink(&self) -> SinkHandle {
        self.sink.read().clone()
    }

    fn emit(&self, event: MigrationEvent) {
        self.sink().migration(event);
    }
}

async fn burn_account(
    account: Arc<dyn LedgerAccount>,
    sink: SinkHandle,
) -> Result<(), MigrationError> {
    let public_address = account.public_address();
    sink.migration(MigrationEvent::BurnStarted {
        public_address: public_address.clone(),
    });

    match account.burn().await {
        Ok(hash) => {
            let reason = if hash.is_some() {
                BurnReason::Burned
            } else {
                BurnReason::AlreadyBurned
            };
            sink.migration(MigrationEvent::BurnSucceeded {
                public_address,
                reason,
            });
            Ok(())
        }
        // Nothing to burn counts as success; the network can hold no value
        // for an account that never existed or never took the trustline.
        Err(LedgerError::MissingAccount) => {
            sink.migration(MigrationEvent::BurnSucceeded {
                public_address,
                reason: BurnReason::NoAccount,
            });
            Ok(())
        }
        Err(LedgerError::MissingBalance) => {
            sink.migration(MigrationEvent::BurnSucceeded {
                public_address,
                reason: BurnReason::NoTrustline,
            });
            Ok(())
        }
        Err(error) => {
            sink.migration(MigrationEvent::BurnFailed {
                public_address,
                error: error.to_string(),
            });
            Err(error.into())
        }
    }
}

async fn migrate_account(
    account: Arc<dyn LedgerAccount>,
    sdk_client: Arc<dyn LedgerClient>,
    service: Arc<dyn MigrationService>,
    sink: SinkHandle,
) -> Result<(), MigrationError> {
    let public_address = account.public_address();
    sink.migration(MigrationEvent::RequestAccountMigrationStarted {
        public_address: public_address.clone(),
    });

    let response = match service.migrate(&public_address).await {
        Ok(response) => response,
        Err(error) => {
            sink.migration(MigrationEvent::RequestAccountMigrationFailed {
                public_address,
                error: error.to_string(),
            });
            return Err(error);
        }
    };

    match response.reason() {
        Some(reason) => {
            sink.migration(MigrationEvent::RequestAccountMigrationSucceeded {
                public_address,
                reason,
            });
            move_account_to_sdk_if_needed(account.as_ref(), sdk_client.as_ref())?;
            Ok(())
        }
        None => {
            let error = MigrationError::MigrationFailed {
                code: response.code,
                message: response.message,
            };
            sink.migration(MigrationEvent::RequestAccountMigrationFailed {
                public_address,
                error: error.to_string(),
            });
            Err(error)
        }
    }
}

/// Moves key material into the SDK keystore unless it already holds the
/// address. The check keeps retries from tripping duplicate-key errors.
fn move_account_to_sdk_if_needed(
    account: &dyn LedgerAccount,
    sdk_client: &dyn LedgerClient,
) -> Result<(), MigrationError> {
    let public_address = account.public_address();
    let already_held = sdk_client
        .accounts()
        .iter()
        .any(|held| held.public_address() == public_address);
    if already_held {
        return Ok(());
    }
    let material = account.export(EXPORT_PASSPHRASE)?;
    sdk_client.import_account(&material, EXPORT_PASSPHRASE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::memory_ledger::{MemoryClientFactory, MemoryLedger};
    use crate::service::InMemoryMigrationService;
    use crate::store::InMemoryStore;
    use crate::types::Amount;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct FixedDelegate {
        version: NetworkVersion,
        migration_starts: AtomicUsize,
    }

    impl FixedDelegate {
        fn new(version: NetworkVersion) -> Arc<Self> {
            Arc::new(Self {
                version,
                migration_starts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MigrationDelegate for FixedDelegate {
        async fn needs_version(&self) -> Result<NetworkVersion, MigrationError> {
            Ok(self.version)
        }

        fn did_start_migration(&self) {
            self.migration_starts.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Blocks in `needs_version` until a permit is released.
    struct GatedDelegate {
        gate: Semaphore,
    }

    #[async_trait]
    impl MigrationDelegate for GatedDelegate {
        async fn needs_version(&self) -> Result<NetworkVersion, MigrationError> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| MigrationError::UnexpectedCondition)?;
            Ok(NetworkVersion::Core)
        }
    }

    struct Fixture {
        coordinator: Arc<MigrationCoordinator>,
        core: MemoryLedger,
        sdk: MemoryLedger,
        service: Arc<InMemoryMigrationService>,
        store: Arc<InMemoryStore>,
        sink: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let core = MemoryLedger::new(NetworkVersion::Core);
        let sdk = MemoryLedger::new(NetworkVersion::Sdk);
        let factory = Arc::new(MemoryClientFactory::new(core.clone(), sdk.clone()));
        let service = Arc::new(InMemoryMigrationService::new());
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let sink_dyn: Arc<dyn EventSink> = sink.clone();

        let coordinator = Arc::new(MigrationCoordinator::new(
            factory,
            service.clone() as Arc<dyn MigrationService>,
            store.clone() as Arc<dyn Store>,
        ));
        coordinator.set_event_sink(&sink_dyn);

        Fixture {
            coordinator,
            core,
            sdk,
            service,
            store,
            sink,
        }
    }

    #[tokio::test]
    async fn test_missing_delegate() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let fx = fixture();
            let result = fx.coordinator.start().await;
            assert!(matches!(result, Err(MigrationError::MissingDelegate)));
        })
        .await
        .expect("test_missing_delegate timed out");
    }

    #[tokio::test]
    async fn test_version_core_completes_with_api_check() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let fx = fixture();
            let delegate = FixedDelegate::new(NetworkVersion::Core);
            let delegate_dyn: Arc<dyn MigrationDelegate> = delegate.clone();
            fx.coordinator.set_delegate(&delegate_dyn);

            let ready = fx.coordinator.start().await.unwrap().unwrap();
            assert_eq!(ready.version, NetworkVersion::Core);
            assert_eq!(ready.reason, ReadyReason::ApiCheck);
            assert_eq!(ready.client.network_version(), NetworkVersion::Core);

            // Choosing the origin network never persists the migrated flag.
            assert!(!fx.store.is_migrated().unwrap());
            assert!(fx.service.requests().is_empty());
            assert_eq!(delegate.migration_starts.load(Ordering::SeqCst), 0);
        })
        .await
        .expect("test_version_core_completes_with_api_check timed out");
    }

    #[tokio::test]
    async fn test_event_sequence_for_single_account_migration() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let fx = fixture();
            fx.core.add_funded_account(Amount::from_num(50));
            let delegate = FixedDelegate::new(NetworkVersion::Sdk);
            let delegate_dyn: Arc<dyn MigrationDelegate> = delegate.clone();
            fx.coordinator.set_delegate(&delegate_dyn);

            fx.coordinator.start().await.unwrap().unwrap();

            let events = fx.sink.migration_events();
            let names: Vec<&str> = events
                .iter()
                .map(|e| match e {
                    MigrationEvent::MethodStarted => "method_started",
                    MigrationEvent::VersionCheckStarted => "version_check_started",
                    MigrationEvent::VersionCheckSucceeded { .. } => "version_check_succeeded",
                    MigrationEvent::MigrationStarted => "migration_started",
                    MigrationEvent::BurnStarted { .. } => "burn_started",
                    MigrationEvent::BurnSucceeded { .. } => "burn_succeeded",
                    MigrationEvent::RequestAccountMigrationStarted { .. } => "request_started",
                    MigrationEvent::RequestAccountMigrationSucceeded { .. } => "request_succeeded",
                    MigrationEvent::Ready { .. } => "ready",
                    _ => "other",
                })
                .collect();
            assert_eq!(
                names,
                vec![
                    "method_started",
                    "version_check_started",
                    "version_check_succeeded",
                    "migration_started",
                    "burn_started",
                    "burn_succeeded",
                    "request_started",
                    "request_succeeded",
                    "ready",
                ]
            );
            assert_eq!(delegate.migration_starts.load(Ordering::SeqCst), 1);
        })
        .await
        .expect("test_event_sequence_for_single_account_migration timed out");
    }

    #[tokio::test]
    async fn test_burn_hard_failure_aborts_run() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let fx = fixture();
            let healthy = fx.core.add_funded_account(Amount::from_num(10));
            let failing = fx.core.add_funded_account(Amount::from_num(10));
            fx.core.set_burn_error(
                &failing.public_address(),
                LedgerError::Transport("horizon 500".to_string()),
            );
            let delegate = FixedDelegate::new(NetworkVersion::Sdk);
            let delegate_dyn: Arc<dyn MigrationDelegate> = delegate.clone();
            fx.coordinator.set_delegate(&delegate_dyn);

            let result = fx.coordinator.start().await;
            assert!(matches!(
                result,
                Err(MigrationError::Ledger(LedgerError::Transport(_)))
            ));

            // Persisted state is untouched and no migration was requested
            // for the failing account's run... the healthy account may or
            // may not have been burned, which the retry path tolerates.
            assert!(!fx.store.is_migrated().unwrap());
            let _ = healthy;
            let events = fx.sink.migration_events();
            assert!(events
                .iter()
                .any(|e| matches!(e, MigrationEvent::BurnFailed { .. })));
            assert!(events
                .iter()
                .any(|e| matches!(e, MigrationEvent::Failed { .. })));
        })
        .await
        .expect("test_burn_hard_failure_aborts_run timed out");
    }

    #[tokio::test]
    async fn test_failed_run_retries_cleanly() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let fx = fixture();
            let a = fx.core.add_funded_account(Amount::from_num(10));
            let b = fx.core.add_funded_account(Amount::from_num(20));
            // First run: the service rejects account b with an unknown code.
            fx.service.script(&b.public_address(), 5000, "maintenance");

            let delegate = FixedDelegate::new(NetworkVersion::Sdk);
            let delegate_dyn: Arc<dyn MigrationDelegate> = delegate.clone();
            fx.coordinator.set_delegate(&delegate_dyn);

            let result = fx.coordinator.start().await;
            assert!(matches!(
                result,
                Err(MigrationError::MigrationFailed { code: 5000, .. })
            ));
            assert!(!fx.store.is_migrated().unwrap());
            // Both accounts were burned before the migrate phase failed.
            assert!(fx.core.is_burned(&a.public_address()));
            assert!(fx.core.is_burned(&b.public_address()));

            // Second run: the service now reports b as already migrated.
            fx.service.script(
                &b.public_address(),
                crate::service::MIGRATE_CODE_ALREADY_MIGRATED,
                "already migrated",
            );
            let ready = fx.coordinator.start().await.unwrap().unwrap();
            assert_eq!(ready.reason, ReadyReason::Migrated);
            assert!(fx.store.is_migrated().unwrap());
            assert!(fx.sdk.holds(&a.public_address()));
            assert!(fx.sdk.holds(&b.public_address()));

            // Retried burns resolved as already burned, never as failures.
            let events = fx.sink.migration_events();
            assert!(events.iter().any(|e| matches!(
                e,
                MigrationEvent::BurnSucceeded {
                    reason: BurnReason::AlreadyBurned,
                    ..
                }
            )));
        })
        .await
        .expect("test_failed_run_retries_cleanly timed out");
    }

    #[tokio::test]
    async fn test_start_is_reentrant_noop_while_running() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let fx = fixture();
            let delegate = Arc::new(GatedDelegate {
                gate: Semaphore::new(0),
            });
            let delegate_dyn: Arc<dyn MigrationDelegate> = delegate.clone();
            fx.coordinator.set_delegate(&delegate_dyn);

            let coordinator = Arc::clone(&fx.coordinator);
            let first = tokio::spawn(async move { coordinator.start().await });

            // Let the first run reach the version check.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let second = fx.coordinator.start().await.unwrap();
            assert!(second.is_none());

            delegate.gate.add_permits(1);
            let ready = first.await.unwrap().unwrap().unwrap();
            assert_eq!(ready.version, NetworkVersion::Core);

            // The second call emitted nothing.
            let method_started = fx
                .sink
                .migration_events()
                .iter()
                .filter(|e| matches!(e, MigrationEvent::MethodStarted))
                .count();
            assert_eq!(method_started, 1);
        })
        .await
        .expect("test_start_is_reentrant_noop_while_running timed out");
    }

    #[tokio::test]
    async fn test_delete_keystore_clears_both_networks() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let fx = fixture();
            fx.core.add_funded_account(Amount::from_num(1));
            fx.sdk.add_funded_account(Amount::from_num(1));

            fx.coordinator.delete_keystore();
            assert!(fx.core.accounts().is_empty());
            assert!(fx.sdk.accounts().is_empty());
        })
        .await
        .expect("test_delete_keystore_clears_both_networks timed out");
    }
}
