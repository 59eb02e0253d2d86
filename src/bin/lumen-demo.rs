#![forbid(unsafe_code)]
//! End-to-end demo: migrate accounts from the Core network to the SDK
//! network, bind a session, then watch balance changes and one incoming
//! payment. Ledgers are in-memory; the preference store and migration
//! service can be the real ones.

use async_trait::async_trait;
use clap::Parser;
use lumenbridge::config::load_environment;
use lumenbridge::error::MigrationError;
use lumenbridge::events::{EventSink, TracingSink};
use lumenbridge::ledger::WhitelistFn;
use lumenbridge::memory_ledger::{MemoryClientFactory, MemoryLedger};
use lumenbridge::migration::{MigrationCoordinator, MigrationDelegate};
use lumenbridge::service::{HttpMigrationService, InMemoryMigrationService, MigrationService};
use lumenbridge::session::BlockchainSession;
use lumenbridge::store::{Database, InMemoryStore, Store};
use lumenbridge::types::{Amount, NetworkVersion, PaymentMemoIdentifier};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Environment TOML; the beta preset is used when the file is absent
    #[arg(long, default_value = "environment.toml")]
    config: String,
    /// Number of funded Core accounts to migrate
    #[arg(long, default_value_t = 2)]
    accounts: usize,
    /// Network version the check resolves to (core or sdk)
    #[arg(long, default_value = "sdk")]
    target: String,
    /// POST to the environment's migration service instead of the scripted
    /// in-memory one
    #[arg(long)]
    live: bool,
    /// Keep preferences in memory instead of the configured SQLite file
    #[arg(long)]
    ephemeral: bool,
}

struct TargetDelegate {
    version: NetworkVersion,
}

#[async_trait]
impl MigrationDelegate for TargetDelegate {
    async fn needs_version(&self) -> Result<NetworkVersion, MigrationError> {
        Ok(self.version)
    }

    fn did_start_migration(&self) {
        info!("burn/migrate phase starting");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let environment = load_environment(&cli.config)?;
    info!("using environment '{}'", environment.name);

    let target = match cli.target.as_str() {
        "core" => NetworkVersion::Core,
        "sdk" => NetworkVersion::Sdk,
        other => return Err(format!("unknown target network: {}", other).into()),
    };

    // Preference store, falling back to memory when the file is unusable.
    let store: Arc<dyn Store> = if cli.ephemeral {
        Arc::new(InMemoryStore::new())
    } else {
        match Database::open(&environment.store.path) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                warn!(
                    "Failed to open store at {}: {}. Falling back to in-memory store.",
                    environment.store.path, e
                );
                Arc::new(InMemoryStore::new())
            }
        }
    };

    // Two simulated networks, with funded accounts on the origin side.
    let core = MemoryLedger::new(NetworkVersion::Core);
    let sdk = MemoryLedger::new(NetworkVersion::Sdk);
    for i in 0..cli.accounts {
        core.add_funded_account(Amount::from_num(100 * (i as i64 + 1)));
    }
    let factory = Arc::new(MemoryClientFactory::new(core.clone(), sdk.clone()));

    let service: Arc<dyn MigrationService> = if cli.live {
        Arc::new(HttpMigrationService::new(
            environment.migration.base_url.clone(),
            Duration::from_secs(environment.migration.timeout_secs),
        )?)
    } else {
        Arc::new(InMemoryMigrationService::new())
    };

    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let delegate: Arc<dyn MigrationDelegate> = Arc::new(TargetDelegate { version: target });

    let coordinator = MigrationCoordinator::new(factory, service, Arc::clone(&store));
    coordinator.set_delegate(&delegate);
    coordinator.set_event_sink(&sink);

    let ready = coordinator
        .start()
        .await?
        .expect("no run was active, start() must produce an outcome");
    info!(
        "migration ready: version={} reason={}",
        ready.version,
        ready.reason.code()
    );
    if let Some(at) = store.migrated_at()? {
        info!("migrated flag persisted at {}", at);
    }

    // Session owner duties: reset detection, bind, onboard, observe.
    let session = Arc::new(BlockchainSession::new(Arc::clone(&store)));
    session.set_event_sink(&sink);
    if store.register_session("demo-user", &environment.name)? {
        info!("user or environment changed, resetting cached state");
        session.set_needs_reset();
    }

    let account = session.start_account(&ready.client).await?;
    let address = account.public_address();
    info!("bound account {}", address);

    session.onboard().await?;
    let observer = session
        .add_balance_observer(
            Box::new(|balance| info!("balance changed: {}", balance.amount)),
            None,
        )
        .await?;

    // Watch for one incoming payment, delivered by a funded peer.
    let memo = PaymentMemoIdentifier::new("demo-order-1");
    session.start_watching(memo.clone()).await?;

    let network = match target {
        NetworkVersion::Core => core,
        NetworkVersion::Sdk => sdk,
    };
    let peer = network.add_funded_account(Amount::from_num(500));
    let recipient = address.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let whitelist: WhitelistFn = Arc::new(|envelope| Ok(envelope));
        let result = peer
            .send_transaction(
                &recipient,
                Amount::from_num(42),
                Some("demo-order-1"),
                0,
                whitelist,
            )
            .await;
        if let Err(e) = result {
            warn!("peer payment failed: {}", e);
        }
    });

    let hash = session
        .wait_for_new_payment(&memo, Duration::from_secs(5))
        .await?;
    info!("payment arrived: {}", hash);
    info!("final balance: {}", session.balance().await?);

    session.remove_balance_observer(&observer).await;
    session.stop_watching(None).await;
    Ok(())
}
