use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use planpay::application::engine::{SettlementEngine, Stores};
use planpay::config::{AmountBounds, EngineConfig, RailSecrets, StepUpPolicy};
use planpay::domain::ports::{SharedCredentialStore, SharedProviderDirectory};
use planpay::domain::provider::ProviderRegistration;
use planpay::error::PaymentError;
use planpay::infrastructure::in_memory::{
    InMemoryCredentialStore, InMemoryProviderDirectory, in_memory_stores,
};
use planpay::infrastructure::rails::SandboxRails;
#[cfg(feature = "storage-rocksdb")]
use planpay::infrastructure::rocksdb::RocksDBStore;
use planpay::interfaces::csv::category_reader::CategoryReader;
use planpay::interfaces::csv::category_writer::CategoryWriter;
use planpay::interfaces::http::{AppState, router};
use rust_decimal::Decimal;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "planpay", author, version, about = "Budget-constrained multi-rail settlement engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the REST API.
    Serve(ServeArgs),
    /// Provision categories from a CSV file and print their balances as CSV.
    Report(ReportArgs),
}

#[derive(Debug, Args)]
struct StorageArgs {
    /// Path to a persistent RocksDB database. In-memory storage when unset.
    #[cfg(feature = "storage-rocksdb")]
    #[arg(long, env = "PLANPAY_DB_PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Socket address to bind, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080", env = "PLANPAY_LISTEN")]
    listen: SocketAddr,
    #[command(flatten)]
    storage: StorageArgs,
    /// Category CSV provisioned at startup.
    #[arg(long, env = "PLANPAY_SEED")]
    seed: Option<PathBuf>,
    /// Provider ids registered for local runs, comma separated.
    #[arg(long = "provider", env = "PLANPAY_PROVIDERS", value_delimiter = ',')]
    providers: Vec<String>,
    /// Payments at or above this amount require step-up verification.
    #[arg(long, default_value = "1000", env = "PLANPAY_STEP_UP_THRESHOLD")]
    step_up_threshold: Decimal,
    /// Largest single payment accepted.
    #[arg(long, default_value = "50000", env = "PLANPAY_MAX_AMOUNT")]
    max_amount: Decimal,
    /// Maximum webhook signature age in seconds.
    #[arg(long, default_value_t = 300, env = "PLANPAY_WEBHOOK_TOLERANCE_SECS")]
    webhook_tolerance_secs: i64,
    /// Block confirmations before an on-chain transfer is final.
    #[arg(long, default_value_t = 3, env = "PLANPAY_CHAIN_CONFIRMATIONS")]
    chain_confirmations: u32,
    #[arg(long, default_value = "whsec_sandbox_on_chain", env = "PLANPAY_ON_CHAIN_SECRET", hide_env_values = true)]
    on_chain_secret: String,
    #[arg(long, default_value = "whsec_sandbox_crypto_charge", env = "PLANPAY_CRYPTO_CHARGE_SECRET", hide_env_values = true)]
    crypto_charge_secret: String,
    #[arg(long, default_value = "whsec_sandbox_card", env = "PLANPAY_CARD_SECRET", hide_env_values = true)]
    card_secret: String,
    #[arg(long, default_value = "whsec_sandbox_bank_transfer", env = "PLANPAY_BANK_TRANSFER_SECRET", hide_env_values = true)]
    bank_transfer_secret: String,
}

impl ServeArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            step_up: StepUpPolicy {
                threshold: self.step_up_threshold,
                ..StepUpPolicy::default()
            },
            amount_bounds: AmountBounds {
                max: self.max_amount,
            },
            webhook_tolerance: Duration::seconds(self.webhook_tolerance_secs),
            rail_secrets: RailSecrets {
                on_chain: self.on_chain_secret.clone(),
                crypto_charge: self.crypto_charge_secret.clone(),
                card: self.card_secret.clone(),
                bank_transfer: self.bank_transfer_secret.clone(),
            },
            chain_confirmations: self.chain_confirmations,
            ..EngineConfig::default()
        }
    }
}

#[derive(Debug, Args)]
struct ReportArgs {
    /// Category CSV to provision before reporting.
    input: Option<PathBuf>,
    #[command(flatten)]
    storage: StorageArgs,
}

#[cfg_attr(not(feature = "storage-rocksdb"), allow(unused_variables))]
fn open_stores(
    storage: &StorageArgs,
    providers: SharedProviderDirectory,
    credentials: SharedCredentialStore,
) -> Result<(Stores, &'static str)> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(db_path) = &storage.db_path {
        let store = Arc::new(RocksDBStore::open(db_path).into_diagnostic()?);
        let stores = Stores {
            ledger: store.clone(),
            vouchers: store.clone(),
            transactions: store.clone(),
            redemptions: store,
            providers,
            credentials,
        };
        return Ok((stores, "rocksdb"));
    }

    Ok((in_memory_stores(providers, credentials), "memory"))
}

/// Provisions every readable row; bad rows and already-provisioned
/// categories are logged and skipped.
async fn seed_categories(engine: &SettlementEngine, path: &Path) -> Result<usize> {
    let file = File::open(path).into_diagnostic()?;
    let mut provisioned = 0;
    for category in CategoryReader::new(file).categories() {
        match category {
            Ok(category) => match engine.provision_category(category).await {
                Ok(()) => provisioned += 1,
                Err(PaymentError::Conflict(reason)) => {
                    info!(reason, "Category already provisioned, skipping");
                }
                Err(e) => warn!(error = %e, "Error provisioning category"),
            },
            Err(e) => warn!(error = %e, "Error reading category"),
        }
    }
    Ok(provisioned)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.engine_config();

    let providers = InMemoryProviderDirectory::new();
    for provider_id in &args.providers {
        providers
            .register(ProviderRegistration {
                provider_id: provider_id.clone(),
                registration_number: provider_id.clone(),
                active: true,
                expires_at: Utc::now() + Duration::days(365),
            })
            .await;
    }
    let (stores, storage) = open_stores(
        &args.storage,
        Arc::new(providers),
        Arc::new(InMemoryCredentialStore::new()),
    )?;
    let rails = SandboxRails::new(&config);
    let engine = SettlementEngine::new(stores, rails.registry(), &config);

    if let Some(seed) = &args.seed {
        let provisioned = seed_categories(&engine, seed).await?;
        info!(provisioned, seed = %seed.display(), "Seeded categories");
    }

    let app = router(AppState::new(engine, storage));
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .into_diagnostic()?;
    info!(
        storage,
        "planpay listening on {}",
        listener.local_addr().into_diagnostic()?
    );
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}

async fn report(args: ReportArgs) -> Result<()> {
    let config = EngineConfig::default();
    let (stores, _) = open_stores(
        &args.storage,
        Arc::new(InMemoryProviderDirectory::new()),
        Arc::new(InMemoryCredentialStore::new()),
    )?;
    let engine = SettlementEngine::new(stores, SandboxRails::new(&config).registry(), &config);

    if let Some(input) = &args.input {
        seed_categories(&engine, input).await?;
    }

    let categories = engine.categories().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = CategoryWriter::new(stdout.lock());
    writer.write_categories(&categories).into_diagnostic()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "planpay=info,info".to_string()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Report(args) => report(args).await,
    }
}
