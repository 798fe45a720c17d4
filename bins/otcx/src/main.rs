//! otcx settlement engine binary
//!
//! Entry point for the OTC settlement engine. Provides commands for
//! initializing, validating, and starting the engine.

use anyhow::{Context, Result};
use cli::{Cli, Commands, LogFormatArg};
use config::{
    generate_default_config, load_config, save_config, validate_config, BankGatewayConfig,
    EscrowGatewayConfig, GatewayProvider, MasterConfig, StorageBackend, StorageConfig,
};
use observability::{init_logging, init_metrics, LogFormat};
use settlement::{
    BankGateway, EscrowGateway, HttpBankGateway, HttpEscrowGateway, InMemoryAccountDirectory,
    InMemoryOrderStore, MockBankGateway, MockEscrowGateway, OrchestratorConfig, OrderStore,
    PostgresOrderStore, ReconciliationSweeper, SettlementOrchestrator,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Poll on which the sandbox mock providers report a leg as settled
const SANDBOX_SETTLE_ON_POLL: u32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Start {
            config,
            log_format,
            metrics_port,
        } => start_engine(config, log_format, metrics_port).await,
        Commands::Validate { config } => {
            init_logging("otcx", LogFormat::Pretty)?;
            info!("Executing 'validate' command");
            validate_command(config).await
        }
        Commands::Init { output } => {
            init_logging("otcx", LogFormat::Pretty)?;
            info!("Executing 'init' command");
            init_command(output).await
        }
    }
}

async fn start_engine<P: AsRef<Path>>(
    config_path: P,
    log_format: Option<LogFormatArg>,
    metrics_port: Option<u16>,
) -> Result<()> {
    let config_path = config_path.as_ref();
    let config = load_config(config_path)?;

    let format = match log_format {
        Some(arg) => LogFormat::parse(arg.as_str()).unwrap_or_default(),
        None => LogFormat::parse(&config.logging.format).unwrap_or_default(),
    };
    init_logging(&config.service.name, format)?;

    info!(
        service = %config.service.name,
        environment = %config.service.environment,
        path = ?config_path,
        "otcx starting..."
    );

    let report = validate_config(&config);
    for warning in &report.warnings {
        warn!(field = %warning.field, message = %warning.message, "Configuration warning");
    }
    if !report.is_valid() {
        error!(
            error_count = report.errors.len(),
            "Configuration validation failed"
        );
        for err in &report.errors {
            error!("{}", err);
        }
        anyhow::bail!("Cannot start engine due to configuration errors");
    }

    // The recorder must be installed before any metric handle is created
    if config.metrics.enabled || metrics_port.is_some() {
        init_metrics(metrics_port.unwrap_or(config.metrics.port))?;
    }

    let orchestrator = build_engine(&config).await?;

    let report = orchestrator
        .recover()
        .await
        .context("Startup recovery failed")?;
    info!(
        monitors = orchestrator.supervisor().active_count(),
        counter_legs = report.counter_legs_retried,
        "Engine ready"
    );

    let shutdown = CancellationToken::new();
    let sweeper = ReconciliationSweeper::from_config(orchestrator.clone(), &config.settlement);
    let sweeper_token = shutdown.child_token();
    let sweeper_handle = tokio::spawn(async move { sweeper.run(sweeper_token).await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown..."),
        Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
    }

    shutdown.cancel();
    if let Err(e) = sweeper_handle.await {
        warn!(error = %e, "Reconciliation sweeper ended abnormally");
    }
    orchestrator.shutdown().await;

    info!("otcx stopped");
    Ok(())
}

async fn build_engine(config: &MasterConfig) -> Result<Arc<SettlementOrchestrator>> {
    let timeout = Duration::from_secs(config.settlement.gateway_timeout_seconds);

    let store = build_store(&config.storage).await?;
    let escrow = build_escrow_gateway(&config.gateways.escrow, timeout)?;
    let bank = build_bank_gateway(&config.gateways.bank, timeout)?;
    let directory = InMemoryAccountDirectory::from_config(&config.accounts)
        .context("Invalid accounts section")?;
    debug!(accounts = directory.len(), "Account directory loaded");

    Ok(SettlementOrchestrator::new(
        store,
        escrow,
        bank,
        Arc::new(directory),
        OrchestratorConfig::from_config(&config.settlement, &config.gateways.escrow),
    ))
}

async fn build_store(config: &StorageConfig) -> Result<Arc<dyn OrderStore>> {
    match config.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; settlement state does not survive a restart");
            Ok(Arc::new(InMemoryOrderStore::new()))
        }
        StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("storage.postgres is required for the postgres backend")?;
            let store = PostgresOrderStore::connect(&pg.url, pg.max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            if pg.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run settlement migrations")?;
            }
            info!(max_connections = pg.max_connections, "PostgreSQL order store ready");
            Ok(Arc::new(store))
        }
    }
}

fn build_escrow_gateway(config: &EscrowGatewayConfig, timeout: Duration) -> Result<Arc<dyn EscrowGateway>> {
    match config.provider {
        GatewayProvider::Mock => {
            warn!(settle_on_poll = SANDBOX_SETTLE_ON_POLL, "Using mock custody provider");
            Ok(Arc::new(
                MockEscrowGateway::new().with_funding_on_poll(SANDBOX_SETTLE_ON_POLL),
            ))
        }
        GatewayProvider::Http => {
            let base_url = config
                .base_url
                .as_deref()
                .context("gateways.escrow.base_url is required for the http provider")?;
            let gateway = HttpEscrowGateway::new(
                base_url,
                config.api_key.clone().unwrap_or_default(),
                config.asset_id.clone(),
                timeout,
            )?;
            info!(%base_url, asset = %config.asset_id, "Custody provider configured");
            Ok(Arc::new(gateway))
        }
    }
}

fn build_bank_gateway(config: &BankGatewayConfig, timeout: Duration) -> Result<Arc<dyn BankGateway>> {
    match config.provider {
        GatewayProvider::Mock => {
            warn!(settle_on_poll = SANDBOX_SETTLE_ON_POLL, "Using mock banking rail");
            Ok(Arc::new(
                MockBankGateway::new().with_credit_on_poll(SANDBOX_SETTLE_ON_POLL),
            ))
        }
        GatewayProvider::Http => {
            let base_url = config
                .base_url
                .as_deref()
                .context("gateways.bank.base_url is required for the http provider")?;
            let gateway =
                HttpBankGateway::new(base_url, config.api_key.clone().unwrap_or_default(), timeout)?;
            info!(%base_url, "Banking rail configured");
            Ok(Arc::new(gateway))
        }
    }
}

async fn validate_command<P: AsRef<Path>>(config_path: P) -> Result<()> {
    info!(path = ?config_path.as_ref(), "Validating configuration");

    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "Failed to load configuration");
            anyhow::bail!(e);
        }
    };

    let report = validate_config(&config);

    println!("\n=== Configuration Validation Report ===\n");

    if !report.defaults_applied.is_empty() {
        println!("Defaults Applied ({}):", report.defaults_applied.len());
        for default in &report.defaults_applied {
            println!("  [info] {} = {}", default.field, default.value);
        }
        println!();
    }

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] [{}] {}", warning.field, warning.message);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {}", err);
        }
        println!();
        anyhow::bail!("Configuration validation failed");
    }

    println!("[ok] Configuration is valid!");
    println!();
    println!("Service: {}", config.service.name);
    println!("Environment: {}", config.service.environment);
    println!("Storage: {:?}", config.storage.backend);
    println!("Escrow provider: {:?}", config.gateways.escrow.provider);
    println!("Bank provider: {:?}", config.gateways.bank.provider);
    println!(
        "Poll interval: {}s (max {} consecutive gateway errors)",
        config.settlement.poll_interval_seconds, config.settlement.max_retries
    );
    println!("Beneficiary accounts: {}", config.accounts.len());

    Ok(())
}

async fn init_command<P: AsRef<Path>>(output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!(?output_path, "Initializing new configuration file");

    let config = generate_default_config();

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    save_config(&config, output_path)?;

    println!("[ok] Configuration file created successfully!");
    println!();
    println!("Location: {:?}", output_path);
    println!();
    println!("This configuration includes:");
    println!("  - Sandbox environment with mock custody and banking providers");
    println!("  - In-memory order storage");
    println!("  - Settlement polling every {}s", config.settlement.poll_interval_seconds);
    println!();
    println!("Next steps:");
    println!("  1. Edit the configuration file to point at real providers and PostgreSQL");
    println!("  2. Set required environment variables (database URL, provider API keys)");
    println!(
        "  3. Run 'otcx validate --config {:?}' to check configuration",
        output_path
    );
    println!(
        "  4. Run 'otcx start --config {:?}' to start the engine",
        output_path
    );

    Ok(())
}
