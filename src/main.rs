//! Credit Oracle
//!
//! Usage:
//!   credit-oracle [--env-file .env] [--status-port 9100] [--once] [--check-config]
//!
//! Environment:
//!   RPC_URL, PRIVATE_KEY, CONTRACT_ADDRESS (required)
//!   everything else has a default, see `OracleConfig`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credit_oracle::chain::rpc::LendingContract;
use credit_oracle::chain::{
    ContractEventSource, ContractReader, EventSource, LedgerClient, LocalKeySigner, RpcClient,
    TransactionSigner,
};
use credit_oracle::models::{wei_to_native, EventStream};
use credit_oracle::oracle::{
    DecisionPolicy, FeatureAggregator, NonceSequencer, OracleContext, OracleLoop, OracleStats,
    RequestLedger, ScoringChain, SubmissionManager,
};
use credit_oracle::providers::{
    AccountInfoProvider, CoinGeckoPriceProvider, HttpSocialProvider, NoSocialProvider,
    SocialLinkProvider,
};
use credit_oracle::status::{self, StatusState};
use credit_oracle::OracleConfig;

#[derive(Parser, Debug)]
#[command(name = "credit-oracle")]
#[command(about = "Off-chain credit oracle for the lending contract")]
struct Args {
    /// Load environment variables from this file before reading configuration
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Status server port (overrides STATUS_PORT)
    #[arg(long)]
    status_port: Option<u16>,

    /// Process a single tick and exit
    #[arg(long)]
    once: bool,

    /// Validate configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credit_oracle=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env(env_file: Option<&PathBuf>) {
    match env_file {
        Some(path) => {
            if let Err(e) = dotenv::from_path(path) {
                eprintln!("warning: could not load {}: {}", path.display(), e);
            }
        }
        None => {
            let _ = dotenv::dotenv();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    load_env(args.env_file.as_ref());
    init_tracing();

    info!("🚀 Starting credit oracle v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match OracleConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            for violation in &e.violations {
                error!("❌ {}", violation);
            }
            bail!("{} configuration problem(s), refusing to start", e.violations.len());
        }
    };
    if let Some(port) = args.status_port {
        config.status_port = Some(port);
    }
    config.log_summary();

    if args.check_config {
        info!("✅ Configuration valid");
        return Ok(());
    }

    let rpc = Arc::new(RpcClient::new(config.rpc_url.clone(), config.rpc_timeout)?);
    let chain_id = check_connectivity(&rpc, &config).await?;

    let signer = Arc::new(LocalKeySigner::from_hex(config.private_key.expose())?);
    let oracle_address = signer.address();
    match rpc.get_balance(&oracle_address).await {
        Ok(0) => warn!(account = %oracle_address, "⚠️ Oracle account has no balance for gas"),
        Ok(wei) => info!(account = %oracle_address, balance = wei_to_native(wei), "🔑 Oracle account loaded"),
        Err(e) => warn!(account = %oracle_address, error = %e, "⚠️ Could not read oracle balance"),
    }

    let stats = Arc::new(OracleStats::default());

    let account: Arc<dyn AccountInfoProvider> = rpc.clone();
    let social: Arc<dyn SocialLinkProvider> = match &config.social_api_url {
        Some(url) => Arc::new(HttpSocialProvider::new(url.clone(), config.features.provider_timeout)?),
        None => {
            info!("ℹ️ SOCIAL_API_URL not set, social links are never detected");
            Arc::new(NoSocialProvider)
        }
    };
    let price = Arc::new(CoinGeckoPriceProvider::new(
        config.price_feed.clone(),
        config.features.provider_timeout,
    )?);

    let aggregator = FeatureAggregator::new(account, social, price, config.features.clone())
        .with_stats(stats.clone());
    let scoring = ScoringChain::from_config(&config.scoring).with_stats(stats.clone());
    info!(stages = ?scoring.stage_names(), "🧠 Scoring chain ready");

    let ledger_client: Arc<dyn LedgerClient> = rpc.clone();
    let nonces = Arc::new(NonceSequencer::new(
        ledger_client.clone(),
        oracle_address,
        config.rpc_timeout,
    ));
    let submissions = SubmissionManager::new(
        ledger_client,
        signer,
        nonces,
        config.contract_address,
        chain_id,
        config.submission.clone(),
    )
    .with_stats(stats.clone());

    let contract: Arc<dyn ContractReader> =
        Arc::new(LendingContract::new(rpc.clone(), config.contract_address));

    let ctx = Arc::new(OracleContext {
        ledger: Arc::new(
            RequestLedger::new(config.ledger_capacity)
                .with_tombstone_capacity(config.ledger_tombstones),
        ),
        aggregator,
        scoring,
        policy: DecisionPolicy::new(config.approval_threshold),
        submissions,
        contract: Some(contract),
        stats,
    });

    let sources: Vec<Arc<dyn EventSource>> = [EventStream::Standard, EventStream::Debug]
        .into_iter()
        .map(|stream| {
            Arc::new(ContractEventSource::new(
                rpc.clone(),
                config.contract_address,
                stream,
                config.events.clone(),
            )) as Arc<dyn EventSource>
        })
        .collect();

    let oracle = OracleLoop::new(ctx.clone(), sources, config.loop_config.clone());

    if args.once {
        let summary = oracle.tick().await;
        info!(summary = ?summary, "✅ Single tick complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let status_state = config.status_port.map(|port| {
        let state = StatusState::new(ctx.clone());
        let served = state.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(port, served, rx).await {
                error!(error = %e, "❌ Status server stopped");
            }
        });
        state
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutdown signal received, finishing current batch");
        }
        let _ = shutdown_tx.send(true);
    });

    let result = oracle.run(shutdown_rx).await;

    if let Some(state) = status_state {
        let limit = config.submission.confirmation_timeout + config.rpc_timeout;
        state.drain(limit).await;
    }
    result?;

    let final_stats = ctx.stats.snapshot();
    info!(stats = ?final_stats, "👋 Credit oracle stopped");
    Ok(())
}

/// Fatal startup checks. Returns the chain id transactions are signed for.
async fn check_connectivity(rpc: &RpcClient, config: &OracleConfig) -> Result<u64> {
    let chain_id = rpc
        .chain_id()
        .await
        .with_context(|| format!("cannot reach ledger node at {}", rpc.url()))?;
    if let Some(expected) = config.chain_id {
        if expected != chain_id {
            bail!("CHAIN_ID is {} but the node reports {}", expected, chain_id);
        }
    }

    let block = rpc
        .block_number()
        .await
        .context("failed to read the latest block number")?;
    info!(chain_id, block, "✅ Connected to ledger node");

    let code = rpc
        .get_code(&config.contract_address)
        .await
        .context("failed to read contract code")?;
    if code.is_empty() {
        warn!(
            contract = %config.contract_address,
            "⚠️ No contract code at CONTRACT_ADDRESS, is it deployed on this chain?"
        );
    }

    Ok(chain_id)
}
