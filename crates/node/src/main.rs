//! # Nosana Node Entry Point
//!
//! ## Configuration Modes
//!
//! ### Mode 1: TOML file (development)
//! ```text
//! nosana-node <config.toml>
//! ```
//!
//! ### Mode 2: Environment variables (production)
//! ```text
//! nosana-node env
//! ```
//!
//! Required environment variable for env mode:
//! - `NOSANA_MARKET`: market account address to work in
//!
//! Optional:
//! - `NOSANA_NETWORK`: `mainnet` or `devnet` (default devnet)
//! - `NOSANA_SIGNER_FILE`: JSON byte-array keypair file
//! - `NOSANA_RPC_URL`: chain gateway endpoint, or `mock`
//! - `NOSANA_ENGINE`: `docker`, `podman`, a binary path, or `mock`
//! - `NOSANA_ENGINE_HOST`: engine socket override (DOCKER_HOST)
//! - `NOSANA_BLOB_PIN_URL` / `NOSANA_BLOB_GATEWAY_URL` / `NOSANA_BLOB_CREDENTIAL`
//! - `NOSANA_POLL_DELAY_MS`, `NOSANA_DATA_DIR`, `NOSANA_HTTP_PORT`
//! - `NOSANA_OPEN_MARKET`, `NOSANA_START_JOB_LOOP`
//!
//! ## Initialization Flow
//! 1. Parse and validate configuration (fatal on misconfiguration)
//! 2. Wire collaborators (mock endpoints select mock implementations)
//! 3. Run the startup health check and print the boot banner
//! 4. Start the health endpoint and the work loop
//! 5. Wait for SIGINT, then run the shutdown sequence

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use nosana_common::NodeError;
use nosana_node::{
    blob::{BlobClient, BlobGateway, HttpBlobGateway, MockBlobGateway},
    builder::BuilderRegistry,
    chain::{ChainRpc, Market, MockChainRpc},
    config::NodeConfig,
    engine::{ContainerEngine, DockerCliEngine, MockEngine},
    git::{CliGitClient, GitClient, MockGitClient},
    health::HealthMonitor,
    http::serve_health,
    market::MarketClient,
    shutdown::ShutdownCoordinator,
    store::{FileKvStore, FlowStore},
    work_loop::{NodeContext, WorkLoop},
};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{error, info, warn, Level};

fn usage(prog: &str) -> String {
    format!(
        "Usage:\n\
         \n\
         Mode 1 - TOML file (development):\n\
         {prog} <config.toml>\n\
         \n\
         Mode 2 - Environment variables (production):\n\
         {prog} env\n\
         \n\
         Required environment variable for env mode:\n\
         NOSANA_MARKET        - market account address\n\
         \n\
         See the crate documentation for the optional variables."
    )
}

fn load_config() -> Result<NodeConfig, NodeError> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        return Err(NodeError::Misconfiguration(usage(&args[0])));
    }
    if args[1] == "env" {
        NodeConfig::from_env()
    } else {
        NodeConfig::from_file(&args[1])
    }
}

fn wire_rpc(config: &NodeConfig) -> Result<Arc<dyn ChainRpc>, NodeError> {
    if config.rpc_url == "mock" {
        info!("using mock chain gateway");
        let rpc = MockChainRpc::new();
        // a mock chain needs the configured market to exist
        rpc.insert_market(Market {
            address: config.market.clone(),
            queue: vec![],
            job_timeout: 300,
            node_access_key: "open".into(),
        });
        Ok(Arc::new(rpc))
    } else {
        // production chain gateways are injected by deployment builds
        Err(NodeError::Misconfiguration(format!(
            "chain gateway '{}' is not supported by this build; use 'mock'",
            config.rpc_url
        )))
    }
}

fn wire_engine(config: &NodeConfig) -> Arc<dyn ContainerEngine> {
    if config.engine_uri == "mock" {
        info!("using mock container engine");
        Arc::new(MockEngine::new())
    } else {
        Arc::new(DockerCliEngine::new(config.engine_uri.clone(), config.engine_host.clone()))
    }
}

fn wire_blob(config: &NodeConfig) -> Arc<dyn BlobGateway> {
    if config.blob_pin_url == "mock" {
        info!("using mock blob gateway");
        Arc::new(MockBlobGateway::new())
    } else {
        Arc::new(HttpBlobGateway::new(
            config.blob_pin_url.clone(),
            config.blob_gateway_url.clone(),
            config.blob_credential.clone(),
        ))
    }
}

fn wire_git(config: &NodeConfig) -> Arc<dyn GitClient> {
    if config.engine_uri == "mock" {
        Arc::new(MockGitClient::new())
    } else {
        Arc::new(CliGitClient::new())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = match load_config() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let rpc = match wire_rpc(&config) {
        Ok(rpc) => rpc,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let engine = wire_engine(&config);
    let git = wire_git(&config);
    let blob = BlobClient::new(wire_blob(&config));

    let kv = match FileKvStore::new(config.flow_store_dir()) {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let store = FlowStore::new(kv);

    let market = MarketClient::new(rpc.clone(), config.market.clone(), config.node_address());
    let monitor = HealthMonitor::new(config.clone(), rpc.clone(), engine.clone());
    let health = Arc::new(RwLock::new(None));
    let shutdown = Arc::new(Notify::new());

    let ctx = Arc::new(NodeContext {
        config: config.clone(),
        rpc,
        market,
        store,
        blob,
        engine,
        git,
        registry: Arc::new(BuilderRegistry::with_defaults()),
        monitor,
        health: health.clone(),
        shutdown: shutdown.clone(),
    });

    info!("═══════════════════════════════════════════════");
    info!("              Nosana Worker Node");
    info!("═══════════════════════════════════════════════");
    info!("Network:     {}", config.network);
    info!("Market:      {}", config.market);
    info!("Node:        {}", config.node_address());
    info!("Engine:      {}", config.engine_uri);
    info!("Data dir:    {}", config.data_dir.display());
    info!("Poll delay:  {} ms", config.poll_delay_ms);
    info!("═══════════════════════════════════════════════");

    // startup health check feeds the banner and the endpoint
    match ctx.monitor.check().await {
        Ok(report) => {
            if report.is_healthy() {
                info!("startup health check passed");
            } else {
                for reason in report.reasons() {
                    warn!("startup health: {reason}");
                }
            }
            *health.write() = Some(report);
        }
        Err(e) => warn!("startup health check failed: {e}"),
    }

    let http_addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();
    let http_handle = tokio::spawn(serve_health(http_addr, health.clone(), shutdown.clone()));

    let loop_handle = if config.start_job_loop {
        let work_loop = WorkLoop::new(ctx.clone());
        Some(tokio::spawn(work_loop.run()))
    } else {
        info!("job loop disabled, serving health endpoint only");
        None
    };

    info!("node running, press Ctrl+C to shut down");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for termination signal: {e}");
    }

    let coordinator = ShutdownCoordinator::new(ctx.clone());
    coordinator.trigger();

    if let Some(handle) = loop_handle {
        match handle.await {
            Ok(final_state) => coordinator.run(&final_state).await,
            Err(e) => error!("work loop task failed: {e}"),
        }
    }
    let _ = http_handle.await;

    info!("node stopped cleanly");
    ExitCode::SUCCESS
}
