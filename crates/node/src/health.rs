//! # Health Monitor
//!
//! Classifies the node as fit or unfit for market work. Health is computed
//! from actual probes — balances on chain, engine reachability, credential
//! presence — never assumed. Every failing criterion is reported as its own
//! reason so an operator sees the full list at once, on the boot banner and
//! on `/health`.
//!
//! A check is expensive (two balance reads, an NFT count, an engine ping),
//! so the work loop runs it at most every fifteen minutes and caches the
//! report between checks.

use std::sync::Arc;
use std::time::Duration;

use nosana_common::Result;
use serde::Serialize;

use crate::chain::ChainRpc;
use crate::config::NodeConfig;
use crate::engine::ContainerEngine;

/// Minimum SOL balance to operate: 0.01 SOL.
pub const MIN_SOL_BALANCE_LAMPORTS: u64 = 10_000_000;

/// How often the work loop re-runs the health check.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Balance and holdings snapshot taken during a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Snapshot {
    /// Lamports held by the signer.
    pub sol_balance: u64,
    /// NOS token balance on the derived token account.
    pub nos_balance: u64,
    /// Access-key NFTs held from the market's collection.
    pub nft_count: u64,
}

/// One independent reason the node is unfit for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "reason")]
pub enum HealthReason {
    SignerMissing,
    LowSolBalance { lamports: u64 },
    NoAccessKey,
    BlobCredentialMissing,
    EngineUnreachable { detail: String },
}

impl std::fmt::Display for HealthReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthReason::SignerMissing => write!(f, "signer key absent"),
            HealthReason::LowSolBalance { lamports } => {
                write!(f, "SOL balance too low: {lamports} lamports")
            }
            HealthReason::NoAccessKey => write!(f, "no market access key held"),
            HealthReason::BlobCredentialMissing => write!(f, "blob store credential absent"),
            HealthReason::EngineUnreachable { detail } => {
                write!(f, "container engine unreachable: {detail}")
            }
        }
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthReport {
    Healthy { snapshot: Snapshot },
    Unhealthy { snapshot: Snapshot, reasons: Vec<HealthReason> },
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthReport::Healthy { .. })
    }

    pub fn snapshot(&self) -> Snapshot {
        match self {
            HealthReport::Healthy { snapshot } => *snapshot,
            HealthReport::Unhealthy { snapshot, .. } => *snapshot,
        }
    }

    pub fn reasons(&self) -> &[HealthReason] {
        match self {
            HealthReport::Healthy { .. } => &[],
            HealthReport::Unhealthy { reasons, .. } => reasons,
        }
    }
}

/// Runs the probes and classifies the node.
#[derive(Clone)]
pub struct HealthMonitor {
    config: Arc<NodeConfig>,
    rpc: Arc<dyn ChainRpc>,
    engine: Arc<dyn ContainerEngine>,
}

impl HealthMonitor {
    pub fn new(
        config: Arc<NodeConfig>,
        rpc: Arc<dyn ChainRpc>,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        Self { config, rpc, engine }
    }

    /// Run every probe and collect the failing criteria.
    ///
    /// Probe I/O errors propagate: a check that could not run is not a
    /// verdict, and the loop keeps its previous state.
    pub async fn check(&self) -> Result<HealthReport> {
        let mut reasons = Vec::new();
        let mut snapshot = Snapshot::default();

        if self.config.signer.is_none() {
            reasons.push(HealthReason::SignerMissing);
        } else {
            let node = self.config.node_address();
            snapshot.sol_balance = self.rpc.sol_balance(&node).await?;
            if snapshot.sol_balance < MIN_SOL_BALANCE_LAMPORTS {
                reasons.push(HealthReason::LowSolBalance { lamports: snapshot.sol_balance });
            }

            snapshot.nos_balance = self.rpc.token_balance(&self.config.token_address()).await?;

            let market = self.rpc.get_market(&self.config.market).await?;
            snapshot.nft_count =
                self.rpc.access_key_count(&node, &market.node_access_key).await?;
            if snapshot.nft_count < 1 && !self.config.open_market {
                reasons.push(HealthReason::NoAccessKey);
            }
        }

        if self.config.blob_pin_url != "mock" && self.config.blob_credential.is_none() {
            reasons.push(HealthReason::BlobCredentialMissing);
        }

        if let Err(e) = self.engine.ping().await {
            reasons.push(HealthReason::EngineUnreachable { detail: e.to_string() });
        }

        if reasons.is_empty() {
            Ok(HealthReport::Healthy { snapshot })
        } else {
            Ok(HealthReport::Unhealthy { snapshot, reasons })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Market, MockChainRpc};
    use crate::config::{Network, NodeConfig, Signer};
    use crate::engine::MockEngine;
    use std::path::PathBuf;

    fn config(signer: bool, open_market: bool) -> Arc<NodeConfig> {
        Arc::new(NodeConfig {
            network: Network::Devnet,
            market: "market111".into(),
            signer: signer.then(|| Signer::from_keypair_bytes(&[7u8; 32]).expect("signer")),
            rpc_url: "mock".into(),
            engine_uri: "mock".into(),
            engine_host: None,
            blob_pin_url: "mock".into(),
            blob_gateway_url: "https://gateway.example/ipfs".into(),
            blob_credential: None,
            poll_delay_ms: 100,
            open_market,
            start_job_loop: true,
            data_dir: PathBuf::from("./data"),
            http_port: 8080,
        })
    }

    fn seeded_rpc(config: &NodeConfig) -> Arc<MockChainRpc> {
        let rpc = Arc::new(MockChainRpc::new());
        rpc.insert_market(Market {
            address: config.market.clone(),
            queue: vec![],
            job_timeout: 60,
            node_access_key: "collection111".into(),
        });
        rpc.set_sol_balance(&config.node_address(), MIN_SOL_BALANCE_LAMPORTS);
        rpc.set_access_keys(&config.node_address(), 1);
        rpc
    }

    #[tokio::test]
    async fn healthy_when_all_criteria_pass() {
        let config = config(true, false);
        let rpc = seeded_rpc(&config);
        let monitor = HealthMonitor::new(config, rpc, Arc::new(MockEngine::new()));

        let report = monitor.check().await.expect("check");
        assert!(report.is_healthy());
        assert_eq!(report.snapshot().nft_count, 1);
        assert!(report.reasons().is_empty());
    }

    #[tokio::test]
    async fn low_balance_is_a_reason() {
        let config = config(true, false);
        let rpc = seeded_rpc(&config);
        rpc.set_sol_balance(&config.node_address(), MIN_SOL_BALANCE_LAMPORTS - 1);
        let monitor = HealthMonitor::new(config, rpc, Arc::new(MockEngine::new()));

        let report = monitor.check().await.expect("check");
        assert!(!report.is_healthy());
        assert!(report
            .reasons()
            .iter()
            .any(|r| matches!(r, HealthReason::LowSolBalance { .. })));
    }

    #[tokio::test]
    async fn open_market_waives_access_key() {
        let config = config(true, true);
        let rpc = seeded_rpc(&config);
        rpc.set_access_keys(&config.node_address(), 0);
        let monitor = HealthMonitor::new(config, rpc, Arc::new(MockEngine::new()));

        let report = monitor.check().await.expect("check");
        assert!(report.is_healthy());
    }

    #[tokio::test]
    async fn missing_access_key_on_gated_market() {
        let config = config(true, false);
        let rpc = seeded_rpc(&config);
        rpc.set_access_keys(&config.node_address(), 0);
        let monitor = HealthMonitor::new(config, rpc, Arc::new(MockEngine::new()));

        let report = monitor.check().await.expect("check");
        assert!(report.reasons().contains(&HealthReason::NoAccessKey));
    }

    #[tokio::test]
    async fn reasons_accumulate() {
        let config = config(false, false);
        let rpc = seeded_rpc(&config);
        let engine = Arc::new(MockEngine::new());
        engine.set_reachable(false);
        let monitor = HealthMonitor::new(config, rpc, engine);

        let report = monitor.check().await.expect("check");
        let reasons = report.reasons();
        assert!(reasons.contains(&HealthReason::SignerMissing));
        assert!(reasons.iter().any(|r| matches!(r, HealthReason::EngineUnreachable { .. })));
        assert_eq!(reasons.len(), 2);
    }

    #[tokio::test]
    async fn probe_errors_propagate() {
        let config = config(true, false);
        let rpc = seeded_rpc(&config);
        rpc.set_offline(true);
        let monitor = HealthMonitor::new(config, rpc, Arc::new(MockEngine::new()));

        assert!(monitor.check().await.is_err());
    }

    #[test]
    fn report_serializes_reasons() {
        let report = HealthReport::Unhealthy {
            snapshot: Snapshot::default(),
            reasons: vec![HealthReason::SignerMissing],
        };
        let json = serde_json::to_value(&report).expect("encode");
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["reasons"][0]["reason"], "signer-missing");
    }
}
