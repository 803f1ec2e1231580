//! # MarketClient — Typed Adapter Over the Chain Gateway
//!
//! Thin delegation layer: one market, one node identity, typed operations.
//! Claiming is implicit in `enter_market` — the chain assigns the next
//! queued node on the poster's side, so the node only ever enters.
//!
//! The only bounded retry in the node lives here: [`MarketClient::await_tx`]
//! polls a submitted signature every 2 seconds for up to 30 attempts.
//! Everything else fails fast and lets the work loop's tick drive retries.

use std::sync::Arc;
use std::time::Duration;

use nosana_common::Result;
use tracing::debug;

use crate::chain::{ChainRpc, Job, Market, Run, Signature, TxStatus};

/// Confirmation poll interval.
const AWAIT_TX_INTERVAL: Duration = Duration::from_secs(2);
/// Confirmation poll attempts before giving up.
const AWAIT_TX_ATTEMPTS: u32 = 30;

/// Final outcome of waiting on a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Confirmed,
    Failed,
    Timeout,
}

/// Market operations bound to this node's identity.
#[derive(Clone)]
pub struct MarketClient {
    rpc: Arc<dyn ChainRpc>,
    market: String,
    node: String,
    confirm_interval: Duration,
    confirm_attempts: u32,
}

impl MarketClient {
    pub fn new(rpc: Arc<dyn ChainRpc>, market: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            rpc,
            market: market.into(),
            node: node.into(),
            confirm_interval: AWAIT_TX_INTERVAL,
            confirm_attempts: AWAIT_TX_ATTEMPTS,
        }
    }

    /// Override confirmation polling cadence (tests).
    pub fn with_confirmation(mut self, interval: Duration, attempts: u32) -> Self {
        self.confirm_interval = interval;
        self.confirm_attempts = attempts;
        self
    }

    pub fn market_addr(&self) -> &str {
        &self.market
    }

    pub fn node_addr(&self) -> &str {
        &self.node
    }

    pub async fn get_market(&self) -> Result<Market> {
        self.rpc.get_market(&self.market).await
    }

    pub async fn get_job(&self, job_addr: &str) -> Result<Job> {
        self.rpc.get_job(job_addr).await
    }

    pub async fn get_run(&self, run_addr: &str) -> Result<Run> {
        self.rpc.get_run(run_addr).await
    }

    /// All run accounts currently held by this node, across markets.
    pub async fn find_my_runs(&self) -> Result<Vec<Run>> {
        self.rpc.runs_for_node(&self.node).await
    }

    /// Whether this node's address sits in the market queue.
    pub async fn is_queued(&self) -> Result<bool> {
        let market = self.get_market().await?;
        Ok(market.queue.iter().any(|n| n == &self.node))
    }

    /// Submit the `work` instruction: claim the next job if one is waiting,
    /// otherwise take a queue position.
    pub async fn enter_market(&self) -> Result<Signature> {
        debug!(market = %self.market, "submitting work instruction");
        self.rpc.submit_work(&self.market, &self.node).await
    }

    /// Submit the `finish` instruction carrying the result digest.
    pub async fn finish_job(
        &self,
        job_addr: &str,
        run_addr: &str,
        result_digest: [u8; 32],
    ) -> Result<Signature> {
        debug!(job = %job_addr, run = %run_addr, "submitting finish instruction");
        self.rpc.submit_finish(job_addr, run_addr, &self.market, result_digest).await
    }

    /// Submit the `quit` instruction, releasing a run without a result.
    pub async fn quit_job(&self, run_addr: &str) -> Result<Signature> {
        debug!(run = %run_addr, "submitting quit instruction");
        self.rpc.submit_quit(run_addr).await
    }

    /// Submit the `stop` instruction, leaving the market queue.
    pub async fn exit_market(&self) -> Result<Signature> {
        debug!(market = %self.market, "submitting stop instruction");
        self.rpc.submit_stop(&self.market, &self.node).await
    }

    /// Poll a signature until it confirms, fails, or the attempt budget is
    /// spent. Status-read errors count against the budget rather than
    /// aborting: a flaky endpoint should not turn a confirmed transaction
    /// into an error.
    pub async fn await_tx(&self, sig: &Signature) -> TxOutcome {
        for attempt in 1..=self.confirm_attempts {
            match self.rpc.signature_status(sig).await {
                Ok(TxStatus::Confirmed) => return TxOutcome::Confirmed,
                Ok(TxStatus::Failed) => return TxOutcome::Failed,
                Ok(TxStatus::Pending) => {}
                Err(e) => {
                    debug!(sig = %sig, attempt, "signature status read failed: {e}");
                }
            }
            if attempt < self.confirm_attempts {
                tokio::time::sleep(self.confirm_interval).await;
            }
        }
        TxOutcome::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{InstructionKind, MockChainRpc};

    fn client(rpc: Arc<MockChainRpc>) -> MarketClient {
        MarketClient::new(rpc, "market1", "node1")
            .with_confirmation(Duration::from_millis(1), 3)
    }

    fn seed_market(rpc: &MockChainRpc, queue: Vec<String>) {
        rpc.insert_market(Market {
            address: "market1".into(),
            queue,
            job_timeout: 60,
            node_access_key: "collection111".into(),
        });
    }

    #[tokio::test]
    async fn enter_then_queued() {
        let rpc = Arc::new(MockChainRpc::new());
        seed_market(&rpc, vec![]);
        let client = client(rpc.clone());

        assert!(!client.is_queued().await.expect("queued"));
        let sig = client.enter_market().await.expect("enter");
        assert_eq!(client.await_tx(&sig).await, TxOutcome::Confirmed);
        assert!(client.is_queued().await.expect("queued"));
    }

    #[tokio::test]
    async fn exit_market_dequeues() {
        let rpc = Arc::new(MockChainRpc::new());
        seed_market(&rpc, vec!["node1".into()]);
        let client = client(rpc.clone());

        let sig = client.exit_market().await.expect("exit");
        assert_eq!(client.await_tx(&sig).await, TxOutcome::Confirmed);
        assert!(!client.is_queued().await.expect("queued"));
        assert_eq!(rpc.submission_count(InstructionKind::Stop), 1);
    }

    #[tokio::test]
    async fn await_tx_reports_failure() {
        let rpc = Arc::new(MockChainRpc::new());
        seed_market(&rpc, vec![]);
        rpc.set_outcome(InstructionKind::Work, TxStatus::Failed);
        let client = client(rpc);

        let sig = client.enter_market().await.expect("enter");
        assert_eq!(client.await_tx(&sig).await, TxOutcome::Failed);
    }

    #[tokio::test]
    async fn await_tx_times_out_on_pending() {
        let rpc = Arc::new(MockChainRpc::new());
        seed_market(&rpc, vec![]);
        rpc.set_outcome(InstructionKind::Work, TxStatus::Pending);
        let client = client(rpc);

        let sig = client.enter_market().await.expect("enter");
        assert_eq!(client.await_tx(&sig).await, TxOutcome::Timeout);
    }

    #[tokio::test]
    async fn await_tx_survives_status_errors() {
        let rpc = Arc::new(MockChainRpc::new());
        seed_market(&rpc, vec![]);
        let client = client(rpc.clone());

        let sig = client.enter_market().await.expect("enter");
        rpc.set_offline(true);
        // every status read errors; budget runs out, no panic
        assert_eq!(client.await_tx(&sig).await, TxOutcome::Timeout);
    }
}
