//! # ChainRpc — On-Chain Gateway Abstraction
//!
//! The node reads market, run, and job accounts and submits four
//! instructions: `work` (enter the queue), `finish`, `quit`, and `stop`
//! (leave the queue). Account resolution and instruction encoding live
//! behind this trait; the core only sees typed records and signatures.
//!
//! ## No Implicit Retry
//!
//! Implementations perform a single attempt per call. Retry policy belongs
//! to the work loop (tick-driven) and to `MarketClient::await_tx` (bounded
//! confirmation polling). Implementations MUST NOT sleep, backoff, or
//! transform errors beyond mapping them onto [`NodeError`] kinds.

use std::collections::HashMap;

use async_trait::async_trait;
use nosana_common::{NodeError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Transaction signature as returned by the gateway.
pub type Signature = String;

/// On-chain market account: a queue of waiting nodes plus job parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// Market account address.
    pub address: String,
    /// Node addresses waiting for work, in queue order.
    pub queue: Vec<String>,
    /// Seconds a claimed run may take before it can be quit.
    pub job_timeout: i64,
    /// Collection address gating node entry.
    pub node_access_key: String,
}

/// On-chain run account: binds a node to a job from claim to settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run account address.
    pub address: String,
    /// Node that claimed the run.
    pub node: String,
    /// Job account address.
    pub job: String,
    /// Account that funds the job.
    pub payer: String,
    /// Unix seconds at which the run was claimed.
    pub time: i64,
}

/// On-chain job account: references the job document by digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job account address.
    pub address: String,
    /// SHA-256 digest of the pinned job document.
    pub ipfs_job: [u8; 32],
    /// Market this job was posted to.
    pub market: String,
}

/// Confirmation status of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Confirmed,
    Failed,
    Pending,
}

/// Gateway to the chain. Object-safe; one call, one attempt.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_market(&self, addr: &str) -> Result<Market>;
    async fn get_job(&self, addr: &str) -> Result<Job>;
    async fn get_run(&self, addr: &str) -> Result<Run>;

    /// All run accounts whose `node` field equals `node`.
    async fn runs_for_node(&self, node: &str) -> Result<Vec<Run>>;

    /// Submit the `work` instruction with a fresh run keypair.
    async fn submit_work(&self, market: &str, node: &str) -> Result<Signature>;

    /// Submit the `finish` instruction carrying the result digest.
    async fn submit_finish(
        &self,
        job: &str,
        run: &str,
        market: &str,
        result_digest: [u8; 32],
    ) -> Result<Signature>;

    /// Submit the `quit` instruction for a run.
    async fn submit_quit(&self, run: &str) -> Result<Signature>;

    /// Submit the `stop` instruction, leaving the market queue.
    async fn submit_stop(&self, market: &str, node: &str) -> Result<Signature>;

    /// Confirmation status of a previously submitted signature.
    async fn signature_status(&self, sig: &str) -> Result<TxStatus>;

    /// Lamport balance of an account.
    async fn sol_balance(&self, addr: &str) -> Result<u64>;

    /// Token balance of an associated token account.
    async fn token_balance(&self, addr: &str) -> Result<u64>;

    /// Number of access-key NFTs from `collection` held by `owner`.
    async fn access_key_count(&self, owner: &str, collection: &str) -> Result<u64>;
}

// ─── Mock gateway ────────────────────────────────────────────────────────────

/// Instruction kinds, for scripting mock outcomes and asserting submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    Work,
    Finish,
    Quit,
    Stop,
}

/// One submission observed by the mock, for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub kind: InstructionKind,
    /// Run address for finish/quit, market address for work/stop.
    pub account: String,
    pub signature: Signature,
}

#[derive(Default)]
struct MockChainState {
    markets: HashMap<String, Market>,
    jobs: HashMap<String, Job>,
    runs: HashMap<String, Run>,
    sol_balances: HashMap<String, u64>,
    token_balances: HashMap<String, u64>,
    access_keys: HashMap<String, u64>,
    outcomes: HashMap<InstructionKind, TxStatus>,
    statuses: HashMap<Signature, TxStatus>,
    submissions: Vec<Submission>,
    next_sig: u64,
    offline: bool,
}

/// In-memory chain for tests and `mock` development mode.
///
/// Submissions apply their chain-side effect immediately when the scripted
/// outcome for that instruction kind is `Confirmed` (the default); a
/// `Failed` or `Pending` outcome records the submission without mutating
/// accounts. Tests script assignments by inserting run accounts directly.
pub struct MockChainRpc {
    state: Mutex<MockChainState>,
}

impl MockChainRpc {
    pub fn new() -> Self {
        Self { state: Mutex::new(MockChainState::default()) }
    }

    pub fn insert_market(&self, market: Market) {
        self.state.lock().markets.insert(market.address.clone(), market);
    }

    pub fn insert_job(&self, job: Job) {
        self.state.lock().jobs.insert(job.address.clone(), job);
    }

    pub fn insert_run(&self, run: Run) {
        self.state.lock().runs.insert(run.address.clone(), run);
    }

    pub fn remove_run(&self, addr: &str) {
        self.state.lock().runs.remove(addr);
    }

    /// Script the confirmation outcome for subsequent submissions of `kind`.
    pub fn set_outcome(&self, kind: InstructionKind, status: TxStatus) {
        self.state.lock().outcomes.insert(kind, status);
    }

    pub fn set_sol_balance(&self, addr: &str, lamports: u64) {
        self.state.lock().sol_balances.insert(addr.to_string(), lamports);
    }

    pub fn set_token_balance(&self, addr: &str, amount: u64) {
        self.state.lock().token_balances.insert(addr.to_string(), amount);
    }

    pub fn set_access_keys(&self, owner: &str, count: u64) {
        self.state.lock().access_keys.insert(owner.to_string(), count);
    }

    /// Simulate the endpoint dropping off the network.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Snapshot of every submission seen so far.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Count of submissions of one instruction kind.
    pub fn submission_count(&self, kind: InstructionKind) -> usize {
        self.state.lock().submissions.iter().filter(|s| s.kind == kind).count()
    }

    pub fn in_queue(&self, market: &str, node: &str) -> bool {
        self.state
            .lock()
            .markets
            .get(market)
            .map(|m| m.queue.iter().any(|n| n == node))
            .unwrap_or(false)
    }

    fn submit(&self, kind: InstructionKind, account: &str) -> Result<Signature> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(NodeError::RpcTransient("mock endpoint offline".into()));
        }
        state.next_sig += 1;
        let sig = format!("sig-{}", state.next_sig);
        let status = state.outcomes.get(&kind).copied().unwrap_or(TxStatus::Confirmed);
        state.statuses.insert(sig.clone(), status);
        state.submissions.push(Submission {
            kind,
            account: account.to_string(),
            signature: sig.clone(),
        });
        Ok(sig)
    }

    fn check_online(&self) -> Result<()> {
        if self.state.lock().offline {
            return Err(NodeError::RpcTransient("mock endpoint offline".into()));
        }
        Ok(())
    }
}

impl Default for MockChainRpc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    async fn get_market(&self, addr: &str) -> Result<Market> {
        self.check_online()?;
        self.state
            .lock()
            .markets
            .get(addr)
            .cloned()
            .ok_or_else(|| NodeError::RpcPermanent(format!("market account not found: {addr}")))
    }

    async fn get_job(&self, addr: &str) -> Result<Job> {
        self.check_online()?;
        self.state
            .lock()
            .jobs
            .get(addr)
            .cloned()
            .ok_or_else(|| NodeError::RpcPermanent(format!("job account not found: {addr}")))
    }

    async fn get_run(&self, addr: &str) -> Result<Run> {
        self.check_online()?;
        self.state
            .lock()
            .runs
            .get(addr)
            .cloned()
            .ok_or_else(|| NodeError::RpcPermanent(format!("run account not found: {addr}")))
    }

    async fn runs_for_node(&self, node: &str) -> Result<Vec<Run>> {
        self.check_online()?;
        let mut runs: Vec<Run> = self
            .state
            .lock()
            .runs
            .values()
            .filter(|r| r.node == node)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(runs)
    }

    async fn submit_work(&self, market: &str, node: &str) -> Result<Signature> {
        let sig = self.submit(InstructionKind::Work, market)?;
        let mut state = self.state.lock();
        if state.statuses.get(&sig) == Some(&TxStatus::Confirmed) {
            if let Some(m) = state.markets.get_mut(market) {
                if !m.queue.iter().any(|n| n == node) {
                    m.queue.push(node.to_string());
                }
            }
        }
        Ok(sig)
    }

    async fn submit_finish(
        &self,
        _job: &str,
        run: &str,
        _market: &str,
        _result_digest: [u8; 32],
    ) -> Result<Signature> {
        let sig = self.submit(InstructionKind::Finish, run)?;
        let mut state = self.state.lock();
        if state.statuses.get(&sig) == Some(&TxStatus::Confirmed) {
            state.runs.remove(run);
        }
        Ok(sig)
    }

    async fn submit_quit(&self, run: &str) -> Result<Signature> {
        let sig = self.submit(InstructionKind::Quit, run)?;
        let mut state = self.state.lock();
        if state.statuses.get(&sig) == Some(&TxStatus::Confirmed) {
            state.runs.remove(run);
        }
        Ok(sig)
    }

    async fn submit_stop(&self, market: &str, node: &str) -> Result<Signature> {
        let sig = self.submit(InstructionKind::Stop, market)?;
        let mut state = self.state.lock();
        if state.statuses.get(&sig) == Some(&TxStatus::Confirmed) {
            if let Some(m) = state.markets.get_mut(market) {
                m.queue.retain(|n| n != node);
            }
        }
        Ok(sig)
    }

    async fn signature_status(&self, sig: &str) -> Result<TxStatus> {
        self.check_online()?;
        Ok(self.state.lock().statuses.get(sig).copied().unwrap_or(TxStatus::Pending))
    }

    async fn sol_balance(&self, addr: &str) -> Result<u64> {
        self.check_online()?;
        Ok(self.state.lock().sol_balances.get(addr).copied().unwrap_or(0))
    }

    async fn token_balance(&self, addr: &str) -> Result<u64> {
        self.check_online()?;
        Ok(self.state.lock().token_balances.get(addr).copied().unwrap_or(0))
    }

    async fn access_key_count(&self, owner: &str, _collection: &str) -> Result<u64> {
        self.check_online()?;
        Ok(self.state.lock().access_keys.get(owner).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(addr: &str) -> Market {
        Market {
            address: addr.to_string(),
            queue: vec![],
            job_timeout: 60,
            node_access_key: "collection111".to_string(),
        }
    }

    #[tokio::test]
    async fn work_appends_to_queue() {
        let rpc = MockChainRpc::new();
        rpc.insert_market(market("market1"));

        rpc.submit_work("market1", "node1").await.expect("submit");
        assert!(rpc.in_queue("market1", "node1"));

        // idempotent: entering twice keeps one queue slot
        rpc.submit_work("market1", "node1").await.expect("submit");
        let m = rpc.get_market("market1").await.expect("market");
        assert_eq!(m.queue, vec!["node1"]);
    }

    #[tokio::test]
    async fn stop_removes_from_queue() {
        let rpc = MockChainRpc::new();
        rpc.insert_market(market("market1"));
        rpc.submit_work("market1", "node1").await.expect("work");

        rpc.submit_stop("market1", "node1").await.expect("stop");
        assert!(!rpc.in_queue("market1", "node1"));
    }

    #[tokio::test]
    async fn failed_outcome_has_no_effect() {
        let rpc = MockChainRpc::new();
        rpc.insert_market(market("market1"));
        rpc.set_outcome(InstructionKind::Work, TxStatus::Failed);

        let sig = rpc.submit_work("market1", "node1").await.expect("submit");
        assert!(!rpc.in_queue("market1", "node1"));
        assert_eq!(rpc.signature_status(&sig).await.expect("status"), TxStatus::Failed);
    }

    #[tokio::test]
    async fn finish_consumes_run() {
        let rpc = MockChainRpc::new();
        rpc.insert_run(Run {
            address: "run1".into(),
            node: "node1".into(),
            job: "job1".into(),
            payer: "payer1".into(),
            time: 1_700_000_000,
        });

        rpc.submit_finish("job1", "run1", "market1", [0u8; 32]).await.expect("finish");
        assert!(rpc.get_run("run1").await.is_err());
        assert_eq!(rpc.submission_count(InstructionKind::Finish), 1);
    }

    #[tokio::test]
    async fn runs_for_node_filters_and_orders() {
        let rpc = MockChainRpc::new();
        for (addr, node) in [("run-b", "node1"), ("run-a", "node1"), ("run-c", "node2")] {
            rpc.insert_run(Run {
                address: addr.into(),
                node: node.into(),
                job: "job1".into(),
                payer: "payer1".into(),
                time: 0,
            });
        }

        let runs = rpc.runs_for_node("node1").await.expect("runs");
        let addrs: Vec<&str> = runs.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addrs, vec!["run-a", "run-b"]);
    }

    #[tokio::test]
    async fn offline_is_transient() {
        let rpc = MockChainRpc::new();
        rpc.set_offline(true);
        let err = rpc.get_market("market1").await.expect_err("offline");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unknown_signature_is_pending() {
        let rpc = MockChainRpc::new();
        assert_eq!(rpc.signature_status("sig-404").await.expect("status"), TxStatus::Pending);
    }
}
