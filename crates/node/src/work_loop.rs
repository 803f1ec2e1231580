//! # Work Loop — Scheduler Core
//!
//! One cooperative task drives the node state machine:
//!
//! ```text
//! CheckingHealth ──► Unhealthy ◄──┐ (recheck every 15 min)
//!       │                         │
//!       ▼                         │
//!     Idle ◄──────────────────────┘
//!       │  assigned run?            no run, not queued
//!       │        │                        │
//!       ▼        ▼                        ▼
//!   Claimed ◄─ Queued ◄──────────── enter_market
//!       │ runner drained
//!       ▼
//!   Settling ──► Idle (settlement confirmed)
//! ```
//!
//! Every tick is a `tokio::select!` over the shutdown notify and the poll
//! timer; shutdown is honored only at state boundaries, never mid-op.
//! Transient failures are logged and the state is retained — the loop never
//! terminates on an I/O error.
//!
//! All shared handles travel in an explicit [`NodeContext`]; there is no
//! module-level mutable state.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nosana_common::{cid, FlowId, NodeError, Result};
use nosana_common::job::JobDocument;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::blob::BlobClient;
use crate::builder::{BuilderRegistry, FlowInputs};
use crate::chain::{ChainRpc, Run};
use crate::config::NodeConfig;
use crate::engine::ContainerEngine;
use crate::git::GitClient;
use crate::health::{HealthMonitor, HealthReport, HEALTH_CHECK_INTERVAL};
use crate::market::{MarketClient, TxOutcome};
use crate::runner::FlowRunner;
use crate::settle::Settlement;
use crate::store::FlowStore;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Everything a top-level operation needs, passed explicitly.
pub struct NodeContext {
    pub config: Arc<NodeConfig>,
    pub rpc: Arc<dyn ChainRpc>,
    pub market: MarketClient,
    pub store: FlowStore,
    pub blob: BlobClient,
    pub engine: Arc<dyn ContainerEngine>,
    pub git: Arc<dyn GitClient>,
    pub registry: Arc<BuilderRegistry>,
    pub monitor: HealthMonitor,
    /// Latest health report, shared with the HTTP endpoint.
    pub health: Arc<RwLock<Option<HealthReport>>>,
    /// Exit signal: the loop drains to `ShuttingDown` on notify.
    pub shutdown: Arc<Notify>,
}

impl NodeContext {
    pub fn runner(&self) -> FlowRunner {
        FlowRunner::new(
            self.store.clone(),
            self.git.clone(),
            self.engine.clone(),
            self.blob.clone(),
            self.config.logs_dir(),
        )
    }

    pub fn settlement(&self) -> Settlement {
        Settlement::new(self.store.clone(), self.market.clone(), self.engine.clone())
    }
}

/// Node state machine. `Claimed` and `Settling` carry the single active
/// flow handle; at most one is ever populated by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    CheckingHealth,
    Unhealthy,
    Idle,
    Queued,
    Claimed(FlowId),
    Settling(FlowId),
    ShuttingDown,
}

impl NodeState {
    /// The flow currently claimed or settling, if any.
    pub fn active_flow(&self) -> Option<&FlowId> {
        match self {
            NodeState::Claimed(id) | NodeState::Settling(id) => Some(id),
            _ => None,
        }
    }
}

pub struct WorkLoop {
    ctx: Arc<NodeContext>,
    state: NodeState,
    last_health_check: Option<Instant>,
    runner_task: Option<JoinHandle<Result<()>>>,
}

impl WorkLoop {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx, state: NodeState::CheckingHealth, last_health_check: None, runner_task: None }
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Drive ticks until shutdown is signalled.
    pub async fn run(mut self) -> NodeState {
        let poll = Duration::from_millis(self.ctx.config.poll_delay_ms);
        info!(poll_ms = self.ctx.config.poll_delay_ms, "work loop started");

        // pinned across iterations so a notify arriving mid-tick is not lost
        let shutdown = self.ctx.shutdown.clone();
        let notified = shutdown.notified();
        tokio::pin!(notified);

        loop {
            tokio::select! {
                _ = &mut notified => {
                    info!("work loop received exit signal");
                    self.state = NodeState::ShuttingDown;
                    // the flow stays persisted; a restart resumes it
                    if let Some(task) = self.runner_task.take() {
                        task.abort();
                    }
                    break;
                }
                _ = tokio::time::sleep(poll) => {
                    if let Err(e) = self.tick().await {
                        if e.is_transient() {
                            warn!(state = ?self.state, "tick failed, retrying next tick: {e}");
                        } else {
                            error!(state = ?self.state, "tick failed: {e}");
                        }
                    }
                }
            }
        }
        info!("work loop stopped");
        self.state
    }

    fn should_check_health(&self) -> bool {
        self.last_health_check
            .map_or(true, |at| at.elapsed() >= HEALTH_CHECK_INTERVAL)
    }

    /// One state-machine step. Public so tests can single-step the loop.
    pub async fn tick(&mut self) -> Result<()> {
        if self.state == NodeState::ShuttingDown {
            return Ok(());
        }

        if self.should_check_health() {
            // a failed probe leaves last_health_check untouched, so the
            // next tick retries the check
            let report = self.ctx.monitor.check().await?;
            self.last_health_check = Some(Instant::now());
            let healthy = report.is_healthy();
            if !healthy {
                for reason in report.reasons() {
                    warn!("node unhealthy: {reason}");
                }
            }
            *self.ctx.health.write() = Some(report);

            // the gate only governs taking on work; an accepted run is
            // driven to settlement regardless
            match self.state {
                NodeState::Claimed(_) | NodeState::Settling(_) => {}
                _ if healthy => {
                    if matches!(self.state, NodeState::CheckingHealth | NodeState::Unhealthy) {
                        // the transition is this tick's outcome; work
                        // resumes on the next one
                        self.state = NodeState::Idle;
                        return Ok(());
                    }
                }
                _ => {
                    self.state = NodeState::Unhealthy;
                    return Ok(());
                }
            }
        } else if self.state == NodeState::Unhealthy {
            // no chain actions until a recheck succeeds
            return Ok(());
        }

        match self.state.clone() {
            NodeState::CheckingHealth | NodeState::Unhealthy | NodeState::ShuttingDown => Ok(()),
            NodeState::Idle => self.tick_idle().await,
            NodeState::Queued => self.tick_queued().await,
            NodeState::Claimed(flow_id) => self.tick_claimed(&flow_id).await,
            NodeState::Settling(flow_id) => self.tick_settling(&flow_id).await,
        }
    }

    async fn tick_idle(&mut self) -> Result<()> {
        if let Some(run) = self.find_next_assigned_run().await? {
            let flow_id = self.claim(&run).await?;
            self.state = NodeState::Claimed(flow_id);
            return Ok(());
        }
        if self.ctx.market.is_queued().await? {
            self.state = NodeState::Queued;
            return Ok(());
        }
        let sig = self.ctx.market.enter_market().await?;
        match self.ctx.market.await_tx(&sig).await {
            TxOutcome::Confirmed => {
                info!(market = %self.ctx.market.market_addr(), "entered market queue");
                self.state = NodeState::Queued;
            }
            outcome => {
                warn!(?outcome, "enter market not confirmed, retrying next tick");
            }
        }
        Ok(())
    }

    async fn tick_queued(&mut self) -> Result<()> {
        if let Some(run) = self.find_next_assigned_run().await? {
            let flow_id = self.claim(&run).await?;
            self.state = NodeState::Claimed(flow_id);
            return Ok(());
        }
        if !self.ctx.market.is_queued().await? {
            // dequeued without an assignment; re-enter on the next tick
            debug!("queue position lost, returning to idle");
            self.state = NodeState::Idle;
        }
        Ok(())
    }

    async fn tick_claimed(&mut self, flow_id: &FlowId) -> Result<()> {
        let runner_state = self.runner_task.as_ref().map(|task| task.is_finished());
        match runner_state {
            Some(true) => {
                if let Some(task) = self.runner_task.take() {
                    match task.await {
                        Ok(Ok(())) => self.state = NodeState::Settling(flow_id.clone()),
                        Ok(Err(e)) => {
                            // runner aborted on infrastructure failure; the
                            // next tick respawns it from the last persisted op
                            warn!(flow = %flow_id, "runner pass failed: {e}");
                        }
                        Err(e) => error!(flow = %flow_id, "runner task died: {e}"),
                    }
                }
                Ok(())
            }
            Some(false) => {
                // still running: watch for expiry
                let settlement = self.ctx.settlement();
                if settlement.process_flow(flow_id, unix_now()).await?.is_none() {
                    warn!(flow = %flow_id, "run settled while executing, aborting runner");
                    if let Some(task) = self.runner_task.take() {
                        task.abort();
                    }
                    self.state = NodeState::Idle;
                }
                Ok(())
            }
            None => {
                // settle-or-run gate: an expired flow is quit before it
                // ever executes, a flow finished before a restart settles
                // directly
                let now = unix_now();
                let settlement = self.ctx.settlement();
                if settlement.process_flow(flow_id, now).await?.is_none() {
                    self.state = NodeState::Idle;
                    return Ok(());
                }
                let flow = self
                    .ctx
                    .store
                    .get_flow(flow_id)?
                    .ok_or_else(|| NodeError::Storage(format!("flow not found: {flow_id}")))?;
                if !flow.finished() && !flow.expired(now) {
                    let runner = self.ctx.runner();
                    let id = flow_id.clone();
                    debug!(flow = %id, "spawning flow runner");
                    self.runner_task = Some(tokio::spawn(async move { runner.run(&id).await }));
                }
                Ok(())
            }
        }
    }

    async fn tick_settling(&mut self, flow_id: &FlowId) -> Result<()> {
        let settlement = self.ctx.settlement();
        match settlement.process_flow(flow_id, unix_now()).await? {
            Some(keep) => self.state = NodeState::Settling(keep),
            None => self.state = NodeState::Idle,
        }
        Ok(())
    }

    /// First run held by this node whose job belongs to the configured
    /// market. Runs from other markets are stale leftovers and ignored.
    async fn find_next_assigned_run(&self) -> Result<Option<Run>> {
        let runs = self.ctx.market.find_my_runs().await?;
        for run in runs {
            let job = self.ctx.market.get_job(&run.job).await?;
            if job.market == self.ctx.config.market {
                return Ok(Some(run));
            }
            debug!(run = %run.address, market = %job.market, "ignoring run from foreign market");
        }
        Ok(None)
    }

    /// Materialize a run into a persisted flow, or resume the one already
    /// bound to its job.
    async fn claim(&self, run: &Run) -> Result<FlowId> {
        if let Some(existing) = self.ctx.store.flow_for_job(&run.job)? {
            if self.ctx.store.get_flow(&existing)?.is_some() {
                info!(flow = %existing, run = %run.address, "resuming persisted flow");
                return Ok(existing);
            }
        }

        let job = self.ctx.market.get_job(&run.job).await?;
        let doc_cid = cid::digest_to_cid(&job.ipfs_job);
        let raw = self.ctx.blob.get_json(&doc_cid).await?;
        let doc: JobDocument = serde_json::from_value(raw)
            .map_err(|e| NodeError::Decode(format!("job document {doc_cid}: {e}")))?;

        let market = self.ctx.market.get_market().await?;
        let inputs = FlowInputs {
            job_addr: run.job.clone(),
            run_addr: run.address.clone(),
            expires: Some(run.time + market.job_timeout),
            repos_dir: self.ctx.config.repos_dir(),
        };
        let flow = self.ctx.registry.build(&doc, &inputs)?;

        // flow and binding are durable before the loop observes Claimed
        self.ctx.store.put_flow(&flow)?;
        self.ctx.store.bind_job(&run.job, &flow.id)?;
        info!(flow = %flow.id, job = %run.job, run = %run.address, "claimed run");
        Ok(flow.id)
    }
}
