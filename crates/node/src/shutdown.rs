//! # Shutdown Coordinator
//!
//! Owns the termination sequence after the work loop drains. Every step is
//! best-effort with a bounded wait; a hung RPC endpoint cannot keep the
//! process alive.
//!
//! An active flow is deliberately NOT quit here: the flow and its job
//! binding are persisted, so the next node start resumes it. Quitting on
//! shutdown would throw away completed work.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::market::TxOutcome;
use crate::work_loop::{NodeContext, NodeState};

/// Upper bound on waiting for the exit-queue confirmation.
const EXIT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ShutdownCoordinator {
    ctx: Arc<NodeContext>,
}

impl ShutdownCoordinator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Signal the loop to stop taking work.
    pub fn trigger(&self) {
        self.ctx.shutdown.notify_waiters();
    }

    /// Run the termination sequence. `final_state` is where the loop
    /// stopped, used to report what is left behind.
    pub async fn run(&self, final_state: &NodeState) {
        info!("shutdown: work intake stopped");

        if let Some(flow_id) = final_state.active_flow() {
            info!(flow = %flow_id, "shutdown: active flow stays persisted, next start resumes it");
        }

        match self.ctx.market.is_queued().await {
            Ok(true) => self.exit_queue().await,
            Ok(false) => {}
            Err(e) => warn!("shutdown: could not read queue position: {e}"),
        }

        info!("shutdown complete");
    }

    async fn exit_queue(&self) {
        info!(market = %self.ctx.market.market_addr(), "shutdown: leaving market queue");
        let sig = match self.ctx.market.exit_market().await {
            Ok(sig) => sig,
            Err(e) => {
                warn!("shutdown: exit market submission failed: {e}");
                return;
            }
        };
        match timeout(EXIT_CONFIRM_TIMEOUT, self.ctx.market.await_tx(&sig)).await {
            Ok(TxOutcome::Confirmed) => info!("shutdown: left market queue"),
            Ok(outcome) => warn!(?outcome, "shutdown: exit market not confirmed"),
            Err(_) => warn!("shutdown: exit market confirmation timed out"),
        }
    }
}
