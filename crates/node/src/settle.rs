//! # Settlement
//!
//! Reconciles a local flow with the chain. Exactly one of three things is
//! true of a flow on every tick: it produced a result (finish it), it
//! outlived its deadline (quit it), or it is still running (keep it).
//!
//! The active flow handle is released only when the settling transaction is
//! observed as confirmed — a failed or timed-out confirmation keeps the
//! flow active so the next tick tries again.

use std::sync::Arc;

use nosana_common::{cid, Flow, FlowId, NodeError, Result};
use tracing::{info, warn};

use crate::engine::ContainerEngine;
use crate::market::{MarketClient, TxOutcome};
use crate::store::FlowStore;

/// Deadline check, surfaced as the `ExpiredRun` error kind so the quit
/// path is selected by matching on it rather than on a bare bool.
pub(crate) fn check_deadline(flow: &Flow, now: i64) -> Result<()> {
    if flow.expired(now) {
        return Err(NodeError::ExpiredRun);
    }
    Ok(())
}

#[derive(Clone)]
pub struct Settlement {
    store: FlowStore,
    market: MarketClient,
    engine: Arc<dyn ContainerEngine>,
}

impl Settlement {
    pub fn new(store: FlowStore, market: MarketClient, engine: Arc<dyn ContainerEngine>) -> Self {
        Self { store, market, engine }
    }

    /// Settle or keep a flow. Returns the flow id while it must stay
    /// active, `None` once settlement confirmed.
    pub async fn process_flow(&self, flow_id: &FlowId, now: i64) -> Result<Option<FlowId>> {
        let flow = self
            .store
            .get_flow(flow_id)?
            .ok_or_else(|| NodeError::Storage(format!("flow not found: {flow_id}")))?;

        let run_addr = flow
            .run_addr()
            .ok_or_else(|| NodeError::Decode(format!("flow {flow_id} has no run address")))?
            .to_string();

        if flow.finished() {
            let cid_str = flow
                .result_cid()
                .ok_or_else(|| NodeError::Decode(format!("flow {flow_id} has no result cid")))?;
            let digest = cid::cid_to_digest(cid_str)?;
            let job_addr = flow
                .job_addr()
                .ok_or_else(|| NodeError::Decode(format!("flow {flow_id} has no job address")))?;

            // volumes are reclaimed best-effort; a busy engine must not
            // block settlement
            if let Err(e) = self.engine.gc_volumes().await {
                warn!(flow = %flow_id, "volume gc failed: {e}");
            }

            let sig = self.market.finish_job(job_addr, &run_addr, digest).await?;
            match self.market.await_tx(&sig).await {
                TxOutcome::Confirmed => {
                    info!(flow = %flow_id, run = %run_addr, cid = %cid_str, "run finished");
                    Ok(None)
                }
                outcome => {
                    warn!(flow = %flow_id, ?outcome, "finish not confirmed, retrying next tick");
                    Ok(Some(flow_id.clone()))
                }
            }
        } else {
            match check_deadline(&flow, now) {
                Ok(()) => Ok(Some(flow_id.clone())),
                Err(e @ NodeError::ExpiredRun) => {
                    warn!(flow = %flow_id, run = %run_addr, "{e}, quitting run");
                    let sig = self.market.quit_job(&run_addr).await?;
                    match self.market.await_tx(&sig).await {
                        TxOutcome::Confirmed => {
                            info!(flow = %flow_id, run = %run_addr, "run quit");
                            Ok(None)
                        }
                        outcome => {
                            warn!(flow = %flow_id, ?outcome, "quit not confirmed, retrying next tick");
                            Ok(Some(flow_id.clone()))
                        }
                    }
                }
                Err(e) => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{InstructionKind, MockChainRpc, Run, TxStatus};
    use crate::engine::MockEngine;
    use crate::store::MemoryKvStore;
    use nosana_common::flow::{Flow, OpKind, OpResult, Operation, RESULT_IPFS_KEY};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Harness {
        settlement: Settlement,
        store: FlowStore,
        rpc: Arc<MockChainRpc>,
        engine: Arc<MockEngine>,
    }

    fn harness() -> Harness {
        let store = FlowStore::new(Arc::new(MemoryKvStore::new()));
        let rpc = Arc::new(MockChainRpc::new());
        let engine = Arc::new(MockEngine::new());
        let market = MarketClient::new(rpc.clone(), "market1", "node1")
            .with_confirmation(Duration::from_millis(1), 3);
        let settlement = Settlement::new(store.clone(), market, engine.clone());
        Harness { settlement, store, rpc, engine }
    }

    fn flow(expires: Option<i64>) -> Flow {
        let ops = vec![Operation {
            op: OpKind::WrapUp,
            id: "wrap-up".into(),
            args: json!({"collect": []}),
            deps: vec![],
        }];
        let mut state = BTreeMap::new();
        state.insert("input/job-addr".to_string(), json!("job1"));
        state.insert("input/run-addr".to_string(), json!("run1"));
        Flow::new(ops, state, expires)
    }

    fn finished_flow() -> Flow {
        let mut f = flow(None);
        let cid = cid::digest_to_cid(&[0x11; 32]);
        f.record("wrap-up", OpResult::ok(cid.clone()));
        f.record(RESULT_IPFS_KEY, OpResult::ok(cid));
        f
    }

    #[tokio::test]
    async fn finished_flow_settles_with_finish() {
        let h = harness();
        let f = finished_flow();
        h.store.put_flow(&f).expect("persist");
        h.rpc.insert_run(Run {
            address: "run1".into(),
            node: "node1".into(),
            job: "job1".into(),
            payer: "payer1".into(),
            time: 0,
        });

        let kept = h.settlement.process_flow(&f.id, 100).await.expect("process");
        assert_eq!(kept, None);
        assert_eq!(h.rpc.submission_count(InstructionKind::Finish), 1);
        assert_eq!(h.rpc.submission_count(InstructionKind::Quit), 0);
        assert_eq!(h.engine.gc_count(), 1);
    }

    #[tokio::test]
    async fn expired_flow_quits_without_finish() {
        let h = harness();
        let f = flow(Some(60));
        h.store.put_flow(&f).expect("persist");

        let kept = h.settlement.process_flow(&f.id, 61).await.expect("process");
        assert_eq!(kept, None);
        assert_eq!(h.rpc.submission_count(InstructionKind::Quit), 1);
        assert_eq!(h.rpc.submission_count(InstructionKind::Finish), 0);
    }

    #[test]
    fn deadline_check_classifies_expiry() {
        let f = flow(Some(60));
        assert!(check_deadline(&f, 30).is_ok());
        assert!(matches!(check_deadline(&f, 61), Err(NodeError::ExpiredRun)));

        let open = flow(None);
        assert!(check_deadline(&open, i64::MAX).is_ok());
    }

    #[tokio::test]
    async fn running_flow_is_kept() {
        let h = harness();
        let f = flow(Some(60));
        h.store.put_flow(&f).expect("persist");

        let kept = h.settlement.process_flow(&f.id, 30).await.expect("process");
        assert_eq!(kept, Some(f.id));
        assert_eq!(h.rpc.submissions().len(), 0);
    }

    #[tokio::test]
    async fn finished_beats_expired() {
        // a finished flow is settled with finish even past its deadline
        let h = harness();
        let mut f = flow(Some(60));
        let cid = cid::digest_to_cid(&[0x22; 32]);
        f.record("wrap-up", OpResult::ok(cid.clone()));
        f.record(RESULT_IPFS_KEY, OpResult::ok(cid));
        h.store.put_flow(&f).expect("persist");

        let kept = h.settlement.process_flow(&f.id, 1000).await.expect("process");
        assert_eq!(kept, None);
        assert_eq!(h.rpc.submission_count(InstructionKind::Finish), 1);
        assert_eq!(h.rpc.submission_count(InstructionKind::Quit), 0);
    }

    #[tokio::test]
    async fn unconfirmed_finish_keeps_flow_active() {
        let h = harness();
        let f = finished_flow();
        h.store.put_flow(&f).expect("persist");
        h.rpc.set_outcome(InstructionKind::Finish, TxStatus::Pending);

        let kept = h.settlement.process_flow(&f.id, 100).await.expect("process");
        assert_eq!(kept, Some(f.id.clone()));

        // confirmation works next tick; the flow settles then
        h.rpc.set_outcome(InstructionKind::Finish, TxStatus::Confirmed);
        let kept = h.settlement.process_flow(&f.id, 100).await.expect("process");
        assert_eq!(kept, None);
    }

    #[tokio::test]
    async fn gc_failure_does_not_block_finish() {
        let h = harness();
        let f = finished_flow();
        h.store.put_flow(&f).expect("persist");
        h.engine.set_reachable(false);

        let kept = h.settlement.process_flow(&f.id, 100).await.expect("process");
        assert_eq!(kept, None);
        assert_eq!(h.rpc.submission_count(InstructionKind::Finish), 1);
    }

    #[tokio::test]
    async fn rpc_outage_propagates_as_transient() {
        let h = harness();
        let f = finished_flow();
        h.store.put_flow(&f).expect("persist");
        h.rpc.set_offline(true);

        let err = h.settlement.process_flow(&f.id, 100).await.expect_err("offline");
        assert!(err.is_transient());
    }
}
