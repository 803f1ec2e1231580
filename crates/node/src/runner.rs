//! # Flow Runner
//!
//! Advances a persisted flow's operations in dependency order, one op at a
//! time. Every recorded result is flushed to the flow store before the next
//! op starts, so a crash never loses more than the op in flight and a
//! restarted node resumes by skipping ops that already carry a result.
//!
//! Failure semantics split in two:
//!
//! - **Op failures** (`OpFailed`, bad args) are recorded in the flow's
//!   results; dependents are poisoned with the upstream op id as cause and
//!   independent branches keep running.
//! - **Transient infrastructure failures** (engine unreachable, blob
//!   gateway down) abort the pass without recording anything; the work
//!   loop logs and the next tick re-enters the runner where it left off.
//!
//! The runner also honors the flow deadline cooperatively: it refuses to
//! start another op on an expired flow, surfacing `ExpiredRun` so the
//! settlement gate quits the run instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nosana_common::flow::{Flow, OpKind, OpResult, Operation, RESULT_IPFS_KEY};
use nosana_common::job::ResultDocument;
use nosana_common::{NodeError, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::blob::BlobClient;
use crate::engine::{ContainerEngine, RunSpec};
use crate::git::GitClient;
use crate::store::FlowStore;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Executes flows against the external collaborators.
#[derive(Clone)]
pub struct FlowRunner {
    store: FlowStore,
    git: Arc<dyn GitClient>,
    engine: Arc<dyn ContainerEngine>,
    blob: BlobClient,
    logs_dir: PathBuf,
}

enum Step {
    /// Op executed or poisoned; result recorded.
    Recorded,
    /// Nothing left to decide.
    Done,
}

impl FlowRunner {
    pub fn new(
        store: FlowStore,
        git: Arc<dyn GitClient>,
        engine: Arc<dyn ContainerEngine>,
        blob: BlobClient,
        logs_dir: PathBuf,
    ) -> Self {
        Self { store, git, engine, blob, logs_dir }
    }

    /// Drive the flow until every reachable op has a recorded status.
    ///
    /// Returns `Err` on transient infrastructure failure or on an expired
    /// deadline; the flow is left persisted at its last completed op.
    pub async fn run(&self, flow_id: &str) -> Result<()> {
        let mut flow = self
            .store
            .get_flow(flow_id)?
            .ok_or_else(|| NodeError::Storage(format!("flow not found: {flow_id}")))?;

        loop {
            match self.step(&mut flow).await? {
                Step::Recorded => {
                    self.store.put_flow(&flow)?;
                }
                Step::Done => break,
            }
        }
        info!(flow = %flow.id, finished = flow.finished(), "flow runner drained");
        Ok(())
    }

    /// Decide or execute one op.
    async fn step(&self, flow: &mut Flow) -> Result<Step> {
        let Some(op) = next_decidable(flow).cloned() else {
            return Ok(Step::Done);
        };

        // cooperative deadline: never start an op on an expired flow; the
        // loop's settlement gate quits the run
        crate::settle::check_deadline(flow, unix_now())?;

        // poisoned by an upstream failure?
        if let Some(failed_dep) =
            op.deps.iter().find(|dep| flow.results.get(*dep).is_some_and(|r| !r.is_ok()))
        {
            warn!(flow = %flow.id, op = %op.id, dep = %failed_dep, "skipping op, upstream failed");
            flow.record(&op.id, OpResult::error(format!("upstream failure: {failed_dep}")));
            return Ok(Step::Recorded);
        }

        debug!(flow = %flow.id, op = %op.id, "executing op");
        // only op failures are recorded; infrastructure failures (engine
        // down, blob gateway down or unauthorized, store I/O) abort the
        // pass and a later tick retries from the same op
        let result = match self.execute(flow, &op).await {
            Ok(value) => OpResult::ok(value),
            Err(e @ NodeError::OpFailed { .. }) => {
                warn!(flow = %flow.id, op = %op.id, "op failed: {e}");
                OpResult::error(e.to_string())
            }
            Err(e) => return Err(e),
        };
        // a successful wrap-up also records the reserved result key, so
        // settlement can test `finished` without knowing op ids
        let uploaded_cid =
            (op.op == OpKind::WrapUp && result.is_ok()).then(|| result.value.clone());
        flow.record(&op.id, result);
        if let Some(cid) = uploaded_cid {
            flow.record(RESULT_IPFS_KEY, OpResult::ok(cid));
        }
        Ok(Step::Recorded)
    }

    async fn execute(&self, flow: &Flow, op: &Operation) -> Result<Value> {
        match op.op {
            OpKind::GitEnsureRepo => {
                let url = str_arg(op, "url")?;
                let path = PathBuf::from(str_arg(op, "path")?);
                let repo = self.git.ensure_repo(&url, &path).await?;
                Ok(Value::from(repo.to_string_lossy().into_owned()))
            }
            OpKind::GitCheckout => {
                let commit = str_arg(op, "commit")?;
                let repo = PathBuf::from(dep_value(flow, op)?);
                let repo = self.git.checkout(&repo, &commit).await?;
                Ok(Value::from(repo.to_string_lossy().into_owned()))
            }
            OpKind::DockerRun => {
                let image = str_arg(op, "image")?;
                let commands = op
                    .args
                    .get("commands")
                    .and_then(Value::as_array)
                    .map(|cmds| {
                        cmds.iter().filter_map(Value::as_str).map(str::to_string).collect()
                    })
                    .unwrap_or_default();
                let work_dir = Some(PathBuf::from(dep_value(flow, op)?));

                std::fs::create_dir_all(&self.logs_dir).map_err(|e| {
                    NodeError::Storage(format!("create {}: {e}", self.logs_dir.display()))
                })?;
                let log_path = self.logs_dir.join(format!("{}-{}.log", flow.id, op.id));

                let log = self
                    .engine
                    .run(&RunSpec { image, commands, work_dir, log_path })
                    .await?;
                Ok(Value::from(log.to_string_lossy().into_owned()))
            }
            OpKind::WrapUp => self.wrap_up(flow, op).await,
        }
    }

    /// Terminal effect: collect selected results, inline the pipeline log,
    /// upload the result document.
    async fn wrap_up(&self, flow: &Flow, op: &Operation) -> Result<Value> {
        let collect: Vec<String> = op
            .args
            .get("collect")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let mut results = std::collections::BTreeMap::new();
        for id in &collect {
            let recorded = flow.results.get(id).ok_or_else(|| NodeError::OpFailed {
                op: op.id.clone(),
                reason: format!("collected op '{id}' has no result"),
            })?;
            let mut entry = recorded.clone();
            // replace the pipeline's log path handle with the log contents
            if entry.is_ok() && flow.op(id).map(|o| o.op) == Some(OpKind::DockerRun) {
                let path = entry.value.as_str().unwrap_or_default().to_string();
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| NodeError::Storage(format!("read log {path}: {e}")))?;
                entry.value = Value::from(contents);
            }
            results.insert(id.clone(), entry);
        }

        let document = ResultDocument {
            nos_id: flow.id.clone(),
            finished_at: unix_now(),
            results,
        };
        let body = serde_json::to_value(&document)
            .map_err(|e| NodeError::Decode(format!("result document: {e}")))?;
        let cid = self.blob.put_json(&body).await?;
        info!(flow = %flow.id, cid = %cid, "result document uploaded");
        Ok(Value::from(cid))
    }
}

/// First op without a result whose deps all carry one.
fn next_decidable(flow: &Flow) -> Option<&Operation> {
    flow.ops.iter().find(|op| {
        !flow.results.contains_key(&op.id)
            && op.deps.iter().all(|dep| flow.results.contains_key(dep))
    })
}

fn str_arg(op: &Operation, key: &str) -> Result<String> {
    op.args
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| NodeError::OpFailed {
            op: op.id.clone(),
            reason: format!("missing '{key}' argument"),
        })
}

/// Value of the op's first dependency (the chain layout has at most one).
fn dep_value(flow: &Flow, op: &Operation) -> Result<String> {
    let dep = op.deps.first().ok_or_else(|| NodeError::OpFailed {
        op: op.id.clone(),
        reason: "op has no dependency to read".into(),
    })?;
    flow.results
        .get(dep)
        .and_then(|r| r.value.as_str())
        .map(str::to_string)
        .ok_or_else(|| NodeError::OpFailed {
            op: op.id.clone(),
            reason: format!("dependency '{dep}' has no value"),
        })
}
