//! The flow model: a job document materialized into an executable plan.
//!
//! A flow is a small DAG of operations plus a state map and a results map.
//! The id is the SHA-256 of the definition (ops + initial state), so the same
//! job document always materializes to the same flow id and a restarted node
//! can find its in-flight work again.
//!
//! Results grow monotonically: once an op has a recorded status it is never
//! retracted or overwritten.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cid::sha256_hex;

/// Opaque flow identifier: 64 hex chars of the definition hash.
pub type FlowId = String;

/// Results key under which the wrap-up op records the uploaded result CID.
pub const RESULT_IPFS_KEY: &str = "result/ipfs";

/// Flow state key: job type tag.
pub const STATE_JOB_TYPE: &str = "nosana/job-type";
/// Flow state key: on-chain job address.
pub const STATE_JOB_ADDR: &str = "input/job-addr";
/// Flow state key: on-chain run address.
pub const STATE_RUN_ADDR: &str = "input/run-addr";
/// Flow state key: repository URL.
pub const STATE_REPO: &str = "input/repo";
/// Flow state key: commit SHA.
pub const STATE_COMMIT: &str = "input/commit-sha";

/// Operation kinds the runner knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Clone or update a repository. Value: local repo path.
    #[serde(rename = "git.ensure-repo")]
    GitEnsureRepo,
    /// Check out a commit in a cloned repository. Value: repo path.
    #[serde(rename = "git.checkout")]
    GitCheckout,
    /// Run the pipeline image against the checkout. Value: log file path.
    #[serde(rename = "docker.run")]
    DockerRun,
    /// Terminal effect: collect results, upload the result document.
    #[serde(rename = "wrap-up")]
    WrapUp,
}

/// A single operation in a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// What to execute.
    pub op: OpKind,
    /// Unique op id within the flow.
    pub id: String,
    /// Op-specific arguments.
    #[serde(default)]
    pub args: Value,
    /// Op ids that must carry an `ok` result before this op runs.
    #[serde(default)]
    pub deps: Vec<String>,
}

/// Outcome status of an executed op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Ok,
    Error,
}

/// Recorded op outcome. Serializes as the `[status, value]` pair used in the
/// result document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(OpStatus, Value)", into = "(OpStatus, Value)")]
pub struct OpResult {
    pub status: OpStatus,
    pub value: Value,
}

impl OpResult {
    pub fn ok(value: impl Into<Value>) -> Self {
        Self { status: OpStatus::Ok, value: value.into() }
    }

    pub fn error(value: impl Into<Value>) -> Self {
        Self { status: OpStatus::Error, value: value.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OpStatus::Ok
    }
}

impl From<(OpStatus, Value)> for OpResult {
    fn from((status, value): (OpStatus, Value)) -> Self {
        Self { status, value }
    }
}

impl From<OpResult> for (OpStatus, Value) {
    fn from(r: OpResult) -> Self {
        (r.status, r.value)
    }
}

/// A job materialized into an executable local plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Definition hash; stable for identical ops + initial state.
    pub id: FlowId,
    /// Operations in declaration order. Execution order honors `deps`.
    pub ops: Vec<Operation>,
    /// Flow state: job/run addresses, job type, repo inputs, carried state.
    pub state: BTreeMap<String, Value>,
    /// Recorded op outcomes, keyed by op id. Grows monotonically.
    #[serde(default)]
    pub results: BTreeMap<String, OpResult>,
    /// Absolute unix-seconds deadline after which the run is quit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

impl Flow {
    /// Build a flow from its definition; the id is derived from `ops` and
    /// `state` so identical definitions share an id.
    pub fn new(ops: Vec<Operation>, state: BTreeMap<String, Value>, expires: Option<i64>) -> Self {
        let id = flow_id(&ops, &state);
        Self { id, ops, state, results: BTreeMap::new(), expires }
    }

    /// The flow produced and uploaded its result document.
    pub fn finished(&self) -> bool {
        self.results.contains_key(RESULT_IPFS_KEY)
    }

    /// Every op has a recorded status and the terminal wrap-up op succeeded.
    pub fn complete(&self) -> bool {
        let all_recorded = self.ops.iter().all(|op| self.results.contains_key(&op.id));
        let wrap_up_ok = self
            .ops
            .iter()
            .find(|op| op.op == OpKind::WrapUp)
            .and_then(|op| self.results.get(&op.id))
            .map(OpResult::is_ok)
            .unwrap_or(false);
        all_recorded && wrap_up_ok
    }

    /// Past the deadline (if one was stamped).
    pub fn expired(&self, now: i64) -> bool {
        matches!(self.expires, Some(deadline) if now > deadline)
    }

    /// Record an op outcome. Existing entries win: results never retract.
    /// Returns whether the result was newly recorded.
    pub fn record(&mut self, op_id: &str, result: OpResult) -> bool {
        if self.results.contains_key(op_id) {
            return false;
        }
        self.results.insert(op_id.to_string(), result);
        true
    }

    /// Uploaded result CID, once wrap-up ran.
    pub fn result_cid(&self) -> Option<&str> {
        self.results.get(RESULT_IPFS_KEY).and_then(|r| r.value.as_str())
    }

    /// On-chain job address from flow state.
    pub fn job_addr(&self) -> Option<&str> {
        self.state.get(STATE_JOB_ADDR).and_then(Value::as_str)
    }

    /// On-chain run address from flow state.
    pub fn run_addr(&self) -> Option<&str> {
        self.state.get(STATE_RUN_ADDR).and_then(Value::as_str)
    }

    pub fn op(&self, id: &str) -> Option<&Operation> {
        self.ops.iter().find(|op| op.id == id)
    }
}

/// Deterministic definition hash over ops + initial state.
///
/// serde_json maps are sorted, op order is part of the definition, so the
/// canonical JSON encoding is stable.
pub fn flow_id(ops: &[Operation], state: &BTreeMap<String, Value>) -> FlowId {
    let definition = serde_json::json!({ "ops": ops, "state": state });
    // to_string on a Value cannot fail
    sha256_hex(definition.to_string().as_bytes())
}
