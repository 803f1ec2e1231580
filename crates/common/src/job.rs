//! Job and result document wire schemas.
//!
//! The job document is the JSON a poster pins to the blob store; the chain
//! only carries its digest. The result document is what the node uploads
//! after a flow finishes. Unknown `state` keys are carried through untouched
//! so posters can attach data the node does not interpret.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flow::OpResult;

/// Default job type tag when the document omits `type`.
pub const DEFAULT_JOB_TYPE: &str = "Pipeline";

/// Container pipeline description inside a job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Container image to run.
    pub image: String,
    /// Shell commands executed inside the container, in order.
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Content-addressed job document.
///
/// ```json
/// { "type": "Pipeline",
///   "url": "https://github.com/acme/repo",
///   "commit": "d0a1…",
///   "pipeline": { "image": "alpine", "commands": ["echo hi"] },
///   "state": { "nosana/secrets": [] } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    /// Job type tag, dispatched through the builder registry.
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: String,
    /// Repository URL to clone.
    pub url: String,
    /// Commit SHA to check out.
    pub commit: String,
    /// Pipeline to execute against the checkout.
    pub pipeline: PipelineSpec,
    /// Poster-supplied state, merged verbatim into the flow state.
    #[serde(default)]
    pub state: BTreeMap<String, serde_json::Value>,
}

fn default_job_type() -> String {
    DEFAULT_JOB_TYPE.to_string()
}

/// Result document uploaded by the wrap-up op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    /// Flow id that produced these results.
    #[serde(rename = "nos-id")]
    pub nos_id: String,
    /// Unix seconds at which the flow finished.
    #[serde(rename = "finished-at")]
    pub finished_at: i64,
    /// Selected op results, each serialized as a `[status, value]` pair.
    pub results: BTreeMap<String, OpResult>,
}
