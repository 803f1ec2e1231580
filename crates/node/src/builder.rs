//! # Flow Builders
//!
//! Maps a fetched job document to a deterministic executable flow. Dispatch
//! is by the document's job-type tag through a registry, so new job types
//! plug in at init without touching the work loop.
//!
//! Every builder shipped today emits the same four-op layout:
//!
//! ```text
//! clone ──► checkout ──► docker-cmds ──► wrap-up
//! ```
//!
//! `Github` and `Gitlab` documents carry the same consolidated shape as
//! `Pipeline` and differ only in the job-type tag recorded in flow state.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use nosana_common::flow::{
    Flow, OpKind, Operation, STATE_COMMIT, STATE_JOB_ADDR, STATE_JOB_TYPE, STATE_REPO,
    STATE_RUN_ADDR,
};
use nosana_common::job::{JobDocument, DEFAULT_JOB_TYPE};
use nosana_common::{NodeError, Result};
use serde_json::json;

/// Op ids shared by the pipeline layout.
pub const OP_CLONE: &str = "clone";
pub const OP_CHECKOUT: &str = "checkout";
pub const OP_DOCKER_CMDS: &str = "docker-cmds";
pub const OP_WRAP_UP: &str = "wrap-up";

/// Per-run inputs a builder stamps into the flow.
#[derive(Debug, Clone)]
pub struct FlowInputs {
    /// On-chain job address.
    pub job_addr: String,
    /// On-chain run address.
    pub run_addr: String,
    /// Deadline: run claim time + market job timeout.
    pub expires: Option<i64>,
    /// Directory under which repositories are cloned.
    pub repos_dir: PathBuf,
}

/// Builds a flow from a job document.
pub trait FlowBuilder: Send + Sync {
    fn build(&self, doc: &JobDocument, inputs: &FlowInputs) -> Result<Flow>;
}

/// Registry from job-type tag to builder. Unknown tags are an error so a
/// poster typo cannot silently run the wrong flow shape.
pub struct BuilderRegistry {
    builders: HashMap<String, Arc<dyn FlowBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self { builders: HashMap::new() }
    }

    /// Registry with the stock builders registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_JOB_TYPE, Arc::new(PipelineBuilder::tagged(DEFAULT_JOB_TYPE)));
        registry.register("Github", Arc::new(PipelineBuilder::tagged("Github")));
        registry.register("Gitlab", Arc::new(PipelineBuilder::tagged("Gitlab")));
        registry
    }

    pub fn register(&mut self, job_type: impl Into<String>, builder: Arc<dyn FlowBuilder>) {
        self.builders.insert(job_type.into(), builder);
    }

    /// Dispatch on the document's job-type tag.
    pub fn build(&self, doc: &JobDocument, inputs: &FlowInputs) -> Result<Flow> {
        let builder = self.builders.get(&doc.job_type).ok_or_else(|| {
            NodeError::Decode(format!("no builder registered for job type '{}'", doc.job_type))
        })?;
        builder.build(doc, inputs)
    }
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// The stock clone → checkout → docker-cmds → wrap-up layout.
pub struct PipelineBuilder {
    tag: String,
}

impl PipelineBuilder {
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl FlowBuilder for PipelineBuilder {
    fn build(&self, doc: &JobDocument, inputs: &FlowInputs) -> Result<Flow> {
        if doc.pipeline.image.is_empty() {
            return Err(NodeError::Decode("job pipeline has no image".into()));
        }
        let repo_path = inputs.repos_dir.join(&inputs.job_addr);

        let ops = vec![
            Operation {
                op: OpKind::GitEnsureRepo,
                id: OP_CLONE.into(),
                args: json!({
                    "url": doc.url,
                    "path": repo_path.to_string_lossy(),
                }),
                deps: vec![],
            },
            Operation {
                op: OpKind::GitCheckout,
                id: OP_CHECKOUT.into(),
                args: json!({ "commit": doc.commit }),
                deps: vec![OP_CLONE.into()],
            },
            Operation {
                op: OpKind::DockerRun,
                id: OP_DOCKER_CMDS.into(),
                args: json!({
                    "image": doc.pipeline.image,
                    "commands": doc.pipeline.commands,
                    "mount-target": "/root",
                }),
                deps: vec![OP_CHECKOUT.into()],
            },
            Operation {
                op: OpKind::WrapUp,
                id: OP_WRAP_UP.into(),
                args: json!({
                    "collect": [OP_CLONE, OP_CHECKOUT, OP_DOCKER_CMDS],
                }),
                deps: vec![OP_DOCKER_CMDS.into()],
            },
        ];

        // carried poster state first, inputs overwrite on key collision
        let mut state: BTreeMap<String, serde_json::Value> = doc.state.clone();
        state.insert(STATE_JOB_TYPE.into(), json!(self.tag));
        state.insert(STATE_JOB_ADDR.into(), json!(inputs.job_addr));
        state.insert(STATE_RUN_ADDR.into(), json!(inputs.run_addr));
        state.insert(STATE_REPO.into(), json!(doc.url));
        state.insert(STATE_COMMIT.into(), json!(doc.commit));

        Ok(Flow::new(ops, state, inputs.expires))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nosana_common::job::PipelineSpec;
    use serde_json::Value;

    fn doc(job_type: &str) -> JobDocument {
        JobDocument {
            job_type: job_type.into(),
            url: "https://github.com/acme/repo".into(),
            commit: "abc123".into(),
            pipeline: PipelineSpec {
                image: "alpine".into(),
                commands: vec!["echo hi".into()],
            },
            state: BTreeMap::from([(
                "nosana/secrets".to_string(),
                serde_json::json!(["TOKEN"]),
            )]),
        }
    }

    fn inputs() -> FlowInputs {
        FlowInputs {
            job_addr: "job111".into(),
            run_addr: "run111".into(),
            expires: Some(1_700_000_060),
            repos_dir: PathBuf::from("/tmp/repos"),
        }
    }

    #[test]
    fn pipeline_layout_and_deps() {
        let flow = BuilderRegistry::with_defaults().build(&doc("Pipeline"), &inputs()).expect("build");

        let ids: Vec<&str> = flow.ops.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec![OP_CLONE, OP_CHECKOUT, OP_DOCKER_CMDS, OP_WRAP_UP]);

        assert!(flow.op(OP_CLONE).unwrap().deps.is_empty());
        assert_eq!(flow.op(OP_CHECKOUT).unwrap().deps, vec![OP_CLONE]);
        assert_eq!(flow.op(OP_DOCKER_CMDS).unwrap().deps, vec![OP_CHECKOUT]);
        assert_eq!(flow.op(OP_WRAP_UP).unwrap().deps, vec![OP_DOCKER_CMDS]);

        assert_eq!(flow.op(OP_WRAP_UP).unwrap().op, OpKind::WrapUp);
        assert_eq!(flow.expires, Some(1_700_000_060));
    }

    #[test]
    fn state_carries_inputs_and_poster_state() {
        let flow = BuilderRegistry::with_defaults().build(&doc("Pipeline"), &inputs()).expect("build");

        assert_eq!(flow.state[STATE_JOB_TYPE], Value::from("Pipeline"));
        assert_eq!(flow.job_addr(), Some("job111"));
        assert_eq!(flow.run_addr(), Some("run111"));
        assert_eq!(flow.state[STATE_REPO], Value::from("https://github.com/acme/repo"));
        assert_eq!(flow.state[STATE_COMMIT], Value::from("abc123"));
        assert!(flow.state.contains_key("nosana/secrets"));
    }

    #[test]
    fn build_is_deterministic() {
        let registry = BuilderRegistry::with_defaults();
        let a = registry.build(&doc("Pipeline"), &inputs()).expect("build");
        let b = registry.build(&doc("Pipeline"), &inputs()).expect("build");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn job_type_tags_change_flow_identity() {
        let registry = BuilderRegistry::with_defaults();
        let pipeline = registry.build(&doc("Pipeline"), &inputs()).expect("build");
        let github = registry.build(&doc("Github"), &inputs()).expect("build");

        assert_eq!(github.state[STATE_JOB_TYPE], Value::from("Github"));
        assert_ne!(pipeline.id, github.id);
    }

    #[test]
    fn unknown_job_type_is_rejected() {
        let registry = BuilderRegistry::with_defaults();
        assert!(registry.build(&doc("Jenkins"), &inputs()).is_err());
    }

    #[test]
    fn empty_image_is_rejected() {
        let mut bad = doc("Pipeline");
        bad.pipeline.image = String::new();
        let registry = BuilderRegistry::with_defaults();
        assert!(registry.build(&bad, &inputs()).is_err());
    }

    #[test]
    fn custom_builder_registration() {
        struct Nop;
        impl FlowBuilder for Nop {
            fn build(&self, doc: &JobDocument, inputs: &FlowInputs) -> Result<Flow> {
                PipelineBuilder::tagged("Custom").build(doc, inputs)
            }
        }

        let mut registry = BuilderRegistry::with_defaults();
        registry.register("Custom", Arc::new(Nop));
        let flow = registry.build(&doc("Custom"), &inputs()).expect("build");
        assert_eq!(flow.state[STATE_JOB_TYPE], Value::from("Custom"));
    }
}
