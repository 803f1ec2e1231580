//! # ContainerEngine — Pipeline Execution Collaborator
//!
//! The runner hands the engine an image, a command list, and a host
//! directory to mount at `/root`; the engine runs them and leaves combined
//! output in a log file. The log file path is the op's result value — the
//! wrap-up op inlines its contents into the result document later.
//!
//! `DockerCliEngine` drives the `docker`/`podman` CLI through
//! `tokio::process`. Engine unreachability is a transient error
//! (`ContainerUnreachable`), a non-zero pipeline exit is an op failure
//! (`OpFailed`); the two travel very different paths through the work loop.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use nosana_common::{NodeError, Result};
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::debug;

/// One pipeline execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    /// Container image.
    pub image: String,
    /// Shell commands run in order inside one container.
    pub commands: Vec<String>,
    /// Host directory mounted at `/root` inside the container.
    pub work_dir: Option<PathBuf>,
    /// Where combined stdout/stderr is written.
    pub log_path: PathBuf,
}

/// Container engine contract consumed by the runner and health monitor.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;

    /// Run the spec to completion; returns the log file path.
    async fn run(&self, spec: &RunSpec) -> Result<PathBuf>;

    /// Reclaim volumes left behind by finished pipelines.
    async fn gc_volumes(&self) -> Result<()>;
}

// ─── Docker CLI engine ──────────────────────────────────────────────────────

/// Engine backed by the `docker` (or `podman`) command line client.
pub struct DockerCliEngine {
    binary: String,
    /// DOCKER_HOST value, when the engine listens on a non-default socket.
    host: Option<String>,
}

impl DockerCliEngine {
    pub fn new(binary: impl Into<String>, host: Option<String>) -> Self {
        Self { binary: binary.into(), host }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(host) = &self.host {
            cmd.env("DOCKER_HOST", host);
        }
        cmd
    }
}

#[async_trait]
impl ContainerEngine for DockerCliEngine {
    async fn ping(&self) -> Result<()> {
        let status = self
            .command()
            .arg("version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| NodeError::ContainerUnreachable(format!("{}: {e}", self.binary)))?;
        if status.success() {
            Ok(())
        } else {
            Err(NodeError::ContainerUnreachable(format!(
                "{} version exited with {status}",
                self.binary
            )))
        }
    }

    async fn run(&self, spec: &RunSpec) -> Result<PathBuf> {
        let script = spec.commands.join(" && ");
        let mut cmd = self.command();
        cmd.arg("run").arg("--rm");
        if let Some(dir) = &spec.work_dir {
            cmd.arg("-v").arg(format!("{}:/root", dir.display()));
            cmd.arg("-w").arg("/root");
        }
        cmd.arg(&spec.image).arg("sh").arg("-c").arg(&script);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(image = %spec.image, "running pipeline container");
        let output = cmd
            .output()
            .await
            .map_err(|e| NodeError::ContainerUnreachable(format!("{}: {e}", self.binary)))?;

        let mut log = output.stdout;
        log.extend_from_slice(&output.stderr);
        tokio::fs::write(&spec.log_path, &log)
            .await
            .map_err(|e| NodeError::Storage(format!("write {}: {e}", spec.log_path.display())))?;

        if output.status.success() {
            Ok(spec.log_path.clone())
        } else {
            Err(NodeError::OpFailed {
                op: "docker.run".into(),
                reason: format!("pipeline exited with {}", output.status),
            })
        }
    }

    async fn gc_volumes(&self) -> Result<()> {
        let status = self
            .command()
            .args(["volume", "prune", "-f"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| NodeError::ContainerUnreachable(format!("{}: {e}", self.binary)))?;
        if status.success() {
            Ok(())
        } else {
            Err(NodeError::ContainerUnreachable(format!(
                "volume prune exited with {status}"
            )))
        }
    }
}

// ─── Mock engine ────────────────────────────────────────────────────────────

/// Scripted engine for tests: records every run spec, writes a canned log.
pub struct MockEngine {
    runs: Mutex<Vec<RunSpec>>,
    reachable: Mutex<bool>,
    output: Mutex<String>,
    fail_with: Mutex<Option<String>>,
    gc_count: Mutex<u64>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
            reachable: Mutex::new(true),
            output: Mutex::new(String::from("hi\n")),
            fail_with: Mutex::new(None),
            gc_count: Mutex::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock() = reachable;
    }

    /// Log contents written on each successful run.
    pub fn set_output(&self, output: impl Into<String>) {
        *self.output.lock() = output.into();
    }

    /// Make subsequent runs fail as pipeline errors with this reason.
    pub fn set_failure(&self, reason: Option<String>) {
        *self.fail_with.lock() = reason;
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.runs.lock().clone()
    }

    pub fn gc_count(&self) -> u64 {
        *self.gc_count.lock()
    }

    fn ensure_reachable(&self) -> Result<()> {
        if *self.reachable.lock() {
            Ok(())
        } else {
            Err(NodeError::ContainerUnreachable("mock engine offline".into()))
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<()> {
        self.ensure_reachable()
    }

    async fn run(&self, spec: &RunSpec) -> Result<PathBuf> {
        self.ensure_reachable()?;
        self.runs.lock().push(spec.clone());
        if let Some(reason) = self.fail_with.lock().clone() {
            return Err(NodeError::OpFailed { op: "docker.run".into(), reason });
        }
        let output = self.output.lock().clone();
        tokio::fs::write(&spec.log_path, output.as_bytes())
            .await
            .map_err(|e| NodeError::Storage(format!("write {}: {e}", spec.log_path.display())))?;
        Ok(spec.log_path.clone())
    }

    async fn gc_volumes(&self) -> Result<()> {
        self.ensure_reachable()?;
        *self.gc_count.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(log_path: PathBuf) -> RunSpec {
        RunSpec {
            image: "alpine".into(),
            commands: vec!["echo hi".into()],
            work_dir: None,
            log_path,
        }
    }

    #[tokio::test]
    async fn mock_run_writes_log_and_records_spec() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = MockEngine::new();
        engine.set_output("pipeline output\n");

        let log = dir.path().join("run.log");
        let returned = engine.run(&spec(log.clone())).await.expect("run");
        assert_eq!(returned, log);

        let contents = tokio::fs::read_to_string(&log).await.expect("read");
        assert_eq!(contents, "pipeline output\n");
        assert_eq!(engine.runs().len(), 1);
        assert_eq!(engine.runs()[0].image, "alpine");
    }

    #[tokio::test]
    async fn mock_unreachable_is_transient() {
        let engine = MockEngine::new();
        engine.set_reachable(false);

        let err = engine.ping().await.expect_err("offline");
        assert!(err.is_transient());

        let dir = tempfile::tempdir().expect("tempdir");
        let err = engine.run(&spec(dir.path().join("run.log"))).await.expect_err("offline");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn mock_pipeline_failure_is_op_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = MockEngine::new();
        engine.set_failure(Some("exit 1".into()));

        let err = engine.run(&spec(dir.path().join("run.log"))).await.expect_err("fail");
        assert!(matches!(err, NodeError::OpFailed { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn gc_counts() {
        let engine = MockEngine::new();
        engine.gc_volumes().await.expect("gc");
        engine.gc_volumes().await.expect("gc");
        assert_eq!(engine.gc_count(), 2);
    }
}
