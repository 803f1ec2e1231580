//! Git collaborator: repository materialization for flows.
//!
//! Two operations, matching the two git ops a flow carries: make sure the
//! repository exists locally (clone or fetch), then pin it to a commit.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use nosana_common::{NodeError, Result};
use parking_lot::Mutex;
use tokio::process::Command;

/// Git operations the runner needs.
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Clone `url` into `dest`, or fetch if a clone already exists.
    /// Returns the repository path.
    async fn ensure_repo(&self, url: &str, dest: &Path) -> Result<PathBuf>;

    /// Check out `commit` in the repository at `repo`. Returns the
    /// repository path.
    async fn checkout(&self, repo: &Path, commit: &str) -> Result<PathBuf>;
}

// ─── CLI client ──────────────────────────────────────────────────────────────

/// Shells out to the system `git`.
pub struct CliGitClient;

impl CliGitClient {
    pub fn new() -> Self {
        Self
    }

    async fn git(args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| NodeError::OpFailed { op: "git".into(), reason: e.to_string() })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(NodeError::OpFailed {
                op: "git".into(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Default for CliGitClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitClient for CliGitClient {
    async fn ensure_repo(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        let dest_str = dest.to_string_lossy();
        if dest.join(".git").exists() {
            Self::git(&["-C", &dest_str, "fetch", "--all", "--quiet"]).await?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| NodeError::Storage(format!("create {}: {e}", parent.display())))?;
            }
            Self::git(&["clone", "--quiet", url, &dest_str]).await?;
        }
        Ok(dest.to_path_buf())
    }

    async fn checkout(&self, repo: &Path, commit: &str) -> Result<PathBuf> {
        let repo_str = repo.to_string_lossy();
        Self::git(&["-C", &repo_str, "checkout", "--quiet", commit]).await?;
        Ok(repo.to_path_buf())
    }
}

// ─── Mock client ─────────────────────────────────────────────────────────────

/// Records calls, creates the destination directory so downstream ops can
/// mount it.
pub struct MockGitClient {
    calls: Mutex<Vec<String>>,
    fail_with: Mutex<Option<String>>,
}

impl MockGitClient {
    pub fn new() -> Self {
        Self { calls: Mutex::new(Vec::new()), fail_with: Mutex::new(None) }
    }

    pub fn set_failure(&self, reason: Option<String>) {
        *self.fail_with.lock() = reason;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn check_failure(&self, op: &str) -> Result<()> {
        if let Some(reason) = self.fail_with.lock().clone() {
            return Err(NodeError::OpFailed { op: op.into(), reason });
        }
        Ok(())
    }
}

impl Default for MockGitClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitClient for MockGitClient {
    async fn ensure_repo(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        self.calls.lock().push(format!("ensure-repo {url} {}", dest.display()));
        self.check_failure("git.ensure-repo")?;
        std::fs::create_dir_all(dest)
            .map_err(|e| NodeError::Storage(format!("create {}: {e}", dest.display())))?;
        Ok(dest.to_path_buf())
    }

    async fn checkout(&self, repo: &Path, commit: &str) -> Result<PathBuf> {
        self.calls.lock().push(format!("checkout {commit} {}", repo.display()));
        self.check_failure("git.checkout")?;
        Ok(repo.to_path_buf())
    }
}
