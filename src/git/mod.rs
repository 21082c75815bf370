//! # Repository Mirror
//!
//! Wraps one local working copy of the configuration repository and exposes
//! the three operations the reconciliation pipeline needs: fetch, commit
//! range diff, and tree reads.
//!
//! Uses command-line git via `tokio::process` (never libgit2) so transport
//! and authentication mechanics stay outside the controller. Every
//! subprocess is bounded by the configured operation timeout; failures
//! surface as `TransientGit` and are retried implicitly by the next tick.
//!
//! One mirror per environment is the expected setup, which keeps fetch and
//! checkout naturally single-flight without cross-environment locking.

use crate::error::ReconcileError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RepositoryMirror {
    remote_url: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl RepositoryMirror {
    #[must_use]
    pub fn new(remote_url: &str, workdir: &Path, timeout: Duration) -> Self {
        Self {
            remote_url: remote_url.to_string(),
            workdir: workdir.to_path_buf(),
            timeout,
        }
    }

    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone the repository if the working copy does not exist yet.
    pub async fn ensure_cloned(&self) -> Result<(), ReconcileError> {
        if self.workdir.join(".git").exists() {
            return Ok(());
        }

        if let Some(parent) = self.workdir.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ReconcileError::TransientGit(format!(
                    "failed to create mirror directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        info!("Cloning {} into {}", self.remote_url, self.workdir.display());
        let workdir = self.workdir.to_string_lossy().to_string();
        self.run_git_raw(&["clone", "--no-checkout", &self.remote_url, &workdir])
            .await?;
        Ok(())
    }

    /// Fetch `branch` from origin and return its head commit.
    pub async fn fetch(&self, branch: &str) -> Result<String, ReconcileError> {
        self.ensure_cloned().await?;
        self.run_git(&["fetch", "origin", branch]).await?;
        let head = self
            .run_git(&["rev-parse", &format!("origin/{branch}")])
            .await?;
        Ok(head.trim().to_string())
    }

    /// Paths changed between two commits.
    pub async fn diff(&self, from: &str, to: &str) -> Result<Vec<String>, ReconcileError> {
        self.ensure_cloned().await?;
        let output = self
            .run_git(&["diff", "--name-only", &format!("{from}..{to}")])
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Read every file under `path` at `commit` as (repository-relative
    /// path, bytes) pairs.
    pub async fn read_tree(
        &self,
        commit: &str,
        path: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, ReconcileError> {
        self.ensure_cloned().await?;
        let listing = self
            .run_git(&[
                "ls-tree",
                "-r",
                "--name-only",
                commit,
                "--",
                path,
            ])
            .await?;

        let mut files = Vec::new();
        for file_path in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let bytes = self
                .run_git_bytes(&["show", &format!("{commit}:{file_path}")])
                .await?;
            files.push((file_path.to_string(), bytes));
        }
        debug!("Read {} files under {} at {}", files.len(), path, commit);
        Ok(files)
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, ReconcileError> {
        let bytes = self.run_git_bytes(args).await?;
        String::from_utf8(bytes).map_err(|e| {
            ReconcileError::TransientGit(format!("git {:?} produced non-utf8 output: {e}", args))
        })
    }

    async fn run_git_bytes(&self, args: &[&str]) -> Result<Vec<u8>, ReconcileError> {
        let workdir = self.workdir.to_string_lossy().to_string();
        let mut full_args = vec!["-C", workdir.as_str()];
        full_args.extend_from_slice(args);
        self.exec(&full_args).await
    }

    /// Run git without -C, for clone where the workdir does not exist yet.
    async fn run_git_raw(&self, args: &[&str]) -> Result<Vec<u8>, ReconcileError> {
        self.exec(args).await
    }

    async fn exec(&self, args: &[&str]) -> Result<Vec<u8>, ReconcileError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("git").args(args).output(),
        )
        .await
        .map_err(|_| {
            ReconcileError::TransientGit(format!(
                "git {} timed out after {:?}",
                args.first().unwrap_or(&""),
                self.timeout
            ))
        })?
        .map_err(|e| ReconcileError::TransientGit(format!("failed to execute git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReconcileError::TransientGit(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}
