//! Git repository operations.
//!
//! The working copy is a read-only mirror: revisions are fetched into it and
//! files are read straight from the object database, so the checkout is never
//! touched and a fetch of one revision cannot change what another reads.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command as TokioCommand;

use super::auth::{build_auth_env, AuthEnv};
use super::parse::{failure_message, parse_commit_sha, parse_ls_tree};
use crate::config::schema::GitAuthSettings;
use crate::gitops::error::{classify_git_error, Result, SyncError};

/// Default timeout for a single git command.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Local mirror of a remote repository.
pub struct GitRepository {
    repo_path: PathBuf,
    remote_url: String,
    auth: GitAuthSettings,
    timeout: Duration,
}

impl GitRepository {
    /// Creates a handle for a mirror of `remote_url` stored at `repo_path`.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        remote_url: impl Into<String>,
        auth: GitAuthSettings,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            remote_url: remote_url.into(),
            auth,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    /// Checks if the directory is a git repository.
    pub fn is_git_repo(&self) -> bool {
        self.repo_path.join(".git").exists()
    }

    /// Initializes the mirror and points `origin` at the remote.
    pub async fn ensure_initialized(&self) -> Result<()> {
        if !self.is_git_repo() {
            tokio::fs::create_dir_all(&self.repo_path)
                .await
                .map_err(|e| {
                    SyncError::GitOperation(format!(
                        "Failed to create {}: {}",
                        self.repo_path.display(),
                        e
                    ))
                })?;
            self.git_checked(&["init", "--quiet"]).await?;
            log::info!("Initialized git mirror at {}", self.repo_path.display());
        }

        let has_origin = self
            .run_git(&["remote", "get-url", "origin"], None)
            .await?
            .status
            .success();

        if has_origin {
            self.git_checked(&["remote", "set-url", "origin", &self.remote_url])
                .await?;
        } else {
            self.git_checked(&["remote", "add", "origin", &self.remote_url])
                .await?;
        }

        Ok(())
    }

    /// Fetches `revision` (branch, tag or sha) and returns the commit it resolves to.
    pub async fn fetch(&self, revision: &str) -> Result<String> {
        if !self.is_git_repo() {
            return Err(SyncError::GitNotInitialized);
        }

        let auth = build_auth_env(&self.auth)?;
        let output = self
            .run_git(
                &["fetch", "--quiet", "--no-tags", "origin", revision],
                Some(&auth),
            )
            .await?;
        drop(auth);

        if !output.status.success() {
            return Err(classify_git_error(&failure_message(&output)));
        }

        let output = self
            .git_checked(&["rev-parse", "--verify", "FETCH_HEAD^{commit}"])
            .await?;
        parse_commit_sha(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            SyncError::GitOperation(format!("Could not resolve revision '{}'", revision))
        })
    }

    /// Checks whether `sha` is already present in the mirror.
    pub async fn has_commit(&self, sha: &str) -> Result<bool> {
        if !self.is_git_repo() {
            return Ok(false);
        }
        let spec = format!("{}^{{commit}}", sha);
        let output = self.run_git(&["cat-file", "-e", &spec], None).await?;
        Ok(output.status.success())
    }

    /// Checks that `path` is a directory in `commit`.
    pub async fn tree_exists(&self, commit: &str, path: &str) -> Result<bool> {
        if is_root(path) {
            return Ok(true);
        }
        let spec = format!("{}:{}", commit, path.trim_end_matches('/'));
        let output = self.run_git(&["cat-file", "-t", &spec], None).await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "tree")
    }

    /// Lists files below `path` in `commit`, relative to the repository root.
    pub async fn list_files(&self, commit: &str, path: &str) -> Result<Vec<String>> {
        let mut args = vec!["ls-tree", "-r", "--name-only", commit];
        if !is_root(path) {
            args.push("--");
            args.push(path);
        }
        let output = self.git_checked(&args).await?;
        Ok(parse_ls_tree(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Reads a file from `commit`.
    pub async fn show_file(&self, commit: &str, file: &str) -> Result<String> {
        let spec = format!("{}:{}", commit, file);
        let output = self.git_checked(&["show", &spec]).await?;
        String::from_utf8(output.stdout)
            .map_err(|e| SyncError::GitOperation(format!("{} is not valid UTF-8: {}", file, e)))
    }

    async fn git_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run_git(args, None).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(SyncError::GitOperation(failure_message(&output)))
        }
    }

    /// Runs a git command in the repository directory.
    async fn run_git(&self, args: &[&str], auth: Option<&AuthEnv>) -> Result<Output> {
        let mut cmd = TokioCommand::new("git");
        cmd.current_dir(&self.repo_path)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(auth) = auth {
            for (key, value) in &auth.env_vars {
                cmd.env(key, value);
            }
        }

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output.map_err(|e| SyncError::GitOperation(e.to_string())),
            Err(_) => Err(SyncError::GitTimeout(self.timeout.as_secs())),
        }
    }
}

fn is_root(path: &str) -> bool {
    matches!(path.trim_matches('/'), "" | ".")
}
