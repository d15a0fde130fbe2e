//! Version-control backend driving the `git` binary

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use super::REMOTE;

/// Errors raised by version-control operations
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Merge conflict while merging {0}")]
    MergeConflict(String),
}

impl GitError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, GitError::MergeConflict(_))
    }
}

/// Primitive operations the reconciliation engine needs from version control.
///
/// Every call is blocking; async callers go through `spawn_blocking`.
pub trait VersionControl: Send + Sync {
    fn init(&self, path: &Path) -> Result<(), GitError>;

    fn add(&self, path: &Path, globs: &[&str]) -> Result<(), GitError>;

    /// Returns the new commit id, or `None` when there was nothing to commit
    fn commit(&self, path: &Path, message: &str) -> Result<Option<String>, GitError>;

    fn checkout(&self, path: &Path, branch: &str, create: bool) -> Result<(), GitError>;

    fn current_branch(&self, path: &Path) -> Result<String, GitError>;

    /// True if `name` resolves to a commit (local branch or `origin/...` ref)
    fn branch_exists(&self, path: &Path, name: &str) -> Result<bool, GitError>;

    /// Merge `branch` into the current branch; conflicts yield `GitError::MergeConflict`
    fn merge(&self, path: &Path, branch: &str) -> Result<(), GitError>;

    fn merge_abort(&self, path: &Path) -> Result<(), GitError>;

    fn merge_base(&self, path: &Path, a: &str, b: &str) -> Result<String, GitError>;

    fn diff_names(&self, path: &Path, base: &str, head: &str) -> Result<Vec<String>, GitError>;

    fn fetch(&self, path: &Path) -> Result<(), GitError>;

    /// Push the current branch to the same name on the remote
    fn push(&self, path: &Path) -> Result<(), GitError>;

    fn push_branch(&self, path: &Path, branch: &str, force_with_lease: bool) -> Result<(), GitError>;

    fn pull(&self, path: &Path, rebase: bool) -> Result<(), GitError>;

    /// Paths with uncommitted changes, untracked files included
    fn status(&self, path: &Path) -> Result<Vec<String>, GitError>;

    fn has_remote(&self, path: &Path) -> Result<bool, GitError>;

    /// Remote-tracking branches matching `pattern`, e.g. `origin/collaborator/*`
    fn list_remote_branches(&self, path: &Path, pattern: &str) -> Result<Vec<String>, GitError>;

    /// Remote-tracking branches matching `pattern` that are ancestors of `target`
    fn list_merged_remote_branches(
        &self,
        path: &Path,
        target: &str,
        pattern: &str,
    ) -> Result<Vec<String>, GitError>;

    /// Delete a remote branch given its remote-tracking name (`origin/...`)
    fn delete_remote_branch(&self, path: &Path, name: &str) -> Result<(), GitError>;

    /// Bring `files` from `source` into the index and working tree of the
    /// current branch; files absent from `source` are removed
    fn checkout_files(&self, path: &Path, source: &str, files: &[String]) -> Result<(), GitError>;
}

/// `VersionControl` backed by the `git` command line
#[derive(Debug, Clone)]
pub struct GitCli {
    commit_author: String,
    commit_email: String,
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            commit_author: "knowsync".to_string(),
            commit_email: "knowsync@local".to_string(),
        }
    }

    fn output(&self, path: &Path, args: &[&str]) -> Result<Output, GitError> {
        tracing::trace!(repo = %path.display(), args = ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()?;
        Ok(output)
    }

    fn run(&self, path: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.output(path, args)?;
        if !output.status.success() {
            return Err(command_error(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn succeeds(&self, path: &Path, args: &[&str]) -> Result<bool, GitError> {
        Ok(self.output(path, args)?.status.success())
    }

    fn list_branches(&self, path: &Path, args: &[&str]) -> Result<Vec<String>, GitError> {
        let stdout = self.run(path, args)?;
        Ok(stdout
            .lines()
            .map(|line| line.trim_start_matches(['*', ' ']).trim())
            .filter(|line| !line.is_empty() && !line.contains(" -> "))
            .map(str::to_string)
            .collect())
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

fn command_error(args: &[&str], output: &Output) -> GitError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stderr = if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    };
    GitError::Command {
        command: args.first().copied().unwrap_or_default().to_string(),
        stderr,
    }
}

/// Path column of a `git status --porcelain` line
fn porcelain_path(line: &str) -> Option<String> {
    let path = line.get(3..)?;
    let path = match path.split_once(" -> ") {
        Some((_, renamed)) => renamed,
        None => path,
    };
    Some(path.trim_matches('"').to_string())
}

impl VersionControl for GitCli {
    fn init(&self, path: &Path) -> Result<(), GitError> {
        fs::create_dir_all(path)?;
        self.run(path, &["init"])?;
        // Unborn HEAD can be repointed on any git version
        if !self.succeeds(path, &["rev-parse", "--verify", "--quiet", "HEAD"])? {
            self.run(path, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        }
        self.run(path, &["config", "user.name", &self.commit_author])?;
        self.run(path, &["config", "user.email", &self.commit_email])?;
        tracing::info!(repo = %path.display(), "initialized knowledge repository");
        Ok(())
    }

    fn add(&self, path: &Path, globs: &[&str]) -> Result<(), GitError> {
        let mut args = vec!["add", "-A", "--"];
        args.extend_from_slice(globs);
        self.run(path, &args)?;
        Ok(())
    }

    fn commit(&self, path: &Path, message: &str) -> Result<Option<String>, GitError> {
        let args = ["commit", "-m", message];
        let output = self.output(path, &args)?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            // "nothing to commit" and "nothing added to commit" are not failures
            if stdout.contains("nothing to commit")
                || stdout.contains("nothing added to commit")
                || stderr.contains("nothing to commit")
            {
                return Ok(None);
            }
            return Err(command_error(&args, &output));
        }

        let hash = self.run(path, &["rev-parse", "HEAD"])?;
        Ok(Some(hash.trim().to_string()))
    }

    fn checkout(&self, path: &Path, branch: &str, create: bool) -> Result<(), GitError> {
        if create {
            self.run(path, &["checkout", "-b", branch])?;
        } else {
            self.run(path, &["checkout", branch])?;
        }
        Ok(())
    }

    fn current_branch(&self, path: &Path) -> Result<String, GitError> {
        // symbolic-ref also works on an unborn branch
        let name = self.run(path, &["symbolic-ref", "--short", "HEAD"])?;
        Ok(name.trim().to_string())
    }

    fn branch_exists(&self, path: &Path, name: &str) -> Result<bool, GitError> {
        let spec = format!("{}^{{commit}}", name);
        self.succeeds(path, &["rev-parse", "--verify", "--quiet", &spec])
    }

    fn merge(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        let args = ["merge", "--no-edit", branch];
        let output = self.output(path, &args)?;
        if output.status.success() {
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains("CONFLICT")
            || stdout.contains("Automatic merge failed")
            || stderr.contains("CONFLICT")
        {
            return Err(GitError::MergeConflict(branch.to_string()));
        }
        Err(command_error(&args, &output))
    }

    fn merge_abort(&self, path: &Path) -> Result<(), GitError> {
        self.run(path, &["merge", "--abort"])?;
        Ok(())
    }

    fn merge_base(&self, path: &Path, a: &str, b: &str) -> Result<String, GitError> {
        let base = self.run(path, &["merge-base", a, b])?;
        Ok(base.trim().to_string())
    }

    fn diff_names(&self, path: &Path, base: &str, head: &str) -> Result<Vec<String>, GitError> {
        let stdout = self.run(path, &["diff", "--name-only", base, head])?;
        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn fetch(&self, path: &Path) -> Result<(), GitError> {
        self.run(path, &["fetch", REMOTE, "--prune"])?;
        Ok(())
    }

    fn push(&self, path: &Path) -> Result<(), GitError> {
        self.run(path, &["push", REMOTE, "HEAD"])?;
        Ok(())
    }

    fn push_branch(&self, path: &Path, branch: &str, force_with_lease: bool) -> Result<(), GitError> {
        let mut args = vec!["push"];
        if force_with_lease {
            args.push("--force-with-lease");
        }
        args.extend_from_slice(&["-u", REMOTE, branch]);
        self.run(path, &args)?;
        Ok(())
    }

    fn pull(&self, path: &Path, rebase: bool) -> Result<(), GitError> {
        let mode = if rebase { "--rebase" } else { "--no-rebase" };
        let args = ["pull", mode];
        let output = self.output(path, &args)?;
        if output.status.success() {
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("CONFLICT") {
            return Err(GitError::MergeConflict("upstream".to_string()));
        }
        Err(command_error(&args, &output))
    }

    fn status(&self, path: &Path) -> Result<Vec<String>, GitError> {
        let stdout = self.run(path, &["status", "--porcelain", "--untracked-files=all"])?;
        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(porcelain_path)
            .collect())
    }

    fn has_remote(&self, path: &Path) -> Result<bool, GitError> {
        let stdout = self.run(path, &["remote"])?;
        Ok(stdout.lines().any(|line| line.trim() == REMOTE))
    }

    fn list_remote_branches(&self, path: &Path, pattern: &str) -> Result<Vec<String>, GitError> {
        self.list_branches(path, &["branch", "-r", "--list", pattern])
    }

    fn list_merged_remote_branches(
        &self,
        path: &Path,
        target: &str,
        pattern: &str,
    ) -> Result<Vec<String>, GitError> {
        self.list_branches(path, &["branch", "-r", "--merged", target, "--list", pattern])
    }

    fn delete_remote_branch(&self, path: &Path, name: &str) -> Result<(), GitError> {
        let prefix = format!("{}/", REMOTE);
        let branch = name.strip_prefix(&prefix).unwrap_or(name);
        self.run(path, &["push", REMOTE, "--delete", branch])?;
        Ok(())
    }

    fn checkout_files(&self, path: &Path, source: &str, files: &[String]) -> Result<(), GitError> {
        for file in files {
            let object = format!("{}:{}", source, file);
            if self.succeeds(path, &["cat-file", "-e", &object])? {
                self.run(path, &["checkout", source, "--", file])?;
            } else {
                self.run(path, &["rm", "-q", "--ignore-unmatch", "--", file])?;
            }
        }
        Ok(())
    }
}
