//! Git-based reconciliation of participant branches with `main`
//!
//! Collaborators pull `main` into their own branch and push their changes
//! back: additive files are merged automatically, shared-state files go to
//! review. A master participant can sweep every collaborator branch at once.

use super::classify::ChangeSet;
use super::git::{GitError, VersionControl};
use super::locks::RepoLocks;
use super::reviews::{review_body, ReviewGateway};
use super::{
    collaborator_branch, remote_ref, MergeResult, ParticipantResult, SyncResult, BRANCH_PREFIX,
    MAIN_BRANCH, REMOTE,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Checks out `restore` again when dropped, whatever the operation did in between
struct BranchGuard<'a> {
    vcs: &'a dyn VersionControl,
    repo: &'a Path,
    restore: String,
}

impl<'a> BranchGuard<'a> {
    fn new(vcs: &'a dyn VersionControl, repo: &'a Path, restore: impl Into<String>) -> Self {
        Self {
            vcs,
            repo,
            restore: restore.into(),
        }
    }
}

impl Drop for BranchGuard<'_> {
    fn drop(&mut self) {
        match self.vcs.current_branch(self.repo) {
            Ok(current) if current == self.restore => {}
            _ => {
                if let Err(e) = self.vcs.checkout(self.repo, &self.restore, false) {
                    tracing::error!(
                        repo = %self.repo.display(),
                        branch = %self.restore,
                        error = %e,
                        "failed to restore branch"
                    );
                }
            }
        }
    }
}

/// Where the changes being reconciled come from
struct Source<'a> {
    user_name: &'a str,
    /// Reference merged into `main` (`collaborator/x` or `origin/collaborator/x`)
    reference: &'a str,
    /// Branch name as seen by the review service
    branch: &'a str,
    /// Push the branch before requesting review
    push_branch: bool,
    /// Push `main` right after merging
    push_main: bool,
    /// Merge `origin/main` into `main` before merging into it
    refresh_main: bool,
}

/// Reconciliation engine shared by the CLI and the background loop
pub struct SyncEngine {
    vcs: Arc<dyn VersionControl>,
    reviews: Option<Arc<dyn ReviewGateway>>,
    locks: RepoLocks,
}

impl SyncEngine {
    pub fn new(vcs: Arc<dyn VersionControl>) -> Self {
        Self {
            vcs,
            reviews: None,
            locks: RepoLocks::new(),
        }
    }

    pub fn with_reviews(mut self, reviews: Arc<dyn ReviewGateway>) -> Self {
        self.reviews = Some(reviews);
        self
    }

    pub fn vcs(&self) -> &dyn VersionControl {
        self.vcs.as_ref()
    }

    /// Run a blocking engine call on tokio's blocking pool
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, tokio::task::JoinError>
    where
        F: FnOnce(&SyncEngine) -> T + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&engine)).await
    }

    /// `full_sync` offloaded from an async caller
    pub async fn full_sync_async(self: &Arc<Self>, repo: PathBuf, user_name: String) -> SyncResult {
        self.run_blocking(move |engine| engine.full_sync(&repo, &user_name))
            .await
            .unwrap_or_else(|e| SyncResult::failed(format!("sync task failed: {}", e)))
    }

    /// Bring others' reconciled work from `main` into the caller's branch.
    ///
    /// Conflicts are aborted and returned; nothing is resolved automatically.
    pub fn pull(&self, repo: &Path, user_name: &str) -> Result<(), GitError> {
        self.locks.with_lock(repo, || self.pull_unlocked(repo, user_name))
    }

    /// Commit local changes and reconcile them with `main`
    pub fn push(&self, repo: &Path, user_name: &str) -> SyncResult {
        self.locks.with_lock(repo, || self.push_unlocked(repo, user_name))
    }

    /// Pull, then push even if the pull failed
    pub fn full_sync(&self, repo: &Path, user_name: &str) -> SyncResult {
        self.locks.with_lock(repo, || {
            let pulled = self.pull_unlocked(repo, user_name);
            if let Err(e) = &pulled {
                tracing::warn!(user = user_name, error = %e, "pull failed, pushing anyway");
            }

            let mut result = self.push_unlocked(repo, user_name);
            if let Err(e) = pulled {
                result.error.get_or_insert(format!("pull failed: {}", e));
            }
            result
        })
    }

    /// Reconcile every remote collaborator branch into `main` in one pass
    pub fn merge_all(&self, repo: &Path) -> MergeResult {
        self.locks.with_lock(repo, || self.merge_all_unlocked(repo))
    }

    /// Delete remote collaborator branches already contained in `main`
    pub fn prune(&self, repo: &Path) -> Vec<String> {
        self.locks.with_lock(repo, || {
            let remote = match self.vcs.has_remote(repo) {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot inspect remotes, skipping prune");
                    return Vec::new();
                }
            };
            if remote {
                if let Err(e) = self.vcs.fetch(repo) {
                    tracing::warn!(error = %e, "fetch before prune failed");
                }
            }
            self.prune_unlocked(repo, remote)
        })
    }

    fn pull_unlocked(&self, repo: &Path, user_name: &str) -> Result<(), GitError> {
        let span = tracing::info_span!("pull", repo = %repo.display(), user = user_name);
        let _enter = span.enter();

        let branch = collaborator_branch(user_name);
        let remote = self.vcs.has_remote(repo)?;
        if remote {
            self.vcs.fetch(repo)?;
        }
        self.enter_branch(repo, &branch)?;

        let upstream = if remote {
            remote_ref(MAIN_BRANCH)
        } else {
            MAIN_BRANCH.to_string()
        };
        if !self.vcs.branch_exists(repo, &upstream)? {
            tracing::debug!(upstream = %upstream, "nothing to pull yet");
            return Ok(());
        }

        if let Err(e) = self.vcs.merge(repo, &upstream) {
            if e.is_conflict() {
                self.abort_merge(repo);
            }
            return Err(e);
        }
        tracing::info!(branch = %branch, upstream = %upstream, "pulled");
        Ok(())
    }

    fn push_unlocked(&self, repo: &Path, user_name: &str) -> SyncResult {
        let span = tracing::info_span!("push", repo = %repo.display(), user = user_name);
        let _enter = span.enter();

        let branch = collaborator_branch(user_name);
        if let Err(e) = self.enter_branch(repo, &branch) {
            tracing::warn!(error = %e, "cannot switch to collaborator branch");
            return SyncResult::failed(e);
        }
        let _restore = BranchGuard::new(self.vcs.as_ref(), repo, branch.clone());

        let result = match self.commit_and_reconcile(repo, user_name, &branch) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "push failed");
                SyncResult::failed(e)
            }
        };
        if !result.is_noop() {
            tracing::info!(
                merged = result.additive_merged,
                pending = result.shared_state_files.len(),
                review = result.review_opened,
                "pushed"
            );
        }
        result
    }

    fn commit_and_reconcile(
        &self,
        repo: &Path,
        user_name: &str,
        branch: &str,
    ) -> Result<SyncResult, GitError> {
        if self.vcs.status(repo)?.is_empty() {
            tracing::debug!("no local changes");
            return Ok(SyncResult::default());
        }

        self.vcs.add(repo, &["."])?;
        let message = format!("sync({}): {}", user_name, Utc::now().to_rfc3339());
        self.vcs.commit(repo, &message)?;

        let remote = self.vcs.has_remote(repo)?;
        // Local main may lag behind what pull already merged into the branch
        let base = self.authoritative_ref(repo, remote)?;
        let changes = self.branch_changes(repo, &base, branch)?;
        let source = Source {
            user_name,
            reference: branch,
            branch,
            push_branch: remote,
            push_main: remote,
            refresh_main: remote,
        };
        Ok(self.reconcile(repo, &source, changes))
    }

    fn merge_all_unlocked(&self, repo: &Path) -> MergeResult {
        let span = tracing::info_span!("merge_all", repo = %repo.display());
        let _enter = span.enter();

        let mut merge = MergeResult::default();
        let start = match self.vcs.current_branch(repo) {
            Ok(branch) => branch,
            Err(e) => {
                merge.error = Some(e.to_string());
                return merge;
            }
        };
        let _restore = BranchGuard::new(self.vcs.as_ref(), repo, start);

        let remote = match self.prepare_sweep(repo) {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(error = %e, "cannot prepare main for sweep");
                merge.error = Some(e.to_string());
                return merge;
            }
        };

        let pattern = format!("{}/{}*", REMOTE, BRANCH_PREFIX);
        let branches = match self.vcs.list_remote_branches(repo, &pattern) {
            Ok(branches) => branches,
            Err(e) => {
                merge.error = Some(e.to_string());
                return merge;
            }
        };

        let prefix = remote_ref(BRANCH_PREFIX);
        for branch in branches {
            let user_name = branch.strip_prefix(&prefix).unwrap_or(&branch).to_string();
            let result = self.merge_participant(repo, &branch, &user_name);
            if let Some(e) = &result.error {
                tracing::warn!(branch = %branch, error = %e, "branch not reconciled");
            }
            merge.participants.push(ParticipantResult {
                user_name,
                branch,
                result,
            });
        }

        merge.pruned = self.prune_unlocked(repo, remote);

        if remote && merge.total_additive_merged() > 0 {
            let pushed = self
                .ensure_on(repo, MAIN_BRANCH)
                .and_then(|()| self.vcs.push(repo));
            if let Err(e) = pushed {
                tracing::warn!(error = %e, "push of main failed");
                merge.error = Some(format!("push of {} failed: {}", MAIN_BRANCH, e));
            }
        }

        tracing::info!(
            branches = merge.participants.len(),
            merged = merge.total_additive_merged(),
            reviews = merge.total_reviews_opened(),
            pruned = merge.pruned.len(),
            "sweep finished"
        );
        merge
    }

    fn prepare_sweep(&self, repo: &Path) -> Result<bool, GitError> {
        self.ensure_on(repo, MAIN_BRANCH)?;
        let remote = self.vcs.has_remote(repo)?;
        if remote {
            self.vcs.fetch(repo)?;
            self.refresh_main(repo)?;
        }
        Ok(remote)
    }

    fn merge_participant(&self, repo: &Path, remote_branch: &str, user_name: &str) -> SyncResult {
        let prefix = format!("{}/", REMOTE);
        let branch = remote_branch.strip_prefix(&prefix).unwrap_or(remote_branch);
        let source = Source {
            user_name,
            reference: remote_branch,
            branch,
            push_branch: false,
            push_main: false,
            refresh_main: false,
        };

        let result = match self.branch_changes(repo, MAIN_BRANCH, remote_branch) {
            Ok(changes) => self.reconcile(repo, &source, changes),
            Err(e) => SyncResult::failed(e),
        };

        // Keep the sweep on main whatever happened to this branch
        if let Err(e) = self.ensure_on(repo, MAIN_BRANCH) {
            tracing::error!(error = %e, "cannot return to main during sweep");
        }
        result
    }

    fn prune_unlocked(&self, repo: &Path, remote: bool) -> Vec<String> {
        // Only what the authoritative branch provably contains
        let target = if remote {
            remote_ref(MAIN_BRANCH)
        } else {
            MAIN_BRANCH.to_string()
        };
        let pattern = format!("{}/{}*", REMOTE, BRANCH_PREFIX);

        let merged = match self.vcs.list_merged_remote_branches(repo, &target, &pattern) {
            Ok(merged) => merged,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list merged branches");
                return Vec::new();
            }
        };

        let mut pruned = Vec::new();
        for branch in merged {
            match self.vcs.delete_remote_branch(repo, &branch) {
                Ok(()) => {
                    tracing::info!(branch = %branch, "pruned merged branch");
                    pruned.push(branch);
                }
                Err(e) => tracing::warn!(branch = %branch, error = %e, "failed to prune branch"),
            }
        }
        pruned
    }

    /// Case A/B/C decision for one set of changes
    fn reconcile(&self, repo: &Path, source: &Source<'_>, changes: ChangeSet) -> SyncResult {
        let mut result = SyncResult::default();
        if changes.is_empty() {
            return result;
        }

        if changes.blocking.is_empty() {
            // Fast path: merge the whole branch, keeping its history
            match self.merge_into_main(repo, source) {
                Ok(()) => {
                    result.additive_merged = changes.allow.len();
                    if source.push_main {
                        self.push_main(repo, &mut result);
                    }
                    return result;
                }
                Err(e) if e.is_conflict() => {
                    tracing::warn!(branch = source.branch, "merge conflicted, requesting review");
                    let everything = changes.all();
                    return self.request_review(repo, source, &[], &everything, result);
                }
                Err(e) => {
                    result.error = Some(e.to_string());
                    return result;
                }
            }
        }

        if !changes.allow.is_empty() {
            // Mixed: merge the allow-listed subset, leave the rest pending
            match self.merge_files_into_main(repo, source, &changes.allow) {
                Ok(true) => {
                    result.additive_merged = changes.allow.len();
                    if source.push_main {
                        self.push_main(repo, &mut result);
                    }
                }
                Ok(false) => {
                    tracing::debug!(branch = source.branch, "additive files already on main");
                }
                Err(e) => {
                    tracing::warn!(branch = source.branch, error = %e, "partial merge failed");
                    result.error = Some(e.to_string());
                }
            }
        }

        self.request_review(repo, source, &changes.allow, &changes.blocking, result)
    }

    fn request_review(
        &self,
        repo: &Path,
        source: &Source<'_>,
        additive: &[String],
        blocking: &[String],
        mut result: SyncResult,
    ) -> SyncResult {
        result.shared_state_files = blocking.to_vec();

        if source.push_branch {
            if let Err(e) = self.vcs.push_branch(repo, source.branch, true) {
                tracing::warn!(branch = source.branch, error = %e, "push of branch failed");
                result
                    .error
                    .get_or_insert(format!("push of {} failed: {}", source.branch, e));
                return result;
            }
        }

        let gateway = self.reviews.as_deref().filter(|g| g.is_available());
        let Some(gateway) = gateway else {
            result.notice = Some(format!(
                "{} is waiting for review; review service unavailable, open a review manually",
                source.branch
            ));
            return result;
        };

        let title = format!("Knowledge sync: {}", source.user_name);
        let body = review_body(source.user_name, additive, blocking);
        match gateway.open_review(repo, source.branch, &title, &body) {
            Some(url) => {
                tracing::info!(branch = source.branch, url = %url, "review opened");
                result.review_opened = true;
                result.review_url = Some(url);
            }
            None => {
                result.notice = Some(format!(
                    "{} is waiting for review; a review is already open or could not be created",
                    source.branch
                ));
            }
        }
        result
    }

    fn merge_into_main(&self, repo: &Path, source: &Source<'_>) -> Result<(), GitError> {
        self.checkout_main(repo, source.refresh_main)?;
        match self.vcs.merge(repo, source.reference) {
            Err(e) if e.is_conflict() => {
                self.abort_merge(repo);
                Err(e)
            }
            other => other,
        }
    }

    /// `false` when `main` already had every file and nothing was committed
    fn merge_files_into_main(
        &self,
        repo: &Path,
        source: &Source<'_>,
        files: &[String],
    ) -> Result<bool, GitError> {
        self.checkout_main(repo, source.refresh_main)?;
        self.vcs.checkout_files(repo, source.reference, files)?;
        let message = format!(
            "sync({}): merge {} file(s) from {}",
            source.user_name,
            files.len(),
            source.branch
        );
        Ok(self.vcs.commit(repo, &message)?.is_some())
    }

    fn push_main(&self, repo: &Path, result: &mut SyncResult) {
        if let Err(e) = self.vcs.push(repo) {
            tracing::warn!(error = %e, "push of main failed");
            result
                .error
                .get_or_insert(format!("push of {} failed: {}", MAIN_BRANCH, e));
        }
    }

    fn checkout_main(&self, repo: &Path, refresh: bool) -> Result<(), GitError> {
        self.ensure_on(repo, MAIN_BRANCH)?;
        if refresh {
            self.refresh_main(repo)?;
        }
        Ok(())
    }

    /// Fold `origin/main` into local `main` so the next push fast-forwards
    fn refresh_main(&self, repo: &Path) -> Result<(), GitError> {
        let upstream = remote_ref(MAIN_BRANCH);
        if !self.vcs.branch_exists(repo, &upstream)? {
            return Ok(());
        }
        match self.vcs.merge(repo, &upstream) {
            Err(e) if e.is_conflict() => {
                self.abort_merge(repo);
                Err(GitError::Command {
                    command: "merge".to_string(),
                    stderr: format!("local {} has diverged from {}", MAIN_BRANCH, upstream),
                })
            }
            other => other,
        }
    }

    /// `origin/main` once fetched, local `main` otherwise
    fn authoritative_ref(&self, repo: &Path, remote: bool) -> Result<String, GitError> {
        let upstream = remote_ref(MAIN_BRANCH);
        if remote && self.vcs.branch_exists(repo, &upstream)? {
            Ok(upstream)
        } else {
            Ok(MAIN_BRANCH.to_string())
        }
    }

    /// Files changed on `head` since it forked from `base`
    fn branch_changes(&self, repo: &Path, base: &str, head: &str) -> Result<ChangeSet, GitError> {
        let base = self.vcs.merge_base(repo, base, head)?;
        let files = self.vcs.diff_names(repo, &base, head)?;
        Ok(ChangeSet::from_paths(&files))
    }

    /// Switch to `branch`, creating it from the current HEAD if missing
    fn enter_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        if self.vcs.branch_exists(repo, branch)? {
            self.ensure_on(repo, branch)
        } else {
            tracing::info!(branch, "creating collaborator branch");
            self.vcs.checkout(repo, branch, true)
        }
    }

    fn ensure_on(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        if self.vcs.current_branch(repo)? != branch {
            self.vcs.checkout(repo, branch, false)?;
        }
        Ok(())
    }

    fn abort_merge(&self, repo: &Path) {
        if let Err(e) = self.vcs.merge_abort(repo) {
            tracing::error!(repo = %repo.display(), error = %e, "merge --abort failed");
        }
    }
}
