//! In-memory stand-ins for git and the review service

use super::git::{GitError, VersionControl};
use super::reviews::{ReviewGateway, ReviewState, ReviewSummary};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct FakeState {
    pub current: String,
    pub branches: BTreeSet<String>,
    pub dirty: Vec<String>,
    /// Changed files per head ref
    pub diffs: HashMap<String, Vec<String>>,
    pub diff_errors: HashSet<String>,
    /// Refs that conflict when merged
    pub conflicts: HashSet<String>,
    pub remote: bool,
    pub remote_branches: Vec<String>,
    pub merged_remote: Vec<String>,
    pub fail_push: bool,
    pub fail_fetch: bool,
    pub fail_delete: HashSet<String>,
    pub merging: bool,
    /// Index holds something to commit
    pub staged: bool,
    pub commits: usize,
    pub deleted: Vec<String>,
    /// Files that reached `main`
    pub main_files: Vec<String>,
    /// Files on `origin/main` that local `main` has not merged yet; they
    /// leak into any diff taken from a merge-base with stale `main`
    pub main_behind: Vec<String>,
    pub calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeVcs {
    state: Mutex<FakeState>,
}

impl FakeVcs {
    /// On `main`, with `origin/main` fetched
    pub fn with_remote() -> Arc<Self> {
        let mut state = FakeState {
            current: "main".to_string(),
            remote: true,
            ..FakeState::default()
        };
        state.branches.insert("main".to_string());
        state.branches.insert("origin/main".to_string());
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn edit(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn state(&self) -> FakeState {
        self.state.lock().unwrap().clone()
    }

    fn with<T>(&self, call: String, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        f(&mut state)
    }
}

fn failure(command: &str) -> GitError {
    GitError::Command {
        command: command.to_string(),
        stderr: "simulated failure".to_string(),
    }
}

impl VersionControl for FakeVcs {
    fn init(&self, _path: &Path) -> Result<(), GitError> {
        self.with("init".to_string(), |_| Ok(()))
    }

    fn add(&self, _path: &Path, globs: &[&str]) -> Result<(), GitError> {
        self.with(format!("add {}", globs.join(" ")), |s| {
            s.staged |= !s.dirty.is_empty();
            Ok(())
        })
    }

    fn commit(&self, _path: &Path, _message: &str) -> Result<Option<String>, GitError> {
        self.with("commit".to_string(), |s| {
            if !s.staged {
                return Ok(None);
            }
            s.staged = false;
            s.commits += 1;
            s.dirty.clear();
            Ok(Some(format!("c{}", s.commits)))
        })
    }

    fn checkout(&self, _path: &Path, branch: &str, create: bool) -> Result<(), GitError> {
        self.with(format!("checkout {}", branch), |s| {
            if s.merging {
                return Err(failure("checkout"));
            }
            if create {
                s.branches.insert(branch.to_string());
            } else if !s.branches.contains(branch) {
                return Err(failure("checkout"));
            }
            s.current = branch.to_string();
            Ok(())
        })
    }

    fn current_branch(&self, _path: &Path) -> Result<String, GitError> {
        Ok(self.state.lock().unwrap().current.clone())
    }

    fn branch_exists(&self, _path: &Path, name: &str) -> Result<bool, GitError> {
        Ok(self.state.lock().unwrap().branches.contains(name))
    }

    fn merge(&self, _path: &Path, branch: &str) -> Result<(), GitError> {
        self.with(format!("merge {}", branch), |s| {
            if s.conflicts.contains(branch) {
                s.merging = true;
                return Err(GitError::MergeConflict(branch.to_string()));
            }
            if s.current == "main" {
                if branch == "origin/main" {
                    s.main_behind.clear();
                }
                let files = s.diffs.get(branch).cloned().unwrap_or_default();
                s.main_files.extend(files);
            }
            Ok(())
        })
    }

    fn merge_abort(&self, _path: &Path) -> Result<(), GitError> {
        self.with("merge --abort".to_string(), |s| {
            s.merging = false;
            Ok(())
        })
    }

    fn merge_base(&self, _path: &Path, a: &str, b: &str) -> Result<String, GitError> {
        self.with(format!("merge-base {} {}", a, b), |_| Ok(format!("{}|{}", a, b)))
    }

    fn diff_names(&self, _path: &Path, base: &str, head: &str) -> Result<Vec<String>, GitError> {
        let state = self.state.lock().unwrap();
        if state.diff_errors.contains(head) {
            return Err(failure("diff"));
        }
        let mut files = Vec::new();
        if base.starts_with("main|") {
            files.extend(state.main_behind.iter().cloned());
        }
        files.extend(state.diffs.get(head).cloned().unwrap_or_default());
        Ok(files)
    }

    fn fetch(&self, _path: &Path) -> Result<(), GitError> {
        self.with("fetch".to_string(), |s| {
            if s.fail_fetch {
                Err(failure("fetch"))
            } else {
                Ok(())
            }
        })
    }

    fn push(&self, _path: &Path) -> Result<(), GitError> {
        let current = self.state.lock().unwrap().current.clone();
        self.with(format!("push {}", current), |s| {
            if s.fail_push {
                Err(failure("push"))
            } else {
                Ok(())
            }
        })
    }

    fn push_branch(&self, _path: &Path, branch: &str, force_with_lease: bool) -> Result<(), GitError> {
        let mode = if force_with_lease { "lease" } else { "plain" };
        self.with(format!("push-branch {} {}", branch, mode), |s| {
            if s.fail_push {
                Err(failure("push"))
            } else {
                Ok(())
            }
        })
    }

    fn pull(&self, _path: &Path, _rebase: bool) -> Result<(), GitError> {
        self.with("pull".to_string(), |_| Ok(()))
    }

    fn status(&self, _path: &Path) -> Result<Vec<String>, GitError> {
        Ok(self.state.lock().unwrap().dirty.clone())
    }

    fn has_remote(&self, _path: &Path) -> Result<bool, GitError> {
        Ok(self.state.lock().unwrap().remote)
    }

    fn list_remote_branches(&self, _path: &Path, _pattern: &str) -> Result<Vec<String>, GitError> {
        Ok(self.state.lock().unwrap().remote_branches.clone())
    }

    fn list_merged_remote_branches(
        &self,
        _path: &Path,
        target: &str,
        _pattern: &str,
    ) -> Result<Vec<String>, GitError> {
        self.with(format!("merged {}", target), |s| Ok(s.merged_remote.clone()))
    }

    fn delete_remote_branch(&self, _path: &Path, name: &str) -> Result<(), GitError> {
        self.with(format!("delete {}", name), |s| {
            if s.fail_delete.contains(name) {
                return Err(failure("push --delete"));
            }
            s.deleted.push(name.to_string());
            Ok(())
        })
    }

    fn checkout_files(&self, _path: &Path, source: &str, files: &[String]) -> Result<(), GitError> {
        self.with(format!("checkout-files {}", source), |s| {
            if s.current == "main" {
                for file in files {
                    if !s.main_files.contains(file) {
                        s.main_files.push(file.clone());
                        s.staged = true;
                    }
                }
            }
            Ok(())
        })
    }
}

/// Records every review request
#[derive(Debug, Default)]
pub struct FakeReviews {
    available: bool,
    opened: Mutex<Vec<(String, String)>>,
}

impl FakeReviews {
    pub fn available() -> Arc<Self> {
        Arc::new(Self {
            available: true,
            ..Self::default()
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(branch, body)` of every review opened
    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().unwrap().clone()
    }
}

impl ReviewGateway for FakeReviews {
    fn is_available(&self) -> bool {
        self.available
    }

    fn open_review(&self, _repo: &Path, branch: &str, _title: &str, body: &str) -> Option<String> {
        if !self.available {
            return None;
        }
        let mut opened = self.opened.lock().unwrap();
        opened.push((branch.to_string(), body.to_string()));
        Some(format!("https://reviews.test/{}", opened.len()))
    }

    fn list_reviews(&self, _repo: &Path, _author: Option<&str>, _state: ReviewState) -> Vec<ReviewSummary> {
        Vec::new()
    }
}
