//! Lifecycle hooks and the periodic reconciliation loop

use super::manifest;
use super::sync::SyncEngine;
use super::{Role, SyncPolicy};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs the local participant's reconciliation on a timer
pub struct BackgroundSync {
    engine: Arc<SyncEngine>,
    repo: PathBuf,
    user_name: String,
    user_id: String,
    interval: Duration,
    enabled: bool,
    running: Mutex<Option<Running>>,
}

impl BackgroundSync {
    pub fn new(
        engine: Arc<SyncEngine>,
        repo: impl Into<PathBuf>,
        user_name: impl Into<String>,
        user_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            repo: repo.into(),
            user_name: user_name.into(),
            user_id: user_id.into(),
            interval,
            enabled: true,
            running: Mutex::new(None),
        }
    }

    /// Interval and on/off switch come from the repository's sync policy
    pub fn from_manifest(
        engine: Arc<SyncEngine>,
        repo: impl Into<PathBuf>,
        user_name: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let repo = repo.into();
        let policy = manifest::load(&repo)
            .map(|m| m.sync_policy)
            .unwrap_or_default();
        Self::with_policy(engine, repo, user_name, user_id, &policy)
    }

    pub fn with_policy(
        engine: Arc<SyncEngine>,
        repo: impl Into<PathBuf>,
        user_name: impl Into<String>,
        user_id: impl Into<String>,
        policy: &SyncPolicy,
    ) -> Self {
        let interval = Duration::from_secs(policy.sync_interval_minutes.max(1) * 60);
        let mut sync = Self::new(engine, repo, user_name, user_id, interval);
        sync.enabled = policy.auto_sync;
        sync
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the periodic loop; calling it again while running does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if !self.enabled {
            tracing::info!(repo = %self.repo.display(), "auto sync disabled");
            return;
        }

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = Arc::clone(&self.engine);
        let repo = self.repo.clone();
        let user_name = self.user_name.clone();
        let user_id = self.user_id.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            tracing::info!(repo = %repo.display(), interval = ?interval, "background sync started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let (repo, user_name, user_id) = (repo.clone(), user_name.clone(), user_id.clone());
                let iteration = engine
                    .run_blocking(move |engine| reconcile_once(engine, &repo, &user_name, &user_id))
                    .await;
                if let Err(e) = iteration {
                    tracing::error!(error = %e, "background sync iteration failed");
                }
            }
            tracing::info!("background sync stopped");
        });

        *running = Some(Running { cancel, handle });
    }

    /// Cancel the timer and wait for an in-flight reconciliation to finish
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { cancel, handle }) = running else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "background sync task failed");
        }
    }

    /// Collaborators pull once when a session begins
    pub async fn on_startup(&self) {
        if self.role().await != Some(Role::Collaborator) {
            return;
        }
        let (repo, user_name) = (self.repo.clone(), self.user_name.clone());
        match self.engine.run_blocking(move |e| e.pull(&repo, &user_name)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "startup pull failed"),
            Err(e) => tracing::error!(error = %e, "startup pull task failed"),
        }
    }

    /// Collaborators push once when a session ends
    pub async fn on_shutdown(&self) {
        if self.role().await != Some(Role::Collaborator) {
            return;
        }
        let (repo, user_name) = (self.repo.clone(), self.user_name.clone());
        match self.engine.run_blocking(move |e| e.push(&repo, &user_name)).await {
            Ok(result) => {
                if let Some(e) = &result.error {
                    tracing::warn!(error = %e, "shutdown push failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "shutdown push task failed"),
        }
    }

    async fn role(&self) -> Option<Role> {
        let (repo, user_id) = (self.repo.clone(), self.user_id.clone());
        tokio::task::spawn_blocking(move || member_role(&repo, &user_id))
            .await
            .ok()
            .flatten()
    }
}

fn member_role(repo: &Path, user_id: &str) -> Option<Role> {
    manifest::load(repo)?.get_member(user_id).map(|m| m.role)
}

fn reconcile_once(engine: &SyncEngine, repo: &Path, user_name: &str, user_id: &str) {
    match member_role(repo, user_id) {
        Some(Role::Collaborator) => {
            let result = engine.full_sync(repo, user_name);
            match &result.error {
                Some(e) => tracing::warn!(error = %e, "scheduled sync failed"),
                None => tracing::debug!(summary = %result.format(), "scheduled sync"),
            }
        }
        Some(Role::Master) => {
            let merge = engine.merge_all(repo);
            if let Some(e) = &merge.error {
                tracing::warn!(error = %e, "scheduled sweep failed");
            }
        }
        None => tracing::debug!(repo = %repo.display(), "not a member, skipping"),
    }
}
