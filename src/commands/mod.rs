//! CLI commands for knowsync

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::collab::background::BackgroundSync;
use crate::collab::classify::ChangeSet;
use crate::collab::git::{GitCli, VersionControl};
use crate::collab::reviews::{GithubReviews, ReviewGateway, ReviewState, ReviewStats};
use crate::collab::sync::SyncEngine;
use crate::collab::{manifest, MergeResult, Role, SyncResult, MAIN_BRANCH};
use crate::config::{load_config, save_config, Config, Identity, KnowsyncPaths};

/// Engine wired to the git CLI and the configured review service
pub fn build_engine(config: &Config) -> Arc<SyncEngine> {
    let reviews = GithubReviews::from_config(&config.review);
    Arc::new(SyncEngine::new(Arc::new(GitCli::new())).with_reviews(Arc::new(reviews)))
}

/// Identity from the config, creating or renaming it when `user_name` is given
fn ensure_identity(user_name: Option<&str>) -> Result<Identity> {
    let mut config = load_config()?;
    match (&config.identity, user_name) {
        (Some(identity), None) => return Ok(identity.clone()),
        (Some(identity), Some(name)) if identity.user_name == name => {
            return Ok(identity.clone())
        }
        (None, None) => bail!("No identity configured. Pass --user to set one"),
        _ => {}
    }

    let user_name = user_name.context("user name required")?;
    validate_user_name(user_name)?;
    let identity = Identity {
        user_name: user_name.to_string(),
        user_id: uuid::Uuid::new_v4().to_string(),
    };
    config.identity = Some(identity.clone());
    save_config(&config)?;
    println!("  Saved identity {} to {}", user_name, KnowsyncPaths::new()?.config.display());
    Ok(identity)
}

fn require_identity(config: &Config) -> Result<&Identity> {
    config
        .identity
        .as_ref()
        .context("No identity configured. Run `knowsync init` or `knowsync join` first")
}

/// User names become branch names
fn validate_user_name(user_name: &str) -> Result<()> {
    let valid = !user_name.is_empty()
        && !user_name.starts_with(['-', '.'])
        && user_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        bail!(
            "Invalid user name: {}. Use letters, digits, '-', '_' or '.'",
            user_name
        );
    }
    Ok(())
}

fn ensure_repository(repo: &Path) -> Result<()> {
    if !repo.join(".git").exists() {
        bail!(
            "{} is not a git repository. Clone the knowledge repository first",
            repo.display()
        );
    }
    Ok(())
}

async fn blocking<T, F>(engine: &Arc<SyncEngine>, f: F) -> Result<T>
where
    F: FnOnce(&SyncEngine) -> T + Send + 'static,
    T: Send + 'static,
{
    engine.run_blocking(f).await.context("Sync task failed")
}

/// Create a knowledge repository and register the caller as master
pub async fn init(repo: &Path, user_name: Option<&str>) -> Result<()> {
    let identity = ensure_identity(user_name)?;
    let config = load_config()?;
    let engine = build_engine(&config);

    println!("Initializing knowledge repository at {}...", repo.display());

    let repo_path = repo.to_path_buf();
    let members = blocking(&engine, move |engine| -> Result<usize> {
        let vcs = engine.vcs();
        vcs.init(&repo_path)?;
        let manifest = manifest::ensure_member(
            &repo_path,
            &identity.user_name,
            &identity.user_id,
            Role::Master,
        )?;
        vcs.add(&repo_path, &["."])?;
        vcs.commit(&repo_path, "knowsync: initialize knowledge repository")?;
        if vcs.has_remote(&repo_path)? {
            vcs.push_branch(&repo_path, MAIN_BRANCH, false)?;
        }
        Ok(manifest.members.len())
    })
    .await??;

    println!("  Created {}", crate::collab::MANIFEST_FILE);
    println!("  Members: {}", members);
    println!();
    println!("✓ Knowledge repository initialized");
    println!();
    println!("Next steps:");
    println!("  git remote add origin <url>   Share the repository");
    println!("  knowsync join --user <name>   Join from another clone");
    println!("  knowsync daemon               Reconcile on a timer");
    Ok(())
}

/// Register the caller as a collaborator in an existing clone
pub async fn join(repo: &Path, user_name: Option<&str>) -> Result<()> {
    ensure_repository(repo)?;
    let identity = ensure_identity(user_name)?;
    let config = load_config()?;
    let engine = build_engine(&config);

    println!("Joining {} as {}...", repo.display(), identity.user_name);

    let repo_path = repo.to_path_buf();
    let result = blocking(&engine, move |engine| -> Result<SyncResult> {
        if let Err(e) = engine.pull(&repo_path, &identity.user_name) {
            tracing::warn!(error = %e, "pull before join failed");
        }
        manifest::ensure_member(
            &repo_path,
            &identity.user_name,
            &identity.user_id,
            Role::Collaborator,
        )?;
        Ok(engine.push(&repo_path, &identity.user_name))
    })
    .await??;

    print_sync_result(&result);
    println!("✓ Joined as collaborator");
    Ok(())
}

pub async fn pull(repo: &Path) -> Result<()> {
    ensure_repository(repo)?;
    let config = load_config()?;
    let identity = require_identity(&config)?.clone();
    let engine = build_engine(&config);

    let repo_path = repo.to_path_buf();
    blocking(&engine, move |engine| engine.pull(&repo_path, &identity.user_name))
        .await?
        .context("Pull failed")?;

    println!("✓ Pulled {} into your branch", MAIN_BRANCH);
    Ok(())
}

pub async fn push(repo: &Path) -> Result<()> {
    ensure_repository(repo)?;
    let config = load_config()?;
    let identity = require_identity(&config)?.clone();
    let engine = build_engine(&config);

    let repo_path = repo.to_path_buf();
    let result = blocking(&engine, move |engine| engine.push(&repo_path, &identity.user_name)).await?;
    print_sync_result(&result);
    Ok(())
}

pub async fn sync(repo: &Path) -> Result<()> {
    ensure_repository(repo)?;
    let config = load_config()?;
    let identity = require_identity(&config)?.clone();
    let engine = build_engine(&config);

    let result = engine
        .full_sync_async(repo.to_path_buf(), identity.user_name)
        .await;
    print_sync_result(&result);
    Ok(())
}

/// Master sweep over every collaborator branch
pub async fn merge_all(repo: &Path) -> Result<()> {
    ensure_repository(repo)?;
    let config = load_config()?;
    let engine = build_engine(&config);
    warn_unless_master(repo, &config);

    let repo_path = repo.to_path_buf();
    let merge = blocking(&engine, move |engine| engine.merge_all(&repo_path)).await?;
    print_merge_result(&merge);
    Ok(())
}

pub async fn prune(repo: &Path) -> Result<()> {
    ensure_repository(repo)?;
    let config = load_config()?;
    let engine = build_engine(&config);

    let repo_path = repo.to_path_buf();
    let pruned = blocking(&engine, move |engine| engine.prune(&repo_path)).await?;
    if pruned.is_empty() {
        println!("No merged collaborator branches to prune.");
    }
    for branch in pruned {
        println!("✓ Pruned {}", branch);
    }
    Ok(())
}

pub async fn status(repo: &Path) -> Result<()> {
    ensure_repository(repo)?;
    let config = load_config()?;
    let engine = build_engine(&config);

    match &config.identity {
        Some(identity) => println!("User:    {} ({})", identity.user_name, identity.user_id),
        None => println!("User:    (not configured)"),
    }

    let repo_path = repo.to_path_buf();
    let (branch, dirty, remote) = blocking(&engine, move |engine| {
        let vcs = engine.vcs();
        (
            vcs.current_branch(&repo_path).ok(),
            vcs.status(&repo_path),
            vcs.has_remote(&repo_path).unwrap_or(false),
        )
    })
    .await?;

    println!("Branch:  {}", branch.as_deref().unwrap_or("(detached)"));
    println!("Remote:  {}", if remote { "origin" } else { "(none)" });

    match manifest::load(repo) {
        Some(manifest) => {
            let role = config
                .identity
                .as_ref()
                .and_then(|i| manifest.get_member(&i.user_id))
                .map(|m| m.role.to_string())
                .unwrap_or_else(|| "not a member".to_string());
            println!("Role:    {}", role);
            println!(
                "Policy:  auto_sync={} every {} min",
                manifest.sync_policy.auto_sync, manifest.sync_policy.sync_interval_minutes
            );
        }
        None => println!("Role:    (no manifest)"),
    }

    let dirty = dirty.context("Failed to read working tree status")?;
    let changes = ChangeSet::from_paths(&dirty);
    println!();
    if changes.is_empty() {
        println!("No local changes.");
        return Ok(());
    }
    println!("Local changes:");
    for file in &changes.allow {
        println!("  ✓ {}  (merges automatically)", file);
    }
    for file in &changes.blocking {
        println!("  ⚠ {}  (needs review)", file);
    }
    Ok(())
}

pub fn members(repo: &Path) -> Result<()> {
    let manifest = manifest::load(repo)
        .with_context(|| format!("No collaboration manifest in {}", repo.display()))?;

    println!("{:<20} {:<14} {:<38} {}", "USER", "ROLE", "ID", "JOINED");
    println!("{}", "-".repeat(90));
    for member in &manifest.members {
        println!(
            "{:<20} {:<14} {:<38} {}",
            truncate(&member.user_name, 18),
            member.role,
            member.user_id,
            member.joined_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

pub async fn reviews(repo: &Path, author: Option<String>, state: &str, mine: bool) -> Result<()> {
    let state: ReviewState = state.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let config = load_config()?;
    let author = match (author, mine) {
        (Some(author), _) => Some(author),
        (None, true) => Some(require_identity(&config)?.user_name.clone()),
        (None, false) => None,
    };

    let gateway = Arc::new(GithubReviews::from_config(&config.review));
    if !gateway.is_available() {
        println!(
            "Review service unavailable: set {} to list reviews.",
            config.review.token_env
        );
        return Ok(());
    }

    let repo_path = repo.to_path_buf();
    let reviews = tokio::task::spawn_blocking(move || {
        gateway.list_reviews(&repo_path, author.as_deref(), state)
    })
    .await
    .context("Review task failed")?;

    if reviews.is_empty() {
        println!("No {} reviews.", state);
        return Ok(());
    }
    for review in &reviews {
        print!("{}", review.format());
    }
    println!();
    println!("{}", ReviewStats::from_reviews(&reviews).format());
    Ok(())
}

/// Pull on start, reconcile on a timer, push on Ctrl-C
pub async fn daemon(repo: PathBuf) -> Result<()> {
    ensure_repository(&repo)?;
    let config = load_config()?;
    let identity = require_identity(&config)?.clone();
    let engine = build_engine(&config);

    let background =
        BackgroundSync::from_manifest(engine, repo.clone(), identity.user_name, identity.user_id);

    background.on_startup().await;
    background.start();
    println!(
        "Syncing {} every {} min. Press Ctrl-C to stop.",
        repo.display(),
        background.interval().as_secs() / 60
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("Stopping...");
    background.stop().await;
    background.on_shutdown().await;
    println!("✓ Stopped");
    Ok(())
}

fn warn_unless_master(repo: &Path, config: &Config) {
    let role = config
        .identity
        .as_ref()
        .and_then(|i| manifest::load(repo)?.get_member(&i.user_id).map(|m| m.role));
    if role != Some(Role::Master) {
        println!("⚠ You are not listed as master of this repository");
    }
}

fn print_sync_result(result: &SyncResult) {
    if result.is_noop() && result.notice.is_none() {
        println!("Nothing to sync.");
        return;
    }
    if result.additive_merged > 0 {
        println!("✓ Merged {} file(s) into {}", result.additive_merged, MAIN_BRANCH);
    }
    if !result.shared_state_files.is_empty() {
        println!("⚠ {} file(s) need review:", result.shared_state_files.len());
        for file in &result.shared_state_files {
            println!("    {}", file);
        }
    }
    if let Some(url) = &result.review_url {
        println!("  Review: {}", url);
    }
    if let Some(notice) = &result.notice {
        println!("  {}", notice);
    }
    if let Some(error) = &result.error {
        println!("✗ {}", error);
    }
}

fn print_merge_result(merge: &MergeResult) {
    if merge.participants.is_empty() {
        println!("No collaborator branches found.");
    }
    for participant in &merge.participants {
        println!("{}: {}", participant.user_name, participant.result.format());
    }
    for branch in &merge.pruned {
        println!("✓ Pruned {}", branch);
    }
    println!();
    println!(
        "Merged {} file(s), opened {} review(s), pruned {} branch(es)",
        merge.total_additive_merged(),
        merge.total_reviews_opened(),
        merge.pruned.len()
    );
    if let Some(error) = &merge.error {
        println!("✗ {}", error);
    }
}

/// Truncate string to max length
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_user_name() {
        assert!(validate_user_name("alice").is_ok());
        assert!(validate_user_name("bob.smith_2").is_ok());
        assert!(validate_user_name("").is_err());
        assert!(validate_user_name("-rf").is_err());
        assert!(validate_user_name("a b").is_err());
        assert!(validate_user_name("a/b").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-user-name", 10), "a-very-...");
    }
}
