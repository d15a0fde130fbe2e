//! Collaboration manifest stored as `.collab.yaml` in the knowledge repository

use super::{Manifest, Member, Role, SyncPolicy, MANIFEST_FILE};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

/// Current manifest format
pub const MANIFEST_VERSION: u32 = 1;

pub fn manifest_path(repo: &Path) -> PathBuf {
    repo.join(MANIFEST_FILE)
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
            members: Vec::new(),
            sync_policy: SyncPolicy::default(),
        }
    }

    pub fn get_member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Add a member; returns the manifest unchanged if `user_id` is already listed
    pub fn add_member(mut self, user_name: &str, user_id: &str, role: Role) -> Self {
        if self.get_member(user_id).is_some() {
            return self;
        }
        self.members.push(Member {
            user_name: user_name.to_string(),
            user_id: user_id.to_string(),
            role,
            joined_at: Utc::now(),
        });
        self
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

/// Load the manifest; missing, empty or unparsable files count as absent
pub fn load(repo: &Path) -> Option<Manifest> {
    let path = manifest_path(repo);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to read manifest");
            }
            return None;
        }
    };

    if content.trim().is_empty() {
        return None;
    }

    match serde_yaml::from_str(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt manifest");
            None
        }
    }
}

pub fn save(repo: &Path, manifest: &Manifest) -> Result<()> {
    let content = serde_yaml::to_string(manifest).context("Failed to serialize manifest")?;
    fs::write(manifest_path(repo), content).context("Failed to write .collab.yaml")?;
    Ok(())
}

/// Load-or-create the manifest and make sure the member is listed
pub fn ensure_member(repo: &Path, user_name: &str, user_id: &str, role: Role) -> Result<Manifest> {
    let manifest = load(repo)
        .unwrap_or_default()
        .add_member(user_name, user_id, role);
    save(repo, &manifest)?;
    Ok(manifest)
}
