//! Collaboration features for knowsync
//!
//! Provides file classification, the collaboration manifest, git-based
//! reconciliation of participant branches and the background sync loop

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod background;
pub mod classify;
pub mod git;
pub mod locks;
pub mod manifest;
pub mod reviews;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

/// Authoritative branch every participant converges on
pub const MAIN_BRANCH: &str = "main";

/// Remote all participants push to and fetch from
pub const REMOTE: &str = "origin";

/// Prefix of per-participant branches
pub const BRANCH_PREFIX: &str = "collaborator/";

/// Collaboration manifest, tracked at the repository root
pub const MANIFEST_FILE: &str = ".collab.yaml";

/// Branch name for a participant
pub fn collaborator_branch(user_name: &str) -> String {
    format!("{}{}", BRANCH_PREFIX, user_name)
}

/// Remote-tracking name for a local branch (`origin/<branch>`)
pub fn remote_ref(branch: &str) -> String {
    format!("{}/{}", REMOTE, branch)
}

/// Participant role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reconciles every collaborator branch in batch
    Master,
    /// Syncs its own branch, gets startup/shutdown hooks
    Collaborator,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Collaborator => write!(f, "collaborator"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "collaborator" => Ok(Role::Collaborator),
            _ => Err(format!("Invalid role: {}. Use: master, collaborator", s)),
        }
    }
}

/// A participant listed in the manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub user_name: String,
    pub user_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

/// How often participants reconcile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncPolicy {
    pub auto_sync: bool,
    pub sync_interval_minutes: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            auto_sync: true,
            sync_interval_minutes: 60,
        }
    }
}

/// Roster and sync policy of one knowledge repository
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default, rename = "sync")]
    pub sync_policy: SyncPolicy,
}

/// Outcome of one push, or of one branch within a master sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Files that reached `main` without review
    pub additive_merged: usize,
    /// Files left pending review
    pub shared_state_files: Vec<String>,
    pub review_opened: bool,
    pub review_url: Option<String>,
    /// Non-fatal failure, retried on the next sync
    pub error: Option<String>,
    /// Operator-facing message that is not an error
    pub notice: Option<String>,
}

impl SyncResult {
    /// Failed before anything was decided
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.additive_merged == 0 && self.shared_state_files.is_empty() && self.error.is_none()
    }

    /// One-line summary for display
    pub fn format(&self) -> String {
        let mut output = format!(
            "merged: {} | pending review: {}",
            self.additive_merged,
            self.shared_state_files.len()
        );
        if let Some(url) = &self.review_url {
            output.push_str(&format!(" | review: {}", url));
        }
        if let Some(notice) = &self.notice {
            output.push_str(&format!(" | {}", notice));
        }
        if let Some(error) = &self.error {
            output.push_str(&format!(" | error: {}", error));
        }
        output
    }
}

/// Per-participant entry of a master sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantResult {
    pub user_name: String,
    /// Remote-tracking branch that was processed
    pub branch: String,
    pub result: SyncResult,
}

/// Aggregate outcome of a master sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub participants: Vec<ParticipantResult>,
    /// Remote branches deleted because `main` already contains them
    pub pruned: Vec<String>,
    /// Failure of the final push of `main`
    pub error: Option<String>,
}

impl MergeResult {
    pub fn total_additive_merged(&self) -> usize {
        self.participants
            .iter()
            .map(|p| p.result.additive_merged)
            .sum()
    }

    pub fn total_reviews_opened(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.result.review_opened)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_and_display() {
        assert_eq!("Master".parse::<Role>(), Ok(Role::Master));
        assert_eq!("collaborator".parse::<Role>(), Ok(Role::Collaborator));
        assert!("owner".parse::<Role>().is_err());
        assert_eq!(Role::Collaborator.to_string(), "collaborator");
    }

    #[test]
    fn test_branch_names() {
        assert_eq!(collaborator_branch("alice"), "collaborator/alice");
        assert_eq!(remote_ref("collaborator/alice"), "origin/collaborator/alice");
    }

    #[test]
    fn test_merge_result_totals() {
        let entry = |merged, opened| ParticipantResult {
            user_name: "u".to_string(),
            branch: "origin/collaborator/u".to_string(),
            result: SyncResult {
                additive_merged: merged,
                review_opened: opened,
                ..SyncResult::default()
            },
        };
        let result = MergeResult {
            participants: vec![entry(2, false), entry(0, true), entry(3, true)],
            ..MergeResult::default()
        };

        assert_eq!(result.total_additive_merged(), 5);
        assert_eq!(result.total_reviews_opened(), 2);
    }
}
