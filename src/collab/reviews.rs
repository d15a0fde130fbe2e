//! Review requests for shared-state changes
//!
//! The engine works without a review service; every gateway call degrades
//! to `None` or an empty list instead of failing.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;

use super::{MAIN_BRANCH, REMOTE};
use crate::config::ReviewConfig;

/// Which reviews to list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewState {
    #[default]
    Open,
    Closed,
    All,
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewState::Open => write!(f, "open"),
            ReviewState::Closed => write!(f, "closed"),
            ReviewState::All => write!(f, "all"),
        }
    }
}

impl FromStr for ReviewState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(ReviewState::Open),
            "closed" => Ok(ReviewState::Closed),
            "all" => Ok(ReviewState::All),
            _ => Err(format!("Invalid review state: {}. Use: open, closed, all", s)),
        }
    }
}

/// A reviewable change set as reported by the review service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewSummary {
    pub number: u64,
    pub title: String,
    pub url: String,
    pub branch: String,
    pub author: String,
    pub state: String,
}

impl ReviewSummary {
    /// Format review for display
    pub fn format(&self) -> String {
        let status_emoji = if self.state == "open" { "⏳" } else { "✅" };
        let mut output = format!("{} #{} {} ({})\n", status_emoji, self.number, self.title, self.state);
        output.push_str(&format!("  Branch: {}\n", self.branch));
        output.push_str(&format!("  Author: {}\n", self.author));
        output.push_str(&format!("  URL:    {}\n", self.url));
        output
    }
}

/// External review service (pull requests)
pub trait ReviewGateway: Send + Sync {
    /// Probed before use; an unavailable gateway is skipped
    fn is_available(&self) -> bool;

    /// Open a review for `branch` against `main`.
    ///
    /// `None` when the service is unavailable, the request failed, or a
    /// review for the branch is already open.
    fn open_review(&self, repo: &Path, branch: &str, title: &str, body: &str) -> Option<String>;

    /// Never fails; an unavailable service yields an empty list
    fn list_reviews(&self, repo: &Path, author: Option<&str>, state: ReviewState) -> Vec<ReviewSummary>;
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    title: String,
    html_url: String,
    state: String,
    user: Option<PullRequestUser>,
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    #[serde(rename = "ref")]
    branch: String,
}

impl From<PullRequest> for ReviewSummary {
    fn from(pr: PullRequest) -> Self {
        Self {
            number: pr.number,
            title: pr.title,
            url: pr.html_url,
            branch: pr.head.branch,
            author: pr.user.map(|u| u.login).unwrap_or_default(),
            state: pr.state,
        }
    }
}

static GITHUB_REMOTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"github\.com[:/]([^/\s]+)/([^/\s]+?)(?:\.git)?/?$").expect("static regex")
});

/// `owner/name` from a GitHub remote URL (ssh or https)
pub fn parse_github_slug(url: &str) -> Option<String> {
    let caps = GITHUB_REMOTE.captures(url.trim())?;
    Some(format!("{}/{}", &caps[1], &caps[2]))
}

/// Review gateway backed by GitHub pull requests
pub struct GithubReviews {
    api_base: String,
    repository: Option<String>,
    token: Option<String>,
}

impl GithubReviews {
    pub fn new(api_base: impl Into<String>, repository: Option<String>, token: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            repository,
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Token is read from the environment variable named in the config
    pub fn from_config(config: &ReviewConfig) -> Self {
        let token = std::env::var(&config.token_env).ok();
        Self::new(config.api_base.clone(), config.repository.clone(), token)
    }

    // Built per call: the blocking client must not be created or dropped on an async worker
    fn client(&self) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .user_agent(concat!("knowsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")
    }

    fn slug(&self, repo: &Path) -> Option<String> {
        if let Some(slug) = &self.repository {
            return Some(slug.clone());
        }
        let output = Command::new("git")
            .args(["remote", "get-url", REMOTE])
            .current_dir(repo)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_github_slug(&String::from_utf8_lossy(&output.stdout))
    }

    fn get_pulls(&self, slug: &str, query: &str) -> Result<Vec<PullRequest>> {
        let token = self.token.as_deref().context("No review token configured")?;
        let url = format!("{}/repos/{}/pulls?{}", self.api_base, slug, query);

        let response = self
            .client()?
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .send()
            .context("Failed to list pull requests")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Failed to list pull requests: {} - {}", status, body);
        }

        response.json().context("Failed to parse pull request list")
    }

    fn create_pull(&self, slug: &str, branch: &str, title: &str, body: &str) -> Result<Option<String>> {
        let owner = slug.split('/').next().unwrap_or(slug);
        let existing = self.get_pulls(slug, &format!("state=open&head={}:{}", owner, branch))?;
        if let Some(pr) = existing.first() {
            tracing::info!(branch, url = %pr.html_url, "review already open");
            return Ok(None);
        }

        let token = self.token.as_deref().context("No review token configured")?;
        let url = format!("{}/repos/{}/pulls", self.api_base, slug);
        let pr_body = serde_json::json!({
            "title": title,
            "body": body,
            "head": branch,
            "base": MAIN_BRANCH,
            "maintainer_can_modify": true
        });

        let response = self
            .client()?
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .json(&pr_body)
            .send()
            .context("Failed to create pull request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Failed to create PR: {} - {}", status, body);
        }

        let pr: PullRequest = response.json().context("Failed to parse pull request")?;
        Ok(Some(pr.html_url))
    }
}

impl ReviewGateway for GithubReviews {
    fn is_available(&self) -> bool {
        self.token.is_some()
    }

    fn open_review(&self, repo: &Path, branch: &str, title: &str, body: &str) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        let Some(slug) = self.slug(repo) else {
            tracing::warn!(repo = %repo.display(), "cannot determine GitHub repository for review");
            return None;
        };

        match self.create_pull(&slug, branch, title, body) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(branch, error = %e, "failed to open review");
                None
            }
        }
    }

    fn list_reviews(&self, repo: &Path, author: Option<&str>, state: ReviewState) -> Vec<ReviewSummary> {
        if !self.is_available() {
            return Vec::new();
        }
        let Some(slug) = self.slug(repo) else {
            return Vec::new();
        };

        match self.get_pulls(&slug, &format!("state={}&per_page=100", state)) {
            Ok(pulls) => pulls
                .into_iter()
                .map(ReviewSummary::from)
                .filter(|r| author.map_or(true, |a| r.author == a))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list reviews");
                Vec::new()
            }
        }
    }
}

/// Review request text for a branch whose changes could not all be merged
pub fn review_body(user_name: &str, additive: &[String], blocking: &[String]) -> String {
    let mut body = format!(
        "Automated knowledge sync for `{}`.\n\nThese changes touch shared state and need review before merging into `{}`.\n",
        user_name, MAIN_BRANCH
    );

    body.push_str("\n### Needs review\n");
    for file in blocking {
        body.push_str(&format!("- `{}`\n", file));
    }

    if !additive.is_empty() {
        body.push_str("\n### Additive (safe to merge)\n");
        for file in additive {
            body.push_str(&format!("- `{}`\n", file));
        }
    }

    body
}

/// Review statistics
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReviewStats {
    pub total: usize,
    pub open: usize,
    pub closed: usize,
}

impl ReviewStats {
    pub fn from_reviews(reviews: &[ReviewSummary]) -> Self {
        let open = reviews.iter().filter(|r| r.state == "open").count();
        Self {
            total: reviews.len(),
            open,
            closed: reviews.len() - open,
        }
    }

    pub fn format(&self) -> String {
        format!(
            "Total: {} | ⏳ Open: {} | ✅ Closed: {}",
            self.total, self.open, self.closed
        )
    }
}
