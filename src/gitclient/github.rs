//! GitHub-family API client.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::api::{ApiTransport, AuthStyle, RateHeaders};
use super::error::GitClientError;
use super::fallback::CommandLineClient;
use super::ratelimit::{RateBudget, RateLimiter};
use super::{Branch, ClientOptions, GitClient};
use crate::config::RepoConfig;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;
/// Hard cap on branch-list pagination; a repository with more pages than
/// this is beyond what a poll cycle should walk.
const MAX_PAGES: usize = 50;

/// `<owner>/<repo>` parsed from the clone URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RepoPath {
    pub owner: String,
    pub repo: String,
}

pub struct GithubClient {
    api: ApiTransport,
    base: String,
    /// None when the clone URL did not parse; every call then goes through
    /// the fallback.
    path: Option<RepoPath>,
    fallback: Option<CommandLineClient>,
    repo_url: String,
}

// API response shapes.

#[derive(Debug, Deserialize)]
struct ApiBranch {
    name: String,
    commit: CommitRef,
    #[serde(default)]
    protected: bool,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct FileContent {
    #[serde(default)]
    content: String,
}

/// The contents endpoint answers with an array for directories and an
/// object for files.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    Listing(Vec<ContentEntry>),
    File(FileContent),
}

impl GithubClient {
    pub fn new(
        repo: &RepoConfig,
        options: &ClientOptions,
        cancel: CancellationToken,
    ) -> Result<Self, GitClientError> {
        let base = repo
            .api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        let api = ApiTransport::new(
            AuthStyle::Token,
            repo.token.clone(),
            RateHeaders::GITHUB,
            Arc::new(RateLimiter::github()),
            options.retry_attempts,
            options.retry_backoff,
            options.request_timeout,
            cancel.clone(),
        )?;

        let path = match parse_repo_url(&repo.url) {
            Ok(path) => Some(path),
            Err(e) if options.enable_fallback => {
                tracing::warn!(
                    repo = %repo.name,
                    url = %repo.url,
                    error = %e,
                    "URL did not parse as <host>/<owner>/<repo>, using ls-remote only"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let fallback = options.enable_fallback.then(|| {
            CommandLineClient::new(repo.url.clone(), options.git_timeout, cancel)
        });

        Ok(GithubClient {
            api,
            base,
            path,
            fallback,
            repo_url: repo.url.clone(),
        })
    }

    fn path(&self) -> Result<&RepoPath, GitClientError> {
        self.path
            .as_ref()
            .ok_or_else(|| GitClientError::InvalidUrl(self.repo_url.clone()))
    }

    async fn branches_from_api(&self) -> Result<Vec<Branch>, GitClientError> {
        let RepoPath { owner, repo } = self.path()?;
        let mut branches = Vec::new();

        for page in 1..=MAX_PAGES {
            let url = format!(
                "{}/repos/{owner}/{repo}/branches?per_page={PER_PAGE}&page={page}",
                self.base
            );
            let batch: Vec<ApiBranch> = self.api.get_json(&url).await?;
            let len = batch.len();
            branches.extend(batch.into_iter().map(|b| Branch {
                name: b.name,
                commit_sha: b.commit.sha,
                protected: b.protected,
            }));
            if len < PER_PAGE {
                break;
            }
        }

        Ok(branches)
    }

    async fn latest_commit_from_api(&self, branch: &str) -> Result<String, GitClientError> {
        let RepoPath { owner, repo } = self.path()?;
        let url = format!(
            "{}/repos/{owner}/{repo}/branches/{}",
            self.base,
            urlencoding::encode(branch)
        );
        let b: ApiBranch = self.api.get_json(&url).await?;
        Ok(b.commit.sha)
    }

    async fn permissions_from_api(&self) -> Result<(), GitClientError> {
        let RepoPath { owner, repo } = self.path()?;
        let url = format!("{}/repos/{owner}/{repo}", self.base);
        self.api.get(&url).await.map(|_| ())
    }

    async fn contents(&self, commit: &str, path: &str) -> Result<ContentsResponse, GitClientError> {
        let RepoPath { owner, repo } = self.path()?;
        let url = format!(
            "{}/repos/{owner}/{repo}/contents/{}?ref={}",
            self.base,
            path.trim_matches('/'),
            urlencoding::encode(commit)
        );
        self.api.get_json(&url).await
    }
}

#[async_trait]
impl GitClient for GithubClient {
    async fn get_branches(&self) -> Result<Vec<Branch>, GitClientError> {
        if self.path.is_none() {
            if let Some(fallback) = &self.fallback {
                return fallback.get_branches().await;
            }
        }
        match self.branches_from_api().await {
            Ok(branches) => Ok(branches),
            Err(e) if e.is_retryable() => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!(url = %self.repo_url, error = %e, "branch listing fell back to ls-remote");
                    fallback.get_branches().await
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn get_latest_commit(&self, branch: &str) -> Result<String, GitClientError> {
        match self.latest_commit_from_api(branch).await {
            Ok(sha) => Ok(sha),
            Err(e) if e.is_retryable() || matches!(e, GitClientError::InvalidUrl(_)) => {
                match &self.fallback {
                    Some(fallback) => fallback.get_latest_commit(branch).await,
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn check_permissions(&self) -> Result<(), GitClientError> {
        match self.permissions_from_api().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() || matches!(e, GitClientError::InvalidUrl(_)) => {
                match &self.fallback {
                    Some(fallback) => fallback.check_permissions().await,
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn get_rate_limit(&self) -> Result<RateBudget, GitClientError> {
        Ok(self.api.limiter().get_limit())
    }

    async fn list_files(&self, commit: &str, path: &str) -> Result<Vec<String>, GitClientError> {
        match self.contents(commit, path).await? {
            ContentsResponse::Listing(entries) => Ok(entries
                .into_iter()
                .filter(|e| e.kind == "file")
                .map(|e| e.path)
                .collect()),
            ContentsResponse::File(_) => Err(GitClientError::network(format!(
                "{path:?} is a file, not a directory"
            ))),
        }
    }

    async fn get_file_content(
        &self,
        commit: &str,
        path: &str,
    ) -> Result<Vec<u8>, GitClientError> {
        match self.contents(commit, path).await? {
            ContentsResponse::File(file) => decode_content(&file.content),
            ContentsResponse::Listing(_) => Err(GitClientError::network(format!(
                "{path:?} is a directory, not a file"
            ))),
        }
    }

    async fn check_directory_exists(
        &self,
        commit: &str,
        path: &str,
    ) -> Result<bool, GitClientError> {
        match self.contents(commit, path).await {
            Ok(ContentsResponse::Listing(_)) => Ok(true),
            Ok(ContentsResponse::File(_)) => Ok(false),
            Err(GitClientError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Parse a clone URL as `<host>/<owner>/<repo>`, tolerating a `.git` suffix.
pub(crate) fn parse_repo_url(url: &str) -> Result<RepoPath, GitClientError> {
    let parsed = Url::parse(url).map_err(|_| GitClientError::InvalidUrl(url.to_string()))?;
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    let [owner, repo] = segments.as_slice() else {
        return Err(GitClientError::InvalidUrl(url.to_string()));
    };
    Ok(RepoPath {
        owner: (*owner).to_string(),
        repo: repo.trim_end_matches(".git").to_string(),
    })
}

/// GitHub pads base64 content with embedded newlines; strip ASCII
/// whitespace before decoding.
fn decode_content(content: &str) -> Result<Vec<u8>, GitClientError> {
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64
        .decode(compact.as_bytes())
        .map_err(|e| GitClientError::network_caused_by("invalid base64 file content", e))
}
