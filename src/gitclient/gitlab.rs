//! GitLab-family API client.
//!
//! The dialect differences from the GitHub family: Bearer authentication,
//! an RFC 3339 rate-limit reset header, a namespaced project path (with
//! subgroups) that must be URL-encoded, and a numeric project id resolved
//! once per path and used for all subsequent calls.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
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

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 50;

pub struct GitlabClient {
    api: ApiTransport,
    base: String,
    /// Namespaced project path, e.g. `group/subgroup/project`.
    path: Option<String>,
    /// Cache of path -> numeric project id.
    project_ids: DashMap<String, u64>,
    fallback: Option<CommandLineClient>,
    repo_url: String,
}

#[derive(Debug, Deserialize)]
struct Project {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct ApiBranch {
    name: String,
    commit: CommitRef,
    #[serde(default)]
    protected: bool,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryFile {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

impl GitlabClient {
    pub fn new(
        repo: &RepoConfig,
        options: &ClientOptions,
        cancel: CancellationToken,
    ) -> Result<Self, GitClientError> {
        let api = ApiTransport::new(
            AuthStyle::Bearer,
            repo.token.clone(),
            RateHeaders::GITLAB,
            Arc::new(RateLimiter::gitlab()),
            options.retry_attempts,
            options.retry_backoff,
            options.request_timeout,
            cancel.clone(),
        )?;

        let parsed = parse_repo_url(&repo.url);
        let (base, path) = match parsed {
            Ok((host, path)) => {
                let base = match &repo.api_base_url {
                    Some(base) => base.trim_end_matches('/').to_string(),
                    None => format!("https://{host}/api/v4"),
                };
                (base, Some(path))
            }
            Err(e) if options.enable_fallback => {
                tracing::warn!(
                    repo = %repo.name,
                    url = %repo.url,
                    error = %e,
                    "URL did not parse as a project path, using ls-remote only"
                );
                let base = repo
                    .api_base_url
                    .clone()
                    .unwrap_or_default()
                    .trim_end_matches('/')
                    .to_string();
                (base, None)
            }
            Err(e) => return Err(e),
        };

        let fallback = options.enable_fallback.then(|| {
            CommandLineClient::new(repo.url.clone(), options.git_timeout, cancel)
        });

        Ok(GitlabClient {
            api,
            base,
            path,
            project_ids: DashMap::new(),
            fallback,
            repo_url: repo.url.clone(),
        })
    }

    fn path(&self) -> Result<&str, GitClientError> {
        self.path
            .as_deref()
            .ok_or_else(|| GitClientError::InvalidUrl(self.repo_url.clone()))
    }

    /// Resolve (and cache) the numeric project id for the configured path.
    async fn project_id(&self) -> Result<u64, GitClientError> {
        let path = self.path()?;
        if let Some(id) = self.project_ids.get(path) {
            return Ok(*id);
        }
        let url = format!("{}/projects/{}", self.base, urlencoding::encode(path));
        let project: Project = self.api.get_json(&url).await?;
        self.project_ids.insert(path.to_string(), project.id);
        Ok(project.id)
    }

    async fn branches_from_api(&self) -> Result<Vec<Branch>, GitClientError> {
        let id = self.project_id().await?;
        let mut branches = Vec::new();

        for page in 1..=MAX_PAGES {
            let url = format!(
                "{}/projects/{id}/repository/branches?per_page={PER_PAGE}&page={page}",
                self.base
            );
            let batch: Vec<ApiBranch> = self.api.get_json(&url).await?;
            let len = batch.len();
            branches.extend(batch.into_iter().map(|b| Branch {
                name: b.name,
                commit_sha: b.commit.id,
                protected: b.protected,
            }));
            if len < PER_PAGE {
                break;
            }
        }

        Ok(branches)
    }

    async fn latest_commit_from_api(&self, branch: &str) -> Result<String, GitClientError> {
        let id = self.project_id().await?;
        let url = format!(
            "{}/projects/{id}/repository/branches/{}",
            self.base,
            urlencoding::encode(branch)
        );
        let b: ApiBranch = self.api.get_json(&url).await?;
        Ok(b.commit.id)
    }

    async fn tree(&self, commit: &str, path: &str) -> Result<Vec<TreeEntry>, GitClientError> {
        let id = self.project_id().await?;
        let url = format!(
            "{}/projects/{id}/repository/tree?ref={}&path={}&per_page={PER_PAGE}",
            self.base,
            urlencoding::encode(commit),
            urlencoding::encode(path.trim_matches('/'))
        );
        self.api.get_json(&url).await
    }
}

#[async_trait]
impl GitClient for GitlabClient {
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
        match self.project_id().await {
            Ok(_) => Ok(()),
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
        Ok(self
            .tree(commit, path)
            .await?
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| e.path)
            .collect())
    }

    async fn get_file_content(
        &self,
        commit: &str,
        path: &str,
    ) -> Result<Vec<u8>, GitClientError> {
        let id = self.project_id().await?;
        let url = format!(
            "{}/projects/{id}/repository/files/{}?ref={}",
            self.base,
            urlencoding::encode(path.trim_matches('/')),
            urlencoding::encode(commit)
        );
        let file: RepositoryFile = self.api.get_json(&url).await?;
        decode_content(&file.content, &file.encoding)
    }

    async fn check_directory_exists(
        &self,
        commit: &str,
        path: &str,
    ) -> Result<bool, GitClientError> {
        // The tree endpoint answers 200 with an empty array for unknown
        // paths, and 404 on some self-hosted versions.
        match self.tree(commit, path).await {
            Ok(entries) => Ok(!entries.is_empty()),
            Err(GitClientError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Parse a clone URL into `(host, namespaced path)`; subgroups are kept.
pub(crate) fn parse_repo_url(url: &str) -> Result<(String, String), GitClientError> {
    let parsed = Url::parse(url).map_err(|_| GitClientError::InvalidUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GitClientError::InvalidUrl(url.to_string()))?
        .to_string();
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    if segments.len() < 2 {
        return Err(GitClientError::InvalidUrl(url.to_string()));
    }
    let mut path = segments.join("/");
    if let Some(stripped) = path.strip_suffix(".git") {
        path = stripped.to_string();
    }
    Ok((host, path))
}

/// GitLab gates the payload encoding on an `encoding` field: decode base64,
/// pass anything else through verbatim.
fn decode_content(content: &str, encoding: &str) -> Result<Vec<u8>, GitClientError> {
    if encoding == "base64" {
        let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        BASE64
            .decode(compact.as_bytes())
            .map_err(|e| GitClientError::network_caused_by("invalid base64 file content", e))
    } else {
        Ok(content.as_bytes().to_vec())
    }
}
