//! Provider client layer.
//!
//! Three variants sit behind one capability set: the GitHub-family API
//! client, the GitLab-family API client, and a `git ls-remote` command-line
//! fallback. Workers get a fresh client per poll cycle from [`create_client`].

pub mod api;
pub mod error;
pub mod fallback;
pub mod github;
pub mod gitlab;
pub mod ratelimit;

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{Provider, RepoConfig};
pub use error::GitClientError;
pub use ratelimit::RateBudget;

/// One branch as observed on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub name: String,
    pub commit_sha: String,
    pub protected: bool,
}

/// Knobs shared by every client variant.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    /// Timeout for one git subprocess invocation.
    pub git_timeout: Duration,
    /// Engage the command-line fallback on URL-parse failure or exhausted
    /// transient errors.
    pub enable_fallback: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            git_timeout: Duration::from_secs(30),
            enable_fallback: true,
        }
    }
}

/// Uniform capability surface over the provider dialects.
///
/// A client is bound to one repository at construction. The extended file
/// operations exist for pipeline-directory inspection; the fallback variant
/// does not support them and fails with [`GitClientError::ApiRequired`].
#[async_trait]
pub trait GitClient: Send + Sync {
    async fn get_branches(&self) -> Result<Vec<Branch>, GitClientError>;

    async fn get_latest_commit(&self, branch: &str) -> Result<String, GitClientError>;

    /// Probe that the configured credentials can read the repository.
    async fn check_permissions(&self) -> Result<(), GitClientError>;

    async fn get_rate_limit(&self) -> Result<RateBudget, GitClientError>;

    /// List file paths under `path` at `commit`.
    async fn list_files(&self, commit: &str, path: &str) -> Result<Vec<String>, GitClientError>;

    /// Fetch the raw bytes of one file at `commit`.
    async fn get_file_content(
        &self,
        commit: &str,
        path: &str,
    ) -> Result<Vec<u8>, GitClientError>;

    async fn check_directory_exists(
        &self,
        commit: &str,
        path: &str,
    ) -> Result<bool, GitClientError>;

    /// Release held resources. The default is a no-op; connection pools are
    /// dropped with the client.
    async fn close(&self) {}
}

/// Build the client variant for a repository descriptor.
pub fn create_client(
    repo: &RepoConfig,
    options: &ClientOptions,
    cancel: CancellationToken,
) -> Result<Box<dyn GitClient>, GitClientError> {
    match repo.provider {
        Provider::Github => Ok(Box::new(github::GithubClient::new(repo, options, cancel)?)),
        Provider::Gitlab => Ok(Box::new(gitlab::GitlabClient::new(repo, options, cancel)?)),
    }
}
