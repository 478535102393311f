//! Command-line fallback client over `git ls-remote`.
//!
//! Engaged when an API client cannot parse its repository URL or exhausts
//! its retries on a transient failure. Branch listings come from
//! `ls-remote --heads`, single refs from a restricted listing, and the
//! accessibility probe from `--exit-code`. The extended file operations are
//! not available here.

use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::error::GitClientError;
use super::ratelimit::RateBudget;
use super::{Branch, GitClient};

/// `<hash> TAB refs/heads/<name>`; anything else in the output is skipped.
static LS_REMOTE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-fA-F]{40,64})\trefs/heads/(\S+)$").unwrap());

pub struct CommandLineClient {
    url: String,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CommandLineClient {
    pub fn new(url: impl Into<String>, timeout: Duration, cancel: CancellationToken) -> Self {
        CommandLineClient {
            url: url.into(),
            timeout,
            cancel,
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, GitClientError> {
        let mut command = Command::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = self.cancel.cancelled() => return Err(GitClientError::Cancelled),
            result = tokio::time::timeout(self.timeout, command.output()) => match result {
                Err(_) => {
                    return Err(GitClientError::network(format!(
                        "git {} timed out after {:?}",
                        args.first().copied().unwrap_or_default(),
                        self.timeout
                    )));
                }
                Ok(Err(e)) => {
                    return Err(GitClientError::network_caused_by("failed to spawn git", e));
                }
                Ok(Ok(output)) => output,
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.map_exit_code(output.status.code(), stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Exit-code conventions of `git ls-remote` against hosted remotes:
    /// 128 covers missing repositories, 129 bad credentials.
    fn map_exit_code(&self, code: Option<i32>, stderr: &str) -> GitClientError {
        match code {
            Some(128) => GitClientError::NotFound(self.url.clone()),
            Some(129) => GitClientError::Authentication,
            other => GitClientError::network(format!(
                "git exited with {:?}: {}",
                other,
                if stderr.is_empty() { "(no stderr)" } else { stderr }
            )),
        }
    }
}

/// Parse `ls-remote --heads` output into branches. Unparseable lines are
/// skipped; `ls-remote` carries no protection data, so `protected` is false.
pub fn parse_ls_remote(output: &str) -> Vec<Branch> {
    output
        .lines()
        .filter_map(|line| {
            let caps = LS_REMOTE_LINE.captures(line.trim_end())?;
            Some(Branch {
                name: caps[2].to_string(),
                commit_sha: caps[1].to_ascii_lowercase(),
                protected: false,
            })
        })
        .collect()
}

#[async_trait]
impl GitClient for CommandLineClient {
    async fn get_branches(&self) -> Result<Vec<Branch>, GitClientError> {
        let output = self.run_git(&["ls-remote", "--heads", &self.url]).await?;
        Ok(parse_ls_remote(&output))
    }

    async fn get_latest_commit(&self, branch: &str) -> Result<String, GitClientError> {
        let refname = format!("refs/heads/{branch}");
        let output = self.run_git(&["ls-remote", &self.url, &refname]).await?;
        parse_ls_remote(&output)
            .into_iter()
            .find(|b| b.name == branch)
            .map(|b| b.commit_sha)
            .ok_or_else(|| GitClientError::NotFound(format!("{}#{branch}", self.url)))
    }

    async fn check_permissions(&self) -> Result<(), GitClientError> {
        self.run_git(&["ls-remote", "--exit-code", &self.url])
            .await
            .map(|_| ())
    }

    /// The shell has no request budget; report one that never pressures the
    /// limiter.
    async fn get_rate_limit(&self) -> Result<RateBudget, GitClientError> {
        Ok(RateBudget {
            limit: 1_000_000,
            remaining: 1_000_000,
            reset: OffsetDateTime::now_utc() + time::Duration::hours(1),
        })
    }

    async fn list_files(&self, _commit: &str, _path: &str) -> Result<Vec<String>, GitClientError> {
        Err(GitClientError::ApiRequired(
            "file listing is not available over ls-remote",
        ))
    }

    async fn get_file_content(
        &self,
        _commit: &str,
        _path: &str,
    ) -> Result<Vec<u8>, GitClientError> {
        Err(GitClientError::ApiRequired(
            "file content is not available over ls-remote",
        ))
    }

    async fn check_directory_exists(
        &self,
        _commit: &str,
        _path: &str,
    ) -> Result<bool, GitClientError> {
        Err(GitClientError::ApiRequired(
            "directory probes are not available over ls-remote",
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn test_parse_ls_remote_heads() {
        let output = format!("{SHA_A}\trefs/heads/main\n{SHA_B}\trefs/heads/feature/x\n");
        let branches = parse_ls_remote(&output);
        assert_eq!(
            branches,
            vec![
                Branch {
                    name: "main".into(),
                    commit_sha: SHA_A.into(),
                    protected: false,
                },
                Branch {
                    name: "feature/x".into(),
                    commit_sha: SHA_B.into(),
                    protected: false,
                },
            ]
        );
    }

    #[test]
    fn test_parse_skips_non_head_refs_and_garbage() {
        let output = format!(
            "{SHA_A}\trefs/heads/main\n\
             {SHA_B}\trefs/tags/v1.0\n\
             warning: redirecting to https://example.com/repo.git/\n\
             not-a-sha\trefs/heads/dev\n"
        );
        let branches = parse_ls_remote(&output);
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, "main");
    }

    #[test]
    fn test_parse_normalises_sha_case() {
        let output = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\trefs/heads/main\n";
        let branches = parse_ls_remote(output);
        assert_eq!(branches[0].commit_sha, SHA_A);
    }

    #[test]
    fn test_exit_code_mapping() {
        let client = CommandLineClient::new(
            "https://example.com/org/repo.git",
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        assert!(matches!(
            client.map_exit_code(Some(128), "repository not found"),
            GitClientError::NotFound(_)
        ));
        assert!(matches!(
            client.map_exit_code(Some(129), "authentication failed"),
            GitClientError::Authentication
        ));
        assert!(matches!(
            client.map_exit_code(Some(1), "fatal: something"),
            GitClientError::Network { .. }
        ));
        assert!(matches!(
            client.map_exit_code(None, "killed"),
            GitClientError::Network { .. }
        ));
    }

    #[tokio::test]
    async fn test_extended_operations_require_api() {
        let client = CommandLineClient::new(
            "https://example.com/org/repo.git",
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        assert!(matches!(
            client.list_files("deadbeef", ".pipeline").await,
            Err(GitClientError::ApiRequired(_))
        ));
        assert!(matches!(
            client.get_file_content("deadbeef", ".pipeline/run.yaml").await,
            Err(GitClientError::ApiRequired(_))
        ));
        assert!(matches!(
            client.check_directory_exists("deadbeef", ".pipeline").await,
            Err(GitClientError::ApiRequired(_))
        ));
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok()
    }

    pub(crate) fn init_local_repo(dir: &std::path::Path) {
        let run = |args: &[&str]| {
            let output = std::process::Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .unwrap();
            assert!(
                output.status.success(),
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        };
        run(&["init", "--quiet"]);
        run(&["checkout", "--quiet", "-b", "main"]);
        run(&["config", "user.email", "sentry@example.com"]);
        run(&["config", "user.name", "sentry"]);
        run(&["commit", "--allow-empty", "--quiet", "-m", "initial"]);
    }

    #[tokio::test]
    async fn test_lists_branches_of_a_local_repository() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_local_repo(dir.path());

        let client = CommandLineClient::new(
            dir.path().display().to_string(),
            Duration::from_secs(10),
            CancellationToken::new(),
        );

        let branches = client.get_branches().await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, "main");
        assert!(!branches[0].protected);

        let sha = client.get_latest_commit("main").await.unwrap();
        assert_eq!(sha, branches[0].commit_sha);

        client.check_permissions().await.unwrap();

        assert!(matches!(
            client.get_latest_commit("missing").await,
            Err(GitClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_synthetic_budget_never_pressures_limiter() {
        let client = CommandLineClient::new(
            "https://example.com/org/repo.git",
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        let budget = client.get_rate_limit().await.unwrap();
        assert!(budget.remaining >= 1_000_000);
        assert!(budget.reset > OffsetDateTime::now_utc());
    }
}
