use clap::Parser;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Process configuration parsed from CLI arguments and environment variables.
/// The repository list lives in the YAML file named by `--config`.
#[derive(Parser, Debug)]
#[command(name = "gitsentry")]
#[command(about = "Polls hosted Git repositories and turns branch changes into CI triggers", long_about = None)]
pub struct Args {
    /// Path to the YAML repositories file
    #[arg(long, env = "GITSENTRY_CONFIG", default_value = "gitsentry.yaml")]
    pub config: PathBuf,

    /// SQLite database path for the branch snapshot
    #[arg(long, env = "GITSENTRY_DB", default_value = "gitsentry.db")]
    pub database: PathBuf,

    /// Address for the admin HTTP surface
    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Default polling interval in seconds (per-repo overrides in the YAML)
    #[arg(long, env = "POLLING_INTERVAL_SEC", default_value_t = 300)]
    pub polling_interval: u64,

    /// Upper bound on concurrently polled repositories
    #[arg(long, env = "MAX_WORKERS", default_value_t = 4)]
    pub max_workers: usize,

    /// Additional attempts after a transient API failure
    #[arg(long, env = "RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Base backoff between retry attempts, in milliseconds
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    /// Timeout for one git subprocess invocation, in seconds
    #[arg(long, env = "GIT_TIMEOUT_SEC", default_value_t = 30)]
    pub git_timeout: u64,

    /// Re-run failed API operations through `git ls-remote`
    #[arg(long, env = "ENABLE_FALLBACK", default_value_t = true)]
    pub enable_fallback: bool,

    /// Webhook URL that receives generated trigger events
    #[arg(long, env = "WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Log events instead of dispatching them
    #[arg(long, env = "DRY_RUN", default_value_t = false)]
    pub dry_run: bool,

    /// How long shutdown waits for in-flight poll cycles, in seconds
    #[arg(long, env = "SHUTDOWN_DEADLINE_SEC", default_value_t = 30)]
    pub shutdown_deadline: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Gitlab => "gitlab",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One watched repository, validated and immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub name: String,
    pub url: String,
    pub provider: Provider,
    pub api_base_url: Option<String>,
    pub token: String,
    /// Branch-name filter; empty admits every branch.
    pub branch_regex: String,
    pub enabled: bool,
    /// Per-repo override of the default polling interval.
    pub interval: Option<Duration>,
    /// Directory probed for declarative pipeline resources.
    pub pipeline_dir: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate repository name {0:?}")]
    DuplicateName(String),

    #[error("repository {name:?} has an unparseable URL {url:?}")]
    InvalidUrl { name: String, url: String },

    #[error("repository {name:?}: cannot infer provider from host {host:?}; set `provider`")]
    UnknownProvider { name: String, host: String },

    #[error("repository {name:?} has an invalid branch_regex: {source}")]
    InvalidRegex {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("repository {name:?} references unset environment variable {var:?}")]
    MissingEnv { name: String, var: String },
}

/// On-disk shape of the repositories file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    repositories: Vec<RawRepo>,
}

#[derive(Debug, Deserialize)]
struct RawRepo {
    name: String,
    url: String,
    #[serde(default)]
    provider: Option<Provider>,
    #[serde(default)]
    api_base_url: Option<String>,
    #[serde(default)]
    token: String,
    #[serde(default)]
    branch_regex: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    polling_interval_sec: Option<u64>,
    #[serde(default)]
    pipeline_dir: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Load and validate the repositories file.
pub fn load_repositories(path: &Path) -> Result<Vec<RepoConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ConfigFile = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;

    let mut seen = HashSet::new();
    let mut repositories = Vec::with_capacity(file.repositories.len());

    for raw in file.repositories {
        if !seen.insert(raw.name.clone()) {
            return Err(ConfigError::DuplicateName(raw.name));
        }

        let provider = match raw.provider {
            Some(p) => p,
            None => infer_provider(&raw.name, &raw.url)?,
        };

        if !raw.branch_regex.is_empty() {
            Regex::new(&raw.branch_regex).map_err(|source| ConfigError::InvalidRegex {
                name: raw.name.clone(),
                source,
            })?;
        }

        let token = expand_env(&raw.name, &raw.token)?;

        repositories.push(RepoConfig {
            name: raw.name,
            url: raw.url,
            provider,
            api_base_url: raw.api_base_url,
            token,
            branch_regex: raw.branch_regex,
            enabled: raw.enabled,
            interval: raw.polling_interval_sec.map(Duration::from_secs),
            pipeline_dir: raw.pipeline_dir,
        });
    }

    Ok(repositories)
}

/// Infer the provider family from the clone URL host.
fn infer_provider(name: &str, url: &str) -> Result<Provider, ConfigError> {
    let parsed = Url::parse(url).map_err(|_| ConfigError::InvalidUrl {
        name: name.to_string(),
        url: url.to_string(),
    })?;
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    if host.contains("github") {
        Ok(Provider::Github)
    } else if host.contains("gitlab") {
        Ok(Provider::Gitlab)
    } else {
        Err(ConfigError::UnknownProvider {
            name: name.to_string(),
            host,
        })
    }
}

/// Expand a `${VAR}` token reference from the environment. Literal values
/// pass through untouched.
fn expand_env(name: &str, token: &str) -> Result<String, ConfigError> {
    let trimmed = token.trim();
    let Some(var) = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Ok(token.to_string());
    };
    std::env::var(var).map_err(|_| ConfigError::MissingEnv {
        name: name.to_string(),
        var: var.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn repo_config(name: &str, url: &str, provider: Provider) -> RepoConfig {
        RepoConfig {
            name: name.to_string(),
            url: url.to_string(),
            provider,
            api_base_url: None,
            token: String::new(),
            branch_regex: String::new(),
            enabled: true,
            interval: None,
            pipeline_dir: None,
        }
    }

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_minimal_config() {
        let file = write_config(
            r#"
repositories:
  - name: app
    url: https://github.com/org/app
"#,
        );
        let repos = load_repositories(file.path()).unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].name, "app");
        assert_eq!(repos[0].provider, Provider::Github);
        assert!(repos[0].enabled);
        assert!(repos[0].branch_regex.is_empty());
    }

    #[test]
    fn test_provider_inference_gitlab() {
        let file = write_config(
            r#"
repositories:
  - name: infra
    url: https://gitlab.example.com/group/sub/infra
"#,
        );
        let repos = load_repositories(file.path()).unwrap();
        assert_eq!(repos[0].provider, Provider::Gitlab);
    }

    #[test]
    fn test_unknown_host_requires_explicit_provider() {
        let file = write_config(
            r#"
repositories:
  - name: mystery
    url: https://code.example.com/org/repo
"#,
        );
        assert!(matches!(
            load_repositories(file.path()),
            Err(ConfigError::UnknownProvider { .. })
        ));

        let file = write_config(
            r#"
repositories:
  - name: mystery
    url: https://code.example.com/org/repo
    provider: gitlab
"#,
        );
        let repos = load_repositories(file.path()).unwrap();
        assert_eq!(repos[0].provider, Provider::Gitlab);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let file = write_config(
            r#"
repositories:
  - name: app
    url: https://github.com/org/app
  - name: app
    url: https://github.com/org/other
"#,
        );
        assert!(matches!(
            load_repositories(file.path()),
            Err(ConfigError::DuplicateName(name)) if name == "app"
        ));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let file = write_config(
            r#"
repositories:
  - name: app
    url: https://github.com/org/app
    branch_regex: "("
"#,
        );
        assert!(matches!(
            load_repositories(file.path()),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_token_env_expansion() {
        // SAFETY: test-local variable; nothing else reads the environment here.
        unsafe { std::env::set_var("GITSENTRY_TEST_TOKEN", "sekrit") };
        let file = write_config(
            r#"
repositories:
  - name: app
    url: https://github.com/org/app
    token: ${GITSENTRY_TEST_TOKEN}
"#,
        );
        let repos = load_repositories(file.path()).unwrap();
        assert_eq!(repos[0].token, "sekrit");
    }

    #[test]
    fn test_missing_env_token_is_an_error() {
        let file = write_config(
            r#"
repositories:
  - name: app
    url: https://github.com/org/app
    token: ${GITSENTRY_TEST_UNSET_VAR}
"#,
        );
        assert!(matches!(
            load_repositories(file.path()),
            Err(ConfigError::MissingEnv { .. })
        ));
    }

    #[test]
    fn test_per_repo_overrides() {
        let file = write_config(
            r#"
repositories:
  - name: app
    url: https://github.com/org/app
    branch_regex: "^(main|release/.*)$"
    enabled: false
    polling_interval_sec: 60
    pipeline_dir: .ci
"#,
        );
        let repos = load_repositories(file.path()).unwrap();
        assert!(!repos[0].enabled);
        assert_eq!(repos[0].interval, Some(Duration::from_secs(60)));
        assert_eq!(repos[0].pipeline_dir.as_deref(), Some(".ci"));
        assert_eq!(repos[0].branch_regex, "^(main|release/.*)$");
    }
}
