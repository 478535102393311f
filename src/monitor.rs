//! Change detection: compare live branch state against the persisted
//! snapshot and emit the minimal set of branch-change records.

use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::RepoConfig;
use crate::db::{RepoState, StateStore};
use crate::gitclient::{GitClient, GitClientError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    New,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::New => "new",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed branch-level change.
///
/// `new` carries an empty old commit, `deleted` an empty new commit, and
/// `updated` both (differing) commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchChange {
    pub repo_name: String,
    pub branch_name: String,
    pub old_commit: String,
    pub new_commit: String,
    pub change_type: ChangeType,
    pub timestamp: OffsetDateTime,
    pub protected: bool,
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid branch pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to fetch branches: {0}")]
    Fetch(#[source] GitClientError),

    #[error("snapshot load failed: {0}")]
    Snapshot(#[source] sqlx::Error),
}

/// Run one detection cycle for one repository.
///
/// Fetches the current branches, filters them by the repository's branch
/// pattern, diffs against the snapshot, and commits the new snapshot as a
/// side effect. The observation timestamp is captured once and reused for
/// every change in the cycle, which keeps downstream event identifiers
/// stable within a run.
///
/// Per-branch snapshot writes are applied independently: a failed upsert is
/// logged and skipped, and the next cycle re-observes and converges.
pub async fn detect_changes(
    repo: &RepoConfig,
    client: &dyn GitClient,
    store: &dyn StateStore,
) -> Result<Vec<BranchChange>, DetectError> {
    let pattern = compile_pattern(&repo.branch_regex)?;

    let branches = client.get_branches().await.map_err(DetectError::Fetch)?;
    let observed_at = OffsetDateTime::now_utc();

    let current: Vec<_> = branches
        .into_iter()
        .filter(|b| pattern.as_ref().is_none_or(|p| p.is_match(&b.name)))
        .collect();

    let snapshot: HashMap<String, RepoState> = store
        .get_repo_states(&repo.name)
        .await
        .map_err(DetectError::Snapshot)?
        .into_iter()
        .map(|s| (s.branch_name.clone(), s))
        .collect();

    let mut changes = Vec::new();

    for branch in &current {
        match snapshot.get(&branch.name) {
            None => {
                changes.push(BranchChange {
                    repo_name: repo.name.clone(),
                    branch_name: branch.name.clone(),
                    old_commit: String::new(),
                    new_commit: branch.commit_sha.clone(),
                    change_type: ChangeType::New,
                    timestamp: observed_at,
                    protected: branch.protected,
                });
            }
            Some(prior) if prior.commit_sha != branch.commit_sha => {
                changes.push(BranchChange {
                    repo_name: repo.name.clone(),
                    branch_name: branch.name.clone(),
                    old_commit: prior.commit_sha.clone(),
                    new_commit: branch.commit_sha.clone(),
                    change_type: ChangeType::Updated,
                    timestamp: observed_at,
                    protected: branch.protected,
                });
            }
            // Unchanged commit: the upsert below still refreshes the
            // observation timestamp and protected flag.
            Some(_) => {}
        }

        let state = RepoState {
            repo_name: repo.name.clone(),
            branch_name: branch.name.clone(),
            commit_sha: branch.commit_sha.clone(),
            protected: branch.protected,
            last_checked: observed_at,
        };
        if let Err(e) = store.upsert_repo_state(&state).await {
            tracing::warn!(
                repo = %repo.name,
                branch = %branch.name,
                error = %e,
                "snapshot upsert failed, continuing cycle"
            );
        }
    }

    for (branch_name, prior) in &snapshot {
        if current.iter().any(|b| &b.name == branch_name) {
            continue;
        }
        changes.push(BranchChange {
            repo_name: repo.name.clone(),
            branch_name: branch_name.clone(),
            old_commit: prior.commit_sha.clone(),
            new_commit: String::new(),
            change_type: ChangeType::Deleted,
            timestamp: observed_at,
            // No source of truth at deletion time.
            protected: false,
        });
        if let Err(e) = store.delete_repo_state(&repo.name, branch_name).await {
            tracing::warn!(
                repo = %repo.name,
                branch = %branch_name,
                error = %e,
                "snapshot delete failed, continuing cycle"
            );
        }
    }

    Ok(changes)
}

/// Compile the branch pattern; an empty pattern admits every branch.
fn compile_pattern(pattern: &str) -> Result<Option<Regex>, DetectError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|source| DetectError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}
