//! Event generation: convert branch changes into trigger events with
//! deterministic identifiers.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;

use crate::config::RepoConfig;
use crate::monitor::{BranchChange, ChangeType};

pub const GENERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "branch.created")]
    BranchCreated,
    #[serde(rename = "branch.updated")]
    BranchUpdated,
    #[serde(rename = "branch.deleted")]
    BranchDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BranchCreated => "branch.created",
            EventKind::BranchUpdated => "branch.updated",
            EventKind::BranchDeleted => "branch.deleted",
        }
    }

    fn from_change(change_type: ChangeType) -> Self {
        match change_type {
            ChangeType::New => EventKind::BranchCreated,
            ChangeType::Updated => EventKind::BranchUpdated,
            ChangeType::Deleted => EventKind::BranchDeleted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Dispatched,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Dispatched => "dispatched",
            EventStatus::Failed => "failed",
        }
    }
}

/// One outbound CI trigger event. The identifier is a pure function of
/// `(repository, branch, new commit, observation second)`, so re-running an
/// identical cycle reproduces the identifier and the sink can deduplicate.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    pub prev_commit: String,
    pub provider: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub status: EventStatus,
    pub metadata: BTreeMap<String, String>,
}

/// Deterministic event identifier: `event_` plus the first 8 bytes of
/// SHA-256 over `repo:branch:commit:unix-second`, lowercase hex.
pub fn event_id(repo: &str, branch: &str, commit: &str, at: OffsetDateTime) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.as_bytes());
    hasher.update(b":");
    hasher.update(branch.as_bytes());
    hasher.update(b":");
    hasher.update(commit.as_bytes());
    hasher.update(b":");
    hasher.update(at.unix_timestamp().to_string().as_bytes());
    let digest = hasher.finalize();
    format!("event_{}", hex::encode(&digest[..8]))
}

/// Optional secondary selection applied before events are built.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Drop changes on unprotected branches.
    pub protected_only: bool,
    /// When non-empty, admit only these change types.
    pub include_types: Vec<ChangeType>,
    /// Change types dropped outright.
    pub exclude_types: Vec<ChangeType>,
    /// Drop changes younger than this at generation time.
    pub min_age: Option<Duration>,
}

impl EventFilter {
    fn admits(&self, change: &BranchChange, now: OffsetDateTime) -> bool {
        if self.protected_only && !change.protected {
            return false;
        }
        if !self.include_types.is_empty() && !self.include_types.contains(&change.change_type) {
            return false;
        }
        if self.exclude_types.contains(&change.change_type) {
            return false;
        }
        if let Some(min_age) = self.min_age {
            let age = now - change.timestamp;
            if age < min_age {
                return false;
            }
        }
        true
    }
}

pub struct EventGenerator {
    /// Tag carried in every event's metadata naming the producing system.
    source: String,
    filter: Option<EventFilter>,
}

impl EventGenerator {
    pub fn new(source: impl Into<String>) -> Self {
        EventGenerator {
            source: source.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Map filtered changes to events, one per admitted change.
    pub fn generate(&self, repo: &RepoConfig, changes: &[BranchChange]) -> Vec<Event> {
        let now = OffsetDateTime::now_utc();
        changes
            .iter()
            .filter(|c| self.filter.as_ref().is_none_or(|f| f.admits(c, now)))
            .map(|c| self.build_event(repo, c))
            .collect()
    }

    fn build_event(&self, repo: &RepoConfig, change: &BranchChange) -> Event {
        let mut metadata = BTreeMap::new();
        metadata.insert("repository".to_string(), change.repo_name.clone());
        metadata.insert("provider".to_string(), repo.provider.to_string());
        metadata.insert("branch".to_string(), change.branch_name.clone());
        metadata.insert("change_type".to_string(), change.change_type.to_string());
        metadata.insert("commit_sha".to_string(), change.new_commit.clone());
        metadata.insert("previous_commit".to_string(), change.old_commit.clone());
        metadata.insert("protected".to_string(), change.protected.to_string());
        metadata.insert("source".to_string(), self.source.clone());
        metadata.insert(
            "generator_version".to_string(),
            GENERATOR_VERSION.to_string(),
        );
        if !repo.url.is_empty() {
            metadata.insert("repository_url".to_string(), repo.url.clone());
        }

        Event {
            id: event_id(
                &change.repo_name,
                &change.branch_name,
                &change.new_commit,
                change.timestamp,
            ),
            kind: EventKind::from_change(change.change_type),
            repository: change.repo_name.clone(),
            branch: change.branch_name.clone(),
            commit_sha: change.new_commit.clone(),
            prev_commit: change.old_commit.clone(),
            provider: repo.provider.to_string(),
            created_at: change.timestamp,
            status: EventStatus::Pending,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Provider;
    use crate::config::tests::repo_config;
    use time::macros::datetime;

    fn change(branch: &str, change_type: ChangeType, at: OffsetDateTime) -> BranchChange {
        let (old, new) = match change_type {
            ChangeType::New => ("", "sha_new"),
            ChangeType::Updated => ("sha_old", "sha_new"),
            ChangeType::Deleted => ("sha_old", ""),
        };
        BranchChange {
            repo_name: "app".to_string(),
            branch_name: branch.to_string(),
            old_commit: old.to_string(),
            new_commit: new.to_string(),
            change_type,
            timestamp: at,
            protected: false,
        }
    }

    #[test]
    fn test_event_id_is_deterministic() {
        let at = datetime!(2024-06-01 12:00:00 UTC);
        let a = event_id("app", "main", "sha_a", at);
        let b = event_id("app", "main", "sha_a", at);
        assert_eq!(a, b);
        assert!(a.starts_with("event_"));
        assert_eq!(a.len(), "event_".len() + 16);
    }

    #[test]
    fn test_event_id_varies_with_every_input() {
        let at = datetime!(2024-06-01 12:00:00 UTC);
        let base = event_id("app", "main", "sha_a", at);
        assert_ne!(base, event_id("other", "main", "sha_a", at));
        assert_ne!(base, event_id("app", "dev", "sha_a", at));
        assert_ne!(base, event_id("app", "main", "sha_b", at));
        assert_ne!(
            base,
            event_id("app", "main", "sha_a", at + time::Duration::seconds(1))
        );
    }

    #[test]
    fn test_subsecond_timestamps_share_an_id() {
        let at = datetime!(2024-06-01 12:00:00 UTC);
        let later = at + time::Duration::milliseconds(400);
        assert_eq!(
            event_id("app", "main", "sha_a", at),
            event_id("app", "main", "sha_a", later)
        );
    }

    #[test]
    fn test_generate_maps_kinds_and_metadata() {
        let repo = repo_config("app", "https://github.com/org/app", Provider::Github);
        let generator = EventGenerator::new("gitsentry");
        let at = datetime!(2024-06-01 12:00:00 UTC);
        let changes = vec![
            change("main", ChangeType::New, at),
            change("dev", ChangeType::Updated, at),
            change("old", ChangeType::Deleted, at),
        ];

        let events = generator.generate(&repo, &changes);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::BranchCreated);
        assert_eq!(events[1].kind, EventKind::BranchUpdated);
        assert_eq!(events[2].kind, EventKind::BranchDeleted);
        assert!(events.iter().all(|e| e.status == EventStatus::Pending));

        let metadata = &events[1].metadata;
        assert_eq!(metadata["provider"], "github");
        assert_eq!(metadata["change_type"], "updated");
        assert_eq!(metadata["commit_sha"], "sha_new");
        assert_eq!(metadata["previous_commit"], "sha_old");
        assert_eq!(metadata["repository_url"], "https://github.com/org/app");
        assert_eq!(metadata["source"], "gitsentry");
    }

    #[test]
    fn test_repository_url_omitted_when_empty() {
        let repo = repo_config("app", "", Provider::Github);
        let generator = EventGenerator::new("gitsentry");
        let events = generator.generate(
            &repo,
            &[change("main", ChangeType::New, OffsetDateTime::now_utc())],
        );
        assert!(!events[0].metadata.contains_key("repository_url"));
    }

    #[test]
    fn test_filter_by_change_type() {
        let repo = repo_config("app", "https://github.com/org/app", Provider::Github);
        let at = OffsetDateTime::now_utc();
        let changes = vec![
            change("main", ChangeType::New, at),
            change("dev", ChangeType::Deleted, at),
        ];

        let include_only = EventGenerator::new("gitsentry").with_filter(EventFilter {
            include_types: vec![ChangeType::New],
            ..EventFilter::default()
        });
        assert_eq!(include_only.generate(&repo, &changes).len(), 1);

        let exclude_deleted = EventGenerator::new("gitsentry").with_filter(EventFilter {
            exclude_types: vec![ChangeType::Deleted],
            ..EventFilter::default()
        });
        let events = exclude_deleted.generate(&repo, &changes);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::BranchCreated);
    }

    #[test]
    fn test_filter_protected_and_min_age() {
        let repo = repo_config("app", "https://github.com/org/app", Provider::Github);
        let at = OffsetDateTime::now_utc();
        let mut protected = change("main", ChangeType::Updated, at - time::Duration::minutes(5));
        protected.protected = true;
        let fresh = change("dev", ChangeType::Updated, at);

        let generator = EventGenerator::new("gitsentry").with_filter(EventFilter {
            protected_only: true,
            min_age: Some(Duration::from_secs(60)),
            ..EventFilter::default()
        });
        let events = generator.generate(&repo, &[protected, fresh]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].branch, "main");
    }

    #[test]
    fn test_event_serialises_with_wire_kind_names() {
        let repo = repo_config("app", "https://github.com/org/app", Provider::Github);
        let generator = EventGenerator::new("gitsentry");
        let events = generator.generate(
            &repo,
            &[change("main", ChangeType::New, datetime!(2024-06-01 12:00:00 UTC))],
        );
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["kind"], "branch.created");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["created_at"], "2024-06-01T12:00:00Z");
    }
}
