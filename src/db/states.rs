use async_trait::async_trait;
use time::OffsetDateTime;

/// One persisted snapshot entry: the last-observed commit for a
/// `(repository, branch)` pair. The primary key guarantees at most one row
/// per pair.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RepoState {
    pub repo_name: String,
    pub branch_name: String,
    pub commit_sha: String,
    pub protected: bool,
    pub last_checked: OffsetDateTime,
}

/// Snapshot store seam between the change detector and the database.
///
/// The store provides its own atomicity per row; callers never hold
/// cross-repository locks around it.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn initialize(&self) -> Result<(), sqlx::Error>;

    /// Every snapshot entry for one repository.
    async fn get_repo_states(&self, repo_name: &str) -> Result<Vec<RepoState>, sqlx::Error>;

    /// Insert or update a single entry.
    async fn upsert_repo_state(&self, state: &RepoState) -> Result<(), sqlx::Error>;

    /// Remove an entry; absent entries are not an error.
    async fn delete_repo_state(
        &self,
        repo_name: &str,
        branch_name: &str,
    ) -> Result<(), sqlx::Error>;

    async fn health_check(&self) -> Result<(), sqlx::Error>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_store;

    fn state(repo: &str, branch: &str, sha: &str) -> RepoState {
        RepoState {
            repo_name: repo.to_string(),
            branch_name: branch.to_string(),
            commit_sha: sha.to_string(),
            protected: false,
            last_checked: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get_roundtrip() {
        let store = test_store().await;
        store.upsert_repo_state(&state("app", "main", "sha_a")).await.unwrap();
        store.upsert_repo_state(&state("app", "dev", "sha_b")).await.unwrap();
        store.upsert_repo_state(&state("other", "main", "sha_c")).await.unwrap();

        let mut states = store.get_repo_states("app").await.unwrap();
        states.sort_by(|a, b| a.branch_name.cmp(&b.branch_name));
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].branch_name, "dev");
        assert_eq!(states[1].commit_sha, "sha_a");
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let store = test_store().await;
        store.upsert_repo_state(&state("app", "main", "sha_a")).await.unwrap();

        let mut updated = state("app", "main", "sha_a2");
        updated.protected = true;
        store.upsert_repo_state(&updated).await.unwrap();

        let states = store.get_repo_states("app").await.unwrap();
        assert_eq!(states.len(), 1, "one row per (repo, branch)");
        assert_eq!(states[0].commit_sha, "sha_a2");
        assert!(states[0].protected);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = test_store().await;
        store.upsert_repo_state(&state("app", "main", "sha_a")).await.unwrap();
        store.delete_repo_state("app", "main").await.unwrap();
        store.delete_repo_state("app", "main").await.unwrap();
        assert!(store.get_repo_states("app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_roundtrip() {
        let store = test_store().await;
        let entry = state("app", "main", "sha_a");
        store.upsert_repo_state(&entry).await.unwrap();
        let loaded = &store.get_repo_states("app").await.unwrap()[0];
        // SQLite stores subsecond precision; compare at second granularity.
        assert_eq!(
            loaded.last_checked.unix_timestamp(),
            entry.last_checked.unix_timestamp()
        );
    }
}
