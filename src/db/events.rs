//! Journal of generated events and their dispatch outcomes.

use serde::Serialize;
use time::OffsetDateTime;

use super::SqliteStore;
use crate::events::{Event, EventStatus};

/// One journalled event row. Metadata is stored as a JSON string.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: String,
    pub kind: String,
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    pub prev_commit: String,
    pub provider: String,
    pub status: String,
    pub metadata: String,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SqliteStore {
    /// Record a freshly generated event. A replayed cycle regenerates the
    /// same identifier, so conflicts keep the original row untouched.
    pub async fn record_event(&self, event: &Event) -> Result<(), sqlx::Error> {
        let metadata =
            serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string());
        sqlx::query(
            r#"
            INSERT INTO events
                (id, kind, repository, branch, commit_sha, prev_commit, provider, status, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(event.kind.as_str())
        .bind(&event.repository)
        .bind(&event.branch)
        .bind(&event.commit_sha)
        .bind(&event.prev_commit)
        .bind(&event.provider)
        .bind(event.status.as_str())
        .bind(metadata)
        .bind(event.created_at)
        .execute(self.pool())
        .await
        .map(|_| ())
    }

    /// Record the dispatch outcome against an event.
    pub async fn update_event_status(
        &self,
        id: &str,
        status: EventStatus,
        last_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE events SET status = ?, last_error = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(last_error)
            .bind(id)
            .execute(self.pool())
            .await
            .map(|_| ())
    }

    /// Most recent events, newest first.
    pub async fn recent_events(&self, limit: u32) -> Result<Vec<StoredEvent>, sqlx::Error> {
        sqlx::query_as::<_, StoredEvent>(
            "SELECT id, kind, repository, branch, commit_sha, prev_commit, provider,
                    status, metadata, last_error, created_at
             FROM events ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_store;
    use crate::events::EventKind;
    use std::collections::BTreeMap;

    fn event(id: &str, branch: &str) -> Event {
        let mut metadata = BTreeMap::new();
        metadata.insert("branch".to_string(), branch.to_string());
        Event {
            id: id.to_string(),
            kind: EventKind::BranchCreated,
            repository: "app".to_string(),
            branch: branch.to_string(),
            commit_sha: "sha_a".to_string(),
            prev_commit: String::new(),
            provider: "github".to_string(),
            created_at: OffsetDateTime::now_utc(),
            status: EventStatus::Pending,
            metadata,
        }
    }

    #[tokio::test]
    async fn test_record_and_list_events() {
        let store = test_store().await;
        store.record_event(&event("event_1", "main")).await.unwrap();
        store.record_event(&event("event_2", "dev")).await.unwrap();

        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.id == "event_1"));
        assert_eq!(events[0].status, "pending");
        assert!(events[0].metadata.contains("branch"));
    }

    #[tokio::test]
    async fn test_duplicate_id_keeps_original_row() {
        let store = test_store().await;
        store.record_event(&event("event_1", "main")).await.unwrap();
        store
            .update_event_status("event_1", EventStatus::Dispatched, None)
            .await
            .unwrap();

        // Same identifier from a replayed cycle.
        store.record_event(&event("event_1", "main")).await.unwrap();
        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "dispatched");
    }

    #[tokio::test]
    async fn test_status_update_records_error() {
        let store = test_store().await;
        store.record_event(&event("event_1", "main")).await.unwrap();
        store
            .update_event_status("event_1", EventStatus::Failed, Some("503 from sink"))
            .await
            .unwrap();

        let events = store.recent_events(1).await.unwrap();
        assert_eq!(events[0].status, "failed");
        assert_eq!(events[0].last_error.as_deref(), Some("503 from sink"));
    }
}
