pub mod events;
pub mod states;

pub use states::{RepoState, StateStore};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

/// SQLite pool creation with retry logic.
///
/// Production: exponential backoff (1s -> 2s -> 4s... -> 30s cap), max 10
/// attempts. Development: fail fast (1 attempt).
pub async fn create_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let max_attempts: u32 = if cfg!(debug_assertions) { 1 } else { 10 };
    let initial_delay = Duration::from_secs(1);
    let max_delay = Duration::from_secs(30);

    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool_options = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10));

    let mut last_error = None;
    let mut delay = initial_delay;

    for attempt in 1..=max_attempts {
        match pool_options
            .clone()
            .connect_with(connect_options.clone())
            .await
        {
            Ok(pool) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Database connection established after retry");
                }
                return Ok(pool);
            }
            Err(e) => {
                if attempt < max_attempts {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Database connection failed, retrying..."
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap())
}

/// The embedded snapshot store: branch state per `(repository, branch)`
/// plus a journal of generated events.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`.
    pub async fn connect(path: &Path) -> Result<Self, sqlx::Error> {
        let pool = create_pool(path).await?;
        Ok(SqliteStore { pool })
    }

    /// A private in-memory database; one connection so every query sees
    /// the same data.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(SqliteStore { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn initialize(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repo_states (
                repo_name   TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                commit_sha  TEXT NOT NULL,
                protected   INTEGER NOT NULL DEFAULT 0,
                last_checked TEXT NOT NULL,
                PRIMARY KEY (repo_name, branch_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id          TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                repository  TEXT NOT NULL,
                branch      TEXT NOT NULL,
                commit_sha  TEXT NOT NULL,
                prev_commit TEXT NOT NULL DEFAULT '',
                provider    TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'pending',
                metadata    TEXT NOT NULL DEFAULT '{}',
                last_error  TEXT,
                created_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_repo_created
             ON events (repository, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_repo_states(&self, repo_name: &str) -> Result<Vec<RepoState>, sqlx::Error> {
        sqlx::query_as::<_, RepoState>(
            "SELECT repo_name, branch_name, commit_sha, protected, last_checked
             FROM repo_states WHERE repo_name = ?",
        )
        .bind(repo_name)
        .fetch_all(&self.pool)
        .await
    }

    async fn upsert_repo_state(&self, state: &RepoState) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO repo_states (repo_name, branch_name, commit_sha, protected, last_checked)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (repo_name, branch_name) DO UPDATE SET
                commit_sha = excluded.commit_sha,
                protected = excluded.protected,
                last_checked = excluded.last_checked
            "#,
        )
        .bind(&state.repo_name)
        .bind(&state.branch_name)
        .bind(&state.commit_sha)
        .bind(state.protected)
        .bind(state.last_checked)
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    async fn delete_repo_state(
        &self,
        repo_name: &str,
        branch_name: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM repo_states WHERE repo_name = ? AND branch_name = ?")
            .bind(repo_name)
            .bind(branch_name)
            .execute(&self.pool)
            .await
            .map(|_| ())
    }

    async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.map(|_| ())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
