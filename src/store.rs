use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StreamContainer {
    pub stream_key: String,
    pub title: String,
    pub video_path: String,
    pub stream_url: String,
    pub is_streaming: i64,
    pub schedule_duration: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub stream_key: String,
    pub title: String,
    pub video_path: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StreamStore {
    pool: SqlitePool,
}

impl StreamStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS stream_containers (
                stream_key TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                video_path TEXT NOT NULL,
                stream_url TEXT NOT NULL,
                is_streaming INTEGER NOT NULL DEFAULT 0,
                schedule_duration INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS stream_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_key TEXT NOT NULL,
                title TEXT NOT NULL,
                video_path TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_start(
        &self,
        stream_key: &str,
        title: &str,
        video_path: &str,
        stream_url: &str,
        schedule_duration: u64,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO stream_containers
               (stream_key, title, video_path, stream_url, is_streaming, schedule_duration, created_at, updated_at)
               VALUES (?, ?, ?, ?, 1, ?, ?, ?)
               ON CONFLICT(stream_key) DO UPDATE SET
                 title = excluded.title,
                 video_path = excluded.video_path,
                 stream_url = excluded.stream_url,
                 is_streaming = 1,
                 schedule_duration = excluded.schedule_duration,
                 updated_at = excluded.updated_at"#,
        )
        .bind(stream_key)
        .bind(title)
        .bind(video_path)
        .bind(stream_url)
        .bind(schedule_duration as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_stop(&self, stream_key: &str, reason: &str) -> anyhow::Result<bool> {
        let rows_affected = sqlx::query(
            r#"UPDATE stream_containers SET is_streaming = 0, updated_at = ?
               WHERE stream_key = ? AND is_streaming = 1"#,
        )
        .bind(Utc::now())
        .bind(stream_key)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Ok(false);
        }

        let container: Option<StreamContainer> =
            sqlx::query_as("SELECT * FROM stream_containers WHERE stream_key = ?")
                .bind(stream_key)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(container) = container {
            sqlx::query(
                r#"INSERT INTO stream_history (stream_key, title, video_path, reason, created_at)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(stream_key)
            .bind(&container.title)
            .bind(&container.video_path)
            .bind(reason)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }

        Ok(true)
    }

    pub async fn record_crash(&self, stream_key: &str) -> anyhow::Result<bool> {
        self.record_stop(stream_key, "crash").await
    }

    pub async fn active_containers(&self) -> anyhow::Result<Vec<StreamContainer>> {
        let containers: Vec<StreamContainer> = sqlx::query_as(
            "SELECT * FROM stream_containers WHERE is_streaming = 1 ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(containers)
    }

    pub async fn history(&self) -> anyhow::Result<Vec<HistoryEntry>> {
        let entries: Vec<HistoryEntry> =
            sqlx::query_as("SELECT * FROM stream_history ORDER BY created_at DESC, id DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(entries)
    }

    pub async fn delete_history(&self, id: i64) -> anyhow::Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM stream_history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }

    pub async fn reconcile_stale(&self) -> anyhow::Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE stream_containers SET is_streaming = 0, updated_at = ? WHERE is_streaming = 1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) async fn memory_store() -> StreamStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = StreamStore::from_pool(pool);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn record_start_marks_container_streaming() {
        let store = memory_store().await;
        store
            .record_start("abc", "Test", "demo.mp4", "rtmp://localhost/live", 60)
            .await
            .unwrap();

        let active = store.active_containers().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].stream_key, "abc");
        assert_eq!(active[0].is_streaming, 1);
        assert_eq!(active[0].schedule_duration, 60);
    }

    #[tokio::test]
    async fn record_start_upserts_existing_key() {
        let store = memory_store().await;
        store
            .record_start("abc", "First", "a.mp4", "rtmp://x/live", 10)
            .await
            .unwrap();
        store.record_stop("abc", "requested").await.unwrap();
        store
            .record_start("abc", "Second", "b.mp4", "rtmp://x/live", 20)
            .await
            .unwrap();

        let active = store.active_containers().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, "Second");
        assert_eq!(active[0].video_path, "b.mp4");
    }

    #[tokio::test]
    async fn record_stop_is_idempotent_and_appends_once() {
        let store = memory_store().await;
        store
            .record_start("abc", "Test", "demo.mp4", "rtmp://x/live", 10)
            .await
            .unwrap();

        assert!(store.record_stop("abc", "requested").await.unwrap());
        assert!(!store.record_stop("abc", "requested").await.unwrap());
        assert!(!store.record_crash("abc").await.unwrap());

        let history = store.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "requested");
        assert!(store.active_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_crash_writes_crash_reason() {
        let store = memory_store().await;
        store
            .record_start("abc", "Test", "demo.mp4", "rtmp://x/live", 10)
            .await
            .unwrap();
        assert!(store.record_crash("abc").await.unwrap());

        let history = store.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "crash");
    }

    #[tokio::test]
    async fn reconcile_flips_stale_flags() {
        let store = memory_store().await;
        store
            .record_start("a", "A", "a.mp4", "rtmp://x/live", 10)
            .await
            .unwrap();
        store
            .record_start("b", "B", "b.mp4", "rtmp://x/live", 10)
            .await
            .unwrap();

        assert_eq!(store.reconcile_stale().await.unwrap(), 2);
        assert!(store.active_containers().await.unwrap().is_empty());
        assert!(store.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_history_removes_entry() {
        let store = memory_store().await;
        store
            .record_start("abc", "Test", "demo.mp4", "rtmp://x/live", 10)
            .await
            .unwrap();
        store.record_stop("abc", "requested").await.unwrap();

        let history = store.history().await.unwrap();
        assert!(store.delete_history(history[0].id).await.unwrap());
        assert!(!store.delete_history(history[0].id).await.unwrap());
        assert!(store.history().await.unwrap().is_empty());
    }
}
