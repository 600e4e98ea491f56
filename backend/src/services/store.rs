use std::collections::HashSet;

use chrono::Utc;
use log::info;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{Channel, EnsureOutcome, Topic, VideoRecord};

/// SQLite keeps a single writer; a larger pool only queues behind it.
const MAX_CONNECTIONS: u32 = 1;

/// Existence checks are chunked well below SQLite's bind-parameter cap.
const IN_CHUNK: usize = 500;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                item_count INTEGER NOT NULL DEFAULT 0,
                latest_item_url TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS videos (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                duration TEXT NOT NULL,
                broadcast TEXT NOT NULL,
                scheduled_start_time TEXT,
                created_at TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topics (
                name TEXT PRIMARY KEY,
                mention_id TEXT NOT NULL,
                webhook_url TEXT NOT NULL,
                include_keywords TEXT NOT NULL DEFAULT '[]',
                exclude_keywords TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscribers (
                token TEXT PRIMARY KEY,
                song INTEGER NOT NULL DEFAULT 0,
                info INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All watched channels with their last-known playlist snapshots.
    pub async fn channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query("SELECT id, name, item_count, latest_item_url FROM channels")
            .fetch_all(&self.pool)
            .await?;

        let mut channels = Vec::with_capacity(rows.len());
        for row in rows {
            channels.push(Channel {
                id: row.try_get("id").map_err(Error::Db)?,
                name: row.try_get("name").map_err(Error::Db)?,
                item_count: row.try_get("item_count").map_err(Error::Db)?,
                latest_item_url: row.try_get("latest_item_url").map_err(Error::Db)?,
            });
        }
        Ok(channels)
    }

    /// Dedup filter: the subset of `ids` with no persisted video record,
    /// in input order. Safe to call any number of times.
    pub async fn filter_unseen(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        for chunk in ids.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("SELECT id FROM videos WHERE id IN ({placeholders})");
            let mut query = sqlx::query_scalar::<_, String>(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for id in query.fetch_all(&self.pool).await? {
                seen.insert(id);
            }
        }

        Ok(ids
            .iter()
            .filter(|id| !seen.contains(id.as_str()))
            .cloned()
            .collect())
    }

    /// One transaction advancing the changed playlist snapshots and
    /// appending the run's new video records. Either both land or
    /// neither does, so a later run can never see a half-applied state.
    /// Re-inserting an already-known video is ignored, never an error.
    pub async fn apply_run_update(
        &self,
        changed: &[Channel],
        videos: &[VideoRecord],
    ) -> Result<(u64, u64)> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for channel in changed {
            sqlx::query(
                "UPDATE channels SET item_count = ?, latest_item_url = ?, updated_at = ? WHERE id = ?",
            )
            .bind(channel.item_count)
            .bind(&channel.latest_item_url)
            .bind(now.to_rfc3339())
            .bind(&channel.id)
            .execute(&mut *tx)
            .await?;
        }

        let mut created = 0u64;
        let mut existing = 0u64;
        for video in videos {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO videos
                    (id, title, duration, broadcast, scheduled_start_time, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&video.id)
            .bind(&video.title)
            .bind(&video.duration)
            .bind(video.broadcast.as_str())
            .bind(video.scheduled_start_time.map(|t| t.to_rfc3339()))
            .bind(video.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            match ensure_outcome(result.rows_affected()) {
                EnsureOutcome::Created => created += 1,
                EnsureOutcome::AlreadyExists => existing += 1,
            }
        }

        tx.commit().await?;

        if existing > 0 {
            info!("{existing} video record(s) already existed, left untouched");
        }
        Ok((created, existing))
    }

    /// Registered topic rules. Owned by the external registry; read-only
    /// here.
    pub async fn topics(&self) -> Result<Vec<Topic>> {
        let rows = sqlx::query(
            "SELECT name, mention_id, webhook_url, include_keywords, exclude_keywords FROM topics",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut topics = Vec::with_capacity(rows.len());
        for row in rows {
            let include_raw: String = row.try_get("include_keywords").map_err(Error::Db)?;
            let exclude_raw: String = row.try_get("exclude_keywords").map_err(Error::Db)?;
            topics.push(Topic {
                name: row.try_get("name").map_err(Error::Db)?,
                mention_id: row.try_get("mention_id").map_err(Error::Db)?,
                webhook_url: row.try_get("webhook_url").map_err(Error::Db)?,
                include: serde_json::from_str(&include_raw)
                    .map_err(|e| Error::Malformed(format!("topic include keywords: {e}")))?,
                exclude: serde_json::from_str(&exclude_raw)
                    .map_err(|e| Error::Malformed(format!("topic exclude keywords: {e}")))?,
            });
        }
        Ok(topics)
    }

    /// Push tokens of subscribers who opted into song notifications.
    pub async fn song_tokens(&self) -> Result<Vec<String>> {
        let tokens = sqlx::query_scalar("SELECT token FROM subscribers WHERE song = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(tokens)
    }

    #[cfg(test)]
    pub(crate) async fn seed_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query("INSERT INTO channels (id, name, item_count, latest_item_url) VALUES (?, ?, ?, ?)")
            .bind(&channel.id)
            .bind(&channel.name)
            .bind(channel.item_count)
            .bind(&channel.latest_item_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn seed_topic(&self, topic: &Topic) -> Result<()> {
        sqlx::query(
            "INSERT INTO topics (name, mention_id, webhook_url, include_keywords, exclude_keywords) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&topic.name)
        .bind(&topic.mention_id)
        .bind(&topic.webhook_url)
        .bind(serde_json::to_string(&topic.include).expect("serializable"))
        .bind(serde_json::to_string(&topic.exclude).expect("serializable"))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn seed_subscriber(&self, token: &str, song: bool) -> Result<()> {
        sqlx::query("INSERT INTO subscribers (token, song, info) VALUES (?, ?, 0)")
            .bind(token)
            .bind(song as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn ensure_outcome(rows_affected: u64) -> EnsureOutcome {
    if rows_affected == 0 {
        EnsureOutcome::AlreadyExists
    } else {
        EnsureOutcome::Created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BroadcastState;

    async fn memory_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn record(id: &str) -> VideoRecord {
        VideoRecord {
            id: id.to_string(),
            title: format!("video {id}"),
            duration: "PT3M10S".to_string(),
            broadcast: BroadcastState::Upcoming,
            scheduled_start_time: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn filter_unseen_returns_only_unknown_ids() {
        let store = memory_store().await;
        store.apply_run_update(&[], &[record("a")]).await.unwrap();

        let unseen = store
            .filter_unseen(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(unseen, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn filter_unseen_is_idempotent() {
        let store = memory_store().await;
        let ids = vec!["x".to_string(), "y".to_string()];
        let first = store.filter_unseen(&ids).await.unwrap();
        let second = store.filter_unseen(&ids).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn reapplying_overlapping_videos_keeps_one_record_each() {
        let store = memory_store().await;

        let (created, existing) = store
            .apply_run_update(&[], &[record("a"), record("b")])
            .await
            .unwrap();
        assert_eq!((created, existing), (2, 0));

        let (created, existing) = store
            .apply_run_update(&[], &[record("b"), record("c")])
            .await
            .unwrap();
        assert_eq!((created, existing), (1, 1));

        let unseen = store
            .filter_unseen(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert!(unseen.is_empty());
    }

    #[tokio::test]
    async fn duplicate_insert_does_not_overwrite_the_first_record() {
        let store = memory_store().await;

        let mut original = record("a");
        original.title = "original title".to_string();
        store.apply_run_update(&[], &[original]).await.unwrap();

        let mut duplicate = record("a");
        duplicate.title = "rewritten title".to_string();
        store.apply_run_update(&[], &[duplicate]).await.unwrap();

        let title: String = sqlx::query_scalar("SELECT title FROM videos WHERE id = 'a'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(title, "original title");
    }

    #[tokio::test]
    async fn snapshot_update_and_inserts_commit_together() {
        let store = memory_store().await;
        let channel = Channel {
            id: "UCchan".to_string(),
            name: "chan".to_string(),
            item_count: 3,
            latest_item_url: "old".to_string(),
        };
        store.seed_channel(&channel).await.unwrap();

        let advanced = Channel {
            item_count: 5,
            latest_item_url: "new".to_string(),
            ..channel
        };
        store
            .apply_run_update(&[advanced], &[record("v1")])
            .await
            .unwrap();

        let channels = store.channels().await.unwrap();
        assert_eq!(channels[0].item_count, 5);
        assert_eq!(channels[0].latest_item_url, "new");
        assert!(store
            .filter_unseen(&["v1".to_string()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn topics_round_trip_keyword_arrays() {
        let store = memory_store().await;
        let topic = Topic {
            name: "3d-debut".to_string(),
            mention_id: "123456789".to_string(),
            webhook_url: "https://example.com/hook".to_string(),
            include: vec!["3D".to_string(), "debut".to_string()],
            exclude: vec!["rebroadcast".to_string()],
        };
        store.seed_topic(&topic).await.unwrap();

        let topics = store.topics().await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].include, topic.include);
        assert_eq!(topics[0].exclude, topic.exclude);
    }

    #[tokio::test]
    async fn song_tokens_only_returns_opted_in_subscribers() {
        let store = memory_store().await;
        store.seed_subscriber("tok-song", true).await.unwrap();
        store.seed_subscriber("tok-other", false).await.unwrap();

        let tokens = store.song_tokens().await.unwrap();
        assert_eq!(tokens, vec!["tok-song".to_string()]);
    }
}
