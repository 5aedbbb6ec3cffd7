//! PostgreSQL message store for production use.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 5)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 1)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Row};
use std::time::Duration;

use crate::types::{ChannelId, IdRange, MediaKind, Message, MessageId, NativeTopicId, ReplyEdge};
use super::MessageStore;

/// Schema for archived messages.
pub const MESSAGES_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS archive_messages (
    channel_id      BIGINT      NOT NULL,
    id              BIGINT      NOT NULL,
    author_id       BIGINT,
    sent_at         TIMESTAMPTZ NOT NULL,
    text            TEXT,
    media_kind      TEXT,
    reply_to_id     BIGINT,
    native_topic_id BIGINT,
    archived_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (channel_id, id)
);
CREATE INDEX IF NOT EXISTS archive_messages_reply_idx
    ON archive_messages (channel_id, reply_to_id) WHERE reply_to_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS archive_messages_topic_idx
    ON archive_messages (channel_id, native_topic_id) WHERE native_topic_id IS NOT NULL;
"#;

/// Schema for ids confirmed absent upstream.
pub const ABSENT_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS archive_absent_ids (
    channel_id  BIGINT      NOT NULL,
    id          BIGINT      NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (channel_id, id)
);
"#;

/// Configuration for PostgreSQL connection pool.
///
/// Writes are serialized per channel by the fetch sequencer, so the pool
/// stays small.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 5).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 1).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
}

impl PostgresConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/archive".to_string()),
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            min_connections: std::env::var("DB_MIN_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            connect_timeout_secs: std::env::var("DB_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            idle_timeout_secs: std::env::var("DB_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
            max_lifetime_secs: std::env::var("DB_MAX_LIFETIME_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1800),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// PostgreSQL message store.
pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    /// Create a new store with the given configuration.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            "Initializing PostgreSQL connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Create a store from environment variables.
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Create the archive tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), PostgresError> {
        // Plain string execution uses the simple protocol, which allows
        // several statements per call
        (&self.pool).execute(MESSAGES_TABLE_SCHEMA).await?;
        (&self.pool).execute(ABSENT_TABLE_SCHEMA).await?;
        Ok(())
    }

    /// Get the connection pool for health checks.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Get pool statistics for monitoring.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }

    /// Parse a message from a database row.
    fn parse_message_row(row: &sqlx::postgres::PgRow) -> Result<Message, sqlx::Error> {
        let channel_id: i64 = row.try_get("channel_id")?;
        let id: i64 = row.try_get("id")?;
        let author_id: Option<i64> = row.try_get("author_id")?;
        let sent_at: DateTime<Utc> = row.try_get("sent_at")?;
        let text: Option<String> = row.try_get("text")?;
        let media_kind: Option<String> = row.try_get("media_kind")?;
        let reply_to_id: Option<i64> = row.try_get("reply_to_id")?;
        let native_topic_id: Option<i64> = row.try_get("native_topic_id")?;

        Ok(Message {
            id: MessageId::new(id),
            channel_id: ChannelId::new(channel_id),
            author_id,
            timestamp: sent_at,
            text,
            media_kind: media_kind.and_then(|s| MediaKind::parse(&s)),
            reply_to_id: reply_to_id.map(MessageId::new),
            native_topic_id: native_topic_id.map(NativeTopicId::new),
        })
    }

    async fn insert_message<'e, E>(executor: E, message: &Message) -> Result<bool, sqlx::Error>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO archive_messages
                (channel_id, id, author_id, sent_at, text, media_kind, reply_to_id, native_topic_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (channel_id, id) DO NOTHING
            "#
        )
        .bind(message.channel_id.get())
        .bind(message.id.get())
        .bind(message.author_id)
        .bind(message.timestamp)
        .bind(message.text.as_deref())
        .bind(message.media_kind.as_ref().map(|m| m.to_string()))
        .bind(message.reply_to_id.map(|id| id.get()))
        .bind(message.native_topic_id.map(|id| id.get()))
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Current pool size.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum pool size.
    pub max: u32,
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A message in a batch belongs to another channel.
    #[error("Message {id} belongs to channel {actual}, not {expected}")]
    ChannelMismatch {
        /// Message id.
        id: MessageId,
        /// Channel the batch was committed for.
        expected: ChannelId,
        /// Channel carried by the message.
        actual: ChannelId,
    },
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    type Error = PostgresError;

    async fn put(&self, message: Message) -> Result<bool, Self::Error> {
        Ok(Self::insert_message(&self.pool, &message).await?)
    }

    async fn put_batch(&self, channel: ChannelId, messages: Vec<Message>) -> Result<usize, Self::Error> {
        if let Some(bad) = messages.iter().find(|m| m.channel_id != channel) {
            return Err(PostgresError::ChannelMismatch {
                id: bad.id,
                expected: channel,
                actual: bad.channel_id,
            });
        }

        // One transaction per page: a crash mid-page leaves no partial rows
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for message in &messages {
            if Self::insert_message(&mut *tx, message).await? {
                inserted += 1;
            }
        }
        tx.commit().await?;

        tracing::trace!(channel_id = %channel, inserted, "Committed message batch");
        Ok(inserted)
    }

    async fn get_ids(&self, channel: ChannelId) -> Result<Vec<MessageId>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM archive_messages
            WHERE channel_id = $1
            ORDER BY id
            "#
        )
        .bind(channel.get())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter()
            .map(|row| MessageId::new(row.get("id")))
            .collect())
    }

    async fn get_ids_in_range(&self, channel: ChannelId, range: IdRange) -> Result<Vec<MessageId>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM archive_messages
            WHERE channel_id = $1 AND id BETWEEN $2 AND $3
            ORDER BY id
            "#
        )
        .bind(channel.get())
        .bind(range.start.get())
        .bind(range.end.get())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter()
            .map(|row| MessageId::new(row.get("id")))
            .collect())
    }

    async fn get_id_bounds(&self, channel: ChannelId) -> Result<Option<(MessageId, MessageId)>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT MIN(id) AS min_id, MAX(id) AS max_id
            FROM archive_messages
            WHERE channel_id = $1
            "#
        )
        .bind(channel.get())
        .fetch_one(&self.pool)
        .await?;

        let min: Option<i64> = row.get("min_id");
        let max: Option<i64> = row.get("max_id");
        Ok(min.zip(max).map(|(min, max)| (MessageId::new(min), MessageId::new(max))))
    }

    async fn get(&self, channel: ChannelId, id: MessageId) -> Result<Option<Message>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT channel_id, id, author_id, sent_at, text, media_kind,
                   reply_to_id, native_topic_id
            FROM archive_messages
            WHERE channel_id = $1 AND id = $2
            "#
        )
        .bind(channel.get())
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(Self::parse_message_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_messages(&self, channel: ChannelId) -> Result<Vec<Message>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT channel_id, id, author_id, sent_at, text, media_kind,
                   reply_to_id, native_topic_id
            FROM archive_messages
            WHERE channel_id = $1
            ORDER BY id
            "#
        )
        .bind(channel.get())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(Self::parse_message_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(PostgresError::from)
    }

    async fn get_reply_edges(&self, channel: ChannelId) -> Result<Vec<ReplyEdge>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, reply_to_id
            FROM archive_messages
            WHERE channel_id = $1 AND reply_to_id IS NOT NULL
            ORDER BY id
            "#
        )
        .bind(channel.get())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter()
            .map(|row| {
                ReplyEdge::new(
                    MessageId::new(row.get("id")),
                    MessageId::new(row.get("reply_to_id")),
                )
            })
            .collect())
    }

    async fn mark_absent(&self, channel: ChannelId, ids: &[MessageId]) -> Result<(), Self::Error> {
        let raw: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        sqlx::query(
            r#"
            INSERT INTO archive_absent_ids (channel_id, id)
            SELECT $1, candidate
            FROM UNNEST($2::BIGINT[]) AS candidate
            WHERE NOT EXISTS (
                SELECT 1 FROM archive_messages m
                WHERE m.channel_id = $1 AND m.id = candidate
            )
            ON CONFLICT (channel_id, id) DO NOTHING
            "#
        )
        .bind(channel.get())
        .bind(&raw)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_absent_ids(&self, channel: ChannelId) -> Result<Vec<MessageId>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM archive_absent_ids
            WHERE channel_id = $1
            ORDER BY id
            "#
        )
        .bind(channel.get())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter()
            .map(|row| MessageId::new(row.get("id")))
            .collect())
    }

    async fn get_absent_ids_in_range(&self, channel: ChannelId, range: IdRange) -> Result<Vec<MessageId>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM archive_absent_ids
            WHERE channel_id = $1 AND id BETWEEN $2 AND $3
            ORDER BY id
            "#
        )
        .bind(channel.get())
        .bind(range.start.get())
        .bind(range.end.get())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter()
            .map(|row| MessageId::new(row.get("id")))
            .collect())
    }

    async fn list_channels(&self) -> Result<Vec<ChannelId>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT channel_id FROM archive_messages
            ORDER BY channel_id
            "#
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter()
            .map(|row| ChannelId::new(row.get("channel_id")))
            .collect())
    }
}
