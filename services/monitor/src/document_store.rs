use crate::config::DatabaseConfig;
use crate::models::{
    clamp_limit, Collection, Coordinates, Detection, Message, NewDetection, Record,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors returned by the storage gateway
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Query on {collection} failed: {source}")]
    Query {
        collection: Collection,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    /// True when the failure means "no usable connection" rather than a bad query
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    fn from_sqlx(collection: Collection, error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(error.to_string())
            }
            source => StoreError::Query { collection, source },
        }
    }
}

/// Durable, queryable persistence for messages and detections.
///
/// Implementations assign the record id and timestamp themselves; callers
/// never supply either.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store a broker message and return its id
    async fn insert_message(&self, topic: &str, payload: &str) -> Result<Uuid, StoreError>;

    /// Store an uploaded detection and return its id
    async fn insert_detection(&self, detection: NewDetection) -> Result<Uuid, StoreError>;

    /// Most recent records of a collection, newest first, at most
    /// [`RECENT_LIMIT`](crate::models::RECENT_LIMIT) of them
    async fn find_recent(
        &self,
        collection: Collection,
        limit: i64,
    ) -> Result<Vec<Record>, StoreError>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Timestamp assigned to every record at insertion.
///
/// Truncated to microseconds so the value handed back matches what Postgres keeps.
pub fn server_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    topic: String,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            topic: row.topic,
            payload: String::from_utf8_lossy(&row.payload).into_owned(),
            timestamp: row.timestamp,
        }
    }
}

#[derive(Debug, FromRow)]
struct DetectionRow {
    id: Uuid,
    timestamp: DateTime<Utc>,
    image: String,
    location: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    confidence: f64,
}

impl From<DetectionRow> for Detection {
    fn from(row: DetectionRow) -> Self {
        let coordinates = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        };

        Self {
            id: row.id,
            timestamp: row.timestamp,
            image: row.image,
            location: row.location,
            coordinates,
            confidence: row.confidence,
        }
    }
}

/// PostgreSQL-backed document store.
///
/// Holds at most one pool. Until the first connection succeeds every
/// operation fails with [`StoreError::Unavailable`].
pub struct PgDocumentStore {
    config: DatabaseConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PgDocumentStore {
    /// Make one connection attempt. A failure is logged and leaves the
    /// store not ready; see [`PgDocumentStore::maintain_connection`].
    pub async fn connect(config: &DatabaseConfig) -> Self {
        let store = Self {
            config: config.clone(),
            pool: RwLock::new(None),
        };

        if let Err(e) = store.try_connect().await {
            error!(error = %e, "Failed to connect to PostgreSQL");
        }

        store
    }

    /// Wrap an existing pool (used by tests and tooling)
    pub fn from_pool(config: &DatabaseConfig, pool: PgPool) -> Self {
        Self {
            config: config.clone(),
            pool: RwLock::new(Some(pool)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pool.read().is_some()
    }

    async fn try_connect(&self) -> Result<()> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .min_connections(self.config.min_connections)
            .acquire_timeout(self.config.connect_timeout())
            .idle_timeout(Some(self.config.idle_timeout()))
            .connect(&self.config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        if self.config.run_migrations {
            run_migrations(&pool).await?;
        }

        *self.pool.write() = Some(pool);
        info!("Connected to PostgreSQL database");

        Ok(())
    }

    /// Retry the initial connection with jittered exponential backoff until it
    /// succeeds or `shutdown` fires. Returns immediately if already connected.
    ///
    /// Once a pool exists sqlx re-establishes individual connections itself.
    pub async fn maintain_connection(self: Arc<Self>, shutdown: CancellationToken) {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.reconnect_base_delay(),
            max_interval: self.config.reconnect_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;

        while !self.is_ready() {
            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| self.config.reconnect_max_delay());

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Database reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempts += 1;
            match self.try_connect().await {
                Ok(()) => {
                    info!(attempts = attempts, "Database connection established");
                }
                Err(e) => {
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Database connection failed, retrying"
                    );
                }
            }
        }
    }

    /// Release the pool. Later calls fail with [`StoreError::Unavailable`].
    pub async fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Database pool closed");
        }
    }

    fn pool(&self) -> Result<PgPool, StoreError> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| StoreError::Unavailable("database connection not established".to_string()))
    }
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    info!("Database migrations completed");
    Ok(())
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    #[instrument(skip(self, payload), fields(payload_size = payload.len()))]
    async fn insert_message(&self, topic: &str, payload: &str) -> Result<Uuid, StoreError> {
        let pool = self.pool()?;
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO messages (id, topic, payload, timestamp)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(topic)
        .bind(payload.as_bytes())
        .bind(server_timestamp())
        .execute(&pool)
        .await
        .map_err(|e| StoreError::from_sqlx(Collection::Messages, e))?;

        debug!(message_id = %id, "Message inserted");
        metrics::counter!("monitor.messages.stored").increment(1);

        Ok(id)
    }

    #[instrument(skip(self, detection), fields(location = %detection.location))]
    async fn insert_detection(&self, detection: NewDetection) -> Result<Uuid, StoreError> {
        let pool = self.pool()?;
        let id = Uuid::new_v4();
        let (latitude, longitude) = match detection.coordinates {
            Some(c) => (Some(c.latitude), Some(c.longitude)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO detections (
                id, timestamp, image, location,
                latitude, longitude, confidence
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(id)
        .bind(server_timestamp())
        .bind(&detection.image)
        .bind(&detection.location)
        .bind(latitude)
        .bind(longitude)
        .bind(detection.confidence)
        .execute(&pool)
        .await
        .map_err(|e| StoreError::from_sqlx(Collection::Detections, e))?;

        debug!(detection_id = %id, "Detection inserted");
        metrics::counter!("monitor.detections.stored").increment(1);

        Ok(id)
    }

    #[instrument(skip(self))]
    async fn find_recent(
        &self,
        collection: Collection,
        limit: i64,
    ) -> Result<Vec<Record>, StoreError> {
        let pool = self.pool()?;
        let limit = clamp_limit(Some(limit));

        let records = match collection {
            Collection::Messages => sqlx::query_as::<_, MessageRow>(
                r#"
                SELECT id, topic, payload, timestamp
                FROM messages
                ORDER BY timestamp DESC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&pool)
            .await
            .map_err(|e| StoreError::from_sqlx(collection, e))?
            .into_iter()
            .map(|row| Record::Message(row.into()))
            .collect(),
            Collection::Detections => sqlx::query_as::<_, DetectionRow>(
                r#"
                SELECT id, timestamp, image, location,
                       latitude, longitude, confidence
                FROM detections
                ORDER BY timestamp DESC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&pool)
            .await
            .map_err(|e| StoreError::from_sqlx(collection, e))?
            .into_iter()
            .map(|row| Record::Detection(row.into()))
            .collect(),
        };

        Ok(records)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let pool = self.pool()?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(())
    }
}
