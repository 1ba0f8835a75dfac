use super::{ImageStore, StoreError, StoredImage};
use crate::config::DatabaseConfig;
use crate::validator::CapturedImage;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument, warn};

/// Earliest instant `TIMESTAMPTZ` accepts (4714-11-24 BC), in microseconds
/// since the Unix epoch. chrono's upper limit is already below Postgres', so
/// only the lower end needs its own check.
const PG_MIN_TIMESTAMP_MICROS: i64 = -210_866_803_200_000_000;

/// Values for the `image_metadata` columns, checked against what the columns
/// can hold before anything is written.
fn metadata_columns(image: &CapturedImage) -> Result<(DateTime<Utc>, i32, i32), StoreError> {
    let time = image
        .timestamp_micros()
        .filter(|micros| *micros >= PG_MIN_TIMESTAMP_MICROS)
        .and_then(DateTime::from_timestamp_micros)
        .ok_or_else(|| StoreError::out_of_range(image))?;

    let dimensions_error = || StoreError::DimensionsOutOfRange {
        width: image.width,
        height: image.height,
    };
    let width = i32::try_from(image.width).map_err(|_| dimensions_error())?;
    let height = i32::try_from(image.height).map_err(|_| dimensions_error())?;

    Ok((time, width, height))
}

/// An archived image read back together with its metadata row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RelationalEntry {
    /// Generated id of the `images` row
    pub image_id: i64,
    /// Raw image payload
    pub image: Vec<u8>,
    /// Capture time
    pub time: DateTime<Utc>,
    /// Image width
    pub width: i32,
    /// Image height
    pub height: i32,
}

/// Relational backend storing each image as two linked rows.
///
/// The image row is inserted first to obtain its id. If the metadata insert
/// then fails the image row stays behind without metadata; there is no
/// transaction around the pair.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store with its own connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert the raw payload and return the generated id
    async fn insert_image(&self, payload: &[u8]) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO images (image)
            VALUES ($1)
            RETURNING id
            "#,
        )
        .bind(payload)
        .fetch_one(&self.pool)
        .await
    }

    /// Insert the metadata row referencing an image
    async fn insert_metadata(
        &self,
        image_id: i64,
        time: DateTime<Utc>,
        width: i32,
        height: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO image_metadata (image_id, time, width, height)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(image_id)
        .bind(time)
        .bind(width)
        .bind(height)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read an image back with its metadata
    pub async fn fetch_entry(&self, image_id: i64) -> Result<Option<RelationalEntry>, StoreError> {
        let entry = sqlx::query_as::<_, RelationalEntry>(
            r#"
            SELECT i.id AS image_id, i.image, m.time, m.width, m.height
            FROM images i
            JOIN image_metadata m ON m.image_id = i.id
            WHERE i.id = $1
            "#,
        )
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl ImageStore for PostgresStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, image), fields(capture_s = image.capture_seconds, size_bytes = image.payload.len()))]
    async fn persist(&self, image: &CapturedImage) -> Result<StoredImage, StoreError> {
        // Column range problems are caught here; only database failures can
        // still leave an image row without metadata
        let (time, width, height) = metadata_columns(image)?;

        let image_id = match self.insert_image(&image.payload).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Image dropped");
                metrics::counter!("receiver.images.dropped").increment(1);
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .insert_metadata(image_id, time, width, height)
            .await
        {
            warn!(image_id, error = %e, "Failed to store metadata, image row left without metadata");
            metrics::counter!("receiver.images.orphaned").increment(1);
            return Err(e.into());
        }

        debug!(image_id, time = %time, "Image row stored");

        Ok(StoredImage::Row { image_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgConnectOptions;
    use bytes::Bytes;

    /// Connects when `RECEIVER_TEST_DATABASE_URL` is set, otherwise the test is skipped.
    async fn test_store() -> Option<PostgresStore> {
        let url = std::env::var("RECEIVER_TEST_DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("test database reachable");
        let store = PostgresStore::from_pool(pool);
        store.run_migrations().await.expect("migrations apply");
        Some(store)
    }

    fn image(seconds: i64, micros: i64, payload: &'static [u8]) -> CapturedImage {
        CapturedImage {
            capture_seconds: seconds,
            capture_micros: micros,
            width: 3280,
            height: 2464,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_persist_and_fetch() {
        let Some(store) = test_store().await else {
            return;
        };

        let stored = store
            .persist(&image(1589144404, 1234, b"postgres payload"))
            .await
            .unwrap();
        let StoredImage::Row { image_id } = stored else {
            panic!("expected a row, got {stored:?}");
        };

        let entry = store.fetch_entry(image_id).await.unwrap().unwrap();
        assert_eq!(entry.image, b"postgres payload");
        assert_eq!(entry.width, 3280);
        assert_eq!(entry.height, 2464);
        assert_eq!(entry.time.timestamp_micros(), 1_589_144_404_001_234);
    }

    #[tokio::test]
    async fn test_out_of_range_time_inserts_nothing() {
        let Some(store) = test_store().await else {
            return;
        };

        // Overflows i64 micros, and representable in chrono but before TIMESTAMPTZ
        for seconds in [i64::MAX, -300_000_000_000] {
            let err = store
                .persist(&image(seconds, 0, b"never stored"))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::TimestampOutOfRange { .. }));
        }

        let mut wide = image(1589144404, 0, b"never stored");
        wide.width = u32::MAX;
        let err = store.persist(&wide).await.unwrap_err();
        assert!(matches!(err, StoreError::DimensionsOutOfRange { .. }));

        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images WHERE image = $1")
            .bind(&b"never stored"[..])
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn test_metadata_failure_leaves_image_row() {
        let Ok(url) = std::env::var("RECEIVER_TEST_DATABASE_URL") else {
            return;
        };

        // Own schema so the extra constraint can't affect other tests
        let schema = format!("receiver_orphan_{}", std::process::id());
        let admin = PgPool::connect(&url).await.expect("test database reachable");
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
            .execute(&admin)
            .await
            .unwrap();
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .unwrap();

        let options = url
            .parse::<PgConnectOptions>()
            .unwrap()
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        let store = PostgresStore::from_pool(pool);
        store.run_migrations().await.expect("migrations apply");

        // Only the metadata table refuses width 13
        sqlx::query("ALTER TABLE image_metadata ADD CONSTRAINT refuse_width_13 CHECK (width <> 13)")
            .execute(store.pool())
            .await
            .unwrap();

        let mut refused = image(1589144404, 0, b"orphaned payload");
        refused.width = 13;
        let err = store.persist(&refused).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));

        let orphans: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT i.id
            FROM images i
            LEFT JOIN image_metadata m ON m.image_id = i.id
            WHERE m.image_id IS NULL
            "#,
        )
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(orphans.len(), 1);
        assert!(store.fetch_entry(orphans[0]).await.unwrap().is_none());

        let payload: Vec<u8> = sqlx::query_scalar("SELECT image FROM images WHERE id = $1")
            .bind(orphans[0])
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(payload, b"orphaned payload");

        // The same store keeps working for the next image
        let stored = store
            .persist(&image(1589144405, 0, b"next payload"))
            .await
            .unwrap();
        let StoredImage::Row { image_id } = stored else {
            panic!("expected a row, got {stored:?}");
        };
        let entry = store.fetch_entry(image_id).await.unwrap().unwrap();
        assert_eq!(entry.image, b"next payload");

        store.pool().close().await;
        sqlx::query(&format!("DROP SCHEMA {schema} CASCADE"))
            .execute(&admin)
            .await
            .unwrap();
    }

    #[test]
    fn test_metadata_columns_within_postgres_range() {
        let (time, width, height) = metadata_columns(&image(1589144404, 1234, b"x")).unwrap();
        assert_eq!(time.timestamp_micros(), 1_589_144_404_001_234);
        assert_eq!((width, height), (3280, 2464));

        // Earliest TIMESTAMPTZ value is accepted, one microsecond earlier is not
        let earliest = image(0, PG_MIN_TIMESTAMP_MICROS, b"x");
        let (time, _, _) = metadata_columns(&earliest).unwrap();
        assert_eq!(
            time.date_naive(),
            chrono::NaiveDate::from_ymd_opt(-4713, 11, 24).unwrap()
        );
        assert!(matches!(
            metadata_columns(&image(0, PG_MIN_TIMESTAMP_MICROS - 1, b"x")),
            Err(StoreError::TimestampOutOfRange { .. })
        ));

        // Year -7500 fits chrono but not the column
        assert!(matches!(
            metadata_columns(&image(-300_000_000_000, 0, b"x")),
            Err(StoreError::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn test_metadata_columns_reject_wide_dimensions() {
        let mut wide = image(1589144404, 0, b"x");
        wide.height = i32::MAX as u32 + 1;
        assert!(matches!(
            metadata_columns(&wide),
            Err(StoreError::DimensionsOutOfRange { width: 3280, height: 2_147_483_648 })
        ));

        wide.height = i32::MAX as u32;
        let (_, _, height) = metadata_columns(&wide).unwrap();
        assert_eq!(height, i32::MAX);
    }
}
