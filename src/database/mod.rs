use crate::assets::MigrationAssets;
use crate::config::DatabaseConfig;
use crate::errors::AppResult;
use crate::models::{NewStreamRecord, StreamRecord, StreamRecordUpdate};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Pool, Sqlite};

pub mod stream_records;

/// Durable storage for stream records.
///
/// The lifecycle manager only talks to storage through this trait so it
/// can be exercised against any backend; `Database` is the SQLite one.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, record: NewStreamRecord) -> AppResult<StreamRecord>;

    async fn update(&self, id: i64, update: StreamRecordUpdate) -> AppResult<()>;

    /// Returns `false` when no row had that id
    async fn delete(&self, id: i64) -> AppResult<bool>;

    async fn get(&self, id: i64) -> AppResult<Option<StreamRecord>>;

    /// Records flagged as streaming (scheduled or live)
    async fn query_active(&self) -> AppResult<Vec<StreamRecord>>;

    async fn query_all(&self) -> AppResult<Vec<StreamRecord>>;

    /// The active record holding `stream_key`, if any
    async fn find_by_key(&self, stream_key: &str) -> AppResult<Option<StreamRecord>>;
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub fn pool(&self) -> Pool<Sqlite> {
        self.pool.clone()
    }

    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        // In-memory databases have nothing to create
        if !config.url.contains(":memory:") && !Sqlite::database_exists(&config.url).await? {
            Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(10))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        self.run_embedded_migrations().await?;
        Ok(())
    }

    async fn run_embedded_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sqlx_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT NOT NULL,
                installed_on TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                success BOOLEAN NOT NULL,
                checksum BLOB NOT NULL,
                execution_time BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (name, content) in MigrationAssets::get_migrations() {
            // "001_stream_containers.sql" -> 1
            let version: i64 = name
                .split('_')
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("Migration {} has no numeric prefix", name))?;

            let existing = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM _sqlx_migrations WHERE version = ? AND success = true",
            )
            .bind(version)
            .fetch_one(&self.pool)
            .await?;

            if existing > 0 {
                continue;
            }

            let start = std::time::Instant::now();
            let mut transaction = self.pool.begin().await?;

            match sqlx::query(&content).execute(&mut *transaction).await {
                Ok(_) => {
                    let execution_time = start.elapsed().as_millis() as i64;
                    let checksum = Self::calculate_checksum(&content);

                    sqlx::query(
                        r#"
                        INSERT INTO _sqlx_migrations (version, description, success, checksum, execution_time)
                        VALUES (?, ?, true, ?, ?)
                        "#,
                    )
                    .bind(version)
                    .bind(&name)
                    .bind(&checksum)
                    .bind(execution_time)
                    .execute(&mut *transaction)
                    .await?;

                    transaction.commit().await?;
                    tracing::info!("Applied migration: {} ({}ms)", name, execution_time);
                }
                Err(e) => {
                    transaction.rollback().await?;
                    return Err(anyhow::anyhow!("Migration {} failed: {}", name, e));
                }
            }
        }

        Ok(())
    }

    fn calculate_checksum(content: &str) -> Vec<u8> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        hasher.finish().to_be_bytes().to_vec()
    }
}
