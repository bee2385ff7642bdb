//! Database initialization
//!
//! Opens (creating if missing) the SQLite database and brings the
//! Image → Class → Region schema up to date. Every statement is idempotent,
//! so this is safe to run on each start.

use crate::config::DatabaseConfig;
use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize database connection pool and create tables if needed
pub async fn init_database(config: &DatabaseConfig) -> Result<SqlitePool> {
    let db_path = &config.path;
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Foreign keys are per-connection in SQLite, so they go on the connect
    // options rather than a one-off PRAGMA against the pool.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_images_table(pool).await?;
    create_classes_table(pool).await?;
    create_regions_table(pool).await?;
    create_indexes(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

/// Liveness probe used by the `check` command
pub async fn check_connection(pool: &SqlitePool) -> Result<()> {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_images_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id TEXT PRIMARY KEY,
            image_height INTEGER NOT NULL CHECK (image_height > 0),
            image_width INTEGER NOT NULL CHECK (image_width > 0),
            processing_time_seconds REAL NOT NULL CHECK (processing_time_seconds >= 0),
            timestamp TEXT NOT NULL,
            input_image_path TEXT NOT NULL,
            result_image_1_path TEXT,
            result_image_2_path TEXT,
            result_image_3_path TEXT,
            batch_id TEXT,
            original_filename TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_classes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classes (
            id TEXT PRIMARY KEY,
            image_id TEXT NOT NULL REFERENCES images(id) ON DELETE CASCADE,
            category_id INTEGER NOT NULL CHECK (category_id BETWEEN 1 AND 4),
            category_name TEXT NOT NULL,
            total_regions INTEGER NOT NULL CHECK (total_regions >= 0),
            total_area_pixels INTEGER NOT NULL CHECK (total_area_pixels >= 0),
            UNIQUE (image_id, category_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_regions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS regions (
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL REFERENCES classes(id) ON DELETE CASCADE,
            image_id TEXT NOT NULL REFERENCES images(id) ON DELETE CASCADE,
            region_index INTEGER NOT NULL CHECK (region_index >= 1),
            centroid_x REAL NOT NULL,
            centroid_y REAL NOT NULL,
            bbox_x INTEGER NOT NULL,
            bbox_y INTEGER NOT NULL,
            bbox_width INTEGER NOT NULL CHECK (bbox_width > 0),
            bbox_height INTEGER NOT NULL CHECK (bbox_height > 0),
            area_pixels INTEGER NOT NULL CHECK (area_pixels > 0),
            perimeter REAL NOT NULL CHECK (perimeter > 0),
            major_axis REAL NOT NULL,
            minor_axis REAL NOT NULL,
            circularity REAL NOT NULL CHECK (circularity >= 0 AND circularity <= 1),
            aspect_ratio REAL NOT NULL,
            UNIQUE (class_id, region_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_indexes(pool: &SqlitePool) -> Result<()> {
    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_classes_image_category ON classes(image_id, category_id)",
        "CREATE INDEX IF NOT EXISTS idx_regions_image_class ON regions(image_id, class_id)",
        "CREATE INDEX IF NOT EXISTS idx_regions_class_index ON regions(class_id, region_index)",
        "CREATE INDEX IF NOT EXISTS idx_images_batch ON images(batch_id)",
        "CREATE INDEX IF NOT EXISTS idx_images_created ON images(created_at)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
