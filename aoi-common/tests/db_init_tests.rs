//! Integration tests for database initialization and schema constraints

use aoi_common::config::DatabaseConfig;
use aoi_common::db::init::{check_connection, init_database, SCHEMA_VERSION};
use tempfile::TempDir;

fn db_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.path().join("nested").join("aoi.db"),
        max_connections: 2,
        busy_timeout_ms: 1000,
    }
}

async fn insert_image(pool: &sqlx::SqlitePool, id: &str) {
    sqlx::query(
        r#"
        INSERT INTO images (id, image_height, image_width, processing_time_seconds,
                            timestamp, input_image_path, created_at)
        VALUES (?, 10, 20, 0.5, '2024-01-01T00:00:00Z', '/in.png', '2024-01-01T00:00:00Z')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn test_database_created_with_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let config = db_config(&dir);

    let pool = init_database(&config).await.unwrap();
    assert!(config.path.exists(), "Database file was not created");
    check_connection(&pool).await.unwrap();

    let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test]
async fn test_initialization_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = db_config(&dir);

    let pool = init_database(&config).await.unwrap();
    insert_image(&pool, "img-1").await;
    pool.close().await;

    let pool = init_database(&config).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1, "Reopening must keep existing rows");
}

#[tokio::test]
async fn test_orphan_class_rejected_by_foreign_key() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&db_config(&dir)).await.unwrap();

    let result = sqlx::query(
        r#"
        INSERT INTO classes (id, image_id, category_id, category_name, total_regions, total_area_pixels)
        VALUES ('c1', 'missing-image', 1, 'PI_Particle', 0, 0)
        "#,
    )
    .execute(&pool)
    .await;

    assert!(result.is_err(), "Class without parent image must be rejected");
}

#[tokio::test]
async fn test_deleting_image_cascades() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&db_config(&dir)).await.unwrap();

    insert_image(&pool, "img-1").await;
    sqlx::query(
        r#"
        INSERT INTO classes (id, image_id, category_id, category_name, total_regions, total_area_pixels)
        VALUES ('c1', 'img-1', 2, 'PR_Peeling', 1, 4)
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        r#"
        INSERT INTO regions (id, class_id, image_id, region_index, centroid_x, centroid_y,
                             bbox_x, bbox_y, bbox_width, bbox_height, area_pixels, perimeter,
                             major_axis, minor_axis, circularity, aspect_ratio)
        VALUES ('r1', 'c1', 'img-1', 1, 1.5, 1.5, 1, 1, 2, 2, 4, 4.0, 2.0, 2.0, 1.0, 1.0)
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query("DELETE FROM images WHERE id = 'img-1'")
        .execute(&pool)
        .await
        .unwrap();

    let classes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM classes WHERE image_id = 'img-1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    let regions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM regions WHERE image_id = 'img-1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(classes, 0);
    assert_eq!(regions, 0);
}
