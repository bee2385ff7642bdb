//! Storage and archival integration tests

mod helpers;

use aoi_agent::config::StorageSettings;
use aoi_agent::models::{ArtifactKind, Artifacts};
use aoi_agent::storage::{StorageManager, BATCH_SUMMARY_FILE};
use aoi_common::{time, Error};
use helpers::input_png;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn storage_in(root: &Path) -> StorageManager {
    StorageManager::new(&StorageSettings {
        upload_dir: root.join("uploads"),
        result_dir: root.join("results"),
        max_file_size: 1024 * 1024,
        allowed_extensions: vec!["png".to_string(), "jpg".to_string()],
    })
}

fn zip_entries(path: &Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_upload_validation() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(dir.path());
    let png = input_png(4, 4);

    assert_eq!(storage.validate_upload(&png, "panel 1.png").unwrap(), "panel_1.png");

    for (bytes, name) in [
        (png.as_slice(), "panel.gif"),
        (b"".as_slice(), "empty.png"),
        (b"definitely not an image".as_slice(), "fake.png"),
        (png.as_slice(), "noext"),
    ] {
        let err = storage.validate_upload(bytes, name).unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{}: {:?}", name, err);
    }

    let oversized = vec![0u8; 2 * 1024 * 1024];
    assert!(matches!(
        storage.validate_upload(&oversized, "big.png"),
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_upload_saved_under_date_folder() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(dir.path());
    storage.ensure_directories().await.unwrap();

    let path = storage.save_upload(&input_png(4, 4), "panel.png").await.unwrap();

    let date = time::date_folder(&time::local_now());
    assert!(path.starts_with(dir.path().join("uploads").join(&date)));
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("_panel.png"), "{}", name);
    assert_eq!(fs::read(&path).unwrap(), input_png(4, 4));
}

#[tokio::test]
async fn test_artifacts_written_with_kind_suffix() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(dir.path());
    let mut artifacts = Artifacts::default();
    artifacts.set(ArtifactKind::Mask, vec![1, 2, 3]);
    artifacts.set(ArtifactKind::Overlay, vec![4, 5]);

    let saved = storage.save_result_artifacts("img-1", &artifacts).await.unwrap();

    assert_eq!(saved.dir.file_name().unwrap(), "img-1");
    assert!(saved.combined.is_none());
    let mask = saved.get(ArtifactKind::Mask).unwrap();
    assert_eq!(mask.file_name().unwrap(), "img-1_mask.png");
    assert_eq!(fs::read(mask).unwrap(), vec![1, 2, 3]);

    storage.remove_artifacts(&saved.dir).await.unwrap();
    assert!(!saved.dir.exists());
    // Already gone
    storage.remove_artifacts(&saved.dir).await.unwrap();

    let outside = dir.path().join("elsewhere");
    assert!(matches!(
        storage.remove_artifacts(&outside).await,
        Err(Error::Security(_))
    ));
}

#[tokio::test]
async fn test_failed_artifact_write_leaves_no_partial_folder() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(dir.path());
    let batch_dir = storage.batch_dir("b1", &time::local_now());
    // A directory where the overlay file should go makes the second write fail
    fs::create_dir_all(batch_dir.join("img-1").join("img-1_overlay.png")).unwrap();
    let mut artifacts = Artifacts::default();
    artifacts.set(ArtifactKind::Mask, vec![1, 2, 3]);
    artifacts.set(ArtifactKind::Overlay, vec![4, 5]);

    let result = storage.save_batch_artifacts(&batch_dir, "img-1", &artifacts).await;

    assert!(result.is_err());
    assert!(!batch_dir.join("img-1").exists());
}

#[tokio::test]
async fn test_resolve_path_stays_inside_roots() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(dir.path());
    storage.ensure_directories().await.unwrap();
    fs::create_dir_all(dir.path().join("results/20240301/img")).unwrap();
    fs::write(dir.path().join("results/20240301/img/a.png"), b"x").unwrap();
    fs::write(dir.path().join("secret.txt"), b"s").unwrap();

    let resolved = storage.resolve_path("20240301/img/a.png").unwrap();
    assert_eq!(fs::read(resolved).unwrap(), b"x");

    // Target exists, but outside the roots
    assert!(matches!(
        storage.resolve_path("../secret.txt"),
        Err(Error::Security(_))
    ));
    assert!(matches!(
        storage.resolve_path("20240301/../../secret.txt"),
        Err(Error::Security(_))
    ));
    let absolute = dir.path().join("secret.txt");
    assert!(matches!(
        storage.resolve_path(&absolute.to_string_lossy()),
        Err(Error::Security(_))
    ));
    assert!(storage.resolve_path("20240301/img/missing.png").unwrap_err().is_not_found());
}

#[cfg(unix)]
#[tokio::test]
async fn test_resolve_path_rejects_symlink_escape() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(dir.path());
    storage.ensure_directories().await.unwrap();
    fs::write(dir.path().join("secret.txt"), b"s").unwrap();
    std::os::unix::fs::symlink(dir.path().join("secret.txt"), dir.path().join("results/link.txt"))
        .unwrap();

    assert!(matches!(storage.resolve_path("link.txt"), Err(Error::Security(_))));
}

#[tokio::test]
async fn test_cleanup_removes_old_date_folders_only() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let storage = storage_in(root);
    let today = time::date_folder(&time::local_now());

    fs::create_dir_all(root.join("uploads/20000101")).unwrap();
    fs::write(root.join("uploads/20000101/a.png"), b"x").unwrap();
    fs::create_dir_all(root.join("results/20000101/img")).unwrap();
    fs::write(root.join("results/20000101/img/img_mask.png"), b"x").unwrap();
    fs::write(root.join("results/20000101/img/img_overlay.png"), b"x").unwrap();
    fs::create_dir_all(root.join("results/archive_notes")).unwrap();
    fs::write(root.join("results/archive_notes/keep.txt"), b"x").unwrap();
    fs::create_dir_all(root.join("results").join(&today)).unwrap();
    fs::write(root.join("results").join(&today).join("new.png"), b"x").unwrap();
    fs::write(root.join("results/batch_fresh_20990101_000000.zip"), b"zip").unwrap();

    let stats = storage.cleanup_older_than(1).await.unwrap();

    assert_eq!(stats.folders_removed, 2);
    assert_eq!(stats.files_removed, 3);
    assert!(!root.join("uploads/20000101").exists());
    assert!(!root.join("results/20000101").exists());
    assert!(root.join("results/archive_notes/keep.txt").exists());
    assert!(root.join("results").join(&today).join("new.png").exists());
    assert!(root.join("results/batch_fresh_20990101_000000.zip").exists());
}

#[tokio::test]
async fn test_archive_unknown_batch_is_not_found_and_leaves_no_zip() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(dir.path());
    storage.ensure_directories().await.unwrap();
    fs::create_dir_all(dir.path().join("results/20240301/batch_other/img")).unwrap();

    let err = storage.build_archive("missing").await.unwrap_err();

    assert!(err.is_not_found(), "got {:?}", err);
    let zips = fs::read_dir(dir.path().join("results"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "zip").unwrap_or(false))
        .count();
    assert_eq!(zips, 0);

    assert!(matches!(
        storage.build_archive("../x").await,
        Err(Error::Security(_))
    ));
}

#[tokio::test]
async fn test_archive_preserves_relative_structure() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(dir.path());
    let results = dir.path().join("results");
    for (date, image) in [("20240301", "img1"), ("20240302", "img2")] {
        let item = results.join(date).join("batch_b1").join(image);
        fs::create_dir_all(&item).unwrap();
        fs::write(item.join(format!("{}_mask.png", image)), b"m").unwrap();
    }
    fs::write(results.join("20240301/batch_b1").join(BATCH_SUMMARY_FILE), b"{}").unwrap();
    fs::create_dir_all(results.join("20240301/batch_b2/img3")).unwrap();
    fs::write(results.join("20240301/batch_b2/img3/img3_mask.png"), b"m").unwrap();

    let archive = storage.build_archive("b1").await.unwrap();

    assert_eq!(archive.parent().unwrap(), results);
    let name = archive.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("batch_b1_") && name.ends_with(".zip"), "{}", name);
    assert_eq!(
        zip_entries(&archive),
        vec![
            "20240301/batch_b1/batch_summary.json",
            "20240301/batch_b1/img1/img1_mask.png",
            "20240302/batch_b1/img2/img2_mask.png",
        ]
    );
}
