//! Batch ZIP export
//!
//! Finds every `batch_<batchId>` folder under the date folders of the results
//! root and writes their files into `results/batch_<batchId>_<timestamp>.zip`,
//! with entry names relative to the results root. A failed export never
//! leaves a partial archive behind.

use super::{validate_id, StorageManager};
use aoi_common::{time, Error, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Archive file name prefix; also used to recognise archives during cleanup
const ARCHIVE_PREFIX: &str = "batch_";

/// Whether `name` looks like an archive produced by [`StorageManager::build_archive`]
pub fn is_archive_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(".zip")
}

impl StorageManager {
    /// Bundle all artifacts of a batch into a ZIP; returns the archive path
    pub async fn build_archive(&self, batch_id: &str) -> Result<PathBuf> {
        validate_id(batch_id)?;

        let result_dir = self.result_dir().to_path_buf();
        let batch_id = batch_id.to_string();

        tokio::task::spawn_blocking(move || build_archive_blocking(&result_dir, &batch_id))
            .await
            .map_err(|e| Error::Internal(format!("archive task failed: {}", e)))?
    }
}

fn build_archive_blocking(result_dir: &Path, batch_id: &str) -> Result<PathBuf> {
    let folders = find_batch_folders(result_dir, batch_id);
    if folders.is_empty() {
        return Err(Error::NotFound(format!("results for batch {}", batch_id)));
    }

    let archive_path = result_dir.join(format!(
        "{}{}_{}.zip",
        ARCHIVE_PREFIX,
        batch_id,
        time::file_timestamp(&time::local_now())
    ));

    match write_archive(&archive_path, result_dir, &folders) {
        Ok(entries) => {
            info!(
                batch_id,
                entries,
                archive = %archive_path.display(),
                "Created batch archive"
            );
            Ok(archive_path)
        }
        Err(e) => {
            if archive_path.exists() {
                if let Err(remove_err) = std::fs::remove_file(&archive_path) {
                    warn!(
                        archive = %archive_path.display(),
                        error = %remove_err,
                        "Failed to remove partial archive"
                    );
                }
            }
            Err(e)
        }
    }
}

/// `results/<date>/batch_<id>` folders, sorted for stable archive order
fn find_batch_folders(result_dir: &Path, batch_id: &str) -> Vec<PathBuf> {
    let folder_name = format!("batch_{}", batch_id);
    let mut folders: Vec<PathBuf> = WalkDir::new(result_dir)
        .follow_links(false)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.file_name().to_string_lossy() == folder_name)
        .map(|e| e.into_path())
        .collect();
    folders.sort();
    folders
}

/// Write every file under `folders` into a new archive; returns the entry count
fn write_archive(archive_path: &Path, result_dir: &Path, folders: &[PathBuf]) -> Result<usize> {
    let file = File::create(archive_path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut entries = 0usize;

    for folder in folders {
        for entry in WalkDir::new(folder)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::Storage(format!("walk {}: {}", folder.display(), e)))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(result_dir)
                .map_err(|e| Error::Internal(format!("archive entry outside results root: {}", e)))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            zip.start_file(name, options).map_err(zip_error)?;
            let mut source = File::open(entry.path())?;
            std::io::copy(&mut source, &mut zip)?;
            entries += 1;
        }
    }

    let mut writer = zip.finish().map_err(zip_error)?;
    writer.flush()?;
    Ok(entries)
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::Storage(format!("ZIP write failed: {}", e))
}
