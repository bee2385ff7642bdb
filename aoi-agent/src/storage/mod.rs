//! Artifact storage
//!
//! Layout under the configured roots:
//!
//! ```text
//! uploads/<YYYYMMDD>/<YYYYMMDD_HHMMSS>_<token>_<name>
//! results/<YYYYMMDD>/<imageId>/<imageId>_<type>.png
//! results/<YYYYMMDD>/batch_<batchId>/<imageId>/<imageId>_<type>.png
//! results/<YYYYMMDD>/batch_<batchId>/batch_summary.json
//! results/batch_<batchId>_<YYYYMMDD_HHMMSS>.zip
//! ```

pub mod archive;

use crate::config::StorageSettings;
use crate::models::inference::{ArtifactKind, Artifacts};
use aoi_common::{time, uuid_utils, Error, Result};
use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Batch summary sidecar file name
pub const BATCH_SUMMARY_FILE: &str = "batch_summary.json";

/// Where one item's artifacts were written
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SavedArtifacts {
    pub dir: PathBuf,
    pub combined: Option<PathBuf>,
    pub mask: Option<PathBuf>,
    pub overlay: Option<PathBuf>,
}

impl SavedArtifacts {
    pub fn get(&self, kind: ArtifactKind) -> Option<&Path> {
        match kind {
            ArtifactKind::Combined => self.combined.as_deref(),
            ArtifactKind::Mask => self.mask.as_deref(),
            ArtifactKind::Overlay => self.overlay.as_deref(),
        }
    }
}

/// Outcome of a retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub folders_removed: u64,
    pub files_removed: u64,
}

/// Filesystem side of the pipeline: uploads, result artifacts, archives
#[derive(Debug, Clone)]
pub struct StorageManager {
    upload_dir: PathBuf,
    result_dir: PathBuf,
    max_file_size: u64,
    allowed_extensions: Vec<String>,
}

impl StorageManager {
    pub fn new(settings: &StorageSettings) -> Self {
        Self {
            upload_dir: settings.upload_dir.clone(),
            result_dir: settings.result_dir.clone(),
            max_file_size: settings.max_file_size,
            allowed_extensions: settings.allowed_extensions.clone(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    /// Create both storage roots if missing
    pub async fn ensure_directories(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        tokio::fs::create_dir_all(&self.result_dir).await?;
        Ok(())
    }

    /// Check name, extension, size and content of an upload
    ///
    /// Returns the sanitized file name.
    pub fn validate_upload(&self, bytes: &[u8], original_name: &str) -> Result<String> {
        let name = sanitize_filename(original_name)
            .ok_or_else(|| Error::Validation(format!("invalid file name '{}'", original_name)))?;

        let extension = Path::new(&name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !self.allowed_extensions.iter().any(|allowed| *allowed == extension) {
            return Err(Error::Validation(format!(
                "file type '.{}' not allowed (allowed: {})",
                extension,
                self.allowed_extensions.join(", ")
            )));
        }

        if bytes.is_empty() {
            return Err(Error::Validation(format!("'{}' is empty", original_name)));
        }
        if bytes.len() as u64 > self.max_file_size {
            return Err(Error::Validation(format!(
                "'{}' is {} bytes, limit is {}",
                original_name,
                bytes.len(),
                self.max_file_size
            )));
        }
        if !infer::is_image(bytes) {
            return Err(Error::Validation(format!(
                "'{}' is not a recognised image",
                original_name
            )));
        }

        Ok(name)
    }

    /// Store an upload under `uploads/<YYYYMMDD>/` with a collision-resistant name
    pub async fn save_upload(&self, bytes: &[u8], original_name: &str) -> Result<PathBuf> {
        let name = self.validate_upload(bytes, original_name)?;

        let now = time::local_now();
        let dir = self.upload_dir.join(time::date_folder(&now));
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!(
            "{}_{}_{}",
            time::file_timestamp(&now),
            uuid_utils::short_token(),
            name
        ));
        tokio::fs::write(&path, bytes).await?;

        debug!(path = %path.display(), bytes = bytes.len(), "Saved upload");
        Ok(path)
    }

    /// Write single-image artifacts to `results/<YYYYMMDD>/<imageId>/`
    pub async fn save_result_artifacts(
        &self,
        image_id: &str,
        artifacts: &Artifacts,
    ) -> Result<SavedArtifacts> {
        validate_id(image_id)?;
        let dir = self
            .result_dir
            .join(time::date_folder(&time::local_now()))
            .join(image_id);
        write_artifacts(dir, image_id, artifacts).await
    }

    /// Folder holding one batch's artifacts and summary
    pub fn batch_dir(&self, batch_id: &str, started: &DateTime<Local>) -> PathBuf {
        self.result_dir
            .join(time::date_folder(started))
            .join(format!("batch_{}", batch_id))
    }

    /// Write a batch item's artifacts to `<batch_dir>/<imageId>/`
    pub async fn save_batch_artifacts(
        &self,
        batch_dir: &Path,
        image_id: &str,
        artifacts: &Artifacts,
    ) -> Result<SavedArtifacts> {
        validate_id(image_id)?;
        write_artifacts(batch_dir.join(image_id), image_id, artifacts).await
    }

    /// Write the batch summary sidecar; returns its path
    pub async fn save_batch_summary<T: Serialize>(&self, batch_dir: &Path, summary: &T) -> Result<PathBuf> {
        tokio::fs::create_dir_all(batch_dir).await?;
        let path = batch_dir.join(BATCH_SUMMARY_FILE);
        let json = serde_json::to_vec_pretty(summary)
            .map_err(|e| Error::Internal(format!("serialize batch summary: {}", e)))?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    /// Delete one item's artifact folder (missing folders are fine)
    pub async fn remove_artifacts(&self, dir: &Path) -> Result<()> {
        if !dir.starts_with(&self.result_dir) || dir == self.result_dir {
            return Err(Error::Security(format!(
                "refusing to remove {} outside the results root",
                dir.display()
            )));
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                debug!(dir = %dir.display(), "Removed artifacts");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a relative path inside the results or uploads root
    ///
    /// `..` segments that climb out of the root, absolute paths and symlinks
    /// leading outside are security errors regardless of whether the target exists.
    pub fn resolve_path(&self, relative: &str) -> Result<PathBuf> {
        let normalized = normalize_relative(relative)?;

        for root in [&self.result_dir, &self.upload_dir] {
            let candidate = root.join(&normalized);
            if !candidate.exists() {
                continue;
            }
            let canonical_root = root.canonicalize()?;
            let canonical = candidate.canonicalize()?;
            if !canonical.starts_with(&canonical_root) {
                return Err(Error::Security(format!(
                    "'{}' resolves outside the storage roots",
                    relative
                )));
            }
            return Ok(canonical);
        }

        Err(Error::NotFound(format!("file {}", relative)))
    }

    /// Remove date folders (and old archives) older than `days`
    ///
    /// A date folder is removed when its midnight is before `now - days`.
    /// Folders whose names are not dates are left alone.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<CleanupStats> {
        let cutoff = Local::now() - chrono::Duration::days(days as i64);
        let roots = [self.upload_dir.clone(), self.result_dir.clone()];

        let stats = tokio::task::spawn_blocking(move || cleanup_roots(&roots, cutoff))
            .await
            .map_err(|e| Error::Internal(format!("cleanup task failed: {}", e)))??;

        info!(
            days,
            folders_removed = stats.folders_removed,
            files_removed = stats.files_removed,
            "Storage cleanup complete"
        );
        Ok(stats)
    }
}

/// Write every artifact into `dir`; on failure the folder is removed again
async fn write_artifacts(dir: PathBuf, image_id: &str, artifacts: &Artifacts) -> Result<SavedArtifacts> {
    match write_artifact_files(&dir, image_id, artifacts).await {
        Ok(saved) => Ok(saved),
        Err(e) => {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(dir = %dir.display(), "Removed partial artifacts"),
                Err(cleanup) if cleanup.kind() == std::io::ErrorKind::NotFound => {}
                Err(cleanup) => warn!(
                    dir = %dir.display(),
                    error = %cleanup,
                    "Failed to remove partial artifacts"
                ),
            }
            Err(e)
        }
    }
}

async fn write_artifact_files(dir: &Path, image_id: &str, artifacts: &Artifacts) -> Result<SavedArtifacts> {
    tokio::fs::create_dir_all(dir).await?;

    let mut saved = SavedArtifacts {
        dir: dir.to_path_buf(),
        ..Default::default()
    };
    for (kind, bytes) in artifacts.iter() {
        let path = dir.join(format!("{}_{}.png", image_id, kind.as_str()));
        tokio::fs::write(&path, bytes).await?;
        match kind {
            ArtifactKind::Combined => saved.combined = Some(path),
            ArtifactKind::Mask => saved.mask = Some(path),
            ArtifactKind::Overlay => saved.overlay = Some(path),
        }
    }

    debug!(dir = %dir.display(), "Saved result artifacts");
    Ok(saved)
}

fn cleanup_roots(roots: &[PathBuf], cutoff: DateTime<Local>) -> Result<CleanupStats> {
    let mut stats = CleanupStats::default();

    for root in roots {
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                let Some(date) = time::parse_date_folder(&name) else {
                    debug!(folder = %path.display(), "Skipping non-date folder");
                    continue;
                };
                let Some(midnight) = date
                    .and_hms_opt(0, 0, 0)
                    .and_then(|dt| Local.from_local_datetime(&dt).earliest())
                else {
                    continue;
                };
                if midnight >= cutoff {
                    continue;
                }

                // Count before deleting
                let files = count_files(&path);
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {
                        stats.folders_removed += 1;
                        stats.files_removed += files;
                    }
                    Err(e) => warn!(folder = %path.display(), error = %e, "Failed to remove folder"),
                }
            } else if file_type.is_file() && archive::is_archive_name(&name) {
                let modified = entry.metadata()?.modified()?;
                if DateTime::<Local>::from(modified) < cutoff {
                    match std::fs::remove_file(&path) {
                        Ok(()) => stats.files_removed += 1,
                        Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove archive"),
                    }
                }
            }
        }
    }

    Ok(stats)
}

fn count_files(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count() as u64
}

/// Lexically normalize a relative path, rejecting anything that climbs out
fn normalize_relative(relative: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::Security(format!(
                        "'{}' escapes the storage roots",
                        relative
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Security(format!(
                    "'{}' is not a relative path",
                    relative
                )));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidInput("empty path".into()));
    }
    Ok(normalized)
}

/// Ids become directory and archive names; allow only `[A-Za-z0-9_-]`
pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(Error::Security(format!("invalid identifier '{}'", id)));
    }
    Ok(())
}

/// Make an uploaded file name safe for the filesystem
///
/// Keeps only the final path component. In the stem, characters other than
/// alphanumerics, `-`, `_` and `.` become `_`, runs of `_` collapse, and
/// leading/trailing `_` are stripped. Returns `None` when no usable stem or
/// extension remains.
pub fn sanitize_filename(original: &str) -> Option<String> {
    let base = original.rsplit(['/', '\\']).next().unwrap_or(original);
    let (stem, ext) = base.rsplit_once('.')?;

    let clean = |s: &str| {
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            let c = if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            };
            if c == '_' && out.ends_with('_') {
                continue;
            }
            out.push(c);
        }
        out.trim_matches('_').to_string()
    };

    let stem = clean(stem);
    let ext = clean(ext);
    if stem.is_empty() || stem.chars().all(|c| c == '.') || ext.is_empty() {
        return None;
    }
    Some(format!("{}.{}", stem, ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("panel 01 (front).PNG").as_deref(), Some("panel_01_front.PNG"));
        assert_eq!(sanitize_filename("../../etc/passwd.jpg").as_deref(), Some("passwd.jpg"));
        assert_eq!(sanitize_filename("C:\\scans\\a__b.tif").as_deref(), Some("a_b.tif"));
        assert_eq!(sanitize_filename("noext"), None);
        assert_eq!(sanitize_filename("???.png"), None);
        assert_eq!(sanitize_filename("..png"), None);
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(
            normalize_relative("20240101/./a/../b.png").unwrap(),
            PathBuf::from("20240101/b.png")
        );
        assert!(matches!(
            normalize_relative("../../etc/passwd"),
            Err(Error::Security(_))
        ));
        assert!(matches!(normalize_relative("a/../../b"), Err(Error::Security(_))));
        assert!(matches!(normalize_relative("/etc/passwd"), Err(Error::Security(_))));
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("20240101_120000_abcd1234").is_ok());
        assert!(validate_id("3f2b-77").is_ok());
        assert!(validate_id("").is_err());
        assert!(matches!(validate_id("../x"), Err(Error::Security(_))));
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a b").is_err());
    }
}
