//! Batch input discovery
//!
//! Expands the paths given on the command line into batch items. Directories
//! are walked recursively without following symlinks; only files with an
//! allowed extension are picked up there. Files named explicitly are kept
//! even when their extension is wrong, so the pipeline reports them.

use crate::workflow::BatchItem;
use aoi_common::{Error, Result};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

pub struct ImageScanner {
    allowed_extensions: Vec<String>,
}

impl ImageScanner {
    /// `allowed_extensions` are lowercase without a leading dot
    pub fn new(allowed_extensions: &[String]) -> Self {
        Self {
            allowed_extensions: allowed_extensions.to_vec(),
        }
    }

    /// Image files under `root`, sorted by path
    pub fn scan(&self, root: &Path) -> Result<Vec<PathBuf>> {
        if !root.exists() {
            return Err(Error::NotFound(format!("path {}", root.display())));
        }
        if !root.is_dir() {
            return Err(Error::InvalidInput(format!(
                "not a directory: {}",
                root.display()
            )));
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

        for entry in walker {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file() && self.has_allowed_extension(entry.path()) {
                        files.push(entry.into_path());
                    }
                }
                Err(e) => tracing::warn!("Error accessing entry: {}", e),
            }
        }

        files.sort();
        tracing::debug!(root = %root.display(), files = files.len(), "Scanned for images");
        Ok(files)
    }

    /// Turn CLI inputs into batch items, preserving the given order
    pub fn collect_items(&self, inputs: &[PathBuf]) -> Result<Vec<BatchItem>> {
        let mut items = Vec::new();
        for input in inputs {
            if input.is_dir() {
                items.extend(self.scan(input)?.into_iter().map(BatchItem::from_path));
            } else {
                items.push(BatchItem::from_path(input.clone()));
            }
        }
        Ok(items)
    }

    fn has_allowed_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .map(|e| self.allowed_extensions.iter().any(|a| *a == e))
            .unwrap_or(false)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scanner() -> ImageScanner {
        ImageScanner::new(&["png".to_string(), "jpg".to_string()])
    }

    #[test]
    fn test_scan_filters_extensions_and_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::write(root.join("b.png"), b"x").unwrap();
        fs::write(root.join("a.JPG"), b"x").unwrap();
        fs::write(root.join("notes.txt"), b"x").unwrap();
        fs::write(root.join("sub/c.png"), b"x").unwrap();
        fs::write(root.join(".cache/d.png"), b"x").unwrap();
        fs::write(root.join(".e.png"), b"x").unwrap();

        let files = scanner().scan(root).unwrap();
        assert_eq!(
            files,
            vec![root.join("a.JPG"), root.join("b.png"), root.join("sub/c.png")]
        );
    }

    #[test]
    fn test_scan_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = scanner().scan(&dir.path().join("nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_collect_items_keeps_explicit_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("imgs")).unwrap();
        fs::write(root.join("imgs/1.png"), b"x").unwrap();
        fs::write(root.join("bad.txt"), b"x").unwrap();

        let items = scanner()
            .collect_items(&[root.join("bad.txt"), root.join("imgs")])
            .unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, vec!["bad.txt", "1.png"]);
    }
}
