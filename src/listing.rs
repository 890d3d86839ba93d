//! Image file discovery.
//!
//! Listings are sorted by file name so batch jobs and playlists see folders
//! in a stable order. Hidden entries (dot-prefixed) are skipped.

use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

/// Extensions recognized as images, compared case-insensitively
pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "gif"];

#[derive(Debug, Clone)]
pub struct ImageLister {
    extensions: Vec<String>,
}

impl Default for ImageLister {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS.iter().copied())
    }
}

impl ImageLister {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }

    /// Images directly inside `dir`.
    pub fn image_files(&self, dir: &Path) -> Vec<PathBuf> {
        self.walk(dir, 1)
            .filter(|e| e.file_type().is_file() && self.is_image(e.path()))
            .map(DirEntry::into_path)
            .collect()
    }

    /// Images inside `dir`, descending into subfolders when `recursive`.
    pub fn collect_images(&self, dir: &Path, recursive: bool) -> Vec<PathBuf> {
        if !recursive {
            return self.image_files(dir);
        }

        self.walk(dir, usize::MAX)
            .filter(|e| e.file_type().is_file() && self.is_image(e.path()))
            .map(DirEntry::into_path)
            .collect()
    }

    /// Folders directly inside `dir`.
    pub fn sub_folders(&self, dir: &Path) -> Vec<PathBuf> {
        self.walk(dir, 1)
            .filter(|e| e.file_type().is_dir())
            .map(DirEntry::into_path)
            .collect()
    }

    fn walk(&self, dir: &Path, max_depth: usize) -> impl Iterator<Item = DirEntry> {
        WalkDir::new(dir)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("skipping unreadable entry: {e}");
                    None
                }
            })
    }
}

/// The walk root itself is never hidden.
fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Images directly inside `dir`, with the default extensions.
pub fn image_files(dir: &Path) -> Vec<PathBuf> {
    ImageLister::default().image_files(dir)
}

pub fn sub_folders(dir: &Path) -> Vec<PathBuf> {
    ImageLister::default().sub_folders(dir)
}

pub fn collect_images(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    ImageLister::default().collect_images(dir, recursive)
}
