//! Temporary directory helpers for pipeline tests.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Returns the workspace root directory.
///
/// This is determined by walking up from the current crate's manifest directory
/// until we find the workspace Cargo.toml.
pub fn workspace_root() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir)
        .parent() // crates/
        .and_then(|p| p.parent()) // workspace root
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from(manifest_dir))
}

/// Creates a temporary directory for test output.
///
/// The directory is automatically cleaned up when the returned `TempDir` is dropped.
pub fn temp_test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temporary test directory")
}

/// Creates a temporary directory with a specific prefix.
pub fn temp_test_dir_with_prefix(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("Failed to create temporary test directory")
}

/// A scratch area with an observation folder and an output folder.
///
/// ```text
/// <tmp>/observations/
/// <tmp>/output/era5-region/   (the cache root, not created)
/// ```
pub struct TestDirs {
    root: tempfile::TempDir,
}

impl TestDirs {
    pub fn new() -> Self {
        let root = temp_test_dir_with_prefix("era5_prep_");
        fs::create_dir_all(root.path().join("observations"))
            .expect("Failed to create observation directory");
        fs::create_dir_all(root.path().join("output"))
            .expect("Failed to create output directory");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn observations(&self) -> PathBuf {
        self.root.path().join("observations")
    }

    pub fn output(&self) -> PathBuf {
        self.root.path().join("output")
    }

    pub fn cache(&self) -> PathBuf {
        self.output().join("era5-region")
    }
}

impl Default for TestDirs {
    fn default() -> Self {
        Self::new()
    }
}

/// All regular files below `dir`, sorted. A missing directory has none.
pub fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    files.sort();
    files
}
