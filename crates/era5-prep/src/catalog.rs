//! Observation catalog.
//!
//! Enumerates the observation files a run works on, from a directory listing
//! filtered by a wildcard pattern, a single explicit file, or a YAML manifest.
//! Failure to enumerate is the one error that aborts a whole run.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{PrepError, Result};
use crate::observation::{InstrumentKind, ManifestDecoder, ManifestEntry, ObservationFile};

/// Ordered list of observation files to process.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<ObservationFile>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    observations: Vec<ManifestEntry>,
}

impl Catalog {
    pub fn from_entries(entries: Vec<ObservationFile>) -> Self {
        Self { entries }
    }

    /// List all files in `folder` whose name matches `pattern`, sorted by name.
    ///
    /// The pattern supports `*` (any run of characters) and `?` (one character).
    pub fn from_directory(folder: &Path, pattern: &str, prefix_len: usize) -> Result<Self> {
        let read_dir =
            std::fs::read_dir(folder).map_err(|e| PrepError::enumeration(folder, e))?;

        let mut paths = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| PrepError::enumeration(folder, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            if matches_pattern(&name, pattern) {
                paths.push(path);
            } else {
                debug!(file = %name, pattern = %pattern, "Skipping non-matching file");
            }
        }
        paths.sort();

        let entries: Vec<ObservationFile> = paths
            .into_iter()
            .map(|p| ObservationFile::new(p, prefix_len))
            .collect();

        info!(
            folder = %folder.display(),
            pattern = %pattern,
            count = entries.len(),
            "Enumerated observations"
        );

        Ok(Self { entries })
    }

    /// A catalog holding exactly one explicitly named file.
    pub fn from_file(path: &Path, prefix_len: usize) -> Result<Self> {
        if !path.is_file() {
            return Err(PrepError::enumeration(path, "observation file not found"));
        }

        Ok(Self {
            entries: vec![ObservationFile::new(path, prefix_len)],
        })
    }

    /// Load a YAML manifest listing observations with their decoded metadata.
    ///
    /// Relative file entries are resolved against the manifest's folder. The
    /// returned decoder answers for exactly the listed files.
    pub fn from_manifest(
        manifest: &Path,
        prefix_len: usize,
        default_instrument: InstrumentKind,
    ) -> Result<(Self, ManifestDecoder)> {
        let content = std::fs::read_to_string(manifest)
            .map_err(|e| PrepError::enumeration(manifest, e))?;
        let parsed: ManifestFile =
            serde_yaml::from_str(&content).map_err(|e| PrepError::enumeration(manifest, e))?;

        let base = manifest.parent().unwrap_or_else(|| Path::new("."));
        let mut entries = Vec::with_capacity(parsed.observations.len());
        let mut decoded = Vec::with_capacity(parsed.observations.len());

        for entry in parsed.observations {
            let path: PathBuf = if entry.file.is_absolute() {
                entry.file.clone()
            } else {
                base.join(&entry.file)
            };
            entries.push(ObservationFile::new(&path, prefix_len));
            decoded.push((path, entry));
        }

        info!(
            manifest = %manifest.display(),
            count = entries.len(),
            "Loaded observation manifest"
        );

        Ok((
            Self { entries },
            ManifestDecoder::new(decoded, default_instrument),
        ))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ObservationFile] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ObservationFile> {
        self.entries
    }
}

/// Wildcard match supporting `*` and `?`.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let (mut n, mut p) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_n = 0;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            n += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_n = n;
            p += 1;
        } else if let Some(s) = star {
            // Let the last star absorb one more character
            p = s + 1;
            star_n += 1;
            n = star_n;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("20191105-2130_T15Z900.nc", "*T15Z900.nc"));
        assert!(matches_pattern("a.nc", "?.nc"));
        assert!(matches_pattern("anything", "*"));
        assert!(!matches_pattern("20191105-2130_T60Z900.nc", "*T15Z900.nc"));
        assert!(!matches_pattern("ab.nc", "?.nc"));
        assert!(matches_pattern("x_T15_y_T15.nc", "*T15*.nc"));
    }

    #[test]
    fn test_directory_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b_T15.nc", "a_T15.nc", "c_T60.nc"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("sub_T15.nc")).unwrap();

        let catalog = Catalog::from_directory(dir.path(), "*T15.nc", 13).unwrap();
        let names: Vec<String> = catalog.entries().iter().map(|e| e.file_name()).collect();
        assert_eq!(names, vec!["a_T15.nc", "b_T15.nc"]);
    }

    #[test]
    fn test_missing_directory_is_enumeration_error() {
        let result = Catalog::from_directory(Path::new("/nonexistent/lidar"), "*", 13);
        assert!(matches!(result, Err(PrepError::Enumeration { .. })));
    }

    #[test]
    fn test_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20191105-2130_20191106-0530.nc");
        fs::write(&path, b"").unwrap();

        let catalog = Catalog::from_file(&path, 13).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.entries()[0].id.as_str(), "20191105-2130");

        let missing = Catalog::from_file(&dir.path().join("nope.nc"), 13);
        assert!(missing.is_err());
    }
}
