//! Observation records and their decoders.
//!
//! Reading raw instrument files (time axes, unit normalization) happens
//! outside this crate. The pipeline only needs the start time, duration and
//! instrument of each observation, which an [`ObservationDecoder`] supplies.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PrepError, Result};

/// Length of the `YYYYMMDD-HHMM` stamp that prefixes observation file names.
pub const DEFAULT_ID_PREFIX_LEN: usize = 13;

const STAMP_FORMAT: &str = "%Y%m%d-%H%M";

/// Identifier of an observation, derived from its file name prefix.
///
/// Every cache artifact of the observation is named after this identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationId(String);

impl ObservationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Take the first `prefix_len` characters of a file name.
    ///
    /// Names shorter than the prefix fall back to the name without extension.
    pub fn from_file_name(file_name: &str, prefix_len: usize) -> Self {
        if file_name.chars().count() > prefix_len {
            Self(file_name.chars().take(prefix_len).collect())
        } else {
            let stem = Path::new(file_name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(file_name);
            Self(stem.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instrument that produced an observation (e.g. "CORAL", "TELMA").
///
/// Labels are case-insensitive and stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct InstrumentKind(String);

impl InstrumentKind {
    pub fn new(label: impl AsRef<str>) -> Self {
        Self(label.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for InstrumentKind {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<InstrumentKind> for String {
    fn from(kind: InstrumentKind) -> Self {
        kind.0
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A catalog entry: an observation file that has not been decoded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationFile {
    pub path: PathBuf,
    pub id: ObservationId,
}

impl ObservationFile {
    pub fn new(path: impl Into<PathBuf>, prefix_len: usize) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = ObservationId::from_file_name(&file_name, prefix_len);
        Self { path, id }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A decoded observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub id: ObservationId,
    pub path: PathBuf,
    /// Start of the measurement (UTC)
    pub start: DateTime<Utc>,
    /// Measurement duration
    pub duration: Duration,
    pub instrument: InstrumentKind,
}

impl Observation {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.duration
    }
}

/// Turns a catalog entry into a decoded [`Observation`].
pub trait ObservationDecoder: Send + Sync {
    fn decode(&self, file: &ObservationFile) -> Result<Observation>;
}

/// Decodes start and end from stamped file names.
///
/// Expected layout: `<YYYYMMDD-HHMM>_<YYYYMMDD-HHMM>[_anything].ext`, for
/// example `20191105-2130_20191106-0530_T15Z900.nc`.
#[derive(Debug, Clone)]
pub struct FilenameDecoder {
    instrument: InstrumentKind,
}

impl FilenameDecoder {
    pub fn new(instrument: InstrumentKind) -> Self {
        Self { instrument }
    }
}

impl ObservationDecoder for FilenameDecoder {
    fn decode(&self, file: &ObservationFile) -> Result<Observation> {
        let name = file.file_name();
        let mut parts = name.split('_');

        let start = parts
            .next()
            .and_then(parse_stamp)
            .ok_or_else(|| PrepError::decode(&file.path, "missing or invalid start stamp"))?;
        let end = parts
            .next()
            .and_then(parse_stamp)
            .ok_or_else(|| PrepError::decode(&file.path, "missing or invalid end stamp"))?;

        if end <= start {
            return Err(PrepError::decode(
                &file.path,
                format!("end {} is not after start {}", end, start),
            ));
        }

        Ok(Observation {
            id: file.id.clone(),
            path: file.path.clone(),
            start,
            duration: end - start,
            instrument: self.instrument.clone(),
        })
    }
}

/// Parse a `YYYYMMDD-HHMM` stamp at the beginning of `token`.
fn parse_stamp(token: &str) -> Option<DateTime<Utc>> {
    let stamp = token.get(..DEFAULT_ID_PREFIX_LEN)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Already-decoded metadata for one observation, as listed in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name or path of the observation, relative to the manifest folder
    pub file: PathBuf,
    pub start_time: DateTime<Utc>,
    pub duration_hours: f64,
    #[serde(default)]
    pub instrument: Option<InstrumentKind>,
}

/// Decoder backed by manifest entries.
#[derive(Debug, Clone)]
pub struct ManifestDecoder {
    entries: HashMap<PathBuf, ManifestEntry>,
    default_instrument: InstrumentKind,
}

impl ManifestDecoder {
    /// Build from entries keyed by the absolute observation path.
    pub fn new(
        entries: impl IntoIterator<Item = (PathBuf, ManifestEntry)>,
        default_instrument: InstrumentKind,
    ) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            default_instrument,
        }
    }
}

impl ObservationDecoder for ManifestDecoder {
    fn decode(&self, file: &ObservationFile) -> Result<Observation> {
        let entry = self
            .entries
            .get(&file.path)
            .ok_or_else(|| PrepError::decode(&file.path, "not listed in manifest"))?;

        if !entry.duration_hours.is_finite() || entry.duration_hours < 0.0 {
            return Err(PrepError::decode(
                &file.path,
                format!("invalid duration {} h", entry.duration_hours),
            ));
        }

        let duration = Duration::seconds((entry.duration_hours * 3600.0).round() as i64);

        Ok(Observation {
            id: file.id.clone(),
            path: file.path.clone(),
            start: entry.start_time,
            duration,
            instrument: entry
                .instrument
                .clone()
                .unwrap_or_else(|| self.default_instrument.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_id_from_stamped_name() {
        let id = ObservationId::from_file_name("20191105-2130_20191106-0530_T15Z900.nc", 13);
        assert_eq!(id.as_str(), "20191105-2130");
    }

    #[test]
    fn test_id_from_short_name_uses_stem() {
        let id = ObservationId::from_file_name("obs1.nc", 13);
        assert_eq!(id.as_str(), "obs1");
    }

    #[test]
    fn test_instrument_kind_is_case_insensitive() {
        assert_eq!(InstrumentKind::new("telma"), InstrumentKind::new(" TELMA "));
    }

    #[test]
    fn test_filename_decoder() {
        let file = ObservationFile::new("/data/20191105-2130_20191106-0530_T15Z900.nc", 13);
        let obs = FilenameDecoder::new(InstrumentKind::new("CORAL"))
            .decode(&file)
            .unwrap();

        assert_eq!(obs.start, Utc.with_ymd_and_hms(2019, 11, 5, 21, 30, 0).unwrap());
        assert_eq!(obs.duration, Duration::hours(8));
        assert_eq!(obs.end().hour(), 5);
        assert_eq!(obs.id.as_str(), "20191105-2130");
    }

    #[test]
    fn test_filename_decoder_end_stamp_with_extension() {
        let file = ObservationFile::new("/data/20191105-2130_20191105-2330.nc", 13);
        let obs = FilenameDecoder::new(InstrumentKind::new("CORAL"))
            .decode(&file)
            .unwrap();
        assert_eq!(obs.duration, Duration::hours(2));
    }

    #[test]
    fn test_filename_decoder_rejects_malformed_names() {
        let decoder = FilenameDecoder::new(InstrumentKind::new("CORAL"));

        let missing_end = ObservationFile::new("/data/20191105-2130.nc", 13);
        assert!(matches!(
            decoder.decode(&missing_end),
            Err(PrepError::Decode { .. })
        ));

        let garbage = ObservationFile::new("/data/notes.txt", 13);
        assert!(matches!(decoder.decode(&garbage), Err(PrepError::Decode { .. })));

        let reversed = ObservationFile::new("/data/20191106-0530_20191105-2130.nc", 13);
        assert!(matches!(decoder.decode(&reversed), Err(PrepError::Decode { .. })));
    }

    #[test]
    fn test_manifest_decoder() {
        let path = PathBuf::from("/data/a.nc");
        let entry = ManifestEntry {
            file: PathBuf::from("a.nc"),
            start_time: Utc.with_ymd_and_hms(2023, 6, 1, 2, 0, 0).unwrap(),
            duration_hours: 7.5,
            instrument: None,
        };
        let decoder = ManifestDecoder::new([(path.clone(), entry)], InstrumentKind::new("CORAL"));

        let obs = decoder.decode(&ObservationFile::new(&path, 13)).unwrap();
        assert_eq!(obs.duration, Duration::minutes(450));
        assert_eq!(obs.instrument.as_str(), "CORAL");

        let unknown = ObservationFile::new("/data/b.nc", 13);
        assert!(decoder.decode(&unknown).is_err());
    }
}
