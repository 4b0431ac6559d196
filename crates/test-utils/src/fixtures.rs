//! Observation fixtures.
//!
//! Observation files are named `<start>_<end>_<suffix>.nc` with
//! `YYYYMMDD-HHMM` stamps, which is what the filename decoder reads.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveDateTime};

/// Stamp format used in observation file names.
pub const STAMP_FORMAT: &str = "%Y%m%d-%H%M";

/// Resolution suffix shared by fixture files.
pub const RESOLUTION_SUFFIX: &str = "T15Z900";

/// Glob matching fixture files.
pub const RESOLUTION_PATTERN: &str = "*T15Z900.nc";

/// Common reference times (UTC).
pub mod times {
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(h, min, 0))
            .expect("valid fixture time")
    }

    /// Early-morning start of a night that began the previous evening
    pub fn early_morning() -> NaiveDateTime {
        at(2023, 6, 2, 2, 0)
    }

    /// Late-morning start of a short daytime measurement
    pub fn late_morning() -> NaiveDateTime {
        at(2023, 6, 2, 10, 0)
    }

    /// Evening start of a nocturnal campaign
    pub fn evening() -> NaiveDateTime {
        at(2019, 11, 5, 21, 30)
    }
}

/// File name for an observation starting at `start` and lasting `minutes`.
pub fn stamped_name(start: NaiveDateTime, minutes: i64) -> String {
    let end = start + Duration::minutes(minutes);
    format!(
        "{}_{}_{}.nc",
        start.format(STAMP_FORMAT),
        end.format(STAMP_FORMAT),
        RESOLUTION_SUFFIX
    )
}

/// Observation id (the start stamp) for a start time.
pub fn stamped_id(start: NaiveDateTime) -> String {
    start.format(STAMP_FORMAT).to_string()
}

/// Write an empty observation file into `dir` and return its path.
pub fn write_observation(dir: &Path, start: NaiveDateTime, hours: f64) -> PathBuf {
    let path = dir.join(stamped_name(start, (hours * 60.0).round() as i64));
    fs::write(&path, b"").expect("Failed to write observation fixture");
    path
}

/// Write one observation per night, each `hours` long and starting at
/// `hour:00` on consecutive days from `first`.
pub fn write_nightly_series(
    dir: &Path,
    first: NaiveDate,
    nights: u32,
    hour: u32,
    hours: f64,
) -> Vec<PathBuf> {
    (0..nights)
        .map(|n| {
            let start = (first + Duration::days(i64::from(n)))
                .and_hms_opt(hour, 0, 0)
                .expect("valid fixture hour");
            write_observation(dir, start, hours)
        })
        .collect()
}
