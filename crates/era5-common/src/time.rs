//! Time handling utilities for reanalysis requests.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// A contiguous run of calendar days requested from the reanalysis archive.
///
/// Reanalysis products are retrieved per day; a span of one day covers a single
/// date, two days covers the anchor date and the following one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateSpan {
    /// First day of the span
    pub first: NaiveDate,
    /// Number of days, at least 1
    pub days: u32,
}

impl DateSpan {
    pub fn new(first: NaiveDate, days: u32) -> Self {
        Self {
            first,
            days: days.max(1),
        }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self::new(date, 1)
    }

    /// Last day of the span (inclusive).
    pub fn last(&self) -> NaiveDate {
        self.first + Duration::days(i64::from(self.days) - 1)
    }

    /// All days in the span, in order.
    pub fn dates(&self) -> Vec<NaiveDate> {
        (0..self.days)
            .map(|offset| self.first + Duration::days(i64::from(offset)))
            .collect()
    }

    /// Format for the retrieval service.
    ///
    /// Supports:
    /// - Single day: "2024-01-15"
    /// - Range: "2024-01-15/to/2024-01-16"
    pub fn to_request_string(&self) -> String {
        if self.days == 1 {
            self.first.format("%Y-%m-%d").to_string()
        } else {
            format!(
                "{}/to/{}",
                self.first.format("%Y-%m-%d"),
                self.last().format("%Y-%m-%d")
            )
        }
    }
}

/// All 24 hourly analysis times of a day, "00:00:00" through "23:00:00".
pub fn hourly_samples() -> Vec<String> {
    (0..24).map(|hour| format!("{:02}:00:00", hour)).collect()
}

/// The hourly samples joined into the service's list syntax ("00:00:00/01:00:00/...").
pub fn hourly_samples_request_string() -> String {
    hourly_samples().join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_day_request_string() {
        let span = DateSpan::single(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(span.to_request_string(), "2024-01-15");
        assert_eq!(span.last(), span.first);
    }

    #[test]
    fn test_two_day_span_crosses_month() {
        let span = DateSpan::new(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(), 2);
        assert_eq!(span.to_request_string(), "2024-01-31/to/2024-02-01");
        assert_eq!(span.dates().len(), 2);
    }

    #[test]
    fn test_zero_days_is_clamped() {
        let span = DateSpan::new(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 0);
        assert_eq!(span.days, 1);
    }

    #[test]
    fn test_hourly_samples() {
        let samples = hourly_samples();
        assert_eq!(samples.len(), 24);
        assert_eq!(samples[0], "00:00:00");
        assert_eq!(samples[23], "23:00:00");
        assert!(hourly_samples_request_string().starts_with("00:00:00/01:00:00/"));
    }
}
