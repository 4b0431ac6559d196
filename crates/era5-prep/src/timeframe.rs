//! Timeframe selection: which reanalysis days an observation needs.
//!
//! Nocturnal campaigns span midnight. With the night policy enabled, an
//! observation starting before the reference hour belongs to the night that
//! began on the previous calendar day.

use std::collections::HashMap;

use chrono::{Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};
use era5_common::DateSpan;
use serde::Serialize;

use crate::observation::{InstrumentKind, Observation};

/// The calendar days of reanalysis data required for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TargetWindow {
    span: DateSpan,
}

impl TargetWindow {
    pub fn new(anchor: NaiveDate, days: u32) -> Self {
        Self {
            span: DateSpan::new(anchor, days),
        }
    }

    pub fn anchor(&self) -> NaiveDate {
        self.span.first
    }

    pub fn days(&self) -> u32 {
        self.span.days
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.span.dates()
    }

    /// Date argument for retrieval requests.
    pub fn to_request_string(&self) -> String {
        self.span.to_request_string()
    }
}

/// Day/night anchoring policy plus per-instrument window lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeframePolicy {
    /// Anchor early-morning observations to the previous day
    pub night_policy: bool,
    /// Local hour boundary; hours strictly below it belong to the previous day
    pub reference_hour: u32,
    /// Offset of local time from UTC
    pub utc_offset: FixedOffset,
    /// Window length for instruments without an override
    pub default_span_days: u32,
    /// Window length per instrument
    pub instrument_spans: HashMap<InstrumentKind, u32>,
}

impl Default for TimeframePolicy {
    fn default() -> Self {
        Self {
            night_policy: false,
            reference_hour: 15,
            utc_offset: Utc.fix(),
            default_span_days: 2,
            instrument_spans: HashMap::new(),
        }
    }
}

impl TimeframePolicy {
    /// Number of days to request for an instrument.
    pub fn span_days(&self, instrument: &InstrumentKind) -> u32 {
        self.instrument_spans
            .get(instrument)
            .copied()
            .unwrap_or(self.default_span_days)
            .max(1)
    }

    /// Compute the target window for a decoded observation.
    pub fn select(&self, observation: &Observation) -> TargetWindow {
        let local_start = (observation.start + Duration::seconds(i64::from(
            self.utc_offset.local_minus_utc(),
        )))
        .naive_utc();

        select_window(
            local_start,
            self.reference_hour,
            self.night_policy,
            self.span_days(&observation.instrument),
        )
    }
}

/// Core selection rule on a local start time.
///
/// - Night policy disabled: the start date alone.
/// - Enabled: anchor on the previous day when the local hour is strictly
///   below `reference_hour`, else on the start date; the window then covers
///   `span_days` days from the anchor.
pub fn select_window(
    local_start: NaiveDateTime,
    reference_hour: u32,
    night_policy: bool,
    span_days: u32,
) -> TargetWindow {
    let start_date = local_start.date();

    if !night_policy {
        return TargetWindow::new(start_date, 1);
    }

    let anchor = if local_start.hour() < reference_hour {
        start_date - Duration::days(1)
    } else {
        start_date
    };

    TargetWindow::new(anchor, span_days)
}
