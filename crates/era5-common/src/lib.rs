//! Common types and utilities shared across the ERA5 preparation crates.

pub mod area;
pub mod grid;
pub mod time;

pub use area::{Area, AreaParseError};
pub use grid::{Grid, GridParseError};
pub use time::{hourly_samples, DateSpan};
