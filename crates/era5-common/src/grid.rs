//! Output grid resolution for regridded retrievals.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Regular latitude/longitude output grid, in degrees.
///
/// Asking the service for a regular grid is what makes NetCDF output possible;
/// without it the data comes back as spherical harmonics or a reduced Gaussian grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Grid {
    pub dlat: f64,
    pub dlon: f64,
}

impl Grid {
    pub fn new(dlat: f64, dlon: f64) -> Result<Self, GridParseError> {
        if !(dlat > 0.0) || !(dlon > 0.0) {
            return Err(GridParseError::NonPositive(format!("{}/{}", dlat, dlon)));
        }
        Ok(Self { dlat, dlon })
    }

    /// Parse a grid string: "DLAT/DLON"
    pub fn from_request_string(s: &str) -> Result<Self, GridParseError> {
        let (lat, lon) = s
            .split_once('/')
            .ok_or_else(|| GridParseError::InvalidFormat(s.to_string()))?;

        let dlat = lat
            .trim()
            .parse()
            .map_err(|_| GridParseError::InvalidNumber(lat.to_string()))?;
        let dlon = lon
            .trim()
            .parse()
            .map_err(|_| GridParseError::InvalidNumber(lon.to_string()))?;

        Self::new(dlat, dlon)
    }

    pub fn to_request_string(&self) -> String {
        format!("{}/{}", self.dlat, self.dlon)
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self {
            dlat: 0.25,
            dlon: 0.25,
        }
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_request_string())
    }
}

impl FromStr for Grid {
    type Err = GridParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_request_string(s)
    }
}

impl TryFrom<String> for Grid {
    type Error = GridParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_request_string(&value)
    }
}

impl From<Grid> for String {
    fn from(grid: Grid) -> Self {
        grid.to_request_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GridParseError {
    #[error("Invalid grid format: {0}. Expected 'DLAT/DLON'")]
    InvalidFormat(String),

    #[error("Invalid number in grid: {0}")]
    InvalidNumber(String),

    #[error("Grid spacing must be positive: {0}")]
    NonPositive(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grid() {
        assert_eq!(Grid::default().to_request_string(), "0.25/0.25");
    }

    #[test]
    fn test_parse_grid() {
        let grid: Grid = "0.5/1".parse().unwrap();
        assert_eq!(grid.dlat, 0.5);
        assert_eq!(grid.dlon, 1.0);
        assert!(Grid::from_request_string("0/0.25").is_err());
        assert!(Grid::from_request_string("0.25").is_err());
    }
}
