//! Geographic retrieval areas.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A latitude/longitude box in the order the retrieval service expects it:
/// North, West, South, East (degrees).
///
/// The service accepts `north < south` (it swaps them), so no ordering is
/// enforced between the two latitudes here. Only the value ranges are checked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Area {
    pub north: f64,
    pub west: f64,
    pub south: f64,
    pub east: f64,
}

impl Area {
    /// Create a new area from its four edges.
    pub fn new(north: f64, west: f64, south: f64, east: f64) -> Result<Self, AreaParseError> {
        for lat in [north, south] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(AreaParseError::LatitudeOutOfRange(lat));
            }
        }
        for lon in [west, east] {
            if !(-180.0..=360.0).contains(&lon) {
                return Err(AreaParseError::LongitudeOutOfRange(lon));
            }
        }

        Ok(Self {
            north,
            west,
            south,
            east,
        })
    }

    /// The whole globe.
    pub fn global() -> Self {
        Self {
            north: 90.0,
            west: -180.0,
            south: -90.0,
            east: 180.0,
        }
    }

    /// Parse an area string: "N/W/S/E"
    pub fn from_request_string(s: &str) -> Result<Self, AreaParseError> {
        let parts: Vec<&str> = s.split('/').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(AreaParseError::InvalidFormat(s.to_string()));
        }

        let mut values = [0.0_f64; 4];
        for (value, part) in values.iter_mut().zip(&parts) {
            *value = part
                .parse()
                .map_err(|_| AreaParseError::InvalidNumber(part.to_string()))?;
        }

        Self::new(values[0], values[1], values[2], values[3])
    }

    /// Format as the "N/W/S/E" string used in retrieval requests.
    pub fn to_request_string(&self) -> String {
        format!("{}/{}/{}/{}", self.north, self.west, self.south, self.east)
    }

    /// Latitude extent in degrees, independent of edge order.
    pub fn lat_extent(&self) -> f64 {
        (self.north - self.south).abs()
    }

    /// Longitude extent in degrees.
    pub fn lon_extent(&self) -> f64 {
        if self.east >= self.west {
            self.east - self.west
        } else {
            // Crosses the antimeridian
            self.east + 360.0 - self.west
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_request_string())
    }
}

impl FromStr for Area {
    type Err = AreaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_request_string(s)
    }
}

impl TryFrom<String> for Area {
    type Error = AreaParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_request_string(&value)
    }
}

impl From<Area> for String {
    fn from(area: Area) -> Self {
        area.to_request_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AreaParseError {
    #[error("Invalid area format: {0}. Expected 'N/W/S/E'")]
    InvalidFormat(String),

    #[error("Invalid number in area: {0}")]
    InvalidNumber(String),

    #[error("Latitude out of range [-90, 90]: {0}")]
    LatitudeOutOfRange(f64),

    #[error("Longitude out of range [-180, 360]: {0}")]
    LongitudeOutOfRange(f64),
}
