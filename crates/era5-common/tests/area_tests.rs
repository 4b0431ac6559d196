//! Tests for Area and Grid parsing as they appear in run configuration.

use era5_common::area::{Area, AreaParseError};
use era5_common::grid::Grid;

// ============================================================================
// Constructor tests
// ============================================================================

#[test]
fn test_area_new() {
    let area = Area::new(-25.0, -120.0, -85.0, -30.0).unwrap();
    assert_eq!(area.north, -25.0);
    assert_eq!(area.west, -120.0);
    assert_eq!(area.south, -85.0);
    assert_eq!(area.east, -30.0);
}

#[test]
fn test_area_global() {
    let area = Area::global();
    assert_eq!(area.to_request_string(), "90/-180/-90/180");
    assert_eq!(area.lat_extent(), 180.0);
    assert_eq!(area.lon_extent(), 360.0);
}

#[test]
fn test_area_rejects_bad_latitude() {
    let result = Area::new(95.0, 0.0, 10.0, 20.0);
    assert!(matches!(result, Err(AreaParseError::LatitudeOutOfRange(_))));
}

#[test]
fn test_area_rejects_bad_longitude() {
    let result = Area::new(10.0, -200.0, 0.0, 20.0);
    assert!(matches!(result, Err(AreaParseError::LongitudeOutOfRange(_))));
}

// ============================================================================
// from_request_string tests
// ============================================================================

#[test]
fn test_parse_with_whitespace() {
    let area = Area::from_request_string(" 60 / -10 / 40 / 30 ").unwrap();
    assert_eq!(area.north, 60.0);
    assert_eq!(area.east, 30.0);
}

#[test]
fn test_parse_floating() {
    let area: Area = "67.5/-20.25/55.75/30.5".parse().unwrap();
    assert!((area.west - (-20.25)).abs() < 1e-9);
    assert!((area.south - 55.75).abs() < 1e-9);
}

#[test]
fn test_parse_too_few_parts() {
    let result = Area::from_request_string("10/20/30");
    assert!(matches!(result, Err(AreaParseError::InvalidFormat(_))));
}

#[test]
fn test_parse_comma_separated_is_rejected() {
    let result = Area::from_request_string("10,20,30,40");
    assert!(matches!(result, Err(AreaParseError::InvalidFormat(_))));
}

#[test]
fn test_parse_invalid_number() {
    let result = Area::from_request_string("10/abc/0/20");
    assert!(matches!(result, Err(AreaParseError::InvalidNumber(_))));
}

#[test]
fn test_request_string_roundtrip_is_stable() {
    let area = Area::from_request_string("-25/-120/-85/-30").unwrap();
    assert_eq!(area.to_request_string(), "-25/-120/-85/-30");
    assert_eq!(area.to_string(), "-25/-120/-85/-30");
}

// ============================================================================
// Serde tests
// ============================================================================

#[test]
fn test_area_and_grid_from_yaml() {
    #[derive(serde::Deserialize)]
    struct Section {
        area: Area,
        grid: Grid,
    }

    let section: Section = serde_yaml::from_str("area: \"-25/-120/-85/-30\"\ngrid: \"0.25/0.25\"\n")
        .unwrap();
    assert_eq!(section.area.north, -25.0);
    assert_eq!(section.grid, Grid::default());
}

#[test]
fn test_invalid_area_in_yaml_fails() {
    let result: Result<Area, _> = serde_yaml::from_str("\"100/0/0/10\"");
    assert!(result.is_err());
}
