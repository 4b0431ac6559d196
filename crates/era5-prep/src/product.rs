//! Retrieval request specifications for each retrieved artifact kind.

use era5_common::{time, Area, Grid};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::artifacts::ArtifactKind;
use crate::timeframe::TargetWindow;

/// Dataset holding model, pressure and PV level analyses.
pub const DEFAULT_DATASET: &str = "reanalysis-era5-complete";

const MODEL_LEVELS: &str = "1/to/137";
const MODEL_LEVEL_PARAMS: &str = "129/130/131/132/133/152";

const PRESSURE_LEVELS: &str = "1/2/3/5/7/10/20/30/50/70/100/125/150/175/200/225/250/300/350/400/\
450/500/550/600/650/700/750/775/800/825/850/875/900/925/950/975/1000";
const PRESSURE_LEVEL_PARAMS: &str = "60.128/129.128/131/132";

/// Potential vorticity surface in units of 10^-3 PVU (2000 = 2 PVU).
const PV_LEVEL: &str = "2000";
const PV_LEVEL_PARAMS: &str = "3.128/54.128/129.128/131.128/132.128/133.128";

/// Vertical coordinate of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelType {
    /// Model levels
    Ml,
    /// Pressure levels
    Pl,
    /// Potential vorticity levels
    Pv,
}

impl LevelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ml => "ml",
            Self::Pl => "pl",
            Self::Pv => "pv",
        }
    }
}

/// Settings shared by every request of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalSettings {
    pub dataset: String,
    pub area: Area,
    pub grid: Grid,
    /// Output format name understood by the service ("netcdf", "grib")
    pub format: String,
}

impl RetrievalSettings {
    /// File extension matching the output format.
    pub fn extension(&self) -> &'static str {
        match self.format.as_str() {
            "grib" | "grib1" | "grib2" => "grib",
            _ => "nc",
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            dataset: DEFAULT_DATASET.to_string(),
            area: Area::global(),
            grid: Grid::default(),
            format: "netcdf".to_string(),
        }
    }
}

/// One complete retrieval request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductSpec {
    pub kind: ArtifactKind,
    pub dataset: String,
    pub window: TargetWindow,
    pub level_type: LevelType,
    pub levels: &'static str,
    pub params: &'static str,
    /// Spectral resolution ("av" full, "21" for T21); model levels only
    pub resolution: Option<&'static str>,
    pub times: Vec<String>,
    pub area: Area,
    pub grid: Grid,
    pub format: String,
}

impl ProductSpec {
    /// Build the request for a retrieved kind.
    ///
    /// Returns `None` for the interpolated kind, which is derived locally.
    pub fn for_artifact(
        kind: ArtifactKind,
        window: TargetWindow,
        settings: &RetrievalSettings,
    ) -> Option<Self> {
        let (level_type, levels, params, resolution) = match kind {
            ArtifactKind::ModelLevelRaw => {
                (LevelType::Ml, MODEL_LEVELS, MODEL_LEVEL_PARAMS, Some("av"))
            }
            ArtifactKind::ModelLevelTruncatedRaw => {
                (LevelType::Ml, MODEL_LEVELS, MODEL_LEVEL_PARAMS, Some("21"))
            }
            ArtifactKind::PressureLevel => {
                (LevelType::Pl, PRESSURE_LEVELS, PRESSURE_LEVEL_PARAMS, None)
            }
            ArtifactKind::PotentialVorticityLevel => {
                (LevelType::Pv, PV_LEVEL, PV_LEVEL_PARAMS, None)
            }
            ArtifactKind::ModelLevelInterpolated => return None,
        };

        Some(Self {
            kind,
            dataset: settings.dataset.clone(),
            window,
            level_type,
            levels,
            params,
            resolution,
            times: time::hourly_samples(),
            area: settings.area,
            grid: settings.grid,
            format: settings.format.clone(),
        })
    }

    /// Request body sent to the retrieval service.
    pub fn to_request(&self) -> Value {
        let mut request = Map::new();
        request.insert("class".into(), json!("ea"));
        request.insert("date".into(), json!(self.window.to_request_string()));
        request.insert("expver".into(), json!("1"));
        request.insert("levelist".into(), json!(self.levels));
        request.insert("levtype".into(), json!(self.level_type.as_str()));
        request.insert("param".into(), json!(self.params));
        request.insert("stream".into(), json!("oper"));
        request.insert("time".into(), json!(self.times.join("/")));
        request.insert("type".into(), json!("an"));
        request.insert("area".into(), json!(self.area.to_request_string()));
        request.insert("grid".into(), json!(self.grid.to_request_string()));
        request.insert("format".into(), json!(self.format));
        if let Some(resol) = self.resolution {
            request.insert("resol".into(), json!(resol));
        }
        Value::Object(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn window() -> TargetWindow {
        TargetWindow::new(NaiveDate::from_ymd_opt(2019, 11, 5).unwrap(), 2)
    }

    fn settings() -> RetrievalSettings {
        RetrievalSettings {
            area: Area::from_request_string("-25/-120/-85/-30").unwrap(),
            ..RetrievalSettings::default()
        }
    }

    #[test]
    fn test_model_level_request() {
        let spec =
            ProductSpec::for_artifact(ArtifactKind::ModelLevelRaw, window(), &settings()).unwrap();
        let req = spec.to_request();

        assert_eq!(req["levtype"], "ml");
        assert_eq!(req["levelist"], "1/to/137");
        assert_eq!(req["resol"], "av");
        assert_eq!(req["date"], "2019-11-05/to/2019-11-06");
        assert_eq!(req["area"], "-25/-120/-85/-30");
        assert_eq!(req["grid"], "0.25/0.25");
        assert_eq!(req["format"], "netcdf");
        assert_eq!(req["time"].as_str().unwrap().split('/').count(), 24);
    }

    #[test]
    fn test_truncated_request_differs_only_in_resolution() {
        let full =
            ProductSpec::for_artifact(ArtifactKind::ModelLevelRaw, window(), &settings()).unwrap();
        let t21 = ProductSpec::for_artifact(
            ArtifactKind::ModelLevelTruncatedRaw,
            window(),
            &settings(),
        )
        .unwrap();

        let mut full_req = full.to_request();
        let mut t21_req = t21.to_request();
        assert_eq!(t21_req["resol"], "21");
        full_req.as_object_mut().unwrap().remove("resol");
        t21_req.as_object_mut().unwrap().remove("resol");
        assert_eq!(full_req, t21_req);
    }

    #[test]
    fn test_pressure_and_pv_requests() {
        let pl =
            ProductSpec::for_artifact(ArtifactKind::PressureLevel, window(), &settings()).unwrap();
        let req = pl.to_request();
        assert_eq!(req["levtype"], "pl");
        assert_eq!(req["levelist"].as_str().unwrap().split('/').count(), 37);
        assert!(req.get("resol").is_none());

        let pv = ProductSpec::for_artifact(
            ArtifactKind::PotentialVorticityLevel,
            window(),
            &settings(),
        )
        .unwrap();
        assert_eq!(pv.to_request()["levelist"], "2000");
        assert_eq!(pv.level_type, LevelType::Pv);
    }

    #[test]
    fn test_interpolated_kind_has_no_request() {
        assert!(ProductSpec::for_artifact(
            ArtifactKind::ModelLevelInterpolated,
            window(),
            &settings()
        )
        .is_none());
    }

    #[test]
    fn test_extension_follows_format() {
        let mut s = settings();
        assert_eq!(s.extension(), "nc");
        s.format = "grib".to_string();
        assert_eq!(s.extension(), "grib");
    }
}
