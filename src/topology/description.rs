/// Declarative topology description, as read from JSON or TOML.
///
/// These structs mirror the file format one-to-one and carry no behaviour
/// beyond loading; validation and resolution happen in `Topology::new`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::regular::RegularizeMode;
use crate::ingest::SeriesType;
use crate::model::{ConfigurationError, NodeId, SeriesId, VariableId};
use crate::timegrid::Interval;

/// Either a row count or a calendar interval. Used for horizontal offsets and
/// for the topology-wide interpolation limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StepsOrInterval {
    Rows(i64),
    Interval(Interval),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyDescription {
    pub timestart: String,
    pub timeend: String,
    /// End of the forecast window; defaults to `timeend`.
    #[serde(default)]
    pub forecast_timeend: Option<String>,
    /// Added to both window ends after truncating them to the day.
    #[serde(default)]
    pub time_offset: Option<Interval>,
    #[serde(default)]
    pub time_offset_start: Option<Interval>,
    #[serde(default)]
    pub time_offset_end: Option<Interval>,
    /// Default gap limit for variables that set none.
    #[serde(default)]
    pub interpolation_limit: Option<StepsOrInterval>,
    /// Whether interpolating regularization and the final interpolation stage
    /// fill leading/trailing gaps.
    #[serde(default)]
    pub extrapolate: bool,
    /// Model id outputs are filed under by `Topology::upload_as_forecast`.
    #[serde(default)]
    pub cal_id: Option<u64>,
    /// Drop forecast values at or before the last observation when splicing.
    #[serde(default = "default_true")]
    pub ignore_warmup: bool,
    pub nodes: Vec<NodeDescription>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDescription {
    pub id: NodeId,
    pub name: String,
    pub variables: Vec<VariableDescription>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VariableDescription {
    pub id: VariableId,
    #[serde(default)]
    pub name: Option<String>,
    pub time_interval: Interval,
    /// Time-of-day offset of the grid for daily variables.
    #[serde(default)]
    pub time_offset: Option<Interval>,
    /// Interval each published value represents; sets `timeend` on upload.
    #[serde(default)]
    pub time_support: Option<Interval>,
    #[serde(default)]
    pub input_series: Vec<InputSeriesDescription>,
    #[serde(default)]
    pub forecast_series: Vec<ForecastSeriesDescription>,
    #[serde(default)]
    pub derived_from: Option<DerivedFromDescription>,
    #[serde(default)]
    pub interpolated_from: Option<InterpolatedFromDescription>,
    #[serde(default)]
    pub fallback_value: Option<f64>,
    #[serde(default)]
    pub calibration: Option<CalibrationDescription>,
    #[serde(default)]
    pub linear_combination: Option<LinearCombinationDescription>,
    #[serde(default)]
    pub interpolation_limit: Option<i64>,
    #[serde(default)]
    pub regularize_mode: RegularizeMode,
    #[serde(default)]
    pub output_series: Vec<OutputSeriesDescription>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InputSeriesDescription {
    pub series_id: SeriesId,
    #[serde(default)]
    pub series_type: SeriesType,
    #[serde(default)]
    pub outlier_bounds: Option<[f64; 2]>,
    #[serde(default)]
    pub jump_threshold: Option<f64>,
    #[serde(default)]
    pub x_offset: Option<StepsOrInterval>,
    #[serde(default)]
    pub y_offset: f64,
    #[serde(default)]
    pub moving_average: Option<Interval>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ForecastSeriesDescription {
    pub series_id: SeriesId,
    pub model_id: u64,
    #[serde(default)]
    pub run_id: Option<u64>,
    #[serde(default)]
    pub forecast_date: Option<String>,
    #[serde(default)]
    pub qualifier: Option<String>,
    /// Calibrate this forecast against the first input series.
    #[serde(default)]
    pub adjust: bool,
    #[serde(default)]
    pub outlier_bounds: Option<[f64; 2]>,
    #[serde(default)]
    pub jump_threshold: Option<f64>,
    #[serde(default)]
    pub x_offset: Option<StepsOrInterval>,
    #[serde(default)]
    pub y_offset: f64,
    #[serde(default)]
    pub moving_average: Option<Interval>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DerivedFromDescription {
    pub node_id: NodeId,
    pub variable_id: VariableId,
    #[serde(default)]
    pub x_offset: Option<StepsOrInterval>,
    #[serde(default)]
    pub y_offset: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InterpolatedFromDescription {
    pub node_id_1: NodeId,
    pub variable_id_1: VariableId,
    pub node_id_2: NodeId,
    pub variable_id_2: VariableId,
    pub interpolation_coefficient: f64,
    #[serde(default)]
    pub x_offset: Option<StepsOrInterval>,
    #[serde(default)]
    pub y_offset: f64,
}

/// Indices into the variable's `input_series`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationDescription {
    pub truth: usize,
    pub sim: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LinearCombinationDescription {
    #[serde(default)]
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSeriesDescription {
    pub series_id: SeriesId,
    #[serde(default)]
    pub series_type: SeriesType,
    #[serde(default)]
    pub x_offset: Option<StepsOrInterval>,
    #[serde(default)]
    pub y_offset: f64,
}

impl TopologyDescription {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(raw).map_err(|e| ConfigurationError::Malformed(e.to_string()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(raw).map_err(|e| ConfigurationError::Malformed(e.to_string()))
    }

    /// Reads a description file, choosing the format by extension (`.toml`,
    /// anything else is parsed as JSON).
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Malformed(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            _ => Self::from_json_str(&raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
        "timestart": "2022-05-01",
        "timeend": "2022-05-10",
        "interpolation_limit": {"hours": 6},
        "nodes": [
            {"id": 1, "name": "Paraná", "variables": [
                {"id": 2, "time_interval": {"days": 1},
                 "input_series": [{"series_id": 151, "outlier_bounds": [0, 20], "x_offset": -1}],
                 "forecast_series": [{"series_id": 3398, "model_id": 289, "adjust": true}]}
            ]},
            {"id": 5, "name": "Rosario", "variables": [
                {"id": 2, "time_interval": {"days": 1},
                 "derived_from": {"node_id": 1, "variable_id": 2, "x_offset": {"days": 1}, "y_offset": 0.3}}
            ]}
        ]
    }"#;

    #[test]
    fn test_json_description_parses() {
        let description = TopologyDescription::from_json_str(JSON).expect("valid description");
        assert_eq!(description.nodes.len(), 2);
        assert!(description.ignore_warmup, "ignore_warmup defaults to true");
        assert!(!description.extrapolate);
        assert_eq!(description.nodes[0].variables[0].regularize_mode, RegularizeMode::Reindex);
        assert_eq!(
            description.interpolation_limit,
            Some(StepsOrInterval::Interval(Interval::hours(6)))
        );

        let input = &description.nodes[0].variables[0].input_series[0];
        assert_eq!(input.outlier_bounds, Some([0.0, 20.0]));
        assert_eq!(input.x_offset, Some(StepsOrInterval::Rows(-1)));

        let derived = description.nodes[1].variables[0].derived_from.as_ref().unwrap();
        assert_eq!(derived.x_offset, Some(StepsOrInterval::Interval(Interval::days(1))));
    }

    #[test]
    fn test_toml_description_parses() {
        let raw = r#"
            timestart = "2022-05-01"
            timeend = "2022-05-10"
            interpolation_limit = 3

            [[nodes]]
            id = 1
            name = "Paraná"

            [[nodes.variables]]
            id = 2
            time_interval = { hours = 1 }
            regularize_mode = "nearest"

            [[nodes.variables.input_series]]
            series_id = 151
            series_type = "areal"
        "#;
        let description = TopologyDescription::from_toml_str(raw).expect("valid toml");
        let variable = &description.nodes[0].variables[0];
        assert_eq!(variable.regularize_mode, RegularizeMode::Nearest);
        assert_eq!(variable.input_series[0].series_type, SeriesType::Areal);
        assert_eq!(description.interpolation_limit, Some(StepsOrInterval::Rows(3)));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let raw = r#"{"timestart": "2022-05-01", "timeend": "2022-05-02", "nodes": [], "colour": "blue"}"#;
        assert!(matches!(
            TopologyDescription::from_json_str(raw),
            Err(ConfigurationError::Malformed(_))
        ));
    }
}
