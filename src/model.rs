/// Core data types for the hydrofuse conditioning pipeline.
///
/// This module defines the shared domain model imported by all other modules:
/// timestamps, observations, the `Series` container, provenance tags, offsets
/// and the error taxonomy. It performs no I/O.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset};
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// An instant normalised to the analysis time zone.
///
/// Equality and ordering compare instants, so two values parsed with
/// different offsets but naming the same moment are equal.
pub type Timestamp = DateTime<FixedOffset>;

/// Identifier of a series in the upstream observation/forecast provider.
pub type SeriesId = u64;

/// Identifier of a node (location) in a topology.
pub type NodeId = u64;

/// Identifier of a variable (water level, discharge, ...) within a node.
pub type VariableId = u64;

// ---------------------------------------------------------------------------
// Provenance tags
// ---------------------------------------------------------------------------

/// Observed value loaded from the provider.
pub const TAG_OBS: &str = "obs";
/// Forecast value loaded from the provider.
pub const TAG_PRONO: &str = "prono";
pub const TAG_DERIVED: &str = "derived";
pub const TAG_INTERPOLATED: &str = "interpolated";
pub const TAG_EXTRAPOLATED: &str = "extrapolated";
pub const TAG_FILLED: &str = "filled";
pub const TAG_ADJUSTED: &str = "adjusted";
pub const TAG_MOVING_AVERAGE: &str = "moving_average";
pub const TAG_LINEAR_COMBINATION: &str = "linear_combination";

/// Composes a provenance tag by comma-appending `stage` onto `previous`.
///
/// ```
/// use hydrofuse::model::append_tag;
/// assert_eq!(append_tag(Some("obs"), "derived"), "obs,derived");
/// assert_eq!(append_tag(None, "filled"), "filled");
/// ```
pub fn append_tag(previous: Option<&str>, stage: &str) -> String {
    match previous {
        Some(prev) if !prev.is_empty() => format!("{},{}", prev, stage),
        _ => stage.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Observation / Series
// ---------------------------------------------------------------------------

/// A single `(timestamp, value, tag)` cell of a series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub timestamp: Timestamp,
    pub value: Option<f64>,
    pub tag: Option<String>,
}

impl Observation {
    pub fn new(timestamp: Timestamp, value: Option<f64>, tag: Option<&str>) -> Self {
        Self {
            timestamp,
            value,
            tag: tag.map(String::from),
        }
    }

    /// A missing cell: no value, no provenance.
    pub fn null(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            value: None,
            tag: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

/// An ordered, timestamp-unique sequence of observations.
///
/// Values and tags live in the same `Observation`, so the two are aligned by
/// construction. Timestamps are strictly increasing; every constructor sorts
/// and drops duplicates (the last occurrence of a timestamp wins).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Series {
    observations: Vec<Observation>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_observations(mut observations: Vec<Observation>) -> Self {
        // Stable sort keeps input order among equal timestamps, so the
        // reverse-dedup below retains the last one.
        observations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let mut unique: Vec<Observation> = Vec::with_capacity(observations.len());
        for obs in observations {
            match unique.last_mut() {
                Some(last) if last.timestamp == obs.timestamp => *last = obs,
                _ => unique.push(obs),
            }
        }
        Self {
            observations: unique,
        }
    }

    /// Builds a series from `(timestamp, value)` pairs, tagging every
    /// non-null value with `tag`.
    pub fn from_values(points: &[(Timestamp, Option<f64>)], tag: Option<&str>) -> Self {
        Self::from_observations(
            points
                .iter()
                .map(|(t, v)| Observation::new(*t, *v, if v.is_some() { tag } else { None }))
                .collect(),
        )
    }

    /// An all-null series over the given timestamps, each cell tagged `tag`.
    pub fn all_null(timestamps: &[Timestamp], tag: Option<&str>) -> Self {
        Self::from_observations(
            timestamps
                .iter()
                .map(|t| Observation::new(*t, None, tag))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn into_observations(self) -> Vec<Observation> {
        self.observations
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Observation> {
        self.observations.iter()
    }

    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.observations.iter().map(|o| o.timestamp).collect()
    }

    pub fn values(&self) -> Vec<Option<f64>> {
        self.observations.iter().map(|o| o.value).collect()
    }

    /// Looks up the cell at exactly `timestamp`.
    pub fn get(&self, timestamp: &Timestamp) -> Option<&Observation> {
        self.observations
            .binary_search_by(|o| o.timestamp.cmp(timestamp))
            .ok()
            .map(|idx| &self.observations[idx])
    }

    pub fn value_at(&self, timestamp: &Timestamp) -> Option<f64> {
        self.get(timestamp).and_then(|o| o.value)
    }

    pub fn null_count(&self) -> usize {
        self.observations.iter().filter(|o| o.is_null()).count()
    }

    pub fn non_null_count(&self) -> usize {
        self.len() - self.null_count()
    }

    /// Timestamp of the earliest non-null value.
    pub fn first_valid_timestamp(&self) -> Option<Timestamp> {
        self.observations
            .iter()
            .find(|o| o.value.is_some())
            .map(|o| o.timestamp)
    }

    /// Timestamp of the latest non-null value.
    pub fn last_valid_timestamp(&self) -> Option<Timestamp> {
        self.observations
            .iter()
            .rev()
            .find(|o| o.value.is_some())
            .map(|o| o.timestamp)
    }

    /// Keeps only the cells for which `keep` returns true.
    pub fn filter<F>(&self, keep: F) -> Series
    where
        F: Fn(&Observation) -> bool,
    {
        Series {
            observations: self.observations.iter().filter(|o| keep(o)).cloned().collect(),
        }
    }

    /// Sorted union of the timestamps of all `series`.
    pub fn union_index(series: &[&Series]) -> Vec<Timestamp> {
        let set: BTreeSet<Timestamp> = series
            .iter()
            .flat_map(|s| s.observations.iter().map(|o| o.timestamp))
            .collect();
        set.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Offsets
// ---------------------------------------------------------------------------

/// Horizontal displacement applied to a series.
///
/// A `Duration` relabels every timestamp; `Rows` shifts values and tags
/// positionally along the existing index, leaving timestamps in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XOffset {
    Duration(Duration),
    Rows(i64),
}

impl Default for XOffset {
    fn default() -> Self {
        XOffset::Rows(0)
    }
}

impl XOffset {
    pub fn is_zero(&self) -> bool {
        match self {
            XOffset::Duration(d) => d.is_zero(),
            XOffset::Rows(n) => *n == 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

/// The stages of a batch run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Configure,
    Load,
    Outliers,
    Jumps,
    Offset,
    Regularize,
    MovingAverage,
    FillNulls,
    Calibrate,
    Splice,
    Derive,
    Interpolate,
    Publish,
    Upload,
    Procedure,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configure => "configure",
            Stage::Load => "load",
            Stage::Outliers => "outliers",
            Stage::Jumps => "jumps",
            Stage::Offset => "offset",
            Stage::Regularize => "regularize",
            Stage::MovingAverage => "moving_average",
            Stage::FillNulls => "fill_nulls",
            Stage::Calibrate => "calibrate",
            Stage::Splice => "splice",
            Stage::Derive => "derive",
            Stage::Interpolate => "interpolate",
            Stage::Publish => "publish",
            Stage::Upload => "upload",
            Stage::Procedure => "procedure",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// Non-fatal issues
// ---------------------------------------------------------------------------

/// Classes of non-fatal conditions recorded during a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Empty fetch, empty forecast or empty derivation origin.
    DataAvailability,
    /// Calibration skipped for lack of usable truth/sim pairs.
    CalibrationData,
}

/// A non-fatal condition attached to the variable it degraded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineIssue {
    pub stage: Stage,
    pub kind: IssueKind,
    pub message: String,
}

impl PipelineIssue {
    pub fn data_availability(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: IssueKind::DataAvailability,
            message: message.into(),
        }
    }

    pub fn calibration(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: IssueKind::CalibrationData,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Fatal problems in a topology description, detected at construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error(
        "origin node {node_id} variable {variable_id} not found, required by node {required_by_node} variable {required_by_variable}"
    )]
    UnresolvedReference {
        node_id: NodeId,
        variable_id: VariableId,
        required_by_node: NodeId,
        required_by_variable: VariableId,
    },

    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),

    #[error("duplicate variable id {variable_id} in node {node_id}")]
    DuplicateVariable {
        node_id: NodeId,
        variable_id: VariableId,
    },

    #[error("invalid interpolation_limit {limit} for {context}: must be greater than 0")]
    InvalidInterpolationLimit { context: String, limit: i64 },

    #[error("invalid {field} for {context}: {message}")]
    InvalidValue {
        context: String,
        field: String,
        message: String,
    },

    #[error("derived variables form a dependency cycle through {0}")]
    DependencyCycle(String),

    #[error("invalid analysis window: timestart {timestart} must be before timeend {timeend}")]
    InvalidWindow { timestart: String, timeend: String },

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("malformed description: {0}")]
    Malformed(String),
}

/// Failures reported by the upstream observation/forecast provider.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// Non-2xx HTTP response, with the raw body as message.
    #[error("HTTP error: {status}: {message}")]
    Http { status: u16, message: String },
    /// The request could not be sent or the body could not be read.
    #[error("Request failed: {0}")]
    Request(String),
    /// The response body could not be deserialized.
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Calibration could not estimate coefficients. Non-fatal: the caller keeps
/// the uncalibrated data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationDataError {
    #[error("no overlapping non-null truth/sim pairs to estimate coefficients")]
    NoValidPairs,
    #[error("least squares system is singular ({pairs} pairs)")]
    Singular { pairs: usize },
}

/// Errors that abort a batch run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("provider failure for series {series_id} during {stage}: {source}")]
    Provider {
        series_id: SeriesId,
        stage: Stage,
        #[source]
        source: ProviderError,
    },

    #[error("provider failure filing forecast run for model {cal_id}: {source}")]
    ForecastUpload {
        cal_id: u64,
        #[source]
        source: ProviderError,
    },

    #[error("topology was already processed; build a fresh topology to reprocess")]
    AlreadyProcessed,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32) -> Timestamp {
        FixedOffset::west_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_series_sorts_and_keeps_last_duplicate() {
        let series = Series::from_observations(vec![
            Observation::new(t(2), Some(2.0), Some("obs")),
            Observation::new(t(0), Some(0.0), Some("obs")),
            Observation::new(t(2), Some(9.0), Some("obs")),
        ]);
        assert_eq!(series.timestamps(), vec![t(0), t(2)]);
        assert_eq!(
            series.value_at(&t(2)),
            Some(9.0),
            "the last duplicate of a timestamp should win"
        );
    }

    #[test]
    fn test_equal_instants_in_different_offsets_are_equal() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let local = t(9);
        let same = local.with_timezone(&utc);
        assert_eq!(local, same);
    }

    #[test]
    fn test_first_and_last_valid_timestamps_skip_nulls() {
        let series = Series::from_values(
            &[(t(0), None), (t(1), Some(1.0)), (t(2), Some(2.0)), (t(3), None)],
            Some(TAG_OBS),
        );
        assert_eq!(series.first_valid_timestamp(), Some(t(1)));
        assert_eq!(series.last_valid_timestamp(), Some(t(2)));
        assert_eq!(series.null_count(), 2);
    }

    #[test]
    fn test_from_values_only_tags_non_null_cells() {
        let series = Series::from_values(&[(t(0), None), (t(1), Some(1.0))], Some(TAG_OBS));
        assert_eq!(series.observations()[0].tag, None);
        assert_eq!(series.observations()[1].tag.as_deref(), Some("obs"));
    }

    #[test]
    fn test_append_tag_composes_stage_names() {
        let tag = append_tag(Some(&append_tag(Some(TAG_OBS), TAG_DERIVED)), TAG_INTERPOLATED);
        assert_eq!(tag, "obs,derived,interpolated");
    }

    #[test]
    fn test_union_index_merges_without_duplicates() {
        let a = Series::from_values(&[(t(0), Some(1.0)), (t(2), Some(1.0))], None);
        let b = Series::from_values(&[(t(1), Some(1.0)), (t(2), Some(1.0))], None);
        assert_eq!(Series::union_index(&[&a, &b]), vec![t(0), t(1), t(2)]);
    }

    #[test]
    fn test_x_offset_zero_detection() {
        assert!(XOffset::default().is_zero());
        assert!(XOffset::Duration(Duration::zero()).is_zero());
        assert!(!XOffset::Rows(-1).is_zero());
    }
}
