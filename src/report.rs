/// Provenance reporting
///
/// After a batch run every variable can account for its gaps: how many rows
/// it has, how many are still null, which stage produced each value (the
/// tag histogram) and which non-fatal issues degraded it. The pivot view
/// lines all variables up on one shared time index.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::analysis::cleaning::{JumpRow, OutlierRow};
use crate::analysis::regression::CalibrationStats;
use crate::model::{PipelineIssue, Series, SeriesId, Timestamp};
use crate::timegrid::format_timestamp;
use crate::topology::variable::Variable;
use crate::topology::{Topology, VariableRef};

const UNTAGGED: &str = "untagged";

// ---------------------------------------------------------------------------
// Per-series summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesReport {
    pub len: usize,
    pub nulls: usize,
    /// Count of non-null rows per tag. Null rows are not counted.
    pub tags: BTreeMap<String, usize>,
    pub first_observed: Option<Timestamp>,
    pub last_observed: Option<Timestamp>,
}

pub fn summarize(series: &Series) -> SeriesReport {
    let mut tags = BTreeMap::new();
    for obs in series.iter().filter(|o| !o.is_null()) {
        let tag = obs.tag.clone().unwrap_or_else(|| UNTAGGED.to_string());
        *tags.entry(tag).or_insert(0) += 1;
    }
    SeriesReport {
        len: series.len(),
        nulls: series.null_count(),
        tags,
        first_observed: series.first_valid_timestamp(),
        last_observed: series.last_valid_timestamp(),
    }
}

// ---------------------------------------------------------------------------
// Per-variable report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeafReport {
    pub series_id: SeriesId,
    pub summary: SeriesReport,
    pub outliers: Vec<OutlierRow>,
    pub jumps: Vec<JumpRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastReport {
    pub series_id: SeriesId,
    pub model_id: u64,
    pub summary: SeriesReport,
    pub calibration: Option<CalibrationStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableReport {
    pub reference: VariableRef,
    pub label: String,
    pub derived: bool,
    pub data: SeriesReport,
    pub original: Option<SeriesReport>,
    pub inputs: Vec<LeafReport>,
    pub forecasts: Vec<ForecastReport>,
    pub calibration: Option<CalibrationStats>,
    pub max_obs_date: Option<Timestamp>,
    /// Forecast written back by an external procedure, if any.
    pub procedure_forecast: Option<SeriesReport>,
    pub issues: Vec<PipelineIssue>,
}

impl VariableReport {
    pub fn from_variable(variable: &Variable) -> Self {
        VariableReport {
            reference: variable.reference(),
            label: variable.label(),
            derived: variable.is_derived(),
            data: summarize(&variable.data),
            original: variable.original_data.as_ref().map(summarize),
            inputs: variable
                .input_series()
                .iter()
                .map(|s| LeafReport {
                    series_id: s.series_id,
                    summary: summarize(&s.data),
                    outliers: s.outliers.clone(),
                    jumps: s.jumps.clone(),
                })
                .collect(),
            forecasts: variable
                .forecast_series
                .iter()
                .map(|f| ForecastReport {
                    series_id: f.leaf.series_id,
                    model_id: f.selector.model_id,
                    summary: summarize(&f.leaf.data),
                    calibration: f.calibration.clone(),
                })
                .collect(),
            calibration: variable.calibration_stats.clone(),
            max_obs_date: variable.max_obs_date,
            procedure_forecast: variable.procedure_forecast.as_ref().map(summarize),
            issues: variable.issues.clone(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.issues.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Topology report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyReport {
    pub timestart: Timestamp,
    pub timeend: Timestamp,
    pub forecast_timeend: Timestamp,
    pub variables: Vec<VariableReport>,
}

impl TopologyReport {
    pub fn degraded(&self) -> usize {
        self.variables.iter().filter(|v| v.is_degraded()).count()
    }

    pub fn total_nulls(&self) -> usize {
        self.variables.iter().map(|v| v.data.nulls).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for TopologyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "═".repeat(63);
        writeln!(f, "{}", rule)?;
        writeln!(f, "PIPELINE SUMMARY")?;
        writeln!(
            f,
            "{} → {} (forecast to {})",
            format_timestamp(&self.timestart),
            format_timestamp(&self.timeend),
            format_timestamp(&self.forecast_timeend)
        )?;
        writeln!(f, "{}", rule)?;

        for variable in &self.variables {
            let status = if variable.is_degraded() { "⚠" } else { "✓" };
            let tags: Vec<String> = variable.data.tags.iter().map(|(tag, n)| format!("{}={}", tag, n)).collect();
            writeln!(
                f,
                "{} {:<40} {:>5} rows  {:>4} nulls  [{}]",
                status,
                variable.label,
                variable.data.len,
                variable.data.nulls,
                tags.join(" ")
            )?;
            if let Some(forecast) = &variable.procedure_forecast {
                writeln!(f, "    procedure forecast: {} rows", forecast.len)?;
            }
            for issue in &variable.issues {
                writeln!(f, "    {}: {}", issue.stage, issue.message)?;
            }
        }

        writeln!(f)?;
        writeln!(
            f,
            "Variables: {} ({} degraded)  Remaining nulls: {}",
            self.variables.len(),
            self.degraded(),
            self.total_nulls()
        )?;
        writeln!(f, "{}", rule)
    }
}

pub fn format_summary(report: &TopologyReport) -> String {
    report.to_string()
}

pub fn print_summary(report: &TopologyReport) {
    print!("{}", report);
}

// ---------------------------------------------------------------------------
// Pivot view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotRow {
    pub timestamp: Timestamp,
    pub values: Vec<Option<f64>>,
    pub tags: Vec<Option<String>>,
}

/// All variables on the union of their timestamps, one column per variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotTable {
    /// `node_id/variable_id` per column.
    pub columns: Vec<String>,
    pub rows: Vec<PivotRow>,
}

impl PivotTable {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Topology {
    pub fn report(&self) -> TopologyReport {
        TopologyReport {
            timestart: self.timestart,
            timeend: self.timeend,
            forecast_timeend: self.forecast_timeend,
            variables: self.variables().map(VariableReport::from_variable).collect(),
        }
    }

    pub fn pivot(&self) -> PivotTable {
        let variables: Vec<&Variable> = self.variables().collect();
        let columns = variables
            .iter()
            .map(|v| format!("{}/{}", v.node_id, v.id))
            .collect();
        let all: Vec<&Series> = variables.iter().map(|v| &v.data).collect();
        let rows = Series::union_index(&all)
            .into_iter()
            .map(|t| {
                let cells: Vec<_> = all.iter().map(|s| s.get(&t)).collect();
                PivotRow {
                    timestamp: t,
                    values: cells.iter().map(|c| c.and_then(|o| o.value)).collect(),
                    tags: cells.iter().map(|c| c.and_then(|o| o.tag.clone())).collect(),
                }
            })
            .collect();
        PivotTable { columns, rows }
    }
}
