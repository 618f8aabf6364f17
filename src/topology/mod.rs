/// The topology graph and its batch pipeline.
///
/// Nodes live in an arena (`Vec<Node>`) with an id → index map; derived
/// variables refer to their origins by `(node_id, variable_id)` and are
/// resolved through that map, never by reference. Construction validates the
/// whole description and fails fast on any unresolved reference or invalid
/// limit; `batch_process` then runs every stage across all nodes before
/// moving on to the next.
///
/// Submodules:
/// - `description` — serde structs for the JSON/TOML description.
/// - `series`      — leaf series (observed and forecast).
/// - `derived`     — single-origin and two-origin derivations.
/// - `variable`    — per-variable stage logic.
/// - `node`        — per-node fan-out.

pub mod derived;
pub mod description;
pub mod node;
pub mod series;
pub mod variable;

use std::collections::{HashMap, VecDeque};

use chrono::{Duration, FixedOffset};
use rayon::prelude::*;

pub use derived::VariableRef;
use description::{StepsOrInterval, TopologyDescription};
use node::Node;
use series::LoadContext;
use variable::{Variable, VariableKind, Window};

use crate::config::RunContext;
use crate::ingest::{ForecastOutputSeries, ObservationProvider, RawObservation};
use crate::logging::{log_provider_failure, log_stage_summary, Logger};
use crate::model::{ConfigurationError, NodeId, PipelineError, Series, Stage, Timestamp};
use crate::timegrid::{normalize_day, parse_timestamp};

pub struct Topology {
    pub timestart: Timestamp,
    pub timeend: Timestamp,
    pub forecast_timeend: Timestamp,
    pub extrapolate: bool,
    pub ignore_warmup: bool,
    pub cal_id: Option<u64>,
    zone: FixedOffset,
    logger: Logger,
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    derive_order: Vec<VariableRef>,
    processed: bool,
}

fn origins_of(variable: &Variable) -> Vec<VariableRef> {
    match &variable.kind {
        VariableKind::Derived { source } => source.origins(),
        VariableKind::Observed { .. } => Vec::new(),
    }
}

impl Topology {
    pub fn new(description: &TopologyDescription, context: &RunContext) -> Result<Self, ConfigurationError> {
        let zone = context.timezone;
        let parse = |raw: &str| parse_timestamp(raw, zone).map_err(ConfigurationError::InvalidTimestamp);

        let default_offset = description
            .time_offset
            .map(|i| i.to_duration())
            .unwrap_or_else(Duration::zero);
        let start_offset = description.time_offset_start.map_or(default_offset, |i| i.to_duration());
        let end_offset = description.time_offset_end.map_or(default_offset, |i| i.to_duration());

        let timestart = normalize_day(&parse(&description.timestart)?, start_offset);
        let timeend = normalize_day(&parse(&description.timeend)?, end_offset);
        if timestart >= timeend {
            return Err(ConfigurationError::InvalidWindow {
                timestart: timestart.to_rfc3339(),
                timeend: timeend.to_rfc3339(),
            });
        }

        let forecast_timeend = match &description.forecast_timeend {
            Some(raw) => parse(raw)?,
            None => timeend,
        };
        if forecast_timeend < timeend {
            return Err(ConfigurationError::InvalidValue {
                context: "topology".to_string(),
                field: "forecast_timeend".to_string(),
                message: "must not precede timeend".to_string(),
            });
        }

        match description.interpolation_limit {
            Some(StepsOrInterval::Rows(limit)) if limit <= 0 => {
                return Err(ConfigurationError::InvalidInterpolationLimit {
                    context: "topology".to_string(),
                    limit,
                });
            }
            Some(StepsOrInterval::Interval(i)) if i.to_duration() <= Duration::zero() => {
                return Err(ConfigurationError::InvalidInterpolationLimit {
                    context: "topology".to_string(),
                    limit: i.to_duration().num_seconds(),
                });
            }
            _ => {}
        }

        let window = Window {
            start: timestart,
            end: timeend,
            forecast_end: forecast_timeend,
            time_offset: Some(start_offset),
            interpolation_limit: description.interpolation_limit,
        };

        let mut nodes = Vec::with_capacity(description.nodes.len());
        let mut index = HashMap::new();
        for node_description in &description.nodes {
            if index.insert(node_description.id, nodes.len()).is_some() {
                return Err(ConfigurationError::DuplicateNode(node_description.id));
            }
            nodes.push(Node::from_description(node_description, &window, zone)?);
        }

        let mut topology = Topology {
            timestart,
            timeend,
            forecast_timeend,
            extrapolate: description.extrapolate,
            ignore_warmup: description.ignore_warmup,
            cal_id: description.cal_id,
            zone,
            logger: context.logger.clone(),
            nodes,
            index,
            derive_order: Vec::new(),
            processed: false,
        };
        topology.resolve_references()?;
        topology.derive_order = topology.topological_order()?;
        Ok(topology)
    }

    /// Every derived origin must name an existing node and variable.
    fn resolve_references(&self) -> Result<(), ConfigurationError> {
        for variable in self.variables() {
            for origin in origins_of(variable) {
                if self.variable(origin).is_none() {
                    return Err(ConfigurationError::UnresolvedReference {
                        node_id: origin.node_id,
                        variable_id: origin.variable_id,
                        required_by_node: variable.node_id,
                        required_by_variable: variable.id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Orders derived variables so every origin is derived before its
    /// dependents (Kahn's algorithm). Ties keep declaration order.
    fn topological_order(&self) -> Result<Vec<VariableRef>, ConfigurationError> {
        let derived: Vec<&Variable> = self.variables().filter(|v| v.is_derived()).collect();
        let position: HashMap<VariableRef, usize> =
            derived.iter().enumerate().map(|(i, v)| (v.reference(), i)).collect();

        let mut in_degree = vec![0usize; derived.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); derived.len()];
        for (i, variable) in derived.iter().enumerate() {
            for origin in origins_of(variable) {
                if let Some(&parent) = position.get(&origin) {
                    in_degree[i] += 1;
                    children[parent].push(i);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..derived.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(derived.len());
        while let Some(i) = queue.pop_front() {
            order.push(derived[i].reference());
            for &child in &children[i] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        if order.len() != derived.len() {
            let cycle: Vec<String> = derived
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, v)| v.reference().to_string())
                .collect();
            return Err(ConfigurationError::DependencyCycle(cycle.join(", ")));
        }
        Ok(order)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn variable(&self, reference: VariableRef) -> Option<&Variable> {
        self.node(reference.node_id)?.variable(reference.variable_id)
    }

    pub(crate) fn variable_mut(&mut self, reference: VariableRef) -> Option<&mut Variable> {
        locate_mut(&mut self.nodes, &self.index, reference)
    }

    /// All variables, in node declaration order then variable id order.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.nodes.iter().flat_map(|n| n.variables.values())
    }

    pub fn derive_order(&self) -> &[VariableRef] {
        &self.derive_order
    }

    pub fn timezone(&self) -> FixedOffset {
        self.zone
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    fn summarize(&self, stage: Stage) {
        let total = self.variables().count();
        let degraded = self
            .variables()
            .filter(|v| v.issues.iter().any(|issue| issue.stage == stage))
            .count();
        log_stage_summary(&self.logger, stage, total, degraded);
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Runs the whole pipeline once. A topology cannot be processed twice.
    pub fn batch_process(&mut self, provider: &dyn ObservationProvider, include_forecast: bool) -> Result<(), PipelineError> {
        if self.processed {
            return Err(PipelineError::AlreadyProcessed);
        }
        self.processed = true;

        self.load_data(provider, include_forecast)?;
        self.remove_outliers();
        self.detect_jumps();
        self.apply_offset();
        self.regularize();
        self.apply_moving_average();
        self.fill_nulls();
        self.calibrate();
        if include_forecast {
            self.splice_forecast();
        }
        self.derive(include_forecast);
        self.interpolate_final();
        self.publish_output();
        Ok(())
    }

    /// Fetches every leaf series. Leaves are independent, so nodes,
    /// variables and leaves are all loaded in parallel.
    pub fn load_data(&mut self, provider: &dyn ObservationProvider, include_forecast: bool) -> Result<(), PipelineError> {
        self.logger.debug(Stage::Load, None, "loading leaf series");
        let ctx = LoadContext {
            provider,
            start: self.timestart,
            end: self.timeend,
            forecast_end: self.forecast_timeend,
            zone: self.zone,
            logger: &self.logger,
        };
        self.nodes
            .par_iter_mut()
            .try_for_each(|node| node.load(&ctx, include_forecast))?;
        self.summarize(Stage::Load);
        Ok(())
    }

    pub fn remove_outliers(&mut self) -> bool {
        self.logger.debug(Stage::Outliers, None, "clamping outliers");
        self.nodes.iter_mut().fold(false, |applied, n| n.remove_outliers() | applied)
    }

    pub fn detect_jumps(&mut self) -> bool {
        self.logger.debug(Stage::Jumps, None, "detecting jumps");
        self.nodes.iter_mut().fold(false, |applied, n| n.detect_jumps() | applied)
    }

    pub fn apply_offset(&mut self) {
        self.logger.debug(Stage::Offset, None, "applying offsets");
        self.nodes.iter_mut().for_each(Node::apply_offset);
    }

    pub fn regularize(&mut self) {
        self.logger.debug(Stage::Regularize, None, "regularizing onto time grids");
        let extrapolate = self.extrapolate;
        for node in self.nodes.iter_mut() {
            node.regularize(extrapolate);
        }
    }

    pub fn apply_moving_average(&mut self) {
        self.logger.debug(Stage::MovingAverage, None, "applying moving averages");
        self.nodes.iter_mut().for_each(Node::apply_moving_average);
    }

    pub fn fill_nulls(&mut self) {
        self.logger.debug(Stage::FillNulls, None, "running fill cascade");
        self.nodes.iter_mut().for_each(Node::fill_nulls);
    }

    pub fn calibrate(&mut self) {
        self.logger.debug(Stage::Calibrate, None, "calibrating");
        for node in self.nodes.iter_mut() {
            node.calibrate(&self.logger);
        }
        self.summarize(Stage::Calibrate);
    }

    pub fn splice_forecast(&mut self) {
        self.logger.debug(Stage::Splice, None, "splicing forecasts");
        for node in self.nodes.iter_mut() {
            node.splice_forecast(self.ignore_warmup, &self.logger);
        }
    }

    /// Derives every derived variable in dependency order. With
    /// `include_forecast`, derived variables splice their own forecasts
    /// right after derivation.
    pub fn derive(&mut self, include_forecast: bool) {
        self.logger.debug(Stage::Derive, None, "deriving variables");
        for reference in self.derive_order.clone() {
            let origins = self.variable(reference).map(origins_of).unwrap_or_default();
            let origin_data: Vec<Series> = origins
                .iter()
                .filter_map(|o| self.variable(*o).map(|v| v.data.clone()))
                .collect();
            let origin_max = origins
                .first()
                .and_then(|o| self.variable(*o))
                .and_then(|v| v.max_obs_date);

            if let Some(variable) = locate_mut(&mut self.nodes, &self.index, reference) {
                let refs: Vec<&Series> = origin_data.iter().collect();
                variable.derive(&refs, origin_max, &self.logger);
                if include_forecast {
                    variable.splice_forecast(self.ignore_warmup, &self.logger);
                }
            }
        }
        self.summarize(Stage::Derive);
    }

    pub fn interpolate_final(&mut self) {
        self.logger.debug(Stage::Interpolate, None, "closing remaining gaps");
        let extrapolate = self.extrapolate;
        for node in self.nodes.iter_mut() {
            node.interpolate_final(extrapolate);
        }
    }

    pub fn publish_output(&mut self) {
        self.logger.debug(Stage::Publish, None, "publishing output series");
        self.nodes.iter_mut().for_each(Node::publish_output);
    }

    /// Pushes every output series to the provider. A failed push is logged
    /// and recorded; the remaining outputs are still uploaded.
    pub fn upload(&self, provider: &dyn ObservationProvider, include_forecast: bool) -> UploadSummary {
        let mut summary = UploadSummary::default();
        let mut attempted = 0;
        for variable in self.variables() {
            for output in &variable.output_series {
                let rows = variable.upload_rows(output, include_forecast);
                if rows.is_empty() {
                    continue;
                }
                attempted += 1;
                match provider.push_observations(output.series_id, output.series_type, &rows) {
                    Ok(stored) => {
                        self.logger.info(
                            Stage::Upload,
                            Some(&variable.label()),
                            &format!("uploaded {} observations to series {}", stored.len(), output.series_id),
                        );
                        summary.created.extend(stored);
                    }
                    Err(source) => {
                        log_provider_failure(&self.logger, output.series_id, Stage::Upload, "push_observations", &source);
                        summary.failed.push(PipelineError::Provider {
                            series_id: output.series_id,
                            stage: Stage::Upload,
                            source,
                        });
                    }
                }
            }
        }
        log_stage_summary(&self.logger, Stage::Upload, attempted, summary.failed.len());
        summary
    }

    /// Files every output series, forecast rows included, as one new forecast
    /// run of model `cal_id` issued at `timeend`. Returns the new run's id.
    pub fn upload_as_forecast(&self, provider: &dyn ObservationProvider) -> Result<u64, PipelineError> {
        let cal_id = self.cal_id.ok_or_else(|| ConfigurationError::InvalidValue {
            context: "topology".to_string(),
            field: "cal_id".to_string(),
            message: "required to upload outputs as a forecast run".to_string(),
        })?;

        let series: Vec<ForecastOutputSeries> = self
            .variables()
            .flat_map(|variable| {
                variable.output_series.iter().map(move |output| ForecastOutputSeries {
                    series_id: output.series_id,
                    series_type: output.series_type,
                    forecasts: variable.upload_rows(output, true),
                })
            })
            .collect();

        match provider.push_forecast(cal_id, &self.timeend, &series) {
            Ok(run_id) => {
                self.logger.info(
                    Stage::Upload,
                    None,
                    &format!("created forecast run {} of model {} with {} series", run_id, cal_id, series.len()),
                );
                Ok(run_id)
            }
            Err(source) => {
                self.logger.error(Stage::Upload, None, &format!("forecast run for model {} failed: {}", cal_id, source));
                Err(PipelineError::ForecastUpload { cal_id, source })
            }
        }
    }
}

/// Result of `Topology::upload`.
#[derive(Debug, Default)]
pub struct UploadSummary {
    pub created: Vec<RawObservation>,
    pub failed: Vec<PipelineError>,
}

fn locate_mut<'a>(nodes: &'a mut [Node], index: &HashMap<NodeId, usize>, reference: VariableRef) -> Option<&'a mut Variable> {
    let &i = index.get(&reference.node_id)?;
    nodes.get_mut(i)?.variable_mut(reference.variable_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timegrid::parse_utc_offset;

    fn context() -> RunContext {
        RunContext::new(parse_utc_offset("-03:00").unwrap(), Logger::disabled())
    }

    fn build(json: &str) -> Result<Topology, ConfigurationError> {
        let description = TopologyDescription::from_json_str(json)?;
        Topology::new(&description, &context())
    }

    #[test]
    fn test_window_is_normalised_to_day_plus_offset() {
        let topology = build(
            r#"{"timestart": "2022-05-01T15:20:00", "timeend": "2022-05-03", "time_offset": {"hours": 9},
                "nodes": [{"id": 1, "name": "a", "variables": [{"id": 1, "time_interval": {"days": 1},
                "input_series": [{"series_id": 1}]}]}]}"#,
        )
        .expect("valid topology");
        assert_eq!(topology.timestart.to_rfc3339(), "2022-05-01T09:00:00-03:00");
        assert_eq!(topology.timeend.to_rfc3339(), "2022-05-03T09:00:00-03:00");
        assert_eq!(topology.forecast_timeend, topology.timeend);
    }

    #[test]
    fn test_inverted_window_is_rejected() {
        let result = build(r#"{"timestart": "2022-05-03", "timeend": "2022-05-01", "nodes": []}"#);
        assert!(matches!(result, Err(ConfigurationError::InvalidWindow { .. })));
    }

    #[test]
    fn test_unresolved_reference_fails_at_construction() {
        let result = build(
            r#"{"timestart": "2022-05-01", "timeend": "2022-05-03", "nodes": [
                {"id": 1, "name": "a", "variables": [{"id": 2, "time_interval": {"days": 1},
                 "derived_from": {"node_id": 7, "variable_id": 2}}]}]}"#,
        );
        assert_eq!(
            result.err(),
            Some(ConfigurationError::UnresolvedReference {
                node_id: 7,
                variable_id: 2,
                required_by_node: 1,
                required_by_variable: 2,
            })
        );
    }

    #[test]
    fn test_duplicate_node_ids_are_rejected() {
        let result = build(
            r#"{"timestart": "2022-05-01", "timeend": "2022-05-03", "nodes": [
                {"id": 1, "name": "a", "variables": []}, {"id": 1, "name": "b", "variables": []}]}"#,
        );
        assert!(matches!(result, Err(ConfigurationError::DuplicateNode(1))));
    }

    #[test]
    fn test_topology_interpolation_limit_must_be_positive() {
        let result = build(r#"{"timestart": "2022-05-01", "timeend": "2022-05-03", "interpolation_limit": 0, "nodes": []}"#);
        assert!(matches!(result, Err(ConfigurationError::InvalidInterpolationLimit { .. })));
    }

    #[test]
    fn test_derive_order_follows_dependencies_not_declaration() {
        let topology = build(
            r#"{"timestart": "2022-05-01", "timeend": "2022-05-03", "nodes": [
                {"id": 1, "name": "a", "variables": [{"id": 1, "time_interval": {"days": 1},
                 "derived_from": {"node_id": 2, "variable_id": 1}}]},
                {"id": 2, "name": "b", "variables": [{"id": 1, "time_interval": {"days": 1},
                 "derived_from": {"node_id": 3, "variable_id": 1}}]},
                {"id": 3, "name": "c", "variables": [{"id": 1, "time_interval": {"days": 1},
                 "input_series": [{"series_id": 1}]}]}]}"#,
        )
        .expect("valid chain");
        assert_eq!(
            topology.derive_order(),
            &[VariableRef::new(2, 1), VariableRef::new(1, 1)]
        );
    }

    #[test]
    fn test_derivation_cycle_is_rejected() {
        let result = build(
            r#"{"timestart": "2022-05-01", "timeend": "2022-05-03", "nodes": [
                {"id": 1, "name": "a", "variables": [{"id": 1, "time_interval": {"days": 1},
                 "derived_from": {"node_id": 2, "variable_id": 1}}]},
                {"id": 2, "name": "b", "variables": [{"id": 1, "time_interval": {"days": 1},
                 "derived_from": {"node_id": 1, "variable_id": 1}}]}]}"#,
        );
        assert!(matches!(result, Err(ConfigurationError::DependencyCycle(_))));
    }
}
