use std::collections::BTreeMap;

use chrono::FixedOffset;
use rayon::prelude::*;

use super::description::NodeDescription;
use super::series::LoadContext;
use super::variable::{Variable, Window};
use crate::logging::Logger;
use crate::model::{ConfigurationError, NodeId, PipelineError, VariableId};

/// A named location grouping variables. Stage methods fan out over every
/// variable in id order.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub variables: BTreeMap<VariableId, Variable>,
}

impl Node {
    pub fn from_description(
        description: &NodeDescription,
        window: &Window,
        zone: FixedOffset,
    ) -> Result<Self, ConfigurationError> {
        let mut variables = BTreeMap::new();
        for variable in &description.variables {
            if variables.contains_key(&variable.id) {
                return Err(ConfigurationError::DuplicateVariable {
                    node_id: description.id,
                    variable_id: variable.id,
                });
            }
            variables.insert(
                variable.id,
                Variable::from_description(description.id, variable, window, zone)?,
            );
        }
        Ok(Node {
            id: description.id,
            name: description.name.clone(),
            variables,
        })
    }

    pub fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.variables.get(&id)
    }

    pub fn variable_mut(&mut self, id: VariableId) -> Option<&mut Variable> {
        self.variables.get_mut(&id)
    }

    pub fn load(&mut self, ctx: &LoadContext<'_>, include_forecast: bool) -> Result<(), PipelineError> {
        self.variables
            .par_iter_mut()
            .try_for_each(|(_, variable)| variable.load(ctx, include_forecast))
    }

    pub fn remove_outliers(&mut self) -> bool {
        self.variables
            .values_mut()
            .fold(false, |applied, v| v.remove_outliers() | applied)
    }

    pub fn detect_jumps(&mut self) -> bool {
        self.variables
            .values_mut()
            .fold(false, |applied, v| v.detect_jumps() | applied)
    }

    pub fn apply_offset(&mut self) {
        self.variables.values_mut().for_each(Variable::apply_offset);
    }

    pub fn regularize(&mut self, extrapolate: bool) {
        for variable in self.variables.values_mut() {
            variable.regularize(extrapolate);
        }
    }

    pub fn apply_moving_average(&mut self) {
        self.variables.values_mut().for_each(Variable::apply_moving_average);
    }

    pub fn fill_nulls(&mut self) {
        self.variables.values_mut().for_each(Variable::fill_nulls);
    }

    pub fn calibrate(&mut self, logger: &Logger) {
        for variable in self.variables.values_mut() {
            variable.calibrate(logger);
        }
    }

    /// Splices forecasts into observed variables. Derived variables splice
    /// after their derivation instead.
    pub fn splice_forecast(&mut self, ignore_warmup: bool, logger: &Logger) {
        for variable in self.variables.values_mut().filter(|v| !v.is_derived()) {
            variable.splice_forecast(ignore_warmup, logger);
        }
    }

    pub fn interpolate_final(&mut self, extrapolate: bool) {
        for variable in self.variables.values_mut() {
            variable.interpolate_final(extrapolate);
        }
    }

    pub fn publish_output(&mut self) {
        self.variables.values_mut().for_each(Variable::publish_output);
    }
}
