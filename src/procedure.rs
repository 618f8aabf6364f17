/// Boundary-condition interface for external simulation procedures.
///
/// A procedure reads finalized variable series as boundary conditions and
/// writes its result back into the variable's forecast slot. Observed `data`
/// is never touched from here.

use serde::Deserialize;

use crate::model::{ConfigurationError, NodeId, Series, VariableId};
use crate::topology::{Topology, VariableRef};

/// A named reference from a procedure to a topology variable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundaryRef {
    pub node_id: NodeId,
    pub variable_id: VariableId,
    pub name: String,
}

impl BoundaryRef {
    pub fn new(node_id: NodeId, variable_id: VariableId, name: &str) -> Self {
        BoundaryRef {
            node_id,
            variable_id,
            name: name.to_string(),
        }
    }

    pub fn reference(&self) -> VariableRef {
        VariableRef::new(self.node_id, self.variable_id)
    }

    /// Checks the boundary points at an existing variable.
    pub fn resolve(&self, topology: &Topology) -> Result<VariableRef, ConfigurationError> {
        let reference = self.reference();
        match topology.variable(reference) {
            Some(_) => Ok(reference),
            None => Err(self.unresolved()),
        }
    }

    fn unresolved(&self) -> ConfigurationError {
        ConfigurationError::InvalidValue {
            context: format!("boundary '{}'", self.name),
            field: "variable".to_string(),
            message: format!("{} does not exist in the topology", self.reference()),
        }
    }
}

impl Topology {
    /// The finalized series of a boundary variable, read-only.
    pub fn boundary_series(&self, boundary: &BoundaryRef) -> Result<&Series, ConfigurationError> {
        self.variable(boundary.reference())
            .map(|v| &v.data)
            .ok_or_else(|| boundary.unresolved())
    }

    /// Stores a procedure result in the variable's forecast slot, replacing
    /// any previous result.
    pub fn write_procedure_output(&mut self, boundary: &BoundaryRef, output: Series) -> Result<(), ConfigurationError> {
        let variable = self
            .variable_mut(boundary.reference())
            .ok_or_else(|| boundary.unresolved())?;
        variable.procedure_forecast = Some(output);
        Ok(())
    }
}
