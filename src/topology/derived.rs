/// Series computed from one or two other variables of the topology.
///
/// Origins are stored as `(node_id, variable_id)` references and resolved
/// through the topology's index; this module only does the arithmetic on
/// already-finalized origin data.

use chrono::Duration;
use serde::Serialize;

use crate::analysis::cleaning::apply_offset;
use crate::analysis::regular::align;
use crate::model::{append_tag, NodeId, Observation, Series, VariableId, XOffset, TAG_DERIVED, TAG_INTERPOLATED};

/// Address of a variable within a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VariableRef {
    pub node_id: NodeId,
    pub variable_id: VariableId,
}

impl VariableRef {
    pub fn new(node_id: NodeId, variable_id: VariableId) -> Self {
        VariableRef { node_id, variable_id }
    }
}

impl std::fmt::Display for VariableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {} variable {}", self.node_id, self.variable_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedOrigin {
    pub origin: VariableRef,
    pub x_offset: XOffset,
    pub y_offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterpolatedOrigin {
    pub origin_1: VariableRef,
    pub origin_2: VariableRef,
    /// Weight of `origin_2`; `origin_1` gets `1 - coefficient`.
    pub coefficient: f64,
    pub x_offset: XOffset,
    pub y_offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DerivedSeries {
    Single(DerivedOrigin),
    Interpolated(InterpolatedOrigin),
}

impl DerivedSeries {
    pub fn origins(&self) -> Vec<VariableRef> {
        match self {
            DerivedSeries::Single(d) => vec![d.origin],
            DerivedSeries::Interpolated(i) => vec![i.origin_1, i.origin_2],
        }
    }

    /// Computes the derived series from the origins' data, given in the
    /// order of `origins()`. Returns `None` when an origin that carries
    /// weight has no data at all.
    pub fn compute(&self, origins: &[&Series]) -> Option<Series> {
        match (self, origins) {
            (DerivedSeries::Single(d), [origin]) => derive_single(origin, d.x_offset, d.y_offset),
            (DerivedSeries::Interpolated(i), [first, second]) => {
                derive_interpolated(first, second, i.coefficient, i.x_offset, i.y_offset)
            }
            _ => None,
        }
    }
}

/// Copies the origin, adds `y_offset`, applies the horizontal shift and
/// appends `derived` to every tag.
pub fn derive_single(origin: &Series, x_offset: XOffset, y_offset: f64) -> Option<Series> {
    if origin.is_empty() {
        return None;
    }
    let shifted = apply_offset(origin, x_offset, y_offset);
    Some(retag(&shifted, TAG_DERIVED))
}

/// Blends two origins as `v1 * (1 - c) + v2 * c` over their outer join.
///
/// A side with zero weight is not required; a null on a weighted side makes
/// the row null. A duration shift is applied and the result is re-aligned
/// onto the pre-shift timestamps with single-step interpolation.
pub fn derive_interpolated(
    first: &Series,
    second: &Series,
    coefficient: f64,
    x_offset: XOffset,
    y_offset: f64,
) -> Option<Series> {
    let needs_first = coefficient < 1.0;
    let needs_second = coefficient > 0.0;
    if (needs_first && first.is_empty()) || (needs_second && second.is_empty()) {
        return None;
    }

    let index = Series::union_index(&[first, second]);
    let blended = Series::from_observations(
        index
            .iter()
            .map(|t| {
                let a = first.get(t);
                let b = second.get(t);
                let va = a.and_then(|o| o.value);
                let vb = b.and_then(|o| o.value);
                let value = match (needs_first, needs_second) {
                    (true, true) => va.zip(vb).map(|(x, y)| x * (1.0 - coefficient) + y * coefficient),
                    (true, false) => va,
                    (false, _) => vb,
                };
                let source = if needs_first { a } else { b };
                let previous = source.and_then(|o| o.tag.as_deref());
                Observation {
                    timestamp: *t,
                    value,
                    tag: value.map(|_| append_tag(previous, TAG_INTERPOLATED)),
                }
            })
            .collect(),
    );

    let shifted = apply_offset(&blended, x_offset, y_offset);
    match x_offset {
        XOffset::Duration(d) if d != Duration::zero() => Some(align(&shifted, &index, Some(1), false)),
        _ => Some(shifted),
    }
}

fn retag(series: &Series, stage: &str) -> Series {
    Series::from_observations(
        series
            .iter()
            .map(|obs| Observation {
                tag: Some(append_tag(obs.tag.as_deref(), stage)),
                ..obs.clone()
            })
            .collect(),
    )
}
