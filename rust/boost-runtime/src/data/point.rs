// rust/boost-runtime/src/data/point.rs

use serde::{Deserialize, Serialize};

/// Group id of a point that belongs to no ranking group.
pub const NO_GROUP: i64 = -1;

/// One training instance.
///
/// `indices` is `None` for a dense vector, in which case `values[i]` is the
/// value of feature `i`. A sparse vector carries one index per value.
///
/// Equality compares floats bit for bit, so an unset (NaN) base margin or a
/// NaN feature value equals itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledPoint {
    pub indices: Option<Vec<u32>>,
    pub values: Vec<f32>,
    pub label: f32,
    pub weight: f32,
    /// NaN means unset.
    pub base_margin: f32,
    pub group: i64,
}

impl LabeledPoint {
    pub fn dense(label: f32, values: Vec<f32>) -> Self {
        Self {
            indices: None,
            values,
            label,
            weight: 1.0,
            base_margin: f32::NAN,
            group: NO_GROUP,
        }
    }

    /// Mismatched `indices`/`values` lengths are reported by the
    /// missing-value filter, not here.
    pub fn sparse(label: f32, indices: Vec<u32>, values: Vec<f32>) -> Self {
        Self {
            indices: Some(indices),
            ..Self::dense(label, values)
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_base_margin(mut self, base_margin: f32) -> Self {
        self.base_margin = base_margin;
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: i64) -> Self {
        self.group = group;
        self
    }

    pub fn is_sparse(&self) -> bool {
        self.indices.is_some()
    }

    pub fn has_base_margin(&self) -> bool {
        !self.base_margin.is_nan()
    }
}

impl PartialEq for LabeledPoint {
    fn eq(&self, other: &Self) -> bool {
        self.indices == other.indices
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
            && self.label.to_bits() == other.label.to_bits()
            && self.weight.to_bits() == other.weight.to_bits()
            && self.base_margin.to_bits() == other.base_margin.to_bits()
            && self.group == other.group
    }
}

/// A run of points sharing one group id.
///
/// `is_edge_group` marks the first or last group seen in a partition, which
/// may be a fragment of a group continuing in a neighbouring partition.
/// `partitions` lists the origin partitions, ascending, the points came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledPointGroup {
    pub group_id: i64,
    pub points: Vec<LabeledPoint>,
    pub is_edge_group: bool,
    pub partitions: Vec<usize>,
}

impl LabeledPointGroup {
    pub fn new(group_id: i64, points: Vec<LabeledPoint>, is_edge_group: bool, partition: usize) -> Self {
        Self {
            group_id,
            points,
            is_edge_group,
            partitions: vec![partition],
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
