// rust/boost-runtime/src/data/groups.rs

//! Reassembly of ranking groups across partition boundaries.
//!
//! Input partitions are slices of one globally ordered stream in which all
//! points of a group are contiguous. A group can therefore only be cut at a
//! partition boundary, which makes the first and last group of every
//! partition suspect. Those edge groups are collected from all partitions
//! and glued back together in ascending partition order.

use std::collections::HashMap;
use std::iter::Peekable;

use tracing::debug;

use crate::engine::Partitioned;

use super::point::{LabeledPoint, LabeledPointGroup};

/// Splits one partition's point stream into runs of equal group id.
pub struct GroupIterator<I: Iterator<Item = LabeledPoint>> {
    points: Peekable<I>,
    partition: usize,
    emitted: usize,
}

impl<I: Iterator<Item = LabeledPoint>> GroupIterator<I> {
    pub fn new(points: impl IntoIterator<IntoIter = I>, partition: usize) -> Self {
        Self {
            points: points.into_iter().peekable(),
            partition,
            emitted: 0,
        }
    }
}

impl<I: Iterator<Item = LabeledPoint>> Iterator for GroupIterator<I> {
    type Item = LabeledPointGroup;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.points.next()?;
        let group_id = first.group;
        let mut points = vec![first];

        while let Some(point) = self.points.next_if(|p| p.group == group_id) {
            points.push(point);
        }

        let is_first = self.emitted == 0;
        let is_last = self.points.peek().is_none();
        self.emitted += 1;

        Some(LabeledPointGroup::new(
            group_id,
            points,
            is_first || is_last,
            self.partition,
        ))
    }
}

/// Concatenates edge-group fragments sharing a group id.
///
/// Fragments are joined in ascending origin-partition order no matter the
/// order they arrive in. Output groups are complete (not edge groups) and
/// ordered by the partition of their first fragment.
pub fn stitch_edge_groups(mut edges: Vec<LabeledPointGroup>) -> Vec<LabeledPointGroup> {
    edges.sort_by_key(|g| g.partitions.first().copied().unwrap_or(usize::MAX));

    let mut stitched: Vec<LabeledPointGroup> = Vec::new();
    let mut slot_of: HashMap<i64, usize> = HashMap::new();

    for fragment in edges {
        match slot_of.get(&fragment.group_id) {
            Some(&slot) => {
                let group = &mut stitched[slot];
                group.points.extend(fragment.points);
                for p in fragment.partitions {
                    if !group.partitions.contains(&p) {
                        group.partitions.push(p);
                    }
                }
            }
            None => {
                slot_of.insert(fragment.group_id, stitched.len());
                stitched.push(LabeledPointGroup {
                    is_edge_group: false,
                    ..fragment
                });
            }
        }
    }

    stitched
}

/// Groups every partition's points and repairs groups cut by boundaries.
///
/// Complete groups stay where they were found; stitched groups are appended
/// to the partition holding their first fragment.
pub fn aggregate_groups(points: Partitioned<LabeledPoint>) -> Partitioned<LabeledPointGroup> {
    let mut edges = Vec::new();
    let grouped = points.map_partitions(|partition, part| {
        let (edge, complete): (Vec<_>, Vec<_>) =
            GroupIterator::new(part, partition).partition(|g| g.is_edge_group);
        edges.extend(edge);
        complete
    });

    let stitched = stitch_edge_groups(edges);
    debug!(
        "Stitched {} edge groups across {} partitions",
        stitched.len(),
        grouped.num_partitions()
    );

    let mut by_partition: HashMap<usize, Vec<LabeledPointGroup>> = HashMap::new();
    for group in stitched {
        let home = group.partitions.first().copied().unwrap_or(0);
        by_partition.entry(home).or_default().push(group);
    }

    grouped.map_partitions(|partition, mut part| {
        if let Some(extra) = by_partition.remove(&partition) {
            part.extend(extra);
        }
        part
    })
}
