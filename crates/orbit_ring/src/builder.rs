//! Mutable authoritative ring state and partition-space sizing.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::rebalance::Rebalancer;
use crate::ring::Ring;
use crate::table::AssignmentTable;
use crate::{Node, PARTITION_COUNT_MAX};

/// Owns the mutable assignment state behind ring snapshots.
///
/// Nodes are append-only; a node index stays stable for the builder's
/// lifetime and deactivation is modeled by the node's `active` flag, never
/// by removal. The builder is single-owner: callers funnel mutation and
/// snapshot production through one place.
pub struct Builder {
    version: i64,
    nodes: Vec<Arc<dyn Node>>,
    partition_bits: u16,
    table: AssignmentTable,
    points_allowed: i32,
}

impl Builder {
    /// A builder with `replica_count` one-partition replica rows and no
    /// nodes.
    pub fn new(replica_count: usize) -> Self {
        Self {
            version: 0,
            nodes: Vec::new(),
            partition_bits: 0,
            table: AssignmentTable::new(replica_count, 1),
            points_allowed: 1,
        }
    }

    /// The number of percentage points over or under that the ring will
    /// try to keep data assignments within. The default is 1 for one
    /// percent extra or less data.
    pub fn points_allowed(&self) -> i32 {
        self.points_allowed
    }

    pub fn set_points_allowed(&mut self, points: i32) {
        self.points_allowed = points;
    }

    pub fn replica_count(&self) -> usize {
        self.table.replica_count()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, node_index: usize) -> Option<Arc<dyn Node>> {
        self.nodes.get(node_index).cloned()
    }

    /// Add a node to the builder's list and return its index. No
    /// rebalancing happens until the next snapshot.
    pub fn add(&mut self, node: Arc<dyn Node>) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Produce an immutable [`Ring`] of the current data, performing any
    /// pending resize and rebalance first. `local_node_id` lets the
    /// snapshot answer local-responsibility queries; pass `0` when those
    /// are not needed.
    pub fn ring(&mut self, local_node_id: u64) -> Ring {
        let mut changed = self.resize_if_needed();
        if Rebalancer::new(&self.nodes, &mut self.table, self.points_allowed).rebalance() {
            changed = true;
        }
        if changed {
            // The wall clock may not have advanced since the last change;
            // versions of differing snapshots must still be distinct.
            self.version = unix_nanos().max(self.version + 1);
        }
        let node_ids: Vec<u64> = self.nodes.iter().map(|node| node.node_id()).collect();
        let local_node_index = if local_node_id == 0 {
            -1
        } else {
            node_ids
                .iter()
                .position(|&id| id == local_node_id)
                .map_or(-1, |index| index as i32)
        };
        Ring::new(
            self.version,
            self.partition_bits,
            self.nodes.clone(),
            node_ids,
            local_node_index,
            self.table.clone(),
        )
    }

    /// Grow the partition space until every active node's desired share is
    /// within the balance tolerance of a whole partition count, or the
    /// hard ceiling is reached. Returns true iff the space grew.
    ///
    /// Shrinking never happens; it would normally cause more data movement
    /// than the memory is worth.
    fn resize_if_needed(&mut self) -> bool {
        let replica_count = self.table.replica_count();
        let total_capacity: u64 = self
            .nodes
            .iter()
            .filter(|node| node.active())
            .map(|node| u64::from(node.capacity()))
            .sum();
        if total_capacity == 0 {
            return false;
        }
        let mut partition_count = self.table.partition_count();
        let mut partition_bits = self.partition_bits;
        let tolerance = f64::from(self.points_allowed) * 0.01;
        'scan: loop {
            for node in self.nodes.iter().filter(|node| node.active()) {
                if node.capacity() == 0 {
                    continue;
                }
                let desired = partition_count as f64
                    * replica_count as f64
                    * (f64::from(node.capacity()) / total_capacity as f64);
                let under = (desired - desired.floor()) / desired;
                let over = (desired.floor() + 1.0 - desired) / desired;
                if under > tolerance || over > tolerance {
                    partition_count <<= 1;
                    partition_bits += 1;
                    if partition_count >= PARTITION_COUNT_MAX {
                        break 'scan;
                    }
                    continue 'scan;
                }
            }
            break;
        }
        if partition_count > self.table.partition_count() {
            let shift = partition_bits - self.partition_bits;
            self.table.expand(partition_count, shift);
            self.partition_bits = partition_bits;
            return true;
        }
        false
    }

    /// Information about the builder and its health. This snapshots the
    /// ring internally and so can trigger a resize and rebalance; the max
    /// under/over values indicate how balanced the builder is right now.
    pub fn stats(&mut self) -> BuilderStats {
        let ring = self.ring(0);
        let mut stats = BuilderStats {
            replica_count: ring.replica_count(),
            node_count: self.nodes.len(),
            inactive_node_count: 0,
            partition_bits: ring.partition_bits(),
            partition_count: ring.partition_count(),
            points_allowed: self.points_allowed,
            total_capacity: 0,
            max_under_node_percentage: 0.0,
            max_under_node_index: -1,
            max_over_node_percentage: 0.0,
            max_over_node_index: -1,
        };
        let mut assignment_counts = vec![0u64; self.nodes.len()];
        for row in self.table.rows() {
            for &entry in row {
                if let Ok(index) = usize::try_from(entry) {
                    assignment_counts[index] += 1;
                }
            }
        }
        for node in &self.nodes {
            if node.active() {
                stats.total_capacity += u64::from(node.capacity());
            } else {
                stats.inactive_node_count += 1;
            }
        }
        for (node_index, node) in self.nodes.iter().enumerate() {
            if !node.active() || stats.total_capacity == 0 {
                continue;
            }
            let desired = f64::from(node.capacity()) / stats.total_capacity as f64
                * stats.partition_count as f64
                * stats.replica_count as f64;
            let actual = assignment_counts[node_index] as f64;
            if desired > actual {
                let under = 100.0 * (desired - actual) / desired;
                if under > stats.max_under_node_percentage {
                    stats.max_under_node_percentage = under;
                    stats.max_under_node_index = node_index as i32;
                }
            } else if desired < actual {
                let over = 100.0 * (actual - desired) / desired;
                if over > stats.max_over_node_percentage {
                    stats.max_over_node_percentage = over;
                    stats.max_over_node_index = node_index as i32;
                }
            }
        }
        stats
    }
}

/// Point-in-time balance report for a [`Builder`].
#[derive(Clone, Debug, PartialEq)]
pub struct BuilderStats {
    pub replica_count: usize,
    pub node_count: usize,
    pub inactive_node_count: usize,
    pub partition_bits: u16,
    pub partition_count: usize,
    pub points_allowed: i32,
    pub total_capacity: u64,
    /// Percentage the worst underweight node falls short of the
    /// assignments its capacity calls for; `max_under_node_index` is `-1`
    /// when no node is underweight.
    pub max_under_node_percentage: f64,
    pub max_under_node_index: i32,
    /// Percentage the worst overweight node exceeds the assignments its
    /// capacity calls for; `max_over_node_index` is `-1` when no node is
    /// overweight.
    pub max_over_node_percentage: f64,
    pub max_over_node_index: i32,
}

impl fmt::Display for BuilderStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replicas={} nodes={} inactive={} partition_bits={} partitions={} \
             points_allowed={} total_capacity={} max_under={:.2}%@{} max_over={:.2}%@{}",
            self.replica_count,
            self.node_count,
            self.inactive_node_count,
            self.partition_bits,
            self.partition_count,
            self.points_allowed,
            self.total_capacity,
            self.max_under_node_percentage,
            self.max_under_node_index,
            self.max_over_node_percentage,
            self.max_over_node_index,
        )
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch,
/// saturating.
fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}
