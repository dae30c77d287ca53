//! Immutable, versioned ring snapshots.

use std::sync::Arc;

use crate::table::AssignmentTable;
use crate::Node;

/// An immutable view of partition placements at a particular version.
///
/// A snapshot owns a deep copy of the builder's assignment table, so later
/// builder mutation never tears the view; it is safe to share across
/// concurrent readers without synchronization. Fresh data requires asking
/// the builder for a new ring.
pub struct Ring {
    version: i64,
    partition_bits: u16,
    nodes: Vec<Arc<dyn Node>>,
    node_ids: Vec<u64>,
    local_node_index: i32,
    table: AssignmentTable,
}

impl Ring {
    pub(crate) fn new(
        version: i64,
        partition_bits: u16,
        nodes: Vec<Arc<dyn Node>>,
        node_ids: Vec<u64>,
        local_node_index: i32,
        table: AssignmentTable,
    ) -> Self {
        Self {
            version,
            partition_bits,
            nodes,
            node_ids,
            local_node_index,
            table,
        }
    }

    /// Monotonic identifier for this snapshot, derived from the wall clock
    /// at the moment a rebalance last produced a change. Snapshots with
    /// identical assignments may share a version.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn partition_bits(&self) -> u16 {
        self.partition_bits
    }

    pub fn partition_count(&self) -> usize {
        1 << self.partition_bits
    }

    pub fn replica_count(&self) -> usize {
        self.table.replica_count()
    }

    /// Look up a node by id. Linear over the node list; rings hold few
    /// enough nodes that an index is not worth carrying.
    pub fn node(&self, node_id: u64) -> Option<Arc<dyn Node>> {
        self.node_ids
            .iter()
            .position(|id| *id == node_id)
            .map(|index| self.nodes[index].clone())
    }

    /// The node this snapshot was produced for, or `None` when the builder
    /// was snapshotted without a local identity.
    pub fn local_node(&self) -> Option<Arc<dyn Node>> {
        usize::try_from(self.local_node_index)
            .ok()
            .and_then(|index| self.nodes.get(index).cloned())
    }

    /// One entry per replica; `None` where that replica slot is
    /// unassigned. Callers fan out over the `Some` entries.
    pub fn responsible_nodes(&self, partition: u32) -> Vec<Option<Arc<dyn Node>>> {
        let partition = partition as usize;
        (0..self.table.replica_count())
            .map(|replica| {
                usize::try_from(self.table.get(replica, partition))
                    .ok()
                    .map(|index| self.nodes[index].clone())
            })
            .collect()
    }

    /// Ids of the nodes responsible for `partition`; unassigned replica
    /// slots are omitted.
    pub fn responsible_ids(&self, partition: u32) -> Vec<u64> {
        let partition = partition as usize;
        (0..self.table.replica_count())
            .filter_map(|replica| {
                usize::try_from(self.table.get(replica, partition))
                    .ok()
                    .map(|index| self.node_ids[index])
            })
            .collect()
    }

    /// Partition for a 64-bit key hash: the top `partition_bits` bits.
    pub fn partition_for(&self, hash: u64) -> u32 {
        if self.partition_bits == 0 {
            0
        } else {
            (hash >> (64 - u32::from(self.partition_bits))) as u32
        }
    }
}
