//! Replica-by-partition assignment table.

/// Sentinel node index for an unassigned replica slot.
pub const NODE_INDEX_NONE: i32 = -1;

/// A 2-D table mapping `replica × partition` to a node index, or
/// [`NODE_INDEX_NONE`] where no assignment exists.
///
/// `Clone` is a deep copy (every replica row is a fresh allocation); ring
/// snapshots rely on that to outlive later builder mutation.
#[derive(Clone, Debug)]
pub struct AssignmentTable {
    rows: Vec<Vec<i32>>,
}

impl AssignmentTable {
    /// A table with every slot unassigned.
    pub fn new(replica_count: usize, partition_count: usize) -> Self {
        Self {
            rows: vec![vec![NODE_INDEX_NONE; partition_count]; replica_count],
        }
    }

    pub fn replica_count(&self) -> usize {
        self.rows.len()
    }

    pub fn partition_count(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    pub fn get(&self, replica: usize, partition: usize) -> i32 {
        self.rows[replica][partition]
    }

    pub fn set(&mut self, replica: usize, partition: usize, node_index: i32) {
        self.rows[replica][partition] = node_index;
    }

    pub(crate) fn rows(&self) -> &[Vec<i32>] {
        &self.rows
    }

    /// Grow every replica row to `partition_count` entries, refining the
    /// existing placements: partition `p` inherits the assignment of the
    /// coarser partition `p >> shift`.
    pub(crate) fn expand(&mut self, partition_count: usize, shift: u16) {
        for row in &mut self.rows {
            let mut grown = Vec::with_capacity(partition_count);
            for partition in 0..partition_count {
                grown.push(row[partition >> shift]);
            }
            *row = grown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_table_is_fully_unassigned() {
        let table = AssignmentTable::new(3, 4);
        assert_eq!(table.replica_count(), 3);
        assert_eq!(table.partition_count(), 4);
        for replica in 0..3 {
            for partition in 0..4 {
                assert_eq!(table.get(replica, partition), NODE_INDEX_NONE);
            }
        }
    }

    #[test]
    fn expand_refines_existing_placements() {
        let mut table = AssignmentTable::new(1, 2);
        table.set(0, 0, 7);
        table.set(0, 1, 9);
        table.expand(8, 2);
        assert_eq!(table.partition_count(), 8);
        for partition in 0..4 {
            assert_eq!(table.get(0, partition), 7);
        }
        for partition in 4..8 {
            assert_eq!(table.get(0, partition), 9);
        }
    }

    #[test]
    fn clone_is_deep() {
        let original = AssignmentTable::new(2, 2);
        let mut copy = original.clone();
        copy.set(1, 1, 3);
        assert_eq!(original.get(1, 1), NODE_INDEX_NONE);
        assert_eq!(copy.get(1, 1), 3);
    }
}
