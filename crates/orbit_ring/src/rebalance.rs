//! Capacity-weighted replica assignment with tier-diversity preference.
//!
//! The builder only relies on the output table satisfying the placement
//! invariants: every entry a valid active node index or unassigned, and no
//! node holding two replicas of one partition. The scoring policy below is
//! self-contained and can evolve independently of the ring types.
//!
//! Assignment runs in three passes:
//! 1. clear entries that are no longer legal (inactive or zero-capacity
//!    nodes, out-of-range indices, duplicates within a partition)
//! 2. fill vacant slots, preferring the candidate that separates failure
//!    domains at the outermost possible tier, then the most underweight
//! 3. move single assignments from the most overweight node to the most
//!    underweight until both sit within the balance tolerance

use std::sync::Arc;

use tracing::debug;

use crate::table::{AssignmentTable, NODE_INDEX_NONE};
use crate::Node;

pub(crate) struct Rebalancer<'a> {
    nodes: &'a [Arc<dyn Node>],
    table: &'a mut AssignmentTable,
    /// Fractional balance tolerance (`points_allowed / 100`).
    tolerance: f64,
    /// Per-node desired assignment count; zero for nodes that must not
    /// hold anything.
    desired: Vec<f64>,
    /// Per-node current assignment count, kept in step with `table`.
    assigned: Vec<usize>,
}

impl<'a> Rebalancer<'a> {
    pub(crate) fn new(
        nodes: &'a [Arc<dyn Node>],
        table: &'a mut AssignmentTable,
        points_allowed: i32,
    ) -> Self {
        let total_capacity: u64 = nodes
            .iter()
            .filter(|node| node.active())
            .map(|node| u64::from(node.capacity()))
            .sum();
        let total_slots = (table.replica_count() * table.partition_count()) as f64;
        let desired = nodes
            .iter()
            .map(|node| {
                if node.active() && total_capacity > 0 {
                    total_slots * f64::from(node.capacity()) / total_capacity as f64
                } else {
                    0.0
                }
            })
            .collect();
        Self {
            nodes,
            table,
            tolerance: f64::from(points_allowed) * 0.01,
            desired,
            assigned: vec![0; nodes.len()],
        }
    }

    /// Bring the table up to date with the current node set. Returns true
    /// iff any entry changed.
    pub(crate) fn rebalance(&mut self) -> bool {
        let cleared = self.clear_invalid();
        let filled = self.fill_vacant();
        let moved = self.balance();
        if cleared + filled + moved > 0 {
            debug!(cleared, filled, moved, "rebalanced assignments");
        }
        cleared + filled + moved > 0
    }

    fn eligible(&self, node_index: usize) -> bool {
        let node = &self.nodes[node_index];
        node.active() && node.capacity() > 0
    }

    /// Drop entries that reference missing, inactive, or zero-capacity
    /// nodes, and break up duplicate holders within a partition. Rebuilds
    /// the per-node assignment counts as it goes.
    fn clear_invalid(&mut self) -> usize {
        let mut cleared = 0;
        let replica_count = self.table.replica_count();
        for partition in 0..self.table.partition_count() {
            let mut holders: Vec<i32> = Vec::with_capacity(replica_count);
            for replica in 0..replica_count {
                let entry = self.table.get(replica, partition);
                if entry == NODE_INDEX_NONE {
                    continue;
                }
                let legal = usize::try_from(entry).ok().is_some_and(|index| {
                    index < self.nodes.len() && self.eligible(index) && !holders.contains(&entry)
                });
                if legal {
                    holders.push(entry);
                    self.assigned[entry as usize] += 1;
                } else {
                    self.table.set(replica, partition, NODE_INDEX_NONE);
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Outermost tier level at which `candidate` differs from every holder
    /// of the partition, plus one; zero when no level fully separates.
    /// Higher scores put the new replica in a farther failure domain.
    fn tier_distance(&self, candidate: usize, holders: &[i32]) -> usize {
        let tiers = self.nodes[candidate].tier_values();
        if holders.is_empty() {
            return tiers.len() + 1;
        }
        for level in (0..tiers.len()).rev() {
            let separated = holders.iter().all(|&holder| {
                self.nodes[holder as usize].tier_values().get(level) != Some(&tiers[level])
            });
            if separated {
                return level + 1;
            }
        }
        0
    }

    fn fill_vacant(&mut self) -> usize {
        let mut filled = 0;
        let replica_count = self.table.replica_count();
        for partition in 0..self.table.partition_count() {
            let mut holders: Vec<i32> = (0..replica_count)
                .map(|replica| self.table.get(replica, partition))
                .filter(|&entry| entry != NODE_INDEX_NONE)
                .collect();
            for replica in 0..replica_count {
                if self.table.get(replica, partition) != NODE_INDEX_NONE {
                    continue;
                }
                let Some(choice) = self.best_candidate(&holders) else {
                    continue;
                };
                self.table.set(replica, partition, choice as i32);
                holders.push(choice as i32);
                self.assigned[choice] += 1;
                filled += 1;
            }
        }
        filled
    }

    /// The eligible node not yet holding the partition that best separates
    /// failure domains, breaking ties toward the most underweight node and
    /// then the lowest index so assignment stays deterministic.
    fn best_candidate(&self, holders: &[i32]) -> Option<usize> {
        let mut best: Option<(usize, f64, usize)> = None;
        for index in 0..self.nodes.len() {
            if !self.eligible(index) || holders.contains(&(index as i32)) {
                continue;
            }
            let distance = self.tier_distance(index, holders);
            let deficit = self.desired[index] - self.assigned[index] as f64;
            let better = match best {
                None => true,
                Some((best_distance, best_deficit, _)) => {
                    distance > best_distance
                        || (distance == best_distance && deficit > best_deficit)
                }
            };
            if better {
                best = Some((distance, deficit, index));
            }
        }
        best.map(|(_, _, index)| index)
    }

    /// Percentage deviations from desired, as fractions of desired.
    fn worst_over(&self) -> Option<(usize, f64)> {
        self.deviations(|index| (self.assigned[index] as f64 - self.desired[index]) / self.desired[index])
    }

    fn worst_under(&self) -> Option<(usize, f64)> {
        self.deviations(|index| (self.desired[index] - self.assigned[index] as f64) / self.desired[index])
    }

    fn deviations(&self, deviation: impl Fn(usize) -> f64) -> Option<(usize, f64)> {
        (0..self.nodes.len())
            .filter(|&index| self.eligible(index) && self.desired[index] > 0.0)
            .map(|index| (index, deviation(index)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn balance(&mut self) -> usize {
        let mut moved = 0;
        // A single move can never push either node past the other side, so
        // total deviation strictly shrinks; the bound is a backstop.
        let move_limit = self.table.replica_count() * self.table.partition_count();
        let mut cursor = 0;
        while moved < move_limit {
            let Some((over_node, over_pct)) = self.worst_over() else {
                break;
            };
            let Some((under_node, under_pct)) = self.worst_under() else {
                break;
            };
            if over_pct <= self.tolerance && under_pct <= self.tolerance {
                break;
            }
            if self.assigned[over_node] as f64 <= self.desired[over_node] {
                // Nothing genuinely over; remaining imbalance is vacant
                // slots, not misplacement.
                break;
            }
            if self.desired[under_node] - (self.assigned[under_node] as f64) < 1.0 {
                // The most underweight node cannot absorb a whole
                // assignment without overshooting; moving would only swap
                // which node is out of balance.
                break;
            }
            match self.move_one(over_node, under_node, cursor) {
                Some(partition) => {
                    cursor = partition + 1;
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Reassign one replica slot from `from` to `to`, scanning partitions
    /// from `start` (wrapping) so successive moves sweep the table instead
    /// of rescanning its head. Returns the partition moved, if any.
    fn move_one(&mut self, from: usize, to: usize, start: usize) -> Option<usize> {
        let partition_count = self.table.partition_count();
        let replica_count = self.table.replica_count();
        for offset in 0..partition_count {
            let partition = (start + offset) % partition_count;
            let mut from_replica = None;
            let mut to_present = false;
            for replica in 0..replica_count {
                let entry = self.table.get(replica, partition);
                if entry == from as i32 {
                    from_replica = Some(replica);
                } else if entry == to as i32 {
                    to_present = true;
                }
            }
            if let (Some(replica), false) = (from_replica, to_present) {
                self.table.set(replica, partition, to as i32);
                self.assigned[from] -= 1;
                self.assigned[to] += 1;
                return Some(partition);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    struct TestNode {
        id: u64,
        active: bool,
        capacity: u32,
        tiers: Vec<i32>,
    }

    impl TestNode {
        fn shared(id: u64, capacity: u32, tiers: Vec<i32>) -> Arc<dyn Node> {
            Arc::new(Self {
                id,
                active: true,
                capacity,
                tiers,
            })
        }
    }

    impl Node for TestNode {
        fn node_id(&self) -> u64 {
            self.id
        }
        fn active(&self) -> bool {
            self.active
        }
        fn capacity(&self) -> u32 {
            self.capacity
        }
        fn tier_values(&self) -> &[i32] {
            &self.tiers
        }
        fn address(&self, _index: usize) -> Option<SocketAddr> {
            None
        }
    }

    fn column(table: &AssignmentTable, partition: usize) -> Vec<i32> {
        (0..table.replica_count())
            .map(|replica| table.get(replica, partition))
            .collect()
    }

    #[test]
    fn fills_every_slot_without_duplicate_holders() {
        let nodes = vec![
            TestNode::shared(1, 100, vec![0]),
            TestNode::shared(2, 100, vec![1]),
            TestNode::shared(3, 100, vec![2]),
        ];
        let mut table = AssignmentTable::new(3, 8);
        assert!(Rebalancer::new(&nodes, &mut table, 1).rebalance());
        for partition in 0..8 {
            let mut holders = column(&table, partition);
            holders.sort_unstable();
            assert_eq!(holders, vec![0, 1, 2]);
        }
    }

    #[test]
    fn leaves_slots_vacant_when_replicas_exceed_nodes() {
        let nodes = vec![TestNode::shared(1, 100, vec![0])];
        let mut table = AssignmentTable::new(3, 4);
        Rebalancer::new(&nodes, &mut table, 1).rebalance();
        for partition in 0..4 {
            let holders = column(&table, partition);
            assert_eq!(holders.iter().filter(|&&h| h == 0).count(), 1);
            assert_eq!(
                holders.iter().filter(|&&h| h == NODE_INDEX_NONE).count(),
                2
            );
        }
    }

    #[test]
    fn drains_deactivated_nodes() {
        let mut nodes = vec![
            TestNode::shared(1, 100, vec![0]),
            TestNode::shared(2, 100, vec![1]),
        ];
        let mut table = AssignmentTable::new(2, 4);
        Rebalancer::new(&nodes, &mut table, 1).rebalance();

        nodes[1] = Arc::new(TestNode {
            id: 2,
            active: false,
            capacity: 100,
            tiers: vec![1],
        });
        Rebalancer::new(&nodes, &mut table, 1).rebalance();
        for partition in 0..4 {
            assert!(!column(&table, partition).contains(&1));
        }
    }

    #[test]
    fn prefers_separated_failure_domains() {
        // Two zones with two hosts each; tier values are (host, zone).
        let nodes = vec![
            TestNode::shared(1, 100, vec![0, 0]),
            TestNode::shared(2, 100, vec![1, 0]),
            TestNode::shared(3, 100, vec![2, 1]),
            TestNode::shared(4, 100, vec![3, 1]),
        ];
        let mut table = AssignmentTable::new(2, 16);
        Rebalancer::new(&nodes, &mut table, 1).rebalance();
        for partition in 0..16 {
            let holders = column(&table, partition);
            let zones: Vec<i32> = holders
                .iter()
                .map(|&holder| nodes[holder as usize].tier_values()[1])
                .collect();
            assert_ne!(zones[0], zones[1], "partition {partition} kept both replicas in one zone");
        }
    }

    #[test]
    fn moves_assignments_toward_a_dominant_new_node() {
        let mut nodes = vec![
            TestNode::shared(1, 100, vec![0]),
            TestNode::shared(2, 100, vec![1]),
        ];
        let mut table = AssignmentTable::new(1, 256);
        Rebalancer::new(&nodes, &mut table, 1).rebalance();

        nodes.push(TestNode::shared(3, 600, vec![2]));
        Rebalancer::new(&nodes, &mut table, 1).rebalance();
        let newcomer = (0..256)
            .filter(|&partition| table.get(0, partition) == 2)
            .count();
        // Desired share is 600/800 of 256 partitions = 192.
        assert!(
            (newcomer as i64 - 192).abs() <= 2,
            "newcomer holds {newcomer} of 256 partitions"
        );
    }

    #[test]
    fn unchanged_table_reports_no_change() {
        let nodes = vec![
            TestNode::shared(1, 100, vec![0]),
            TestNode::shared(2, 100, vec![1]),
        ];
        let mut table = AssignmentTable::new(1, 64);
        assert!(Rebalancer::new(&nodes, &mut table, 1).rebalance());
        assert!(!Rebalancer::new(&nodes, &mut table, 1).rebalance());
    }
}
