//! End-to-end balance scenarios for the builder and its snapshots.

use std::net::SocketAddr;
use std::sync::Arc;

use orbit_ring::{Builder, Node, PARTITION_COUNT_MAX};

struct ClusterNode {
    id: u64,
    active: bool,
    capacity: u32,
    tiers: Vec<i32>,
}

impl ClusterNode {
    fn shared(id: u64, capacity: u32) -> Arc<dyn Node> {
        Arc::new(Self {
            id,
            active: true,
            capacity,
            tiers: vec![id as i32],
        })
    }
}

impl Node for ClusterNode {
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

/// Count how many partitions each node id holds across all replicas.
fn holdings(ring: &orbit_ring::Ring, node_id: u64) -> usize {
    (0..ring.partition_count() as u32)
        .filter(|&partition| ring.responsible_ids(partition).contains(&node_id))
        .count()
}

#[test]
fn two_equal_nodes_split_the_ring_evenly() {
    let mut builder = Builder::new(1);
    builder.add(ClusterNode::shared(1, 100));
    builder.add(ClusterNode::shared(2, 100));
    let ring = builder.ring(0);

    assert!(ring.partition_bits() >= 1);
    let desired = ring.partition_count() as f64 / 2.0;
    for id in [1, 2] {
        let held = holdings(&ring, id) as f64;
        let deviation = 100.0 * (held - desired).abs() / desired;
        assert!(
            deviation <= 1.0,
            "node {id} holds {held} partitions, desired {desired}"
        );
    }
}

#[test]
fn skewed_capacities_grow_the_partition_space() {
    let mut builder = Builder::new(1);
    builder.add(ClusterNode::shared(1, 100));
    builder.add(ClusterNode::shared(2, 1));
    let ring = builder.ring(0);

    // Node 2's desired share is roughly 1/101; the space must be fine
    // enough for that share to round within one percent.
    assert!(ring.partition_count() >= 128);
    assert!(ring.partition_count() <= PARTITION_COUNT_MAX);

    let desired = ring.partition_count() as f64 / 101.0;
    let held = holdings(&ring, 2) as f64;
    let deviation = 100.0 * (held - desired).abs() / desired;
    assert!(
        deviation <= 1.0,
        "node 2 holds {held} partitions, desired {desired}"
    );
}

#[test]
fn three_replicas_stay_on_distinct_nodes_as_the_cluster_changes() {
    let mut builder = Builder::new(3);
    for id in 1..=4 {
        builder.add(ClusterNode::shared(id, 100));
    }
    let _ = builder.ring(0);
    builder.add(ClusterNode::shared(5, 200));
    let ring = builder.ring(0);

    for partition in 0..ring.partition_count() as u32 {
        let mut ids = ring.responsible_ids(partition);
        assert_eq!(ids.len(), 3, "partition {partition} lost a replica");
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3, "partition {partition} doubled up a node");
    }
}

#[test]
fn stats_track_the_worst_outliers() {
    let mut builder = Builder::new(1);
    builder.add(ClusterNode::shared(1, 300));
    builder.add(ClusterNode::shared(2, 200));
    builder.add(ClusterNode::shared(3, 100));
    let stats = builder.stats();

    assert_eq!(stats.replica_count, 1);
    assert_eq!(stats.node_count, 3);
    assert_eq!(stats.total_capacity, 600);
    assert!(stats.max_under_node_percentage <= 1.0, "{stats}");
    assert!(stats.max_over_node_percentage <= 1.0, "{stats}");
}
