//! Capacity-weighted, tier-aware partition placement.
//!
//! A [`Builder`] owns the mutable placement state: nodes are added over
//! time, the partition space is sized to the cluster's capacity skew, and
//! producing a [`Ring`] runs any pending rebalance and returns a versioned
//! immutable snapshot that answers placement queries without
//! synchronization.

mod builder;
mod node;
mod rebalance;
mod ring;
mod table;

pub use builder::{Builder, BuilderStats};
pub use node::Node;
pub use ring::Ring;
pub use table::{AssignmentTable, NODE_INDEX_NONE};

/// Hard ceiling on the partition space. `1 << 23` is 8388608 which, with
/// three replicas, costs roughly 100M of index memory.
pub const PARTITION_COUNT_MAX: usize = 1 << 23;
