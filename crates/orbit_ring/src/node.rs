//! Node descriptor capability set.

use std::net::SocketAddr;

/// A single item assigned to a ring, usually one device such as a disk
/// drive. Implementations are supplied by the embedding application; the
/// builder and its snapshots hold them as trait objects.
pub trait Node: Send + Sync {
    /// Uniquely identifies this node. Id `0` is reserved to mean "no
    /// node"; callers without a local identity pass `0` to
    /// [`crate::Builder::ring`].
    fn node_id(&self) -> u64;

    fn active(&self) -> bool;

    /// The amount of data that should be assigned to this node relative to
    /// other nodes. Any unit works as long as every node uses the same
    /// one; gigabytes of storage is the common choice, but CPU capacity or
    /// another resource can make more sense to balance on.
    fn capacity(&self) -> u32;

    /// Failure-domain coordinates, innermost first. Tier 0 might be the
    /// server (each node one drive on it), tier 1 the power zone the
    /// server is in, and a later tier the geographic region. Values are
    /// indices into names stored elsewhere; plain ints keep rebalancing
    /// fast.
    fn tier_values(&self) -> &[i32];

    /// One of the node's published endpoints, selected by `index` so
    /// internal and external addresses can coexist. The messenger picks
    /// the index with its `address_index` option.
    fn address(&self, index: usize) -> Option<SocketAddr>;
}
