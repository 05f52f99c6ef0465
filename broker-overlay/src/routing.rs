//! Per-endpoint routing table.
//!
//! Maps each directly connected peer to its communication handle and to the
//! distances that neighbor claims toward indirectly reachable peers. Entries
//! are kept in id order so that iteration, and therefore every tie-break
//! derived from it, is deterministic.

use broker_core::PeerId;
use std::collections::{BTreeMap, HashMap};

/// Routing information reachable through one direct peer.
#[derive(Debug, Clone)]
pub struct RoutingTableEntry<H> {
    /// Communication handle of the direct peer
    pub handle: H,
    /// Best known hop count to indirect peers via this neighbor
    pub distances: HashMap<PeerId, usize>,
}

impl<H> RoutingTableEntry<H> {
    /// Create an entry with no indirect routes yet.
    pub fn new(handle: H) -> Self {
        Self { handle, distances: HashMap::new() }
    }
}

/// Routing table of one endpoint. The transport inserts entries when links
/// come up; the peer erases them when links go away. The table never holds a
/// self-entry.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable<H> {
    entries: BTreeMap<PeerId, RoutingTableEntry<H>>,
}

impl<H> RoutingTable<H> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Insert or replace the entry for a direct peer.
    pub fn insert(&mut self, peer: PeerId, handle: H) {
        self.entries.insert(peer, RoutingTableEntry::new(handle));
    }

    /// Remove the entry for a direct peer.
    pub fn erase(&mut self, peer: &PeerId) -> Option<RoutingTableEntry<H>> {
        self.entries.remove(peer)
    }

    /// Look up a direct peer.
    pub fn get(&self, peer: &PeerId) -> Option<&RoutingTableEntry<H>> {
        self.entries.get(peer)
    }

    /// Look up a direct peer mutably.
    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut RoutingTableEntry<H>> {
        self.entries.get_mut(peer)
    }

    /// Whether `peer` is directly connected.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    /// Iterate entries in peer-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &RoutingTableEntry<H>)> {
        self.entries.iter()
    }

    /// Number of direct peers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best known hop count to `peer`: 1 for a direct connection, otherwise
    /// the minimum distance any neighbor claims, or `None` if unreachable.
    pub fn distance_to(&self, peer: &PeerId) -> Option<usize> {
        if self.contains(peer) {
            return Some(1);
        }
        self.entries.values().filter_map(|entry| entry.distances.get(peer).copied()).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(token: &str) -> PeerId {
        PeerId::from(token)
    }

    #[test]
    fn test_direct_distance_is_one() {
        let mut tbl = RoutingTable::new();
        tbl.insert(id("b"), ());
        assert_eq!(tbl.distance_to(&id("b")), Some(1));
        assert_eq!(tbl.distance_to(&id("c")), None);
    }

    #[test]
    fn test_indirect_distance_is_minimum_claim() {
        let mut tbl = RoutingTable::new();
        tbl.insert(id("b"), ());
        tbl.insert(id("c"), ());
        tbl.get_mut(&id("b")).unwrap().distances.insert(id("z"), 4);
        tbl.get_mut(&id("c")).unwrap().distances.insert(id("z"), 2);
        assert_eq!(tbl.distance_to(&id("z")), Some(2));
    }

    #[test]
    fn test_direct_entry_wins_over_claims() {
        let mut tbl = RoutingTable::new();
        tbl.insert(id("b"), ());
        tbl.get_mut(&id("b")).unwrap().distances.insert(id("c"), 3);
        tbl.insert(id("c"), ());
        assert_eq!(tbl.distance_to(&id("c")), Some(1));
        // Erasing the direct link falls back to the claimed route.
        tbl.erase(&id("c"));
        assert_eq!(tbl.distance_to(&id("c")), Some(3));
    }

    #[test]
    fn test_iteration_is_id_ordered() {
        let mut tbl = RoutingTable::new();
        for peer in ["c", "a", "b"] {
            tbl.insert(id(peer), ());
        }
        let order: Vec<_> = tbl.iter().map(|(p, _)| p.as_str().to_string()).collect();
        assert_eq!(order, ["a", "b", "c"]);
    }
}
