//! Static full-mesh peer table.

use crate::MachineId;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// The peers of one machine and their network addresses.
///
/// Peers are kept ordered by id, so "first" and "second" peer are stable
/// across the whole run and across machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTable {
    local: MachineId,
    peers: BTreeMap<MachineId, SocketAddr>,
}

impl PeerTable {
    /// Create an empty table for `local`.
    pub fn new(local: MachineId) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
        }
    }

    /// Build a table from `(id, addr)` pairs. Entries for `local` are skipped.
    pub fn from_entries(
        local: MachineId,
        entries: impl IntoIterator<Item = (MachineId, SocketAddr)>,
    ) -> Self {
        let mut table = Self::new(local);
        for (id, addr) in entries {
            table.insert(id, addr);
        }
        table
    }

    /// Add a peer. Returns false (and leaves the table unchanged) if the id is
    /// the local machine or already present.
    pub fn insert(&mut self, id: MachineId, addr: SocketAddr) -> bool {
        if id == self.local || self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(id, addr);
        true
    }

    /// The local machine's id.
    pub fn local(&self) -> MachineId {
        self.local
    }

    /// Address of a peer.
    pub fn address(&self, id: MachineId) -> Option<SocketAddr> {
        self.peers.get(&id).copied()
    }

    /// Whether `id` is a known peer.
    pub fn contains(&self, id: MachineId) -> bool {
        self.peers.contains_key(&id)
    }

    /// All peer ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.peers.keys().copied()
    }

    /// The peer at position `index` in id order.
    pub fn nth(&self, index: usize) -> Option<MachineId> {
        self.peers.keys().nth(index).copied()
    }

    /// Peers this machine must dial (higher ids).
    pub fn outbound(&self) -> impl Iterator<Item = (MachineId, SocketAddr)> + '_ {
        let local = self.local;
        self.peers
            .iter()
            .filter(move |(id, _)| local.initiates_to(**id))
            .map(|(id, addr)| (*id, *addr))
    }

    /// Peers expected to dial in (lower ids).
    pub fn inbound(&self) -> impl Iterator<Item = MachineId> + '_ {
        let local = self.local;
        self.peers.keys().copied().filter(move |id| id.initiates_to(local))
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the table has no peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
