//! Registry owning every client record.

use std::collections::HashMap;

use geoclued_types::AccuracyLevel;
use log::debug;

use crate::client::{ClientId, ClientRecord};

/// Owns client records and the per-peer reuse map.
#[derive(Debug, Default)]
pub struct ClientManager {
    clients: HashMap<ClientId, ClientRecord>,
    reusable_by_peer: HashMap<String, ClientId>,
    next_id: u64,
}

impl ClientManager {
    /// Create a fresh client owned by `owner`.
    pub fn create(&mut self, owner: &str, auto_delete: bool) -> ClientId {
        self.next_id += 1;
        let id = ClientId(self.next_id);
        self.clients
            .insert(id, ClientRecord::new(id, owner.to_owned(), auto_delete));
        debug!("client {} created for {owner} (auto_delete={auto_delete})", id.0);
        id
    }

    /// Return the reusable client for a peer, creating it on first call.
    ///
    /// Reusable clients survive their peer on the bus (no auto delete) and
    /// are handed back to the same peer on repeated calls.
    pub fn get_or_create(&mut self, owner: &str) -> ClientId {
        if let Some(&id) = self.reusable_by_peer.get(owner) {
            if self.clients.contains_key(&id) {
                return id;
            }
        }
        let id = self.create(owner, false);
        self.reusable_by_peer.insert(owner.to_owned(), id);
        id
    }

    /// Remove a client record entirely.
    pub fn remove(&mut self, id: ClientId) -> Option<ClientRecord> {
        self.reusable_by_peer.retain(|_, &mut kept| kept != id);
        self.clients.remove(&id)
    }

    /// Shared access to a record.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    /// Exclusive access to a record.
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.clients.get_mut(&id)
    }

    /// All records.
    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    /// All records, mutable.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientRecord> {
        self.clients.values_mut()
    }

    /// Ids of every client owned by a peer.
    #[must_use]
    pub fn owned_by(&self, owner: &str) -> Vec<ClientId> {
        let mut ids: Vec<_> = self
            .clients
            .values()
            .filter(|client| client.owner == owner)
            .map(|client| client.id)
            .collect();
        ids.sort();
        ids
    }

    /// Effective levels of every started client.
    #[must_use]
    pub fn started_levels(&self) -> Vec<AccuracyLevel> {
        self.clients
            .values()
            .filter_map(ClientRecord::effective_level)
            .collect()
    }

    /// Largest time threshold among started clients, in seconds.
    #[must_use]
    pub fn max_started_time_threshold(&self) -> u32 {
        self.clients
            .values()
            .filter(|client| client.started())
            .map(|client| client.time_threshold)
            .max()
            .unwrap_or(0)
    }

    /// Whether any client is started.
    #[must_use]
    pub fn any_started(&self) -> bool {
        self.clients.values().any(ClientRecord::started)
    }
}
