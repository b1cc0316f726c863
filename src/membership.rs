//! In-memory membership tables: known peer servers and registered
//! clients, both TTL-evicted (C4).

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use crate::clock::{self, Timestamp};

/// `(IP address, UDP port)`, equal by bytes (spec §3).
pub type Endpoint = SocketAddr;

/// Serialized bytes used to break ties in election (spec §4.4: "lexicographic
/// comparison of serialized endpoint bytes").
pub fn endpoint_bytes(endpoint: &Endpoint) -> Vec<u8> {
    match endpoint {
        SocketAddr::V4(v4) => {
            let mut bytes = v4.ip().octets().to_vec();
            bytes.extend_from_slice(&v4.port().to_be_bytes());
            bytes
        }
        SocketAddr::V6(v6) => {
            let mut bytes = v6.ip().octets().to_vec();
            bytes.extend_from_slice(&v6.port().to_be_bytes());
            bytes
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEntry {
    pub endpoint: Endpoint,
    pub last_heard_utc: Timestamp,
    pub registration_time_utc: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEntry {
    pub endpoint: Endpoint,
    pub broadcast_group: u32,
    pub last_heard_utc: Timestamp,
}

#[derive(Debug, Default)]
pub struct ServerTable {
    entries: HashMap<Endpoint, ServerEntry>,
}

impl ServerTable {
    /// Upserts a peer. On refresh the existing `registration_time_utc`
    /// is preserved; it is only set from `registration_time_utc` on the
    /// entry's initial insertion (spec §4.5, `SERVER_REGISTER` handling).
    pub fn upsert(&mut self, endpoint: Endpoint, now: Timestamp, registration_time_utc: Timestamp) {
        self.entries
            .entry(endpoint)
            .and_modify(|entry| entry.last_heard_utc = now)
            .or_insert(ServerEntry {
                endpoint,
                last_heard_utc: now,
                registration_time_utc,
            });
    }

    pub fn remove(&mut self, endpoint: &Endpoint) -> Option<ServerEntry> {
        self.entries.remove(endpoint)
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&ServerEntry> {
        self.entries.get(endpoint)
    }

    pub fn snapshot(&self) -> Vec<ServerEntry> {
        self.entries.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every entry whose `last_heard_utc` is older
    /// than `ttl` relative to `now` (spec §3: `ServerEntry` expiry).
    pub fn sweep_expired(&mut self, now: Timestamp, ttl: Duration) -> Vec<ServerEntry> {
        let expired: Vec<Endpoint> = self
            .entries
            .iter()
            .filter(|(_, entry)| clock::duration_since(now, entry.last_heard_utc) > ttl)
            .map(|(&endpoint, _)| endpoint)
            .collect();
        expired
            .into_iter()
            .filter_map(|endpoint| self.entries.remove(&endpoint))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ClientTable {
    entries: HashMap<Endpoint, ClientEntry>,
}

impl ClientTable {
    pub fn upsert(&mut self, endpoint: Endpoint, broadcast_group: u32, now: Timestamp) {
        self.entries
            .entry(endpoint)
            .and_modify(|entry| {
                entry.last_heard_utc = now;
                entry.broadcast_group = broadcast_group;
            })
            .or_insert(ClientEntry {
                endpoint,
                broadcast_group,
                last_heard_utc: now,
            });
    }

    pub fn remove(&mut self, endpoint: &Endpoint) -> Option<ClientEntry> {
        self.entries.remove(endpoint)
    }

    pub fn snapshot(&self) -> Vec<ClientEntry> {
        self.entries.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn in_group(&self, group: u32) -> impl Iterator<Item = &ClientEntry> {
        self.entries.values().filter(move |entry| entry.broadcast_group == group)
    }

    pub fn sweep_expired(&mut self, now: Timestamp, ttl: Duration) -> Vec<ClientEntry> {
        let expired: Vec<Endpoint> = self
            .entries
            .iter()
            .filter(|(_, entry)| clock::duration_since(now, entry.last_heard_utc) > ttl)
            .map(|(&endpoint, _)| endpoint)
            .collect();
        expired
            .into_iter()
            .filter_map(|endpoint| self.entries.remove(&endpoint))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> Endpoint {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn insert_preserves_registration_time_on_refresh() {
        let mut table = ServerTable::default();
        table.upsert(ep(1), 100, 100);
        table.upsert(ep(1), 200, 200);
        assert_eq!(table.get(&ep(1)).unwrap().registration_time_utc, 100);
        assert_eq!(table.get(&ep(1)).unwrap().last_heard_utc, 200);
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let mut table = ServerTable::default();
        table.upsert(ep(1), 0, 0);
        table.upsert(ep(2), 0, 0);
        let now = 5 * clock::TICKS_PER_SECOND;
        table.upsert(ep(2), now, 0); // refresh #2 so it survives
        let removed = table.sweep_expired(now, Duration::from_secs(1));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].endpoint, ep(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn client_table_filters_by_group() {
        let mut table = ClientTable::default();
        table.upsert(ep(1), 0, 0);
        table.upsert(ep(2), 100, 0);
        let group0: Vec<_> = table.in_group(0).collect();
        assert_eq!(group0.len(), 1);
        assert_eq!(group0[0].endpoint, ep(1));
    }

    #[test]
    fn endpoint_bytes_ordering_is_lexicographic_not_numeric() {
        let a = endpoint_bytes(&ep(1));
        let b = endpoint_bytes(&ep(2));
        assert!(a < b);
    }
}
